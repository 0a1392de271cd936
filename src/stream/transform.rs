//! Per-body stream adapters: [`map`], [`filter`], [`until`],
//! [`until_eventual`], and the take family.

use super::node::{ControlFlow, ControlSignal, Flow, StreamNode, StreamSignal};
use super::{NodeCx, ResumeHandle};
use crate::compose::{stage, Eventual, StreamTransform, TransformKind};
use crate::continuation::{downcast_item, Continuation, Item};
use crate::error::Error;
use crate::interrupt::Interrupt;
use std::collections::VecDeque;
use std::marker::PhantomData;

/// Transform each body by running a fresh clone of the eventual `e` with
/// the body as its input; stream shape is preserved.
pub fn map<E>(e: E) -> Map<E> {
    Map { e }
}

pub struct Map<E> {
    e: E,
}

stage!(Map<E> => TransformKind);

impl<A, E> StreamTransform<A> for Map<E>
where
    A: Send + 'static,
    E: Eventual<A> + Clone + Send + 'static,
{
    type Item = E::Output;

    fn push_nodes(self, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(MapNode::<A, E> {
            e: self.e,
            interrupt: None,
            _marker: PhantomData,
        }));
    }
}

struct MapNode<A, E> {
    e: E,
    interrupt: Option<Interrupt>,
    _marker: PhantomData<fn(A)>,
}

struct MapAdaptor<B> {
    handle: ResumeHandle,
    _marker: PhantomData<fn(B)>,
}

impl<B: Send + 'static> Continuation<B> for MapAdaptor<B> {
    fn started(self, value: B) {
        self.handle.resume(Box::new(value));
    }

    fn failed(self, error: Error) {
        self.handle.forward(StreamSignal::Failed(error));
    }

    fn stopped(self) {
        self.handle.forward(StreamSignal::Stopped);
    }

    fn register(&mut self, _interrupt: &Interrupt) {
        // Registered through the node.
    }
}

impl<A, E> StreamNode for MapNode<A, E>
where
    A: Send + 'static,
    E: Eventual<A> + Clone + Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Body(item) => {
                let value = downcast_item::<A>(item);
                let mut inner = self.e.clone().materialize(MapAdaptor::<E::Output> {
                    handle: cx.resume_handle(),
                    _marker: PhantomData,
                });
                if let Some(interrupt) = &self.interrupt {
                    inner.register(interrupt);
                }
                inner.started(value);
                Flow::Handled
            }
            other => Flow::Continue(other),
        }
    }

    fn control(&mut self, _signal: ControlSignal, _cx: &NodeCx) -> ControlFlow {
        ControlFlow::PassUp
    }

    fn resume(&mut self, payload: Item, _cx: &NodeCx) -> Flow {
        Flow::Continue(StreamSignal::Body(payload))
    }

    fn register(&mut self, interrupt: &Interrupt, _cx: &NodeCx) {
        self.interrupt = Some(interrupt.clone());
    }
}

/// Forward only bodies satisfying `pred`; otherwise re-request upstream.
pub fn filter<P>(pred: P) -> Filter<P> {
    Filter { pred }
}

pub struct Filter<P> {
    pred: P,
}

stage!(Filter<P> => TransformKind);

impl<A, P> StreamTransform<A> for Filter<P>
where
    A: Send + 'static,
    P: FnMut(&A) -> bool + Send + 'static,
{
    type Item = A;

    fn push_nodes(self, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(FilterNode::<A, P> {
            pred: self.pred,
            _marker: PhantomData,
        }));
    }
}

struct FilterNode<A, P> {
    pred: P,
    _marker: PhantomData<fn(A)>,
}

impl<A, P> StreamNode for FilterNode<A, P>
where
    A: Send + 'static,
    P: FnMut(&A) -> bool + Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Body(item) => {
                let value = downcast_item::<A>(item);
                if (self.pred)(&value) {
                    Flow::Continue(StreamSignal::Body(Box::new(value)))
                } else {
                    cx.next_upstream();
                    Flow::Handled
                }
            }
            other => Flow::Continue(other),
        }
    }

    fn control(&mut self, _signal: ControlSignal, _cx: &NodeCx) -> ControlFlow {
        ControlFlow::PassUp
    }
}

/// Terminate the stream (via upstream `done`) at the first body for which
/// `pred` is true; that body and everything after it is withheld.
pub fn until<P>(pred: P) -> Until<P> {
    Until { pred }
}

pub struct Until<P> {
    pred: P,
}

stage!(Until<P> => TransformKind);

impl<A, P> StreamTransform<A> for Until<P>
where
    A: Send + 'static,
    P: FnMut(&A) -> bool + Send + 'static,
{
    type Item = A;

    fn push_nodes(self, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(UntilNode::<A, P> {
            pred: self.pred,
            _marker: PhantomData,
        }));
    }
}

struct UntilNode<A, P> {
    pred: P,
    _marker: PhantomData<fn(A)>,
}

impl<A, P> StreamNode for UntilNode<A, P>
where
    A: Send + 'static,
    P: FnMut(&A) -> bool + Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Body(item) => {
                let value = downcast_item::<A>(item);
                if (self.pred)(&value) {
                    cx.done_upstream();
                    Flow::Handled
                } else {
                    Flow::Continue(StreamSignal::Body(Box::new(value)))
                }
            }
            other => Flow::Continue(other),
        }
    }

    fn control(&mut self, _signal: ControlSignal, _cx: &NodeCx) -> ControlFlow {
        ControlFlow::PassUp
    }
}

/// [`until`] with a predicate that is itself an eventual of bool, built
/// fresh per body from a borrow of the candidate value.
pub fn until_eventual<F>(f: F) -> UntilEventual<F> {
    UntilEventual { f }
}

pub struct UntilEventual<F> {
    f: F,
}

stage!(UntilEventual<F> => TransformKind);

impl<A, E, F> StreamTransform<A> for UntilEventual<F>
where
    A: Send + 'static,
    E: Eventual<(), Output = bool>,
    F: FnMut(&A) -> E + Send + 'static,
{
    type Item = A;

    fn push_nodes(self, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(UntilEventualNode::<A, F> {
            f: self.f,
            interrupt: None,
            _marker: PhantomData,
        }));
    }
}

struct UntilEventualNode<A, F> {
    f: F,
    interrupt: Option<Interrupt>,
    _marker: PhantomData<fn(A)>,
}

struct UntilAdaptor<A> {
    handle: ResumeHandle,
    value: A,
}

impl<A: Send + 'static> Continuation<bool> for UntilAdaptor<A> {
    fn started(self, done: bool) {
        self.handle.resume(Box::new((self.value, done)));
    }

    fn failed(self, error: Error) {
        self.handle.forward(StreamSignal::Failed(error));
    }

    fn stopped(self) {
        self.handle.forward(StreamSignal::Stopped);
    }

    fn register(&mut self, _interrupt: &Interrupt) {}
}

impl<A, E, F> StreamNode for UntilEventualNode<A, F>
where
    A: Send + 'static,
    E: Eventual<(), Output = bool>,
    F: FnMut(&A) -> E + Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Body(item) => {
                let value = downcast_item::<A>(item);
                let e = (self.f)(&value);
                let mut inner = e.materialize(UntilAdaptor {
                    handle: cx.resume_handle(),
                    value,
                });
                if let Some(interrupt) = &self.interrupt {
                    inner.register(interrupt);
                }
                inner.started(());
                Flow::Handled
            }
            other => Flow::Continue(other),
        }
    }

    fn control(&mut self, _signal: ControlSignal, _cx: &NodeCx) -> ControlFlow {
        ControlFlow::PassUp
    }

    fn resume(&mut self, payload: Item, cx: &NodeCx) -> Flow {
        let (value, done) = downcast_item::<(A, bool)>(payload);
        if done {
            cx.done_upstream();
            Flow::Handled
        } else {
            Flow::Continue(StreamSignal::Body(Box::new(value)))
        }
    }

    fn register(&mut self, interrupt: &Interrupt, _cx: &NodeCx) {
        self.interrupt = Some(interrupt.clone());
    }
}

/// Pass only the first `n` bodies, then request termination.
pub fn take_first_n(n: usize) -> TakeRange {
    take_range(0, n)
}

/// Pass bodies with zero-based positions in `[begin, begin + amount)`.
pub fn take_range(begin: usize, amount: usize) -> TakeRange {
    TakeRange {
        begin,
        amount,
        position: 0,
        in_range: false,
    }
}

pub struct TakeRange {
    begin: usize,
    amount: usize,
    position: usize,
    in_range: bool,
}

stage!(TakeRange => TransformKind);

impl<A> StreamTransform<A> for TakeRange
where
    A: Send + 'static,
{
    type Item = A;

    fn push_nodes(self, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(TakeRangeNode { state: self }));
    }
}

struct TakeRangeNode {
    state: TakeRange,
}

impl StreamNode for TakeRangeNode {
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Body(item) => {
                let state = &mut self.state;
                let selected = state.position >= state.begin
                    && state.position < state.begin + state.amount;
                state.position += 1;
                if selected {
                    state.in_range = true;
                    Flow::Continue(StreamSignal::Body(item))
                } else if !state.in_range {
                    cx.next_upstream();
                    Flow::Handled
                } else {
                    cx.done_upstream();
                    Flow::Handled
                }
            }
            other => Flow::Continue(other),
        }
    }

    fn control(&mut self, _signal: ControlSignal, _cx: &NodeCx) -> ControlFlow {
        ControlFlow::PassUp
    }
}

/// Buffer the last `n` bodies and emit them only once upstream ends.
pub fn take_last_n(n: usize) -> TakeLast {
    TakeLast { n }
}

pub struct TakeLast {
    n: usize,
}

stage!(TakeLast => TransformKind);

impl<A> StreamTransform<A> for TakeLast
where
    A: Send + 'static,
{
    type Item = A;

    fn push_nodes(self, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(TakeLastNode::<A> {
            n: self.n,
            buffer: VecDeque::new(),
            upstream_ended: false,
            _marker: PhantomData,
        }));
    }
}

struct TakeLastNode<A> {
    n: usize,
    buffer: VecDeque<A>,
    upstream_ended: bool,
    _marker: PhantomData<fn(A)>,
}

impl<A> StreamNode for TakeLastNode<A>
where
    A: Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Body(item) => {
                if self.n > 0 {
                    let value = downcast_item::<A>(item);
                    if self.buffer.len() == self.n {
                        self.buffer.pop_front();
                    }
                    self.buffer.push_back(value);
                }
                // Drain the upstream eagerly; nothing flows downstream
                // until it ends.
                cx.next_upstream();
                Flow::Handled
            }
            StreamSignal::Ended => {
                self.upstream_ended = true;
                // The sink has one outstanding `next`; answer it from the
                // buffer (or report the end if the stream was short).
                match self.buffer.pop_front() {
                    Some(value) => Flow::Continue(StreamSignal::Body(Box::new(value))),
                    None => Flow::Continue(StreamSignal::Ended),
                }
            }
            other => Flow::Continue(other),
        }
    }

    fn control(&mut self, signal: ControlSignal, cx: &NodeCx) -> ControlFlow {
        if !self.upstream_ended {
            return ControlFlow::PassUp;
        }
        let handle = cx.resume_handle();
        match signal {
            ControlSignal::Next => match self.buffer.pop_front() {
                Some(value) => handle.forward(StreamSignal::Body(Box::new(value))),
                None => handle.forward(StreamSignal::Ended),
            },
            ControlSignal::Done => handle.forward(StreamSignal::Ended),
        }
        ControlFlow::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventual::just;
    use crate::stream::iterate::{iterate, range};
    use crate::stream::sink::collect;
    use crate::terminal::run;

    #[test]
    fn test_map_squares() {
        let result = run(range(1, 5) | map(crate::then::then(|x: i64| x * x))
            | collect::<Vec<i64>>())
        .unwrap();
        assert_eq!(result, vec![1, 4, 9, 16]);
    }

    #[test]
    fn test_filter_keeps_matching() {
        let result = run(range(0, 10)
            | filter(|x: &i64| x % 2 == 0)
            | collect::<Vec<i64>>())
        .unwrap();
        assert_eq!(result, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn test_until_early_termination() {
        let result = run(range(0, 1000) | until(|x: &i64| *x == 3) | collect::<Vec<i64>>())
            .unwrap();
        assert_eq!(result, vec![0, 1, 2]);
    }

    #[test]
    fn test_until_eventual_predicate() {
        let result = run(range(0, 1000)
            | until_eventual(|x: &i64| just(*x == 3))
            | collect::<Vec<i64>>())
        .unwrap();
        assert_eq!(result, vec![0, 1, 2]);
    }

    #[test]
    fn test_take_first_n() {
        let result = run(range(0, 100) | take_first_n(3) | collect::<Vec<i64>>()).unwrap();
        assert_eq!(result, vec![0, 1, 2]);
    }

    #[test]
    fn test_take_range_window() {
        let result = run(range(0, 100) | take_range(2, 3) | collect::<Vec<i64>>()).unwrap();
        assert_eq!(result, vec![2, 3, 4]);
    }

    #[test]
    fn test_take_last_n() {
        let result = run(iterate(vec![5, 12, 17, 3]) | take_last_n(2) | collect::<Vec<i32>>())
            .unwrap();
        assert_eq!(result, vec![17, 3]);
    }

    #[test]
    fn test_take_last_n_short_stream() {
        let result = run(iterate(vec![1, 2]) | take_last_n(5) | collect::<Vec<i32>>()).unwrap();
        assert_eq!(result, vec![1, 2]);
    }

    #[test]
    fn test_take_last_n_empty_stream() {
        let result = run(iterate(Vec::<i32>::new()) | take_last_n(3) | collect::<Vec<i32>>())
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_map_failure_terminates_stream() {
        let result = run(range(0, 10)
            | map(crate::then::then(|_x: i64| ()) | crate::eventual::raise::<i64>("map broke"))
            | collect::<Vec<i64>>());
        assert!(matches!(result, Err(Error::Failed(m)) if m == "map broke"));
    }
}
