//! Loop-shaped sinks: the stages that consume a stream and yield one value
//! downstream. [`collect`], [`reduce`], [`head`], and the generic
//! [`loop_`] builder.

use super::node::{ControlFlow, ControlSignal, Flow, StreamNode, StreamSignal};
use super::{NodeCx, ResumeHandle};
use crate::compose::{stage, Eventual, SinkKind, StreamSink};
use crate::continuation::{downcast_item, AnyContinuation, Continuation, Item};
use crate::error::Error;
use crate::interrupt::Interrupt;
use std::marker::PhantomData;
use std::sync::Mutex;

/// Upstream control handle given to sink callbacks: request the next body
/// or early termination.
pub struct StreamCtl {
    handle: ResumeHandle,
}

impl StreamCtl {
    pub fn next(&self) {
        self.handle.request_next();
    }

    pub fn done(&self) {
        self.handle.request_done();
    }
}

/// One-shot delivery handle for a sink's downstream value.
pub struct SinkHandle<V> {
    k: Mutex<Option<Box<dyn AnyContinuation>>>,
    _marker: PhantomData<fn(V)>,
}

impl<V: Send + 'static> SinkHandle<V> {
    fn new(k: Box<dyn AnyContinuation>) -> Self {
        Self {
            k: Mutex::new(Some(k)),
            _marker: PhantomData,
        }
    }

    pub fn succeed(&self, value: V) {
        if let Some(k) = self.k.lock().unwrap().take() {
            k.started(Box::new(value));
        }
    }

    pub fn fail(&self, error: impl Into<Error>) {
        if let Some(k) = self.k.lock().unwrap().take() {
            k.failed(error.into());
        }
    }

    pub fn stop(&self) {
        if let Some(k) = self.k.lock().unwrap().take() {
            k.stopped();
        }
    }
}

// --- collect ---

/// Append every body into a fresh container and yield it once the stream
/// ends: `collect::<Vec<i32>>()`.
pub fn collect<C>() -> Collect<C> {
    Collect {
        _marker: PhantomData,
    }
}

pub struct Collect<C> {
    _marker: PhantomData<fn() -> C>,
}

stage!(Collect<C> => SinkKind);

impl<A, C> StreamSink<A> for Collect<C>
where
    A: Send + 'static,
    C: Default + Extend<A> + Send + 'static,
{
    type Output = C;

    fn push_nodes(self, k: Box<dyn AnyContinuation>, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(CollectNode::<A, C> {
            container: C::default(),
            k: Some(k),
            _marker: PhantomData,
        }));
    }
}

struct CollectNode<A, C> {
    container: C,
    k: Option<Box<dyn AnyContinuation>>,
    _marker: PhantomData<fn(A)>,
}

impl<A, C> StreamNode for CollectNode<A, C>
where
    A: Send + 'static,
    C: Default + Extend<A> + Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Started => cx.next_upstream(),
            StreamSignal::Body(item) => {
                self.container.extend(std::iter::once(downcast_item::<A>(item)));
                cx.next_upstream();
            }
            StreamSignal::Ended => {
                if let Some(k) = self.k.take() {
                    k.started(Box::new(std::mem::take(&mut self.container)));
                }
            }
            StreamSignal::Failed(error) => {
                if let Some(k) = self.k.take() {
                    k.failed(error);
                }
            }
            StreamSignal::Stopped => {
                if let Some(k) = self.k.take() {
                    k.stopped();
                }
            }
        }
        Flow::Handled
    }

    fn control(&mut self, _signal: ControlSignal, _cx: &NodeCx) -> ControlFlow {
        ControlFlow::PassUp
    }

    fn register(&mut self, interrupt: &Interrupt, _cx: &NodeCx) {
        if let Some(k) = self.k.as_mut() {
            k.register(interrupt);
        }
    }
}

// --- reduce ---

/// Fold the stream: `fold(acc, body)` returns an eventual yielding the new
/// accumulator and whether to continue (`false` stops the stream early).
pub fn reduce<T, F>(init: T, fold: F) -> Reduce<T, F> {
    Reduce { init, fold }
}

pub struct Reduce<T, F> {
    init: T,
    fold: F,
}

stage!(Reduce<T, F> => SinkKind);

impl<A, T, F, E> StreamSink<A> for Reduce<T, F>
where
    A: Send + 'static,
    T: Send + 'static,
    E: Eventual<(), Output = (T, bool)>,
    F: FnMut(T, A) -> E + Send + 'static,
{
    type Output = T;

    fn push_nodes(self, k: Box<dyn AnyContinuation>, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(ReduceNode::<A, T, F> {
            acc: Some(self.init),
            fold: self.fold,
            k: Some(k),
            interrupt: None,
            _marker: PhantomData,
        }));
    }
}

struct ReduceNode<A, T, F> {
    acc: Option<T>,
    fold: F,
    k: Option<Box<dyn AnyContinuation>>,
    interrupt: Option<Interrupt>,
    _marker: PhantomData<fn(A)>,
}

enum FoldOutcome<T> {
    Next(T, bool),
    Failed(Error),
    Stopped,
}

struct ReduceAdaptor<T> {
    handle: ResumeHandle,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Continuation<(T, bool)> for ReduceAdaptor<T> {
    fn started(self, (acc, proceed): (T, bool)) {
        self.handle
            .resume(Box::new(FoldOutcome::Next(acc, proceed)));
    }

    fn failed(self, error: Error) {
        self.handle.resume(Box::new(FoldOutcome::<T>::Failed(error)));
    }

    fn stopped(self) {
        self.handle.resume(Box::new(FoldOutcome::<T>::Stopped));
    }

    fn register(&mut self, _interrupt: &Interrupt) {}
}

impl<A, T, F, E> StreamNode for ReduceNode<A, T, F>
where
    A: Send + 'static,
    T: Send + 'static,
    E: Eventual<(), Output = (T, bool)>,
    F: FnMut(T, A) -> E + Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Started => cx.next_upstream(),
            StreamSignal::Body(item) => {
                let value = downcast_item::<A>(item);
                let acc = self
                    .acc
                    .take()
                    .expect("reduce received a body while a fold was in flight");
                let e = (self.fold)(acc, value);
                let mut inner = e.materialize(ReduceAdaptor::<T> {
                    handle: cx.resume_handle(),
                    _marker: PhantomData,
                });
                if let Some(interrupt) = &self.interrupt {
                    inner.register(interrupt);
                }
                inner.started(());
            }
            StreamSignal::Ended => {
                if let (Some(k), Some(acc)) = (self.k.take(), self.acc.take()) {
                    k.started(Box::new(acc));
                }
            }
            StreamSignal::Failed(error) => {
                if let Some(k) = self.k.take() {
                    k.failed(error);
                }
            }
            StreamSignal::Stopped => {
                if let Some(k) = self.k.take() {
                    k.stopped();
                }
            }
        }
        Flow::Handled
    }

    fn control(&mut self, _signal: ControlSignal, _cx: &NodeCx) -> ControlFlow {
        ControlFlow::PassUp
    }

    fn resume(&mut self, payload: Item, cx: &NodeCx) -> Flow {
        match downcast_item::<FoldOutcome<T>>(payload) {
            FoldOutcome::Next(acc, proceed) => {
                self.acc = Some(acc);
                if proceed {
                    cx.next_upstream();
                } else {
                    // Early stop: the accumulator is delivered when the
                    // upstream acknowledges with `Ended`.
                    cx.done_upstream();
                }
            }
            FoldOutcome::Failed(error) => {
                if let Some(k) = self.k.take() {
                    k.failed(error);
                }
            }
            FoldOutcome::Stopped => {
                if let Some(k) = self.k.take() {
                    k.stopped();
                }
            }
        }
        Flow::Handled
    }

    fn register(&mut self, interrupt: &Interrupt, _cx: &NodeCx) {
        if let Some(k) = self.k.as_mut() {
            k.register(interrupt);
        }
        self.interrupt = Some(interrupt.clone());
    }
}

// --- head ---

/// Yield the first body of the stream and terminate it; fails with
/// [`Error::EmptyStream`] if the stream ends first.
pub fn head() -> Head {
    Head { _private: () }
}

pub struct Head {
    _private: (),
}

stage!(Head => SinkKind);

impl<A> StreamSink<A> for Head
where
    A: Send + 'static,
{
    type Output = A;

    fn push_nodes(self, k: Box<dyn AnyContinuation>, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(HeadNode::<A> {
            stored: None,
            k: Some(k),
            _marker: PhantomData,
        }));
    }
}

struct HeadNode<A> {
    stored: Option<A>,
    k: Option<Box<dyn AnyContinuation>>,
    _marker: PhantomData<fn(A)>,
}

impl<A> StreamNode for HeadNode<A>
where
    A: Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Started => cx.next_upstream(),
            StreamSignal::Body(item) => {
                self.stored = Some(downcast_item::<A>(item));
                cx.done_upstream();
            }
            StreamSignal::Ended => {
                if let Some(k) = self.k.take() {
                    match self.stored.take() {
                        Some(value) => k.started(Box::new(value)),
                        None => k.failed(Error::EmptyStream),
                    }
                }
            }
            StreamSignal::Failed(error) => {
                if let Some(k) = self.k.take() {
                    k.failed(error);
                }
            }
            StreamSignal::Stopped => {
                if let Some(k) = self.k.take() {
                    k.stopped();
                }
            }
        }
        Flow::Handled
    }

    fn control(&mut self, _signal: ControlSignal, _cx: &NodeCx) -> ControlFlow {
        ControlFlow::PassUp
    }

    fn register(&mut self, interrupt: &Interrupt, _cx: &NodeCx) {
        if let Some(k) = self.k.as_mut() {
            k.register(interrupt);
        }
    }
}

// --- the generic loop builder ---

type LoopStartCallback<C> = Box<dyn FnOnce(&mut C, &StreamCtl) + Send>;
type LoopBodyCallback<A, C> = Box<dyn FnMut(&mut C, &StreamCtl, A) + Send>;
type LoopEndedCallback<V, C> = Box<dyn FnOnce(&mut C, SinkHandle<V>) + Send>;
type LoopFailCallback<V, C> = Box<dyn FnOnce(&mut C, SinkHandle<V>, Error) + Send>;
type LoopStopCallback<V, C> = Box<dyn FnOnce(&mut C, SinkHandle<V>) + Send>;

/// Start building a generic stream sink yielding `V`.
pub fn loop_<A, V>() -> LoopBuilder<A, V, ()> {
    LoopBuilder {
        context: (),
        on_start: None,
        on_body: None,
        _marker: PhantomData,
    }
}

pub struct LoopBuilder<A, V, C> {
    context: C,
    on_start: Option<LoopStartCallback<C>>,
    on_body: Option<LoopBodyCallback<A, C>>,
    _marker: PhantomData<fn(A) -> V>,
}

impl<A, V, C> LoopBuilder<A, V, C> {
    /// Per-sink state passed mutably to every callback. Set this before the
    /// callbacks so they can borrow it.
    pub fn context<C2>(self, context: C2) -> LoopBuilder<A, V, C2> {
        LoopBuilder {
            context,
            on_start: None,
            on_body: None,
            _marker: PhantomData,
        }
    }

    /// Runs when the stream starts. Default: request the first body.
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut C, &StreamCtl) + Send + 'static,
    {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Runs per body. Default: request the next body.
    pub fn on_body<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut C, &StreamCtl, A) + Send + 'static,
    {
        self.on_body = Some(Box::new(f));
        self
    }

    /// Runs when the stream ends, required: deliver the sink's value
    /// through the handle.
    pub fn on_ended<F>(self, f: F) -> LoopSink<A, V, C>
    where
        F: FnOnce(&mut C, SinkHandle<V>) + Send + 'static,
    {
        LoopSink {
            context: self.context,
            on_start: self.on_start,
            on_body: self.on_body,
            on_ended: Box::new(f),
            on_fail: None,
            on_stop: None,
            _marker: PhantomData,
        }
    }
}

/// A generic sink with its `ended` callback set; composable after a stream.
pub struct LoopSink<A, V, C> {
    context: C,
    on_start: Option<LoopStartCallback<C>>,
    on_body: Option<LoopBodyCallback<A, C>>,
    on_ended: LoopEndedCallback<V, C>,
    on_fail: Option<LoopFailCallback<V, C>>,
    on_stop: Option<LoopStopCallback<V, C>>,
    _marker: PhantomData<fn(A) -> V>,
}

impl<A, V, C> LoopSink<A, V, C> {
    /// Override failure handling (default: propagate).
    pub fn on_fail<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut C, SinkHandle<V>, Error) + Send + 'static,
    {
        self.on_fail = Some(Box::new(f));
        self
    }

    /// Override stop handling (default: propagate).
    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut C, SinkHandle<V>) + Send + 'static,
    {
        self.on_stop = Some(Box::new(f));
        self
    }
}

stage!(LoopSink<A, V, C> => SinkKind);

impl<A, V, C> StreamSink<A> for LoopSink<A, V, C>
where
    A: Send + 'static,
    V: Send + 'static,
    C: Send + 'static,
{
    type Output = V;

    fn push_nodes(self, k: Box<dyn AnyContinuation>, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(LoopNode::<A, V, C> {
            context: self.context,
            on_start: self.on_start,
            on_body: self.on_body,
            on_ended: Some(self.on_ended),
            on_fail: self.on_fail,
            on_stop: self.on_stop,
            k: Some(k),
            _marker: PhantomData,
        }));
    }
}

struct LoopNode<A, V, C> {
    context: C,
    on_start: Option<LoopStartCallback<C>>,
    on_body: Option<LoopBodyCallback<A, C>>,
    on_ended: Option<LoopEndedCallback<V, C>>,
    on_fail: Option<LoopFailCallback<V, C>>,
    on_stop: Option<LoopStopCallback<V, C>>,
    k: Option<Box<dyn AnyContinuation>>,
    _marker: PhantomData<fn(A) -> V>,
}

impl<A, V, C> StreamNode for LoopNode<A, V, C>
where
    A: Send + 'static,
    V: Send + 'static,
    C: Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        let ctl = StreamCtl {
            handle: cx.resume_handle(),
        };
        match signal {
            StreamSignal::Started => match self.on_start.take() {
                Some(on_start) => on_start(&mut self.context, &ctl),
                None => ctl.next(),
            },
            StreamSignal::Body(item) => {
                let value = downcast_item::<A>(item);
                match self.on_body.as_mut() {
                    Some(on_body) => on_body(&mut self.context, &ctl, value),
                    None => ctl.next(),
                }
            }
            StreamSignal::Ended => {
                if let (Some(on_ended), Some(k)) = (self.on_ended.take(), self.k.take()) {
                    on_ended(&mut self.context, SinkHandle::new(k));
                }
            }
            StreamSignal::Failed(error) => {
                if let Some(k) = self.k.take() {
                    match self.on_fail.take() {
                        Some(on_fail) => on_fail(&mut self.context, SinkHandle::new(k), error),
                        None => k.failed(error),
                    }
                }
            }
            StreamSignal::Stopped => {
                if let Some(k) = self.k.take() {
                    match self.on_stop.take() {
                        Some(on_stop) => on_stop(&mut self.context, SinkHandle::new(k)),
                        None => k.stopped(),
                    }
                }
            }
        }
        Flow::Handled
    }

    fn control(&mut self, _signal: ControlSignal, _cx: &NodeCx) -> ControlFlow {
        ControlFlow::PassUp
    }

    fn register(&mut self, interrupt: &Interrupt, _cx: &NodeCx) {
        if let Some(k) = self.k.as_mut() {
            k.register(interrupt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventual::just;
    use crate::stream::iterate::{iterate, range};
    use crate::stream::transform::map;
    use crate::terminal::run;
    use crate::then::then;

    #[test]
    fn test_stream_fold() {
        let result = run(range(1, 6)
            | map(then(|x: i64| x * x))
            | reduce(0i64, |acc: i64, x: i64| just((acc + x, true))))
        .unwrap();
        assert_eq!(result, 55);
    }

    #[test]
    fn test_reduce_early_stop() {
        let result = run(range(1, 1000)
            | reduce(0i64, |acc: i64, x: i64| {
                let next = acc + x;
                just((next, next < 10))
            }))
        .unwrap();
        assert_eq!(result, 10); // 1+2+3+4
    }

    #[test]
    fn test_collect_into_vec() {
        let result = run(range(0, 4) | collect::<Vec<i64>>()).unwrap();
        assert_eq!(result, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_head_takes_first() {
        let result = run(iterate(vec![9, 8, 7]) | head()).unwrap();
        assert_eq!(result, 9);
    }

    #[test]
    fn test_head_on_empty_stream_fails() {
        let result = run(iterate(Vec::<i32>::new()) | head());
        assert!(matches!(result, Err(Error::EmptyStream)));
    }

    #[test]
    fn test_loop_builder_counts_bodies() {
        let sink = loop_::<i64, usize>()
            .context(0usize)
            .on_body(|count, ctl, _value: i64| {
                *count += 1;
                ctl.next();
            })
            .on_ended(|count, handle| handle.succeed(*count));

        let result = run(range(0, 7) | sink).unwrap();
        assert_eq!(result, 7);
    }

    #[test]
    fn test_loop_builder_early_done() {
        let sink = loop_::<i64, Vec<i64>>()
            .context(Vec::new())
            .on_body(|seen: &mut Vec<i64>, ctl, value: i64| {
                seen.push(value);
                if seen.len() == 2 {
                    ctl.done();
                } else {
                    ctl.next();
                }
            })
            .on_ended(|seen, handle| handle.succeed(std::mem::take(seen)));

        let result = run(range(0, 100) | sink).unwrap();
        assert_eq!(result, vec![0, 1]);
    }
}
