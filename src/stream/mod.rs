//! Streams: backpressure-driven sequences of bodies between a source and a
//! loop-shaped sink.
//!
//! A materialized stream is a small graph of nodes (source, transforms,
//! sink) driven by one serialized command queue. Every entry point into the
//! graph (a downstream `next`/`done` request, an emitted body, an async
//! transform resumption, an interrupt) is a command; whichever thread
//! pushes a command while the queue is idle drains it, so stream callbacks
//! run on the thread of whoever called next/done (or whoever emitted), and
//! all deliveries within one stream are serialized without holding locks
//! across user code on other components. The queue also turns the
//! source-to-sink signal recursion into iteration, keeping stack depth flat
//! no matter how many bodies flow.
//!
//! Backpressure contract: a source never emits a body unless its downstream
//! requested one with `next`; a sink issues exactly one `next` per received
//! body (or `done`). One element is in flight per stream.

pub(crate) mod node;

pub mod iterate;
pub mod sink;
pub mod transform;

use crate::compose::{stage, EventualStream, SourceKind};
use crate::continuation::{Continuation, Item};
use crate::error::Error;
use crate::interrupt::Interrupt;
use node::{ControlFlow, ControlSignal, Flow, StreamNode, StreamSignal};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

// --- The machine ---

pub(crate) enum Cmd {
    /// Deliver a signal *to* node `index`, flowing downstream from there.
    Deliver(usize, StreamSignal),
    /// Node `index` requests next/done from its upstream.
    Control(usize, ControlSignal),
    /// Re-enter node `index` with the result of one of its async adaptors.
    Resume(usize, Item),
    /// The pipeline's interrupt fired.
    Interrupted,
}

struct CommandQueue {
    items: VecDeque<Cmd>,
    draining: bool,
}

pub(crate) struct MachineCore {
    queue: Mutex<CommandQueue>,
    nodes: Mutex<Vec<Box<dyn StreamNode>>>,
}

impl MachineCore {
    fn new(nodes: Vec<Box<dyn StreamNode>>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(CommandQueue {
                items: VecDeque::new(),
                draining: false,
            }),
            nodes: Mutex::new(nodes),
        })
    }

    /// Enqueue a command; if no drain is active, this thread becomes the
    /// drainer until the queue is empty. Re-entrant pushes from inside a
    /// drain only enqueue.
    pub(crate) fn push(machine: &Arc<MachineCore>, cmd: Cmd) {
        {
            let mut queue = machine.queue.lock().unwrap();
            queue.items.push_back(cmd);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        loop {
            let cmd = {
                let mut queue = machine.queue.lock().unwrap();
                match queue.items.pop_front() {
                    Some(cmd) => cmd,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            MachineCore::execute(machine, cmd);
        }
    }

    fn execute(machine: &Arc<MachineCore>, cmd: Cmd) {
        let mut nodes = machine.nodes.lock().unwrap();
        match cmd {
            Cmd::Deliver(index, signal) => {
                MachineCore::flow(machine, &mut nodes[..], index, signal);
            }
            Cmd::Resume(index, payload) => {
                let cx = NodeCx {
                    machine: machine.clone(),
                    index,
                };
                match nodes[index].resume(payload, &cx) {
                    Flow::Continue(signal) => {
                        MachineCore::flow(machine, &mut nodes[..], index + 1, signal)
                    }
                    Flow::Handled => {}
                }
            }
            Cmd::Control(from, signal) => {
                let mut index = from;
                while index > 0 {
                    index -= 1;
                    let cx = NodeCx {
                        machine: machine.clone(),
                        index,
                    };
                    match nodes[index].control(signal, &cx) {
                        ControlFlow::PassUp => continue,
                        ControlFlow::Handled => break,
                    }
                }
            }
            Cmd::Interrupted => {
                let cx = NodeCx {
                    machine: machine.clone(),
                    index: 0,
                };
                nodes[0].interrupted(&cx);
            }
        }
    }

    /// Walk a signal downstream from `start` until a node consumes it.
    fn flow(
        machine: &Arc<MachineCore>,
        nodes: &mut [Box<dyn StreamNode>],
        start: usize,
        first: StreamSignal,
    ) {
        let mut index = start;
        let mut signal = first;
        while index < nodes.len() {
            let cx = NodeCx {
                machine: machine.clone(),
                index,
            };
            match nodes[index].deliver(signal, &cx) {
                Flow::Continue(next) => {
                    signal = next;
                    index += 1;
                }
                Flow::Handled => break,
            }
        }
    }
}

/// A node's connection to its machine: request upstream control, or mint a
/// [`ResumeHandle`] for async completions.
pub(crate) struct NodeCx {
    machine: Arc<MachineCore>,
    index: usize,
}

impl NodeCx {
    pub(crate) fn next_upstream(&self) {
        MachineCore::push(&self.machine, Cmd::Control(self.index, ControlSignal::Next));
    }

    pub(crate) fn done_upstream(&self) {
        MachineCore::push(&self.machine, Cmd::Control(self.index, ControlSignal::Done));
    }

    pub(crate) fn resume_handle(&self) -> ResumeHandle {
        ResumeHandle {
            machine: self.machine.clone(),
            index: self.index,
        }
    }
}

/// Send-able handle for delivering results back into the serialized graph
/// from any thread.
#[derive(Clone)]
pub(crate) struct ResumeHandle {
    machine: Arc<MachineCore>,
    index: usize,
}

impl ResumeHandle {
    /// Re-enter this node with an adaptor result.
    pub(crate) fn resume(&self, payload: Item) {
        MachineCore::push(&self.machine, Cmd::Resume(self.index, payload));
    }

    /// Deliver a signal to the node just downstream of this one.
    pub(crate) fn forward(&self, signal: StreamSignal) {
        MachineCore::push(&self.machine, Cmd::Deliver(self.index + 1, signal));
    }

    pub(crate) fn request_next(&self) {
        MachineCore::push(&self.machine, Cmd::Control(self.index, ControlSignal::Next));
    }

    pub(crate) fn request_done(&self) {
        MachineCore::push(&self.machine, Cmd::Control(self.index, ControlSignal::Done));
    }
}

// --- Emitter: the source's half of the protocol ---

/// Handed to a source's callbacks; delivers stream signals downstream.
///
/// Cloneable and `Send`: a source that produces asynchronously stores a
/// clone and emits from wherever the data arrives. Per the backpressure
/// contract, call [`emit`](Emitter::emit) only in response to a `next`
/// request, exactly once.
pub struct Emitter<T> {
    handle: ResumeHandle,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static> Emitter<T> {
    /// Deliver one body downstream.
    pub fn emit(&self, value: T) {
        self.handle.forward(StreamSignal::Body(Box::new(value)));
    }

    /// The stream is exhausted.
    pub fn end(&self) {
        self.handle.forward(StreamSignal::Ended);
    }

    /// Terminate the stream with an error.
    pub fn fail(&self, error: impl Into<Error>) {
        self.handle.forward(StreamSignal::Failed(error.into()));
    }

    /// Terminate the stream with a cancellation.
    pub fn stop(&self) {
        self.handle.forward(StreamSignal::Stopped);
    }
}

// --- The user-defined source ---

type StartCallback<T, C> = Box<dyn FnOnce(&mut C, &Emitter<T>) + Send>;
type NextCallback<T, C> = Box<dyn FnMut(&mut C, &Emitter<T>) + Send>;
type DoneCallback<T, C> = Box<dyn FnMut(&mut C, &Emitter<T>) + Send>;
type SourceStopCallback<T, C> = Box<dyn FnOnce(&mut C, &Emitter<T>) + Send>;
type SourceInterruptCallback<T, C> = Box<dyn FnOnce(&mut C, &Emitter<T>) + Send>;

/// Start building a user-defined stream source of `T`.
pub fn stream<T>() -> StreamBuilder<T, ()> {
    StreamBuilder {
        context: (),
        on_start: None,
        _marker: PhantomData,
    }
}

pub struct StreamBuilder<T, C> {
    context: C,
    on_start: Option<StartCallback<T, C>>,
    _marker: PhantomData<fn(T)>,
}

impl<T, C> StreamBuilder<T, C> {
    /// Per-stream state passed mutably to every callback. Set this before
    /// the callbacks so they can borrow it.
    pub fn context<C2>(self, context: C2) -> StreamBuilder<T, C2> {
        StreamBuilder {
            context,
            on_start: None,
            _marker: PhantomData,
        }
    }

    /// Runs once when the stream starts, before the sink's first `next`.
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut C, &Emitter<T>) + Send + 'static,
    {
        self.on_start = Some(Box::new(f));
        self
    }

    /// The production callback, required: respond to each downstream `next`
    /// with exactly one `emit` (now or later) or `end`.
    pub fn on_next<F>(self, f: F) -> StreamSource<T, C>
    where
        F: FnMut(&mut C, &Emitter<T>) + Send + 'static,
    {
        StreamSource {
            context: self.context,
            on_start: self.on_start,
            on_next: Box::new(f),
            on_done: None,
            on_stop: None,
            on_interrupt: None,
            _marker: PhantomData,
        }
    }
}

/// A user-defined source with its `next` callback set; composable as a
/// stream.
pub struct StreamSource<T, C> {
    context: C,
    on_start: Option<StartCallback<T, C>>,
    on_next: NextCallback<T, C>,
    on_done: Option<DoneCallback<T, C>>,
    on_stop: Option<SourceStopCallback<T, C>>,
    on_interrupt: Option<SourceInterruptCallback<T, C>>,
    _marker: PhantomData<fn(T)>,
}

impl<T, C> StreamSource<T, C> {
    /// Runs when the sink requests early termination. Default: end the
    /// stream.
    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut C, &Emitter<T>) + Send + 'static,
    {
        self.on_done = Some(Box::new(f));
        self
    }

    /// Runs when a stop arrives from upstream. Default: propagate it.
    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut C, &Emitter<T>) + Send + 'static,
    {
        self.on_stop = Some(Box::new(f));
        self
    }

    /// Runs when the pipeline's interrupt fires; typically tears the stream
    /// down with `emitter.stop()`.
    pub fn on_interrupt<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut C, &Emitter<T>) + Send + 'static,
    {
        self.on_interrupt = Some(Box::new(f));
        self
    }
}

stage!(StreamSource<T, C> => SourceKind);

impl<Arg, T, C> EventualStream<Arg> for StreamSource<T, C>
where
    Arg: Send + 'static,
    T: Send + 'static,
    C: Send + 'static,
{
    type Item = T;
    type Materialized = SourceContinuation<Arg>;

    fn materialize_stream(self, downstream: Vec<Box<dyn StreamNode>>) -> SourceContinuation<Arg> {
        let mut nodes: Vec<Box<dyn StreamNode>> = Vec::with_capacity(downstream.len() + 1);
        nodes.push(Box::new(SourceNode {
            context: self.context,
            on_start: self.on_start,
            on_next: self.on_next,
            on_done: self.on_done,
            on_stop: self.on_stop,
            on_interrupt: self.on_interrupt,
            emitter: None,
            interrupted_before_start: false,
        }));
        nodes.extend(downstream);
        SourceContinuation {
            nodes,
            interrupt: None,
            _marker: PhantomData,
        }
    }
}

struct SourceNode<T, C> {
    context: C,
    on_start: Option<StartCallback<T, C>>,
    on_next: NextCallback<T, C>,
    on_done: Option<DoneCallback<T, C>>,
    on_stop: Option<SourceStopCallback<T, C>>,
    on_interrupt: Option<SourceInterruptCallback<T, C>>,
    emitter: Option<Emitter<T>>,
    /// The interrupt fired before the stream started; run the interrupt
    /// callback instead of starting.
    interrupted_before_start: bool,
}

impl<T, C> SourceNode<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn emitter(&mut self, cx: &NodeCx) -> Emitter<T> {
        self.emitter
            .get_or_insert_with(|| Emitter {
                handle: cx.resume_handle(),
                _marker: PhantomData,
            })
            .clone()
    }
}

impl<T, C> StreamNode for SourceNode<T, C>
where
    T: Send + 'static,
    C: Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Started => {
                let emitter = self.emitter(cx);
                if self.interrupted_before_start {
                    if let Some(on_interrupt) = self.on_interrupt.take() {
                        on_interrupt(&mut self.context, &emitter);
                    }
                    return Flow::Handled;
                }
                if let Some(on_start) = self.on_start.take() {
                    on_start(&mut self.context, &emitter);
                }
                Flow::Continue(StreamSignal::Started)
            }
            StreamSignal::Stopped => match self.on_stop.take() {
                Some(on_stop) => {
                    let emitter = self.emitter(cx);
                    on_stop(&mut self.context, &emitter);
                    Flow::Handled
                }
                None => Flow::Continue(StreamSignal::Stopped),
            },
            other => Flow::Continue(other),
        }
    }

    fn control(&mut self, signal: ControlSignal, cx: &NodeCx) -> ControlFlow {
        let emitter = self.emitter(cx);
        match signal {
            ControlSignal::Next => (self.on_next)(&mut self.context, &emitter),
            ControlSignal::Done => match self.on_done {
                Some(ref mut on_done) => on_done(&mut self.context, &emitter),
                None => emitter.end(),
            },
        }
        ControlFlow::Handled
    }

    fn interrupted(&mut self, cx: &NodeCx) {
        if let Some(on_interrupt) = self.on_interrupt.take() {
            let emitter = self.emitter(cx);
            on_interrupt(&mut self.context, &emitter);
        }
    }

    fn register(&mut self, interrupt: &Interrupt, cx: &NodeCx) {
        if self.on_interrupt.is_some() {
            let machine = cx.machine.clone();
            let installed = interrupt.install(Box::new(move || {
                MachineCore::push(&machine, Cmd::Interrupted);
            }));
            if installed.is_err() {
                self.interrupted_before_start = true;
            }
        }
    }
}

/// The one-shot continuation a materialized stream presents to its
/// upstream; starting it launches the machine.
pub struct SourceContinuation<Arg> {
    nodes: Vec<Box<dyn StreamNode>>,
    interrupt: Option<Interrupt>,
    _marker: PhantomData<fn(Arg)>,
}

impl<Arg: Send + 'static> SourceContinuation<Arg> {
    fn launch(self, first: StreamSignal) {
        let machine = MachineCore::new(self.nodes);
        if let Some(interrupt) = &self.interrupt {
            let mut nodes = machine.nodes.lock().unwrap();
            for index in 0..nodes.len() {
                let cx = NodeCx {
                    machine: machine.clone(),
                    index,
                };
                nodes[index].register(interrupt, &cx);
            }
        }
        MachineCore::push(&machine, Cmd::Deliver(0, first));
    }
}

impl<Arg: Send + 'static> Continuation<Arg> for SourceContinuation<Arg> {
    fn started(self, _value: Arg) {
        // Sources read their input from their context; the upstream value
        // only sequences the start.
        self.launch(StreamSignal::Started);
    }

    fn failed(self, error: Error) {
        self.launch(StreamSignal::Failed(error));
    }

    fn stopped(self) {
        self.launch(StreamSignal::Stopped);
    }

    fn register(&mut self, interrupt: &Interrupt) {
        self.interrupt = Some(interrupt.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::sink::collect;
    use crate::terminal::run;

    #[test]
    fn test_stream_builder_counts_down() {
        let source = stream::<i32>().context(5).on_next(|count, emitter| {
            if *count > 0 {
                let value = *count;
                *count -= 1;
                emitter.emit(value);
            } else {
                emitter.end();
            }
        });

        let result = run(source | collect::<Vec<i32>>()).unwrap();
        assert_eq!(result, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_stream_asynchronous_emission() {
        // The source answers each `next` from a freshly spawned thread; the
        // machine serializes deliveries regardless of the emitting thread.
        let source = stream::<i32>().context(0).on_next(|produced, emitter| {
            if *produced == 3 {
                emitter.end();
            } else {
                *produced += 1;
                let value = *produced;
                let emitter = emitter.clone();
                std::thread::spawn(move || emitter.emit(value));
            }
        });

        let result = run(source | collect::<Vec<i32>>()).unwrap();
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[test]
    fn test_stream_failure_terminates() {
        let source = stream::<i32>().on_next(|_ctx, emitter| emitter.fail("source broke"));
        let result = run(source | collect::<Vec<i32>>());
        assert!(matches!(result, Err(Error::Failed(m)) if m == "source broke"));
    }

    #[test]
    fn test_one_next_per_body() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let nexts = Arc::new(AtomicUsize::new(0));
        let counting = nexts.clone();
        let source = stream::<i32>().context(0).on_next(move |produced, emitter| {
            counting.fetch_add(1, Ordering::SeqCst);
            if *produced < 5 {
                *produced += 1;
                emitter.emit(*produced);
            } else {
                emitter.end();
            }
        });

        let sink = crate::stream::sink::loop_::<i32, usize>()
            .context(0usize)
            .on_body(|bodies, ctl, _value: i32| {
                *bodies += 1;
                ctl.next();
            })
            .on_ended(|bodies, handle| handle.succeed(*bodies));

        let bodies = run(source | sink).unwrap();
        assert_eq!(bodies, 5);
        // One `next` per body, plus the final one answered by `end`.
        assert_eq!(nexts.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_large_stream_does_not_overflow_stack() {
        let source = stream::<u64>().context(0u64).on_next(|i, emitter| {
            if *i < 100_000 {
                *i += 1;
                emitter.emit(*i);
            } else {
                emitter.end();
            }
        });

        let result = run(source
            | crate::stream::sink::reduce(0u64, |acc: u64, v: u64| {
                crate::eventual::just((acc + v, true))
            }))
        .unwrap();
        assert_eq!(result, 100_000 * 100_001 / 2);
    }
}
