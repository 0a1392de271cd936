//! The concurrent scheduler: a static pool with one worker per core, each
//! pinned and draining its own FIFO intake, plus the [`schedule`] stage for
//! pinned execution and the [`parallel`] stream adapter.

use crate::compose::{stage, Eventual, StreamTransform, TransformKind, ValueKind};
use crate::continuation::{downcast_item, Continuation, Item, Registered};
use crate::error::Error;
use crate::interrupt::Interrupt;
use crate::scheduler::{current, Context, ContextGuard, Job, RescheduleContinuation, Scheduler};
use crate::stream::node::{ControlFlow, ControlSignal, Flow, StreamNode, StreamSignal};
use crate::stream::NodeCx;
use std::cell::Cell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Configuration for a [`StaticThreadPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    workers: Option<usize>,
    pin_cores: bool,
    name: String,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            workers: None,
            pin_cores: true,
            name: "pool".to_string(),
        }
    }

    /// Worker count. Default: one per available core.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    /// Disable core pinning (useful in constrained test environments).
    pub fn without_pinning(mut self) -> Self {
        self.pin_cores = false;
        self
    }

    /// Thread name prefix.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct PoolJob {
    job: Job,
    context: Context,
}

thread_local! {
    /// `(pool id, core)` when this thread is a pool worker.
    static POOL_SLOT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

/// One OS thread per core, each with its own FIFO intake queue. Submitting
/// either executes inline (already on the target core and the submit site
/// allowed it) or enqueues and wakes the worker.
pub struct StaticThreadPool {
    id: usize,
    senders: Vec<flume::Sender<PoolJob>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    concurrency: usize,
}

impl StaticThreadPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let concurrency = config.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let core_ids = if config.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        if config.pin_cores && core_ids.is_empty() {
            tracing::warn!("could not get core ids; running unpinned");
        }

        let mut senders = Vec::with_capacity(concurrency);
        let mut handles = Vec::with_capacity(concurrency);
        for core in 0..concurrency {
            let (tx, rx) = flume::unbounded::<PoolJob>();
            senders.push(tx);
            let core_id = core_ids.get(core % core_ids.len().max(1)).copied();
            let name = format!("{}-{}", config.name, core);
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    if let Some(core_id) = core_id {
                        if !core_affinity::set_for_current(core_id) {
                            tracing::warn!("failed to pin '{}' to {:?}", name, core_id);
                        }
                    }
                    POOL_SLOT.with(|slot| slot.set(Some((id, core))));
                    for PoolJob { job, context } in rx.iter() {
                        tracing::trace!("'{}' running on core {}", context.name(), core);
                        let _guard = ContextGuard::install(context);
                        job();
                    }
                })
                .expect("failed to spawn pool worker");
            handles.push(handle);
        }

        Arc::new(Self {
            id,
            senders,
            handles: Mutex::new(handles),
            concurrency,
        })
    }

    /// The process-wide pool, created on first use with defaults.
    pub fn global() -> Arc<StaticThreadPool> {
        static GLOBAL: OnceLock<Arc<StaticThreadPool>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| StaticThreadPool::new(PoolConfig::new()))
            .clone()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The core this thread serves, if it is one of this pool's workers.
    pub fn member_core(&self) -> Option<usize> {
        POOL_SLOT.with(|slot| match slot.get() {
            Some((pool, core)) if pool == self.id => Some(core),
            _ => None,
        })
    }

    /// Drain the pool: close intakes and join every worker. Called
    /// automatically when the last reference drops.
    fn shutdown(&mut self) {
        self.senders.clear();
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for StaticThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Scheduler for StaticThreadPool {
    fn submit(&self, job: Job, context: &Context, defer: bool) {
        let core = context.core().unwrap_or(0) % self.concurrency;
        // Inline execution bypasses the queue; per-core FIFO ordering
        // relaxes when a submit site opts into it.
        if !defer && self.member_core() == Some(core) {
            let _guard = ContextGuard::install(context.clone());
            job();
            return;
        }
        if self.senders[core]
            .send(PoolJob {
                job,
                context: context.clone(),
            })
            .is_err()
        {
            tracing::warn!("submit to a pool that has shut down");
        }
    }

    fn continuable(&self, context: &Context) -> bool {
        self.member_core().is_some() && self.member_core() == context.core()
    }
}

/// Core requirement for a [`Schedulable`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Pinned {
    pub core: Option<usize>,
}

impl Pinned {
    pub fn core(core: usize) -> Self {
        Self { core: Some(core) }
    }

    pub fn any() -> Self {
        Self { core: None }
    }
}

/// Execution requirements carried by a [`Schedulable`].
#[derive(Clone, Debug)]
pub struct Requirements {
    pub name: String,
    pub pinned: Pinned,
}

impl Requirements {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pinned: Pinned::any(),
        }
    }

    pub fn pinned(mut self, pinned: Pinned) -> Self {
        self.pinned = pinned;
        self
    }
}

/// Types whose operations must run pinned to their required core.
pub trait Schedulable {
    fn requirements(&self) -> &Requirements;

    /// Build a stage that runs `f`'s eventual on this object's core of the
    /// global pool, then reschedules back to the parent context.
    fn schedule<F>(&self, f: F) -> Schedule<F> {
        schedule_on(StaticThreadPool::global(), self.requirements().clone(), f)
    }
}

/// [`Schedulable::schedule`] against an explicit pool.
pub fn schedule_on<F>(pool: Arc<StaticThreadPool>, requirements: Requirements, f: F) -> Schedule<F> {
    Schedule {
        pool,
        requirements,
        f,
    }
}

#[derive(Clone)]
pub struct Schedule<F> {
    pool: Arc<StaticThreadPool>,
    requirements: Requirements,
    f: F,
}

stage!(Schedule<F> => ValueKind);

impl<A, E, F> Eventual<A> for Schedule<F>
where
    A: Send + 'static,
    E: Eventual<()>,
    F: FnOnce(A) -> E + Send + 'static,
{
    type Output = E::Output;
    type Materialized<K: Continuation<E::Output>> = ScheduleContinuation<F, K>;

    fn materialize<K: Continuation<E::Output>>(self, k: K) -> ScheduleContinuation<F, K> {
        ScheduleContinuation {
            pool: self.pool,
            requirements: self.requirements,
            f: self.f,
            k,
            interrupt: None,
        }
    }
}

pub struct ScheduleContinuation<F, K> {
    pool: Arc<StaticThreadPool>,
    requirements: Requirements,
    f: F,
    k: K,
    interrupt: Option<Interrupt>,
}

impl<A, E, F, K> Continuation<A> for ScheduleContinuation<F, K>
where
    A: Send + 'static,
    E: Eventual<()>,
    F: FnOnce(A) -> E + Send + 'static,
    K: Continuation<E::Output>,
{
    fn started(self, value: A) {
        let Self {
            pool,
            requirements,
            f,
            k,
            interrupt,
        } = self;

        // TODO(load): pick the least loaded core when none is required.
        let core = requirements.pinned.core.unwrap_or(0);
        if core >= pool.concurrency() {
            k.failed(Error::InvalidConfig(format!(
                "required core {core} is beyond pool width {}",
                pool.concurrency()
            )));
            return;
        }

        let parent = current();
        let context = Context::pinned(
            requirements.name.clone(),
            pool.clone() as Arc<dyn Scheduler>,
            core,
        );

        let job = Box::new(move || {
            let mut inner = f(value).materialize(Registered {
                k: RescheduleContinuation { context: parent, k },
            });
            if let Some(interrupt) = &interrupt {
                inner.register(interrupt);
            }
            inner.started(());
        });

        pool.submit(job, &context, false);
    }

    fn failed(self, error: Error) {
        self.k.failed(error);
    }

    fn stopped(self) {
        self.k.stopped();
    }

    fn register(&mut self, interrupt: &Interrupt) {
        self.k.register(interrupt);
        self.interrupt = Some(interrupt.clone());
    }
}

/// Stream adapter running each body through a fresh eventual from `factory`
/// on an independent worker of the global pool; in-flight work is bounded
/// by the pool width and results are delivered in completion order.
pub fn parallel<F>(factory: F) -> Parallel<F> {
    parallel_on(StaticThreadPool::global(), factory)
}

/// [`parallel`] against an explicit pool.
pub fn parallel_on<F>(pool: Arc<StaticThreadPool>, factory: F) -> Parallel<F> {
    Parallel { pool, factory }
}

pub struct Parallel<F> {
    pool: Arc<StaticThreadPool>,
    factory: F,
}

stage!(Parallel<F> => TransformKind);

impl<A, E, F> StreamTransform<A> for Parallel<F>
where
    A: Send + 'static,
    E: Eventual<A> + Send + 'static,
    E::Output: Send + 'static,
    F: Fn() -> E + Send + 'static,
{
    type Item = E::Output;

    fn push_nodes(self, nodes: &mut Vec<Box<dyn StreamNode>>) {
        nodes.push(Box::new(ParallelNode::<A, E, F> {
            pool: self.pool,
            factory: self.factory,
            shared: Arc::new(Mutex::new(ParState {
                in_flight: 0,
                results: VecDeque::new(),
                failure: None,
            })),
            live: false,
            outstanding_upstream: false,
            upstream_ended: false,
            downstream_waiting: false,
            discard: false,
            terminated: false,
            job_counter: 0,
            _marker: PhantomData,
        }));
    }
}

struct ParState<B> {
    in_flight: usize,
    results: VecDeque<B>,
    failure: Option<Error>,
}

struct ParallelAdaptor<B> {
    shared: Arc<Mutex<ParState<B>>>,
    handle: crate::stream::ResumeHandle,
}

impl<B: Send + 'static> Continuation<B> for ParallelAdaptor<B> {
    fn started(self, value: B) {
        {
            let mut state = self.shared.lock().unwrap();
            state.in_flight -= 1;
            state.results.push_back(value);
        }
        self.handle.resume(Box::new(()));
    }

    fn failed(self, error: Error) {
        {
            let mut state = self.shared.lock().unwrap();
            state.in_flight -= 1;
            state.failure.get_or_insert(error);
        }
        self.handle.resume(Box::new(()));
    }

    fn stopped(self) {
        {
            let mut state = self.shared.lock().unwrap();
            state.in_flight -= 1;
            state.failure.get_or_insert(Error::Stopped);
        }
        self.handle.resume(Box::new(()));
    }

    fn register(&mut self, _interrupt: &Interrupt) {}
}

struct ParallelNode<A, E: Eventual<A>, F> {
    pool: Arc<StaticThreadPool>,
    factory: F,
    shared: Arc<Mutex<ParState<E::Output>>>,
    /// The sink has issued its first `next`.
    live: bool,
    outstanding_upstream: bool,
    upstream_ended: bool,
    downstream_waiting: bool,
    discard: bool,
    terminated: bool,
    job_counter: usize,
    _marker: PhantomData<fn(A)>,
}

impl<A, E, F> ParallelNode<A, E, F>
where
    A: Send + 'static,
    E: Eventual<A> + Send + 'static,
    E::Output: Send + 'static,
    F: Fn() -> E + Send + 'static,
{
    fn dispatch(&mut self, value: A, cx: &NodeCx) {
        self.shared.lock().unwrap().in_flight += 1;

        let core = self.job_counter % self.pool.concurrency();
        self.job_counter += 1;
        let context = Context::pinned(
            "parallel",
            self.pool.clone() as Arc<dyn Scheduler>,
            core,
        );

        let e = (self.factory)();
        let adaptor = ParallelAdaptor {
            shared: self.shared.clone(),
            handle: cx.resume_handle(),
        };
        // defer: queue even when already on the target core.
        self.pool.submit(
            Box::new(move || e.materialize(adaptor).started(value)),
            &context,
            true,
        );
    }

    fn pump(&mut self, cx: &NodeCx) {
        if self.terminated {
            return;
        }

        let (result, failure, idle) = {
            let mut state = self.shared.lock().unwrap();
            if self.discard {
                state.results.clear();
            }
            let result = if self.downstream_waiting {
                state.results.pop_front()
            } else {
                None
            };
            let failure = if self.downstream_waiting && result.is_none() {
                state.failure.take()
            } else {
                None
            };
            (result, failure, state.in_flight == 0)
        };

        let handle = cx.resume_handle();
        if let Some(value) = result {
            self.downstream_waiting = false;
            handle.forward(StreamSignal::Body(Box::new(value)));
        } else if let Some(error) = failure {
            self.terminated = true;
            self.downstream_waiting = false;
            if !self.upstream_ended {
                cx.done_upstream();
            }
            handle.forward(StreamSignal::Failed(error));
            return;
        } else if self.downstream_waiting && self.upstream_ended && idle {
            self.downstream_waiting = false;
            handle.forward(StreamSignal::Ended);
        }

        // Keep up to pool-width bodies in flight.
        let below_width = self.shared.lock().unwrap().in_flight < self.pool.concurrency();
        if self.live
            && !self.upstream_ended
            && !self.outstanding_upstream
            && !self.discard
            && below_width
        {
            self.outstanding_upstream = true;
            cx.next_upstream();
        }
    }
}

impl<A, E, F> StreamNode for ParallelNode<A, E, F>
where
    A: Send + 'static,
    E: Eventual<A> + Send + 'static,
    E::Output: Send + 'static,
    F: Fn() -> E + Send + 'static,
{
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow {
        match signal {
            StreamSignal::Started => return Flow::Continue(StreamSignal::Started),
            StreamSignal::Body(item) => {
                self.outstanding_upstream = false;
                let value = downcast_item::<A>(item);
                if !self.discard {
                    self.dispatch(value, cx);
                }
                self.pump(cx);
            }
            StreamSignal::Ended => {
                self.outstanding_upstream = false;
                self.upstream_ended = true;
                self.pump(cx);
            }
            StreamSignal::Failed(error) => {
                self.terminated = true;
                return Flow::Continue(StreamSignal::Failed(error));
            }
            StreamSignal::Stopped => {
                self.terminated = true;
                return Flow::Continue(StreamSignal::Stopped);
            }
        }
        Flow::Handled
    }

    fn control(&mut self, signal: ControlSignal, cx: &NodeCx) -> ControlFlow {
        match signal {
            ControlSignal::Next => {
                self.live = true;
                self.downstream_waiting = true;
                self.pump(cx);
            }
            ControlSignal::Done => {
                self.discard = true;
                self.downstream_waiting = true;
                if !self.upstream_ended {
                    cx.done_upstream();
                } else {
                    self.pump(cx);
                }
            }
        }
        ControlFlow::Handled
    }

    fn resume(&mut self, _payload: Item, cx: &NodeCx) -> Flow {
        self.pump(cx);
        Flow::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventual::just;
    use crate::stream::iterate::range;
    use crate::stream::sink::collect;
    use crate::terminal::run;
    use crate::then::then;

    fn test_pool() -> Arc<StaticThreadPool> {
        StaticThreadPool::new(PoolConfig::new().with_workers(4).without_pinning())
    }

    #[test]
    fn test_schedule_runs_on_pool_and_returns() {
        let pool = test_pool();
        let observed = pool.clone();

        let requirements = Requirements::new("worker").pinned(Pinned::core(2));
        let result = run(just(41)
            | schedule_on(pool, requirements, move |x: i32| {
                let observed = observed.clone();
                just(x)
                    | then(move |v: i32| {
                        assert_eq!(observed.member_core(), Some(2));
                        v + 1
                    })
            }))
        .unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_schedule_rejects_out_of_range_core() {
        let pool = test_pool();
        let requirements = Requirements::new("worker").pinned(Pinned::core(64));
        let result = run(just(0) | schedule_on(pool, requirements, |x: i32| just(x)));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_schedulable_mixin() {
        struct Counter {
            requirements: Requirements,
            start: i32,
        }

        impl Schedulable for Counter {
            fn requirements(&self) -> &Requirements {
                &self.requirements
            }
        }

        let counter = Counter {
            requirements: Requirements::new("counter").pinned(Pinned::core(0)),
            start: 41,
        };

        let start = counter.start;
        let result = run(just(()) | counter.schedule(move |_: ()| just(start))
            | then(|x: i32| x + 1))
        .unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_parallel_transforms_every_body() {
        let pool = test_pool();
        let mut result = run(range(1, 6)
            | parallel_on(pool, || then(|x: i64| x + 1))
            | collect::<Vec<i64>>())
        .unwrap();
        result.sort_unstable();
        assert_eq!(result, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_parallel_bounded_by_width() {
        let pool = StaticThreadPool::new(PoolConfig::new().with_workers(2).without_pinning());
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let peak2 = peak.clone();
        let active2 = active.clone();
        let mut result = run(range(0, 16)
            | parallel_on(pool, move || {
                let peak = peak2.clone();
                let active = active2.clone();
                then(move |x: i64| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(2));
                    active.fetch_sub(1, Ordering::SeqCst);
                    x
                })
            })
            | collect::<Vec<i64>>())
        .unwrap();
        result.sort_unstable();
        assert_eq!(result, (0..16).collect::<Vec<i64>>());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_parallel_failure_terminates() {
        let pool = test_pool();
        let result = run(range(0, 8)
            | parallel_on(pool, || {
                then(|_x: i64| ()) | crate::eventual::raise::<i64>("worker failed")
            })
            | collect::<Vec<i64>>());
        assert!(result.is_err());
    }

    #[test]
    fn test_reschedule_onto_pool_context() {
        let pool = test_pool();
        let verify = pool.clone();
        let context = Context::pinned("hop", pool as Arc<dyn Scheduler>, 1);
        let target = context.clone();

        let result = run(just(7)
            | crate::scheduler::reschedule(context)
            | then(move |x: i32| {
                assert!(current().same(&target));
                assert_eq!(verify.member_core(), Some(1));
                x * 2
            }))
        .unwrap();
        assert_eq!(result, 14);
    }
}
