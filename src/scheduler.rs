//! Schedulers, scheduler contexts, and the rescheduling discipline.
//!
//! A [`Context`] is a named identity for a logical task. At most one context
//! is current per OS thread; installing one is always paired with restoring
//! the previous one ([`ContextGuard`]). The default scheduler executes
//! submitted work synchronously on the calling thread, preempting whatever
//! context is current for the duration of the call.
//!
//! [`reschedule`] is the stage that hops execution back onto a specific
//! context's scheduler before forwarding any signal; [`preempt`] runs an
//! inner stage under a fresh context on the default scheduler and then
//! reschedules back to the parent context.

use crate::compose::{stage, Eventual, ValueKind};
use crate::continuation::Continuation;
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

/// A unit of work handed to a scheduler.
pub type Job = Box<dyn FnOnce() + Send>;

/// Routes resumptions onto execution resources.
///
/// Implementations must install the supplied context around the job
/// (see [`ContextGuard`]) so that user code observes it via [`current`].
pub trait Scheduler: Send + Sync + 'static {
    /// Submit a job to run under `context`. With `defer = false` the
    /// scheduler may run the job inline when the calling thread is already
    /// the right execution resource; ordering guarantees relax when that
    /// shortcut applies.
    fn submit(&self, job: Job, context: &Context, defer: bool);

    /// Whether the current thread may inline-execute work for `context`.
    fn continuable(&self, context: &Context) -> bool;
}

struct ContextInner {
    name: String,
    scheduler: Arc<dyn Scheduler>,
    pinned: Option<usize>,
}

/// A named identity for a logical task, bound to the scheduler that created
/// it. Cheap to clone; clones are the same identity.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(name: impl Into<String>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name: name.into(),
                scheduler,
                pinned: None,
            }),
        }
    }

    /// A context pinned to a specific core (used by pool schedulers).
    pub fn pinned(name: impl Into<String>, scheduler: Arc<dyn Scheduler>, core: usize) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name: name.into(),
                scheduler,
                pinned: Some(core),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.inner.scheduler.clone()
    }

    pub fn core(&self) -> Option<usize> {
        self.inner.pinned
    }

    /// Identity comparison: clones of the same context are equal.
    pub fn same(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.name)
            .field("pinned", &self.inner.pinned)
            .finish()
    }
}

thread_local! {
    static STACK: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
    static ROOT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// The context current on this thread.
///
/// Falls back to a per-thread root context on the default scheduler when
/// nothing has been installed (the main thread and bare test threads).
pub fn current() -> Context {
    if let Some(context) = STACK.with(|stack| stack.borrow().last().cloned()) {
        return context;
    }
    ROOT.with(|root| {
        root.borrow_mut()
            .get_or_insert_with(|| {
                let name = std::thread::current()
                    .name()
                    .unwrap_or("thread")
                    .to_string();
                Context::new(name, default_scheduler())
            })
            .clone()
    })
}

/// Installs a context as current for the guard's lifetime; dropping the
/// guard restores the previous one. Install/restore is always paired.
pub struct ContextGuard {
    _private: (),
}

impl ContextGuard {
    pub fn install(context: Context) -> Self {
        STACK.with(|stack| stack.borrow_mut().push(context));
        Self { _private: () }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// The default scheduler: runs submitted work synchronously on the calling
/// thread, preempting the current context for the duration.
pub struct DirectScheduler;

impl Scheduler for DirectScheduler {
    fn submit(&self, job: Job, context: &Context, _defer: bool) {
        let parent = current();
        tracing::trace!("'{}' preempting '{}'", context.name(), parent.name());
        let _guard = ContextGuard::install(context.clone());
        job();
    }

    fn continuable(&self, _context: &Context) -> bool {
        true
    }
}

static DEFAULT: OnceLock<Arc<dyn Scheduler>> = OnceLock::new();

/// The process-wide default scheduler ([`DirectScheduler`] unless replaced).
pub fn default_scheduler() -> Arc<dyn Scheduler> {
    DEFAULT.get_or_init(|| Arc::new(DirectScheduler)).clone()
}

/// Replace the process-wide default scheduler. One-shot: must happen before
/// any pipeline starts, and fails once the default has been observed.
pub fn init_default(scheduler: Arc<dyn Scheduler>) -> Result<()> {
    DEFAULT.set(scheduler).map_err(|_| {
        Error::InvalidConfig("default scheduler already initialized".to_string())
    })
}

/// Stage that submits every signal (start, fail, stop) to `context`'s
/// scheduler before forwarding, so downstream code runs with `context`
/// current.
pub fn reschedule(context: Context) -> Reschedule {
    Reschedule { context }
}

#[derive(Clone)]
pub struct Reschedule {
    context: Context,
}

stage!(Reschedule => ValueKind);

impl<A: Send + 'static> Eventual<A> for Reschedule {
    type Output = A;
    type Materialized<K: Continuation<A>> = RescheduleContinuation<K>;

    fn materialize<K: Continuation<A>>(self, k: K) -> RescheduleContinuation<K> {
        RescheduleContinuation {
            context: self.context,
            k,
        }
    }
}

pub struct RescheduleContinuation<K> {
    pub(crate) context: Context,
    pub(crate) k: K,
}

impl<A, K> Continuation<A> for RescheduleContinuation<K>
where
    A: Send + 'static,
    K: Continuation<A>,
{
    fn started(self, value: A) {
        let Self { context, k } = self;
        tracing::trace!("reschedule submitting '{}'", context.name());
        let scheduler = context.scheduler();
        scheduler.submit(Box::new(move || k.started(value)), &context, false);
    }

    fn failed(self, error: Error) {
        let Self { context, k } = self;
        let scheduler = context.scheduler();
        scheduler.submit(Box::new(move || k.failed(error)), &context, false);
    }

    fn stopped(self) {
        let Self { context, k } = self;
        let scheduler = context.scheduler();
        scheduler.submit(Box::new(move || k.stopped()), &context, false);
    }

    fn register(&mut self, interrupt: &Interrupt) {
        self.k.register(interrupt);
    }
}

/// Runs `e` under a fresh context on the default scheduler, then reschedules
/// back to the parent context before forwarding downstream.
pub fn preempt<E>(name: impl Into<String>, e: E) -> Preempt<E> {
    Preempt {
        name: name.into(),
        e,
    }
}

pub struct Preempt<E> {
    name: String,
    e: E,
}

stage!(Preempt<E> => ValueKind);

impl<A, E> Eventual<A> for Preempt<E>
where
    A: Send + 'static,
    E: Eventual<A> + Send + 'static,
{
    type Output = E::Output;
    type Materialized<K: Continuation<E::Output>> = PreemptContinuation<E, K>;

    fn materialize<K: Continuation<E::Output>>(self, k: K) -> PreemptContinuation<E, K> {
        PreemptContinuation {
            name: self.name,
            e: self.e,
            k,
            interrupt: None,
        }
    }
}

pub struct PreemptContinuation<E, K> {
    name: String,
    e: E,
    k: K,
    interrupt: Option<Interrupt>,
}

impl<E, K> PreemptContinuation<E, K> {
    fn adapt<A>(self) -> (ContextGuard, <E as Eventual<A>>::Materialized<RescheduleContinuation<K>>)
    where
        A: Send + 'static,
        E: Eventual<A>,
        K: Continuation<E::Output>,
    {
        let parent = current();
        let context = Context::new(self.name, default_scheduler());
        let guard = ContextGuard::install(context);
        let mut inner = self.e.materialize(RescheduleContinuation {
            context: parent,
            k: self.k,
        });
        if let Some(interrupt) = &self.interrupt {
            inner.register(interrupt);
        }
        (guard, inner)
    }
}

impl<A, E, K> Continuation<A> for PreemptContinuation<E, K>
where
    A: Send + 'static,
    E: Eventual<A> + Send + 'static,
    K: Continuation<E::Output>,
{
    fn started(self, value: A) {
        let (_guard, inner) = self.adapt::<A>();
        inner.started(value);
    }

    fn failed(self, error: Error) {
        let (_guard, inner) = self.adapt::<A>();
        inner.failed(error);
    }

    fn stopped(self) {
        let (_guard, inner) = self.adapt::<A>();
        inner.stopped();
    }

    fn register(&mut self, interrupt: &Interrupt) {
        self.interrupt = Some(interrupt.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventual::just;
    use crate::terminal::run;
    use crate::then::then;

    #[test]
    fn test_current_falls_back_to_root() {
        let context = current();
        assert!(current().same(&context));
    }

    #[test]
    fn test_guard_installs_and_restores() {
        let before = current();
        {
            let inner = Context::new("inner", default_scheduler());
            let _guard = ContextGuard::install(inner.clone());
            assert!(current().same(&inner));
        }
        assert!(current().same(&before));
    }

    #[test]
    fn test_reschedule_makes_context_current() {
        let context = Context::new("hopped", default_scheduler());
        let observed = context.clone();

        let result = run(just(1)
            | reschedule(context)
            | then(move |x: i32| {
                assert!(current().same(&observed));
                x + 1
            }))
        .unwrap();

        assert_eq!(result, 2);
    }

    #[test]
    fn test_preempt_restores_parent() {
        let parent = current();
        let check = parent.clone();

        let result = run(just(10)
            | preempt("worker", then(|x: i32| x * 2))
            | then(move |x: i32| {
                // Back on the parent context after the preempted stage.
                assert!(current().same(&check));
                x + 1
            }))
        .unwrap();

        assert_eq!(result, 21);
    }

    #[test]
    fn test_init_default_after_use_fails() {
        let _ = default_scheduler();
        assert!(init_default(Arc::new(DirectScheduler)).is_err());
    }
}
