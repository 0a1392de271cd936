//! Cooperative locking: [`Lock`], the [`acquire`]/[`release`] stages, and
//! the [`Synchronizable`] mixin.
//!
//! `Lock` is not a mutex: acquiring never blocks an OS thread. A contended
//! acquire enqueues a waiter callback; `release` hands ownership to the
//! head waiter and runs its callback synchronously on the releasing thread
//! (direct hand-off: a newly enqueued waiter can never observe the lock
//! free while an earlier waiter has not resumed). Waiters resume strictly
//! in acquire order.

use crate::compose::{stage, Eventual, Piped, ValueKind};
use crate::continuation::Continuation;
use crate::error::Error;
use crate::interrupt::Interrupt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Waiter = Box<dyn FnOnce() + Send>;

struct LockState {
    held: bool,
    waiters: VecDeque<Waiter>,
}

/// A cooperative, non-reentrant, FIFO lock shared by the stages that
/// reference it.
pub struct Lock {
    state: Mutex<LockState>,
}

impl Lock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                held: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Run `wake` as the lock's holder: synchronously if the lock is free,
    /// otherwise once every earlier waiter has acquired and released.
    pub fn acquire(&self, wake: Waiter) {
        let run_now = {
            let mut state = self.state.lock().unwrap();
            if state.held {
                state.waiters.push_back(wake);
                None
            } else {
                state.held = true;
                Some(wake)
            }
        };
        if let Some(wake) = run_now {
            wake();
        }
    }

    /// Release the lock, handing off to the head waiter if any.
    pub fn release(&self) {
        let next = {
            let mut state = self.state.lock().unwrap();
            if !state.held {
                tracing::warn!("release of a lock that is not held");
                return;
            }
            match state.waiters.pop_front() {
                // Ownership transfers directly; `held` stays true.
                Some(wake) => Some(wake),
                None => {
                    state.held = false;
                    None
                }
            }
        };
        if let Some(wake) = next {
            tracing::trace!("lock hand-off to next waiter");
            wake();
        }
    }

    /// Whether the lock is currently held.
    pub fn held(&self) -> bool {
        self.state.lock().unwrap().held
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage that queues every signal (start, fail, stop) behind acquisition of
/// `lock`; downstream runs holding it.
pub fn acquire(lock: Arc<Lock>) -> Acquire {
    Acquire { lock }
}

#[derive(Clone)]
pub struct Acquire {
    lock: Arc<Lock>,
}

stage!(Acquire => ValueKind);

impl<A: Send + 'static> Eventual<A> for Acquire {
    type Output = A;
    type Materialized<K: Continuation<A>> = AcquireContinuation<K>;

    fn materialize<K: Continuation<A>>(self, k: K) -> AcquireContinuation<K> {
        AcquireContinuation { lock: self.lock, k }
    }
}

pub struct AcquireContinuation<K> {
    lock: Arc<Lock>,
    k: K,
}

impl<A, K> Continuation<A> for AcquireContinuation<K>
where
    A: Send + 'static,
    K: Continuation<A>,
{
    fn started(self, value: A) {
        let Self { lock, k } = self;
        lock.acquire(Box::new(move || k.started(value)));
    }

    fn failed(self, error: Error) {
        let Self { lock, k } = self;
        lock.acquire(Box::new(move || k.failed(error)));
    }

    fn stopped(self) {
        let Self { lock, k } = self;
        lock.acquire(Box::new(move || k.stopped()));
    }

    fn register(&mut self, interrupt: &Interrupt) {
        self.k.register(interrupt);
    }
}

/// Stage that releases `lock`, then forwards the signal.
pub fn release(lock: Arc<Lock>) -> Release {
    Release { lock }
}

#[derive(Clone)]
pub struct Release {
    lock: Arc<Lock>,
}

stage!(Release => ValueKind);

impl<A: Send + 'static> Eventual<A> for Release {
    type Output = A;
    type Materialized<K: Continuation<A>> = ReleaseContinuation<K>;

    fn materialize<K: Continuation<A>>(self, k: K) -> ReleaseContinuation<K> {
        ReleaseContinuation { lock: self.lock, k }
    }
}

pub struct ReleaseContinuation<K> {
    lock: Arc<Lock>,
    k: K,
}

impl<A, K> Continuation<A> for ReleaseContinuation<K>
where
    A: Send + 'static,
    K: Continuation<A>,
{
    fn started(self, value: A) {
        self.lock.release();
        self.k.started(value);
    }

    fn failed(self, error: Error) {
        self.lock.release();
        self.k.failed(error);
    }

    fn stopped(self) {
        self.lock.release();
        self.k.stopped();
    }

    fn register(&mut self, interrupt: &Interrupt) {
        self.k.register(interrupt);
    }
}

/// A pipeline fragment holding a lock around an inner stage.
pub type Synchronized<E> = Piped<Piped<Acquire, E>, Release>;

/// Mixin for types that own a [`Lock`] and offer `synchronized(e)` sugar:
/// acquire, run `e` holding the lock, release.
pub trait Synchronizable {
    fn lock(&self) -> &Arc<Lock>;

    fn synchronized<E: crate::compose::Stage>(&self, e: E) -> Synchronized<E> {
        acquire(self.lock().clone()) | e | release(self.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventual::{eventual, EventualHandle};
    use crate::terminal::{promisify, run};
    use crate::then::then;

    #[test]
    fn test_uncontended_acquire_runs_inline() {
        let lock = Arc::new(Lock::new());
        let result = run(crate::eventual::just(5)
            | acquire(lock.clone())
            | then(|x: i32| x * 2)
            | release(lock.clone()))
        .unwrap();
        assert_eq!(result, 10);
        assert!(!lock.held());
    }

    #[test]
    fn test_waiters_resume_in_acquire_order() {
        let lock = Arc::new(Lock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Pipeline A acquires and then suspends while holding the lock.
        let gate: Arc<Mutex<Option<EventualHandle<i32>>>> = Arc::new(Mutex::new(None));
        let stash = gate.clone();
        let record_a = order.clone();
        let a = crate::eventual::just(0)
            | acquire(lock.clone())
            | eventual::<i32>().on_start(move |handle, _x: i32| {
                *stash.lock().unwrap() = Some(handle);
            })
            | then(move |x: i32| {
                record_a.lock().unwrap().push("A");
                x
            })
            | release(lock.clone());

        let record_b = order.clone();
        let b = crate::eventual::just(0)
            | acquire(lock.clone())
            | then(move |x: i32| {
                record_b.lock().unwrap().push("B");
                x
            })
            | release(lock.clone());

        let (future_a, driver_a) = promisify(a);
        let (future_b, driver_b) = promisify(b);

        driver_a.start(); // A holds the lock, suspended.
        driver_b.start(); // B queues behind A.
        assert!(order.lock().unwrap().is_empty());

        // Resume A: it records, releases, and the hand-off runs B.
        gate.lock().unwrap().take().unwrap().succeed(1);

        assert_eq!(*order.lock().unwrap(), vec!["A", "B"]);
        futures::executor::block_on(future_a).unwrap();
        futures::executor::block_on(future_b).unwrap();
        assert!(!lock.held());
    }

    #[test]
    fn test_release_forwards_failure() {
        let lock = Arc::new(Lock::new());
        let result = run(crate::eventual::raise::<i32>("held error")
            | acquire(lock.clone())
            | release(lock.clone()));
        assert!(matches!(result, Err(Error::Failed(m)) if m == "held error"));
        assert!(!lock.held());
    }

    #[test]
    fn test_synchronizable_sugar() {
        struct Counter {
            lock: Arc<Lock>,
        }

        impl Synchronizable for Counter {
            fn lock(&self) -> &Arc<Lock> {
                &self.lock
            }
        }

        let counter = Counter {
            lock: Arc::new(Lock::new()),
        };

        let result = run(crate::eventual::just(1)
            | counter.synchronized(then(|x: i32| x + 41)))
        .unwrap();
        assert_eq!(result, 42);
        assert!(!counter.lock.held());
    }
}
