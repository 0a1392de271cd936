//! Predicate-gated waiting on a cooperative lock: [`ConditionVariable`] and
//! [`Notification`].

use crate::compose::{stage, Eventual, ValueKind};
use crate::continuation::Continuation;
use crate::error::Error;
use crate::interrupt::Interrupt;
use crate::lock::{Lock, Synchronizable, Synchronized};
use crate::then::{then, Then};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;
type Resume = Box<dyn FnOnce() + Send>;

/// A FIFO of predicate-gated waiters bound to one [`Lock`].
///
/// [`wait`](ConditionVariable::wait) and the notify methods must run while
/// holding that lock (use [`Synchronizable::synchronized`]). Predicates
/// must be pure: they may be evaluated multiple times.
#[derive(Clone)]
pub struct ConditionVariable {
    lock: Arc<Lock>,
    waiters: Arc<Mutex<VecDeque<Resume>>>,
}

impl ConditionVariable {
    pub fn new(lock: Arc<Lock>) -> Self {
        Self {
            lock,
            waiters: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Stage that suspends while `pred` ("keep waiting") is true, releasing
    /// the lock for the duration; a woken waiter re-acquires, re-checks,
    /// and either resumes downstream (still holding the lock) or
    /// re-suspends.
    pub fn wait<P>(&self, pred: P) -> Wait
    where
        P: Fn() -> bool + Send + Sync + 'static,
    {
        Wait {
            cv: self.clone(),
            pred: Arc::new(pred),
        }
    }

    /// Wake the head waiter; it re-checks its predicate once it re-acquires
    /// the lock.
    pub fn notify_one(&self) {
        let next = self.waiters.lock().unwrap().pop_front();
        if let Some(resume) = next {
            resume();
        }
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        let woken: Vec<Resume> = self.waiters.lock().unwrap().drain(..).collect();
        for resume in woken {
            resume();
        }
    }

    /// Number of suspended waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

#[derive(Clone)]
pub struct Wait {
    cv: ConditionVariable,
    pred: Predicate,
}

stage!(Wait => ValueKind);

impl<A: Send + 'static> Eventual<A> for Wait {
    type Output = A;
    type Materialized<K: Continuation<A>> = WaitContinuation<K>;

    fn materialize<K: Continuation<A>>(self, k: K) -> WaitContinuation<K> {
        WaitContinuation {
            cv: self.cv,
            pred: self.pred,
            k,
        }
    }
}

pub struct WaitContinuation<K> {
    cv: ConditionVariable,
    pred: Predicate,
    k: K,
}

/// Park a waiter: enqueue the resumption, then give up the lock. Called
/// with the lock held; a notifier's wake re-acquires before re-checking, so
/// there is no window where a notification can be missed.
fn park<A, K>(cv: ConditionVariable, pred: Predicate, value: A, k: K)
where
    A: Send + 'static,
    K: Continuation<A>,
{
    let resume: Resume = {
        let cv = cv.clone();
        let pred = pred.clone();
        Box::new(move || {
            let lock = cv.lock.clone();
            lock.acquire(Box::new(move || {
                if pred() {
                    // Spurious for this waiter: re-suspend (park gives the
                    // lock back).
                    park(cv.clone(), pred.clone(), value, k);
                } else {
                    k.started(value);
                }
            }));
        })
    };
    cv.waiters.lock().unwrap().push_back(resume);
    cv.lock.release();
}

impl<A, K> Continuation<A> for WaitContinuation<K>
where
    A: Send + 'static,
    K: Continuation<A>,
{
    fn started(self, value: A) {
        let Self { cv, pred, k } = self;
        if pred() {
            park(cv, pred, value, k);
        } else {
            k.started(value);
        }
    }

    fn failed(self, error: Error) {
        self.k.failed(error);
    }

    fn stopped(self) {
        self.k.stopped();
    }

    fn register(&mut self, interrupt: &Interrupt) {
        self.k.register(interrupt);
    }
}

type NotifyStage = Synchronized<Then<Box<dyn FnOnce(()) + Send>>>;

/// A one-shot, idempotent signal: a [`ConditionVariable`] plus a boolean.
/// Waiters registered after notification complete immediately.
pub struct Notification {
    lock: Arc<Lock>,
    cv: ConditionVariable,
    notified: Arc<AtomicBool>,
}

impl Notification {
    pub fn new() -> Self {
        let lock = Arc::new(Lock::new());
        Self {
            cv: ConditionVariable::new(lock.clone()),
            lock,
            notified: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stage that sets the flag and wakes all waiters. Idempotent: later
    /// notifies are no-ops.
    pub fn notify(&self) -> NotifyStage {
        let notified = self.notified.clone();
        let cv = self.cv.clone();
        self.synchronized(then(Box::new(move |_: ()| {
            if !notified.swap(true, Ordering::SeqCst) {
                cv.notify_all();
            }
        }) as Box<dyn FnOnce(()) + Send>))
    }

    /// Stage that completes once the notification has fired.
    pub fn wait(&self) -> Synchronized<Wait> {
        let notified = self.notified.clone();
        self.synchronized(self.cv.wait(move || !notified.load(Ordering::SeqCst)))
    }

    /// Whether the notification has fired.
    pub fn notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

impl Synchronizable for Notification {
    fn lock(&self) -> &Arc<Lock> {
        &self.lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{promisify, run};

    #[test]
    fn test_notify_then_wait_completes_immediately() {
        let notification = Notification::new();
        run(notification.notify()).unwrap();
        run(notification.wait()).unwrap();
        assert!(notification.notified());
    }

    #[test]
    fn test_wait_then_notify() {
        let notification = Notification::new();

        let (future, driver) = promisify(notification.wait());
        driver.start();
        assert_eq!(notification.cv.waiter_count(), 1);

        run(notification.notify()).unwrap();
        futures::executor::block_on(future).unwrap();
        assert_eq!(notification.cv.waiter_count(), 0);
    }

    #[test]
    fn test_multiple_waiters_all_wake() {
        let notification = Notification::new();

        let (f1, d1) = promisify(notification.wait());
        let (f2, d2) = promisify(notification.wait());
        let (f3, d3) = promisify(notification.wait());
        d1.start();
        d2.start();
        d3.start();
        assert_eq!(notification.cv.waiter_count(), 3);

        run(notification.notify()).unwrap();
        futures::executor::block_on(f1).unwrap();
        futures::executor::block_on(f2).unwrap();
        futures::executor::block_on(f3).unwrap();
    }

    #[test]
    fn test_notify_is_idempotent() {
        let notification = Notification::new();
        run(notification.notify()).unwrap();
        run(notification.notify()).unwrap();
        run(notification.notify()).unwrap();
        run(notification.wait()).unwrap();
    }

    #[test]
    fn test_notified_waiter_still_holds_lock_discipline() {
        // After notify, a fresh wait acquires and releases cleanly.
        let notification = Notification::new();
        run(notification.notify()).unwrap();
        run(notification.wait()).unwrap();
        assert!(!notification.lock.held());
    }

    #[test]
    fn test_condition_variable_notify_one_wakes_head_first() {
        let lock = Arc::new(Lock::new());
        let cv = ConditionVariable::new(lock.clone());
        let ready = Arc::new(AtomicBool::new(false));

        struct Guarded {
            lock: Arc<Lock>,
        }
        impl Synchronizable for Guarded {
            fn lock(&self) -> &Arc<Lock> {
                &self.lock
            }
        }
        let guarded = Guarded { lock: lock.clone() };

        let r = ready.clone();
        let (f1, d1) = promisify(guarded.synchronized(cv.wait(move || !r.load(Ordering::SeqCst))));
        let r = ready.clone();
        let (f2, d2) = promisify(guarded.synchronized(cv.wait(move || !r.load(Ordering::SeqCst))));
        d1.start();
        d2.start();
        assert_eq!(cv.waiter_count(), 2);

        // Notify under the lock, as the contract requires.
        ready.store(true, Ordering::SeqCst);
        let cv2 = cv.clone();
        run(guarded.synchronized(crate::then::then(move |_: ()| cv2.notify_one())))
            .unwrap();
        futures::executor::block_on(f1).unwrap();
        assert_eq!(cv.waiter_count(), 1);

        let cv3 = cv.clone();
        run(guarded.synchronized(crate::then::then(move |_: ()| cv3.notify_one())))
            .unwrap();
        futures::executor::block_on(f2).unwrap();
        assert!(!lock.held());
    }
}
