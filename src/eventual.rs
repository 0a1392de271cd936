//! The primitive value stages: [`just`], [`raise`], and the user-definable
//! [`eventual`] builder.
//!
//! `eventual` is how external event sources integrate: the `on_start`
//! callback receives a cloneable, one-shot [`EventualHandle`] and the
//! upstream value, stores the handle wherever the completion will come from
//! (another thread, an I/O callback), and returns. Whoever holds the handle
//! later delivers exactly one of `succeed`/`fail`/`stop`; extra deliveries
//! are no-ops, which is what makes completion race-free against interrupts.

use crate::compose::{stage, Eventual, ValueKind};
use crate::continuation::Continuation;
use crate::error::Error;
use crate::interrupt::Interrupt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

/// Immediately succeeds with `value`, ignoring any upstream value.
pub fn just<T>(value: T) -> Just<T> {
    Just { value }
}

#[derive(Clone)]
pub struct Just<T> {
    value: T,
}

stage!(Just<T> => ValueKind);

impl<A, T> Eventual<A> for Just<T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    type Output = T;
    type Materialized<K: Continuation<T>> = JustContinuation<T, K>;

    fn materialize<K: Continuation<T>>(self, k: K) -> JustContinuation<T, K> {
        JustContinuation {
            value: self.value,
            k,
        }
    }
}

pub struct JustContinuation<T, K> {
    value: T,
    k: K,
}

impl<A, T, K> Continuation<A> for JustContinuation<T, K>
where
    A: Send + 'static,
    T: Send + 'static,
    K: Continuation<T>,
{
    fn started(self, _value: A) {
        self.k.started(self.value);
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

/// Immediately fails with `error`.
///
/// The output type is phantom (nothing is ever produced); annotate it when
/// the pipeline's type cannot be inferred: `raise::<i32>("boom")`.
pub fn raise<T>(error: impl Into<Error>) -> Raise<T> {
    Raise {
        error: error.into(),
        _marker: PhantomData,
    }
}

pub struct Raise<T> {
    error: Error,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Raise<T> {
    fn clone(&self) -> Self {
        Self {
            error: self.error.clone(),
            _marker: PhantomData,
        }
    }
}

stage!(Raise<T> => ValueKind);

impl<A, T> Eventual<A> for Raise<T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    type Output = T;
    type Materialized<K: Continuation<T>> = RaiseContinuation<T, K>;

    fn materialize<K: Continuation<T>>(self, k: K) -> RaiseContinuation<T, K> {
        RaiseContinuation {
            error: self.error,
            k,
            _marker: PhantomData,
        }
    }
}

pub struct RaiseContinuation<T, K> {
    error: Error,
    k: K,
    _marker: PhantomData<fn() -> T>,
}

impl<A, T, K> Continuation<A> for RaiseContinuation<T, K>
where
    A: Send + 'static,
    T: Send + 'static,
    K: Continuation<T>,
{
    fn started(self, _value: A) {
        self.k.failed(self.error);
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

// --- The user-definable primitive ---

trait ValueSlot<T>: Send {
    fn started(self: Box<Self>, value: T);
    fn failed(self: Box<Self>, error: Error);
    fn stopped(self: Box<Self>);
}

struct SlotContinuation<K>(K);

impl<T, K> ValueSlot<T> for SlotContinuation<K>
where
    T: Send + 'static,
    K: Continuation<T>,
{
    fn started(self: Box<Self>, value: T) {
        self.0.started(value);
    }

    fn failed(self: Box<Self>, error: Error) {
        self.0.failed(error);
    }

    fn stopped(self: Box<Self>) {
        self.0.stopped();
    }
}

/// One-shot delivery handle for a suspended [`eventual`] stage.
///
/// Cloneable so one clone can live in an interrupt handler while another
/// waits on an external completion; whichever delivers first wins and the
/// rest become no-ops.
pub struct EventualHandle<T> {
    slot: Arc<Mutex<Option<Box<dyn ValueSlot<T>>>>>,
}

impl<T> Clone for EventualHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Send + 'static> EventualHandle<T> {
    fn new<K: Continuation<T>>(k: K) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(Box::new(SlotContinuation(k))))),
        }
    }

    fn take(&self) -> Option<Box<dyn ValueSlot<T>>> {
        self.slot.lock().unwrap().take()
    }

    /// Deliver the value downstream. No-op if the stage already terminated.
    pub fn succeed(&self, value: T) {
        if let Some(slot) = self.take() {
            slot.started(value);
        }
    }

    /// Deliver a failure downstream. No-op if the stage already terminated.
    pub fn fail(&self, error: impl Into<Error>) {
        if let Some(slot) = self.take() {
            slot.failed(error.into());
        }
    }

    /// Deliver a stop downstream. No-op if the stage already terminated.
    pub fn stop(&self) {
        if let Some(slot) = self.take() {
            slot.stopped();
        }
    }
}

type FailCallback<T> = Box<dyn FnOnce(EventualHandle<T>, Error) + Send>;
type StopCallback<T> = Box<dyn FnOnce(EventualHandle<T>) + Send>;
type InterruptCallback<T> = Box<dyn FnOnce(EventualHandle<T>) + Send>;

/// Start building a user-defined stage that eventually yields `T`.
pub fn eventual<T>() -> EventualBuilder<T> {
    EventualBuilder {
        _marker: PhantomData,
    }
}

pub struct EventualBuilder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> EventualBuilder<T> {
    /// The stage body, required: receives the delivery handle and the
    /// upstream value.
    pub fn on_start<S>(self, on_start: S) -> EventualStage<T, S> {
        EventualStage {
            on_start,
            on_fail: None,
            on_stop: None,
            on_interrupt: None,
            _marker: PhantomData,
        }
    }
}

/// A user-defined stage with its start callback set. Optional callbacks
/// override the default propagation of fail/stop and react to interrupts.
pub struct EventualStage<T, S> {
    on_start: S,
    on_fail: Option<FailCallback<T>>,
    on_stop: Option<StopCallback<T>>,
    on_interrupt: Option<InterruptCallback<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S> EventualStage<T, S> {
    /// Override failure propagation (default: pass the error through).
    pub fn on_fail<F>(mut self, f: F) -> Self
    where
        F: FnOnce(EventualHandle<T>, Error) + Send + 'static,
    {
        self.on_fail = Some(Box::new(f));
        self
    }

    /// Override stop propagation (default: pass the stop through).
    pub fn on_stop<F>(mut self, f: F) -> Self
    where
        F: FnOnce(EventualHandle<T>) + Send + 'static,
    {
        self.on_stop = Some(Box::new(f));
        self
    }

    /// React to the pipeline's interrupt firing while this stage is
    /// suspended; typically `|handle| handle.stop()`.
    pub fn on_interrupt<F>(mut self, f: F) -> Self
    where
        F: FnOnce(EventualHandle<T>) + Send + 'static,
    {
        self.on_interrupt = Some(Box::new(f));
        self
    }
}

stage!(EventualStage<T, S> => ValueKind);

impl<A, T, S> Eventual<A> for EventualStage<T, S>
where
    A: Send + 'static,
    T: Send + 'static,
    S: FnOnce(EventualHandle<T>, A) + Send + 'static,
{
    type Output = T;
    type Materialized<K: Continuation<T>> = EventualContinuation<T, S, K>;

    fn materialize<K: Continuation<T>>(self, k: K) -> EventualContinuation<T, S, K> {
        EventualContinuation {
            stage: self,
            k,
            interrupt: None,
        }
    }
}

pub struct EventualContinuation<T, S, K> {
    stage: EventualStage<T, S>,
    k: K,
    interrupt: Option<Interrupt>,
}

impl<A, T, S, K> Continuation<A> for EventualContinuation<T, S, K>
where
    A: Send + 'static,
    T: Send + 'static,
    S: FnOnce(EventualHandle<T>, A) + Send + 'static,
    K: Continuation<T>,
{
    fn started(self, value: A) {
        let handle = EventualHandle::new(self.k);

        if let Some(on_interrupt) = self.stage.on_interrupt {
            if let Some(interrupt) = &self.interrupt {
                let h = handle.clone();
                if let Err(handler) = interrupt.install(Box::new(move || on_interrupt(h))) {
                    // Interrupted before start: cancel instead of starting.
                    handler();
                    return;
                }
            }
        }

        (self.stage.on_start)(handle, value);
    }

    fn failed(self, error: Error) {
        match self.stage.on_fail {
            Some(on_fail) => on_fail(EventualHandle::new(self.k), error),
            None => self.k.failed(error),
        }
    }

    fn stopped(self) {
        match self.stage.on_stop {
            Some(on_stop) => on_stop(EventualHandle::new(self.k)),
            None => self.k.stopped(),
        }
    }

    fn register(&mut self, interrupt: &Interrupt) {
        self.k.register(interrupt);
        self.interrupt = Some(interrupt.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::run;
    use crate::then::then;

    #[test]
    fn test_just_yields_value() {
        assert_eq!(run(just(42)).unwrap(), 42);
    }

    #[test]
    fn test_just_ignores_upstream() {
        let result = run(just(1) | just("replaced")).unwrap();
        assert_eq!(result, "replaced");
    }

    #[test]
    fn test_raise_fails() {
        let result = run(raise::<i32>("boom"));
        assert!(matches!(result, Err(Error::Failed(m)) if m == "boom"));
    }

    #[test]
    fn test_eventual_synchronous_completion() {
        let e = eventual::<i32>().on_start(|handle: EventualHandle<i32>, ()| handle.succeed(7));
        assert_eq!(run(e).unwrap(), 7);
    }

    #[test]
    fn test_eventual_completes_from_another_thread() {
        let e = eventual::<String>().on_start(|handle: EventualHandle<String>, ()| {
            std::thread::spawn(move || {
                handle.succeed("t1".to_string());
            });
        });
        assert_eq!(run(e | then(|v: String| v)).unwrap(), "t1");
    }

    #[test]
    fn test_handle_is_one_shot() {
        let e = eventual::<i32>().on_start(|handle: EventualHandle<i32>, ()| {
            handle.succeed(1);
            // Later deliveries are no-ops, not double signals.
            handle.succeed(2);
            handle.fail("late");
        });
        assert_eq!(run(e).unwrap(), 1);
    }

    #[test]
    fn test_eventual_custom_fail_recovers() {
        let e = raise::<i32>("original")
            | eventual::<i32>()
                .on_start(|handle: EventualHandle<i32>, v: i32| handle.succeed(v))
                .on_fail(|handle, _error| handle.succeed(-1));
        assert_eq!(run(e).unwrap(), -1);
    }
}
