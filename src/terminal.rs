//! The terminal: the last stage of a pipeline, and the bridge that exposes
//! a pipeline as a one-shot future.
//!
//! [`promisify`] splits a pipeline into a [`PipelineFuture`] and a
//! [`Driver`]. Calling [`Driver::start`] materializes the continuation
//! chain and begins execution on the caller's thread, optionally after
//! [`Driver::register`]ing an interrupt. [`run`] is the blocking sugar:
//! promisify, start, wait.

use crate::compose::Eventual;
use crate::continuation::Continuation;
use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use futures::channel::oneshot;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Build a terminal observing the pipeline's final signal through callbacks.
///
/// Terminals are continuations, not stages: they are attached by
/// materializing a pipeline with one, so a pipeline can have exactly one.
pub fn terminal<T>() -> Terminal<T> {
    Terminal {
        on_start: None,
        on_fail: None,
        on_stop: None,
    }
}

pub struct Terminal<T> {
    on_start: Option<Box<dyn FnOnce(T) + Send>>,
    on_fail: Option<Box<dyn FnOnce(Error) + Send>>,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Terminal<T> {
    pub fn on_start<F: FnOnce(T) + Send + 'static>(mut self, f: F) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    pub fn on_fail<F: FnOnce(Error) + Send + 'static>(mut self, f: F) -> Self {
        self.on_fail = Some(Box::new(f));
        self
    }

    pub fn on_stop<F: FnOnce() + Send + 'static>(mut self, f: F) -> Self {
        self.on_stop = Some(Box::new(f));
        self
    }
}

impl<T: Send + 'static> Continuation<T> for Terminal<T> {
    fn started(self, value: T) {
        if let Some(f) = self.on_start {
            f(value);
        }
    }

    fn failed(self, error: Error) {
        match self.on_fail {
            Some(f) => f(error),
            None => tracing::warn!("unobserved pipeline failure: {error}"),
        }
    }

    fn stopped(self) {
        if let Some(f) = self.on_stop {
            f();
        }
    }

    fn register(&mut self, _interrupt: &Interrupt) {}
}

/// Resolves to the pipeline's value, or to the translated failure:
/// `Error::Stopped` when a stop reached the terminal.
pub struct PipelineFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for PipelineFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| match r {
            Ok(result) => result,
            Err(oneshot::Canceled) => {
                Err(Error::Other("pipeline dropped without completing".to_string()))
            }
        })
    }
}

struct PromiseContinuation<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T: Send + 'static> Continuation<T> for PromiseContinuation<T> {
    fn started(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    fn failed(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }

    fn stopped(self) {
        let _ = self.tx.send(Err(Error::Stopped));
    }

    fn register(&mut self, _interrupt: &Interrupt) {}
}

/// Drives a promisified pipeline: optionally register an interrupt, then
/// start execution on the calling thread.
pub struct Driver<E: Eventual<()>> {
    e: E,
    tx: oneshot::Sender<Result<<E as Eventual<()>>::Output>>,
    interrupt: Option<Interrupt>,
}

impl<E: Eventual<()>> Driver<E> {
    /// Register the pipeline's interrupt before starting.
    pub fn register(&mut self, interrupt: &Interrupt) {
        self.interrupt = Some(interrupt.clone());
    }

    /// Materialize the pipeline and start it on this thread.
    pub fn start(self) {
        let mut materialized = self.e.materialize(PromiseContinuation { tx: self.tx });
        if let Some(interrupt) = &self.interrupt {
            materialized.register(interrupt);
        }
        materialized.started(());
    }
}

/// Wrap a pipeline into `(future, driver)`.
pub fn promisify<E: Eventual<()>>(e: E) -> (PipelineFuture<E::Output>, Driver<E>) {
    let (tx, rx) = oneshot::channel();
    (
        PipelineFuture { rx },
        Driver {
            e,
            tx,
            interrupt: None,
        },
    )
}

/// Start a pipeline and block until its terminal signal arrives.
pub fn run<E: Eventual<()>>(e: E) -> Result<E::Output> {
    let (future, driver) = promisify(e);
    driver.start();
    futures::executor::block_on(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventual::{eventual, just, raise, EventualHandle};
    use crate::then::then;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_run_returns_value() {
        assert_eq!(run(just(1) | then(|x: i32| x + 2)).unwrap(), 3);
    }

    #[test]
    fn test_run_translates_failure() {
        let result = run(raise::<()>("bad"));
        assert!(matches!(result, Err(Error::Failed(m)) if m == "bad"));
    }

    #[tokio::test]
    async fn test_promisify_resolves_future() {
        let (future, driver) = promisify(just("value"));
        driver.start();
        assert_eq!(future.await.unwrap(), "value");
    }

    #[tokio::test]
    async fn test_interrupt_suspended_pipeline_stops() {
        // The only stage suspends indefinitely; triggering the interrupt
        // must surface a stop at the terminal.
        let e = eventual::<i32>()
            .on_start(|_handle: EventualHandle<i32>, ()| {
                // Suspend: the handle in the interrupt callback is the only
                // way this stage ever completes.
            })
            .on_interrupt(|handle| handle.stop());

        let (future, mut driver) = promisify(e);
        let interrupt = Interrupt::new();
        driver.register(&interrupt);
        driver.start();

        interrupt.trigger();
        assert!(matches!(future.await, Err(Error::Stopped)));
    }

    #[tokio::test]
    async fn test_interrupt_before_start_stops() {
        let e = eventual::<i32>()
            .on_start(|handle: EventualHandle<i32>, ()| handle.succeed(1))
            .on_interrupt(|handle| handle.stop());

        let (future, mut driver) = promisify(e);
        let interrupt = Interrupt::new();
        driver.register(&interrupt);
        interrupt.trigger();
        driver.start();

        assert!(matches!(future.await, Err(Error::Stopped)));
    }

    #[test]
    fn test_terminal_observes_start() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();

        let t = terminal::<i32>().on_start(move |v| {
            assert_eq!(v, 9);
            flag.store(true, Ordering::SeqCst);
        });

        let mut m =
            <crate::eventual::Just<i32> as crate::compose::Eventual<()>>::materialize(just(9), t);
        let interrupt = Interrupt::new();
        crate::continuation::Continuation::<()>::register(&mut m, &interrupt);
        crate::continuation::Continuation::<()>::started(m, ());

        assert!(observed.load(Ordering::SeqCst));
    }
}
