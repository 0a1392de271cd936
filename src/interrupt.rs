//! One-shot cancellation token shared across a pipeline.
//!
//! An [`Interrupt`] is registered once, top-down, through every stage of a
//! pipeline (`Continuation::register`). Stages that want to react install a
//! handler; [`Interrupt::trigger`] invokes all installed handlers in LIFO
//! order, exactly once. A handler's contract is to make progress toward
//! termination: move its stage to a terminal signal (typically `stopped`),
//! cancel an outstanding operation, or no-op if the stage is already done.
//!
//! Handlers must not call `trigger` re-entrantly.

use std::sync::{Arc, Mutex};

type Handler = Box<dyn FnOnce() + Send>;

struct State {
    /// `None` once the interrupt has fired.
    handlers: Option<Vec<Handler>>,
}

/// A pipeline-scoped cancellation token. Cloning shares the token.
#[derive(Clone)]
pub struct Interrupt {
    state: Arc<Mutex<State>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                handlers: Some(Vec::new()),
            })),
        }
    }

    /// Install a cancellation handler.
    ///
    /// Fails iff the interrupt has already fired; the handler is returned so
    /// the caller can invoke it directly. This is what lets a stage that
    /// starts *after* `trigger` cancel itself without racing.
    pub fn install(&self, handler: Handler) -> std::result::Result<(), Handler> {
        let mut state = self.state.lock().unwrap();
        match state.handlers {
            Some(ref mut handlers) => {
                handlers.push(handler);
                Ok(())
            }
            None => Err(handler),
        }
    }

    /// Fire the interrupt, invoking every installed handler in LIFO order.
    ///
    /// One-shot: subsequent calls are no-ops.
    pub fn trigger(&self) {
        let handlers = self.state.lock().unwrap().handlers.take();
        if let Some(handlers) = handlers {
            tracing::trace!(handlers = handlers.len(), "interrupt triggered");
            for handler in handlers.into_iter().rev() {
                handler();
            }
        }
    }

    /// Whether [`trigger`](Interrupt::trigger) has been called.
    pub fn triggered(&self) -> bool {
        self.state.lock().unwrap().handlers.is_none()
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_install_then_trigger_invokes_once() {
        let interrupt = Interrupt::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        assert!(interrupt
            .install(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .is_ok());

        interrupt.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // One-shot: a second trigger is a no-op.
        interrupt.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_install_after_trigger_hands_handler_back() {
        let interrupt = Interrupt::new();
        interrupt.trigger();
        assert!(interrupt.triggered());

        let invoked = Arc::new(AtomicUsize::new(0));
        let i = invoked.clone();
        match interrupt.install(Box::new(move || {
            i.fetch_add(1, Ordering::SeqCst);
        })) {
            Ok(()) => panic!("install should fail after trigger"),
            Err(handler) => handler(),
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_run_lifo() {
        let interrupt = Interrupt::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            let _ = interrupt.install(Box::new(move || {
                order.lock().unwrap().push(i);
            }));
        }

        interrupt.trigger();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_clone_shares_state() {
        let interrupt = Interrupt::new();
        let other = interrupt.clone();
        other.trigger();
        assert!(interrupt.triggered());
    }
}
