//! Sequencing stages: [`then`], [`and_then`], [`closure`], [`let_bind`].
//!
//! `then` maps the upstream value with a plain function; `and_then` maps it
//! to a whole new eventual that is materialized lazily with the outer
//! downstream as its continuation. Rust cannot overload on a closure's
//! return type, so the two are separate combinators (the `futures` crate's
//! map/and_then split).

use crate::compose::{stage, Eventual, ValueKind};
use crate::continuation::{Continuation, Registered};
use crate::error::Error;
use crate::interrupt::Interrupt;

/// Transform the upstream value with `f`; failures and stops propagate
/// unchanged.
pub fn then<F>(f: F) -> Then<F> {
    Then { f }
}

#[derive(Clone)]
pub struct Then<F> {
    f: F,
}

stage!(Then<F> => ValueKind);

impl<A, B, F> Eventual<A> for Then<F>
where
    A: Send + 'static,
    B: Send + 'static,
    F: FnOnce(A) -> B + Send + 'static,
{
    type Output = B;
    type Materialized<K: Continuation<B>> = ThenContinuation<F, K>;

    fn materialize<K: Continuation<B>>(self, k: K) -> ThenContinuation<F, K> {
        ThenContinuation { f: self.f, k }
    }
}

pub struct ThenContinuation<F, K> {
    f: F,
    k: K,
}

impl<A, B, F, K> Continuation<A> for ThenContinuation<F, K>
where
    A: Send + 'static,
    B: Send + 'static,
    F: FnOnce(A) -> B + Send + 'static,
    K: Continuation<B>,
{
    fn started(self, value: A) {
        self.k.started((self.f)(value));
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

/// Transform the upstream value into a new eventual, materialized lazily
/// with this stage's downstream as its continuation.
pub fn and_then<F>(f: F) -> AndThen<F> {
    AndThen { f }
}

#[derive(Clone)]
pub struct AndThen<F> {
    f: F,
}

stage!(AndThen<F> => ValueKind);

impl<A, E, F> Eventual<A> for AndThen<F>
where
    A: Send + 'static,
    E: Eventual<()>,
    F: FnOnce(A) -> E + Send + 'static,
{
    type Output = E::Output;
    type Materialized<K: Continuation<E::Output>> = AndThenContinuation<F, K>;

    fn materialize<K: Continuation<E::Output>>(self, k: K) -> AndThenContinuation<F, K> {
        AndThenContinuation {
            f: self.f,
            k,
            interrupt: None,
        }
    }
}

pub struct AndThenContinuation<F, K> {
    f: F,
    k: K,
    interrupt: Option<Interrupt>,
}

impl<A, E, F, K> Continuation<A> for AndThenContinuation<F, K>
where
    A: Send + 'static,
    E: Eventual<()>,
    F: FnOnce(A) -> E + Send + 'static,
    K: Continuation<E::Output>,
{
    fn started(self, value: A) {
        let inner = (self.f)(value);
        let mut materialized = inner.materialize(Registered { k: self.k });
        if let Some(interrupt) = &self.interrupt {
            materialized.register(interrupt);
        }
        materialized.started(());
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

/// A stage built from a nullary closure returning an eventual; the closure
/// runs when the signal arrives, so captured state is per-invocation and
/// outlives any single inner stage.
pub fn closure<F>(f: F) -> Closure<F> {
    Closure { f }
}

#[derive(Clone)]
pub struct Closure<F> {
    f: F,
}

stage!(Closure<F> => ValueKind);

impl<A, E, F> Eventual<A> for Closure<F>
where
    A: Send + 'static,
    E: Eventual<A>,
    F: FnOnce() -> E + Send + 'static,
{
    type Output = E::Output;
    type Materialized<K: Continuation<E::Output>> = ClosureContinuation<F, K>;

    fn materialize<K: Continuation<E::Output>>(self, k: K) -> ClosureContinuation<F, K> {
        ClosureContinuation {
            f: self.f,
            k,
            interrupt: None,
        }
    }
}

pub struct ClosureContinuation<F, K> {
    f: F,
    k: K,
    interrupt: Option<Interrupt>,
}

impl<E, F, K> ClosureContinuation<F, K>
where
    F: FnOnce() -> E + Send + 'static,
{
    fn materialize_inner<A>(self) -> <E as Eventual<A>>::Materialized<Registered<K>>
    where
        A: Send + 'static,
        E: Eventual<A>,
        K: Continuation<E::Output>,
    {
        let inner = (self.f)();
        let mut materialized = inner.materialize(Registered { k: self.k });
        if let Some(interrupt) = &self.interrupt {
            materialized.register(interrupt);
        }
        materialized
    }
}

impl<A, E, F, K> Continuation<A> for ClosureContinuation<F, K>
where
    A: Send + 'static,
    E: Eventual<A>,
    F: FnOnce() -> E + Send + 'static,
    K: Continuation<E::Output>,
{
    fn started(self, value: A) {
        self.materialize_inner().started(value);
    }

    fn failed(self, error: Error) {
        self.materialize_inner().failed(error);
    }

    fn stopped(self) {
        self.materialize_inner().stopped();
    }

    fn register(&mut self, interrupt: &Interrupt) {
        self.k.register(interrupt);
        self.interrupt = Some(interrupt.clone());
    }
}

/// Bind the upstream value into the enclosing scope of a generated
/// sub-pipeline: `and_then(let_bind(|x| ...))` moves `x` into a [`closure`]
/// so the stages built by `f` can borrow it for as long as they run.
pub fn let_bind<A, E, F>(f: F) -> impl FnOnce(A) -> Closure<Box<dyn FnOnce() -> E + Send>>
where
    A: Send + 'static,
    E: Eventual<()> + 'static,
    F: FnOnce(A) -> E + Send + 'static,
{
    move |value: A| closure(Box::new(move || f(value)) as Box<dyn FnOnce() -> E + Send>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventual::{just, raise};
    use crate::terminal::run;

    #[test]
    fn test_pipe_through() {
        let result = run(just(1) | then(|x: i32| x + 2) | then(|x: i32| x.to_string())).unwrap();
        assert_eq!(result, "3");
    }

    #[test]
    fn test_then_propagates_failure() {
        let result = run(raise::<i32>("nope") | then(|x: i32| x + 1));
        assert!(matches!(result, Err(Error::Failed(m)) if m == "nope"));
    }

    #[test]
    fn test_and_then_materializes_inner_pipeline() {
        let result = run(just(10) | and_then(|x: i32| just(x) | then(|y: i32| y * 3))).unwrap();
        assert_eq!(result, 30);
    }

    #[test]
    fn test_and_then_inner_failure_propagates() {
        let result = run(just(1) | and_then(|_x: i32| raise::<i32>("inner")));
        assert!(matches!(result, Err(Error::Failed(m)) if m == "inner"));
    }

    #[test]
    fn test_closure_defers_construction() {
        let result = run(closure(|| just(5)) | then(|x: i32| x + 1)).unwrap();
        assert_eq!(result, 6);
    }

    #[test]
    fn test_let_bind_keeps_value_alive() {
        let result = run(just(vec![1, 2, 3])
            | and_then(let_bind(|xs: Vec<i32>| {
                just(()) | then(move |_| xs.iter().sum::<i32>())
            })))
        .unwrap();
        assert_eq!(result, 6);
    }
}
