//! Branching stages: [`conditional`] and [`catch`].

use crate::compose::{stage, Eventual, ValueKind};
use crate::continuation::{Continuation, Registered};
use crate::error::Error;
use crate::interrupt::Interrupt;

/// Choose between two lazily-built branches based on the upstream value.
/// Both branches must yield the same downstream value type.
pub fn conditional<P, T, E>(predicate: P, then_branch: T, else_branch: E) -> Conditional<P, T, E> {
    Conditional {
        predicate,
        then_branch,
        else_branch,
    }
}

#[derive(Clone)]
pub struct Conditional<P, T, E> {
    predicate: P,
    then_branch: T,
    else_branch: E,
}

stage!(Conditional<P, T, E> => ValueKind);

impl<A, V, P, T, E, Et, Ee> Eventual<A> for Conditional<P, T, E>
where
    A: Send + 'static,
    V: Send + 'static,
    P: FnOnce(&A) -> bool + Send + 'static,
    T: FnOnce(A) -> Et + Send + 'static,
    E: FnOnce(A) -> Ee + Send + 'static,
    Et: Eventual<(), Output = V>,
    Ee: Eventual<(), Output = V>,
{
    type Output = V;
    type Materialized<K: Continuation<V>> = ConditionalContinuation<P, T, E, K>;

    fn materialize<K: Continuation<V>>(self, k: K) -> ConditionalContinuation<P, T, E, K> {
        ConditionalContinuation {
            predicate: self.predicate,
            then_branch: self.then_branch,
            else_branch: self.else_branch,
            k,
            interrupt: None,
        }
    }
}

pub struct ConditionalContinuation<P, T, E, K> {
    predicate: P,
    then_branch: T,
    else_branch: E,
    k: K,
    interrupt: Option<Interrupt>,
}

impl<A, V, P, T, E, Et, Ee, K> Continuation<A> for ConditionalContinuation<P, T, E, K>
where
    A: Send + 'static,
    V: Send + 'static,
    P: FnOnce(&A) -> bool + Send + 'static,
    T: FnOnce(A) -> Et + Send + 'static,
    E: FnOnce(A) -> Ee + Send + 'static,
    Et: Eventual<(), Output = V>,
    Ee: Eventual<(), Output = V>,
    K: Continuation<V>,
{
    fn started(self, value: A) {
        if (self.predicate)(&value) {
            let mut inner = (self.then_branch)(value).materialize(Registered { k: self.k });
            if let Some(interrupt) = &self.interrupt {
                inner.register(interrupt);
            }
            inner.started(());
        } else {
            let mut inner = (self.else_branch)(value).materialize(Registered { k: self.k });
            if let Some(interrupt) = &self.interrupt {
                inner.register(interrupt);
            }
            inner.started(());
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
        self.interrupt = Some(interrupt.clone());
    }
}

/// Intercept a failure and substitute a fresh eventual whose value becomes
/// the recovered result; successes pass through untouched.
pub fn catch<F>(f: F) -> Catch<F> {
    Catch { f }
}

#[derive(Clone)]
pub struct Catch<F> {
    f: F,
}

stage!(Catch<F> => ValueKind);

impl<A, E, F> Eventual<A> for Catch<F>
where
    A: Send + 'static,
    E: Eventual<(), Output = A>,
    F: FnOnce(Error) -> E + Send + 'static,
{
    type Output = A;
    type Materialized<K: Continuation<A>> = CatchContinuation<F, K>;

    fn materialize<K: Continuation<A>>(self, k: K) -> CatchContinuation<F, K> {
        CatchContinuation {
            f: self.f,
            k,
            interrupt: None,
        }
    }
}

pub struct CatchContinuation<F, K> {
    f: F,
    k: K,
    interrupt: Option<Interrupt>,
}

impl<A, E, F, K> Continuation<A> for CatchContinuation<F, K>
where
    A: Send + 'static,
    E: Eventual<(), Output = A>,
    F: FnOnce(Error) -> E + Send + 'static,
    K: Continuation<A>,
{
    fn started(self, value: A) {
        self.k.started(value);
    }

    fn failed(self, error: Error) {
        let mut inner = (self.f)(error).materialize(Registered { k: self.k });
        if let Some(interrupt) = &self.interrupt {
            inner.register(interrupt);
        }
        inner.started(());
    }

    fn stopped(self) {
        self.k.stopped();
    }

    fn register(&mut self, interrupt: &Interrupt) {
        self.k.register(interrupt);
        self.interrupt = Some(interrupt.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventual::{just, raise};
    use crate::terminal::run;
    use crate::then::then;

    #[test]
    fn test_conditional_takes_then_branch() {
        let result = run(just(42)
            | conditional(
                |x: &i32| *x > 10,
                |_| just("big"),
                |_| just("small"),
            ))
        .unwrap();
        assert_eq!(result, "big");
    }

    #[test]
    fn test_conditional_takes_else_branch() {
        let result = run(just(3)
            | conditional(
                |x: &i32| *x > 10,
                |_| just("big"),
                |_| just("small"),
            ))
        .unwrap();
        assert_eq!(result, "small");
    }

    #[test]
    fn test_conditional_branch_sees_value() {
        let result = run(just(6)
            | conditional(
                |x: &i32| *x % 2 == 0,
                |x| just(x * 10),
                |x| just(x),
            ))
        .unwrap();
        assert_eq!(result, 60);
    }

    #[test]
    fn test_catch_recovers() {
        let result =
            run(raise::<i32>("e") | catch(|_err| just(-1)) | then(|x: i32| x + 1)).unwrap();
        assert_eq!(result, 0);
    }

    #[test]
    fn test_catch_passes_success_through() {
        let result = run(just(5) | catch(|_err| just(-1))).unwrap();
        assert_eq!(result, 5);
    }

    #[test]
    fn test_catch_sees_the_error() {
        let result = run(raise::<String>("original")
            | catch(|err: Error| just(format!("recovered: {err}"))))
        .unwrap();
        assert_eq!(result, "recovered: eventual failed: original");
    }
}
