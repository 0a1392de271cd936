//! Composition: the `|` operator and the compile-time rules that wire
//! stages together.
//!
//! Every combinator is a *stage* with a type-level kind: a value stage, a
//! stream source, a stream transform, or a stream sink. `a | b` produces a
//! [`Piped`] pair, and which capabilities the pair has is decided by the
//! kind algebra:
//!
//! | upstream  | downstream | result |
//! |-----------|------------|--------|
//! | value     | value      | value  |
//! | value     | source     | source |
//! | source    | transform  | source |
//! | source    | sink       | value  |
//! | transform | transform  | transform |
//! | transform | sink       | sink   |
//!
//! Anything else (a sink after a plain value stage, a transform with no
//! source, two sinks) has no impl and fails to compile. A stream therefore
//! cannot reach a terminal without exactly one sink.
//!
//! Materialization is right-to-left: `(a | b).materialize(k)` is
//! `a.materialize(b.materialize(k))`, so the written order is the signal
//! order.

use crate::continuation::{AnyContinuation, Continuation};
use crate::stream::node::StreamNode;

/// A single-value stage: given an upstream `Arg`, eventually yields
/// `Output` (or fails, or stops).
pub trait Eventual<Arg>: Sized {
    type Output: Send + 'static;
    type Materialized<K: Continuation<Self::Output>>: Continuation<Arg>;

    /// Wire this stage's downstream and produce its continuation.
    fn materialize<K: Continuation<Self::Output>>(self, k: K) -> Self::Materialized<K>;
}

/// A stream source (possibly with transforms already piped on): yields zero
/// or more `Item` bodies before a terminal signal.
pub trait EventualStream<Arg>: Sized {
    type Item: Send + 'static;
    type Materialized: Continuation<Arg>;

    /// Materialize with the given downstream node list (transforms and the
    /// sink, in downstream order).
    fn materialize_stream(self, downstream: Vec<Box<dyn StreamNode>>) -> Self::Materialized;
}

/// A per-body stream adapter (map, filter, until, take).
pub trait StreamTransform<A>: Sized {
    type Item: Send + 'static;

    fn push_nodes(self, nodes: &mut Vec<Box<dyn StreamNode>>);
}

/// A loop-shaped stage that consumes a stream and yields one value to its
/// (single-value) downstream.
pub trait StreamSink<A>: Sized {
    type Output: Send + 'static;

    fn push_nodes(self, k: Box<dyn AnyContinuation>, nodes: &mut Vec<Box<dyn StreamNode>>);
}

// --- Kinds ---

pub struct ValueKind;
pub struct SourceKind;
pub struct TransformKind;
pub struct SinkKind;

/// Every composable stage declares its kind.
pub trait Stage {
    type Kind;
}

/// Type-level kind algebra for `Piped`.
pub trait ComposedKind<Rhs> {
    type Kind;
}

impl ComposedKind<ValueKind> for ValueKind {
    type Kind = ValueKind;
}
impl ComposedKind<SourceKind> for ValueKind {
    type Kind = SourceKind;
}
impl ComposedKind<TransformKind> for SourceKind {
    type Kind = SourceKind;
}
impl ComposedKind<SinkKind> for SourceKind {
    type Kind = ValueKind;
}
impl ComposedKind<TransformKind> for TransformKind {
    type Kind = TransformKind;
}
impl ComposedKind<SinkKind> for TransformKind {
    type Kind = SinkKind;
}

/// Two stages wired together by `|`.
#[derive(Clone)]
pub struct Piped<A, B> {
    pub(crate) upstream: A,
    pub(crate) downstream: B,
}

impl<A: Stage, B: Stage> Stage for Piped<A, B>
where
    A::Kind: ComposedKind<B::Kind>,
{
    type Kind = <A::Kind as ComposedKind<B::Kind>>::Kind;
}

// --- Kind-dispatched Eventual impls for Piped ---
//
// `Piped` is an `Eventual` both when it joins two value stages and when it
// closes a stream with a sink. Coherence cannot distinguish those by bounds
// alone, so dispatch goes through a helper trait keyed on the kind pair.

pub trait PipeEventual<KindA, KindB, Arg>: Sized {
    type Output: Send + 'static;
    type Materialized<K: Continuation<Self::Output>>: Continuation<Arg>;

    fn materialize_in<K: Continuation<Self::Output>>(self, k: K) -> Self::Materialized<K>;
}

impl<Arg, A, B> PipeEventual<ValueKind, ValueKind, Arg> for Piped<A, B>
where
    Arg: Send + 'static,
    A: Eventual<Arg>,
    B: Eventual<A::Output>,
{
    type Output = B::Output;
    type Materialized<K: Continuation<B::Output>> = A::Materialized<B::Materialized<K>>;

    fn materialize_in<K: Continuation<B::Output>>(self, k: K) -> Self::Materialized<K> {
        self.upstream.materialize(self.downstream.materialize(k))
    }
}

impl<Arg, A, B> PipeEventual<SourceKind, SinkKind, Arg> for Piped<A, B>
where
    Arg: Send + 'static,
    A: EventualStream<Arg>,
    B: StreamSink<A::Item>,
{
    type Output = B::Output;
    type Materialized<K: Continuation<B::Output>> = A::Materialized;

    fn materialize_in<K: Continuation<B::Output>>(self, k: K) -> Self::Materialized<K> {
        let mut nodes = Vec::new();
        self.downstream.push_nodes(
            crate::continuation::TypedContinuation::<B::Output, K>::boxed(k),
            &mut nodes,
        );
        self.upstream.materialize_stream(nodes)
    }
}

impl<Arg, A, B> Eventual<Arg> for Piped<A, B>
where
    Arg: Send + 'static,
    A: Stage,
    B: Stage,
    Piped<A, B>: PipeEventual<A::Kind, B::Kind, Arg>,
{
    type Output = <Piped<A, B> as PipeEventual<A::Kind, B::Kind, Arg>>::Output;
    type Materialized<K: Continuation<Self::Output>> =
        <Piped<A, B> as PipeEventual<A::Kind, B::Kind, Arg>>::Materialized<K>;

    fn materialize<K: Continuation<Self::Output>>(self, k: K) -> Self::Materialized<K> {
        self.materialize_in(k)
    }
}

// --- Kind-dispatched EventualStream impls for Piped ---

pub trait PipeStream<KindA, KindB, Arg>: Sized {
    type Item: Send + 'static;
    type Materialized: Continuation<Arg>;

    fn materialize_stream_in(self, downstream: Vec<Box<dyn StreamNode>>) -> Self::Materialized;
}

impl<Arg, A, B> PipeStream<SourceKind, TransformKind, Arg> for Piped<A, B>
where
    Arg: Send + 'static,
    A: EventualStream<Arg>,
    B: StreamTransform<A::Item>,
{
    type Item = B::Item;
    type Materialized = A::Materialized;

    fn materialize_stream_in(self, downstream: Vec<Box<dyn StreamNode>>) -> Self::Materialized {
        let mut nodes = Vec::new();
        self.downstream.push_nodes(&mut nodes);
        nodes.extend(downstream);
        self.upstream.materialize_stream(nodes)
    }
}

impl<Arg, A, B> PipeStream<ValueKind, SourceKind, Arg> for Piped<A, B>
where
    Arg: Send + 'static,
    A: Eventual<Arg>,
    B: EventualStream<A::Output>,
{
    type Item = B::Item;
    type Materialized = A::Materialized<B::Materialized>;

    fn materialize_stream_in(self, downstream: Vec<Box<dyn StreamNode>>) -> Self::Materialized {
        self.upstream
            .materialize(self.downstream.materialize_stream(downstream))
    }
}

impl<Arg, A, B> EventualStream<Arg> for Piped<A, B>
where
    Arg: Send + 'static,
    A: Stage,
    B: Stage,
    Piped<A, B>: PipeStream<A::Kind, B::Kind, Arg>,
{
    type Item = <Piped<A, B> as PipeStream<A::Kind, B::Kind, Arg>>::Item;
    type Materialized = <Piped<A, B> as PipeStream<A::Kind, B::Kind, Arg>>::Materialized;

    fn materialize_stream(self, downstream: Vec<Box<dyn StreamNode>>) -> Self::Materialized {
        self.materialize_stream_in(downstream)
    }
}

// --- Transform and sink composition (single kind pair each) ---

impl<A, T1, T2> StreamTransform<A> for Piped<T1, T2>
where
    A: Send + 'static,
    T1: StreamTransform<A>,
    T2: StreamTransform<T1::Item>,
{
    type Item = T2::Item;

    fn push_nodes(self, nodes: &mut Vec<Box<dyn StreamNode>>) {
        self.upstream.push_nodes(nodes);
        self.downstream.push_nodes(nodes);
    }
}

impl<A, T, S> StreamSink<A> for Piped<T, S>
where
    A: Send + 'static,
    T: StreamTransform<A>,
    S: StreamSink<T::Item>,
{
    type Output = S::Output;

    fn push_nodes(self, k: Box<dyn AnyContinuation>, nodes: &mut Vec<Box<dyn StreamNode>>) {
        self.upstream.push_nodes(nodes);
        self.downstream.push_nodes(k, nodes);
    }
}

/// Declares a combinator as a stage of the given kind and wires up the `|`
/// operator for it.
macro_rules! stage {
    ($ty:ident $(<$($g:ident),+>)? => $kind:ty) => {
        impl $(<$($g),+>)? $crate::compose::Stage for $ty $(<$($g),+>)? {
            type Kind = $kind;
        }

        impl<$($($g,)+)? __Rhs: $crate::compose::Stage> std::ops::BitOr<__Rhs>
            for $ty $(<$($g),+>)?
        {
            type Output = $crate::compose::Piped<Self, __Rhs>;

            fn bitor(self, rhs: __Rhs) -> Self::Output {
                $crate::compose::Piped {
                    upstream: self,
                    downstream: rhs,
                }
            }
        }
    };
}

pub(crate) use stage;

impl<A, B, Rhs: Stage> std::ops::BitOr<Rhs> for Piped<A, B> {
    type Output = Piped<Self, Rhs>;

    fn bitor(self, rhs: Rhs) -> Self::Output {
        Piped {
            upstream: self,
            downstream: rhs,
        }
    }
}
