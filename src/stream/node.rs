//! The stream graph's node protocol: enum-tagged signals delivered through
//! a serialized machine (see the module docs on [`super`]).

use super::NodeCx;
use crate::continuation::Item;
use crate::error::Error;
use crate::interrupt::Interrupt;

/// Downstream-bound signals between stream nodes.
pub(crate) enum StreamSignal {
    /// The stream is live; flows source-to-sink before any body.
    Started,
    /// One element.
    Body(Item),
    /// Source exhausted.
    Ended,
    /// Error terminating the stream.
    Failed(Error),
    /// Cancellation terminating the stream.
    Stopped,
}

/// Upstream-bound control requests.
#[derive(Clone, Copy)]
pub(crate) enum ControlSignal {
    /// Request one more body.
    Next,
    /// Request termination.
    Done,
}

/// What a node did with a delivered signal.
pub(crate) enum Flow {
    /// Forward this signal to the next node downstream.
    Continue(StreamSignal),
    /// Consumed; nothing flows further right now.
    Handled,
}

/// What a node did with an upstream-bound control request.
pub(crate) enum ControlFlow {
    /// Not mine; keep walking upstream.
    PassUp,
    /// Intercepted (buffering transforms, and always the source).
    Handled,
}

/// One stage in a materialized stream graph.
pub(crate) trait StreamNode: Send {
    /// A signal arrives from upstream (or from this node's own resumption
    /// via [`Flow::Continue`]).
    fn deliver(&mut self, signal: StreamSignal, cx: &NodeCx) -> Flow;

    /// A next/done request walks up from downstream.
    fn control(&mut self, signal: ControlSignal, cx: &NodeCx) -> ControlFlow;

    /// An async adaptor of this node completed; `payload` is whatever the
    /// node handed to its [`ResumeHandle`](super::ResumeHandle).
    fn resume(&mut self, payload: Item, cx: &NodeCx) -> Flow {
        let _ = (payload, cx);
        Flow::Handled
    }

    /// The pipeline's interrupt fired (delivered to the source node).
    fn interrupted(&mut self, cx: &NodeCx) {
        let _ = cx;
    }

    /// Propagate interrupt registration through the graph.
    fn register(&mut self, interrupt: &Interrupt, cx: &NodeCx) {
        let _ = (interrupt, cx);
    }
}
