//! Error types for entry computation and the snapshot bridge.

use std::fmt;
use std::sync::Arc;

use crate::handle::Suspension;
use crate::value::Cause;

/// Errors produced while computing or reading an entry.
///
/// `Suspend` is not a failure: it is the signal that a computation needs an
/// asynchronous handle to settle before it can make progress. Compute
/// functions propagate it with the `?` operator, which keeps straight-line
/// authoring without a dedicated suspension syntax.
///
/// User errors can be propagated with `?` as well; any `Into<anyhow::Error>`
/// type converts into `FlowError::Failed`.
#[derive(Clone)]
pub enum FlowError {
    /// The computation is waiting for an asynchronous handle to settle.
    ///
    /// The engine parks the entry as pending and re-runs the computation
    /// once the handle settles.
    Suspend(Suspension),

    /// Entry dependencies form a cycle.
    ///
    /// The `path` contains the entry names along the cycle.
    Cycle {
        /// Entry names forming the cycle, outermost first.
        path: Vec<String>,
    },

    /// The computation failed, or read a dependency that failed.
    Failed(Cause),
}

impl FlowError {
    /// A failure for a value that has never been produced.
    pub fn absent() -> Self {
        FlowError::Failed(Cause::fault(anyhow::anyhow!("value is absent")))
    }

    /// Returns `true` if this is a suspension request rather than a failure.
    pub fn is_suspend(&self) -> bool {
        matches!(self, FlowError::Suspend(_))
    }

    /// The failure cause, if this is not a suspension.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            FlowError::Failed(cause) => Some(cause),
            _ => None,
        }
    }

    /// Collapse into a failure cause, turning a cycle into a fault.
    ///
    /// Must not be called on `Suspend`; suspensions are handled by the
    /// computation loop before results are stored.
    pub(crate) fn into_cause(self) -> Cause {
        match self {
            FlowError::Failed(cause) => cause,
            FlowError::Cycle { path } => {
                Cause::fault(anyhow::anyhow!("dependency cycle: {}", path.join(" -> ")))
            }
            FlowError::Suspend(_) => {
                unreachable!("suspension must be intercepted by the computation loop")
            }
        }
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::Suspend(_) => write!(f, "computation suspended on a pending handle"),
            FlowError::Cycle { path } => {
                write!(f, "dependency cycle: {}", path.join(" -> "))
            }
            FlowError::Failed(cause) => write!(f, "{}", cause),
        }
    }
}

impl fmt::Debug for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::Suspend(_) => f.write_str("Suspend"),
            FlowError::Cycle { path } => f.debug_struct("Cycle").field("path", path).finish(),
            FlowError::Failed(cause) => f.debug_tuple("Failed").field(cause).finish(),
        }
    }
}

// Deliberately not `std::error::Error`: the blanket conversion below would
// otherwise conflict with the reflexive `From` impl.
impl<E: Into<anyhow::Error>> From<E> for FlowError {
    fn from(err: E) -> Self {
        FlowError::Failed(Cause::Fault(Arc::new(err.into())))
    }
}

/// Errors surfaced by the snapshot bridge.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// A final flush found an entry that never settled.
    #[error("entry `{key}` is still pending at the final snapshot flush")]
    PendingAtFlush {
        /// Name of the pending entry.
        key: String,
    },

    /// The same entry was serialized once with a codec and once without.
    #[error("entry `{key}` was already serialized in a different mode")]
    ModeMismatch {
        /// Name of the conflicting entry.
        key: String,
    },

    /// A noted entry has no backing value store.
    #[error("entry `{key}` has no value to serialize")]
    MissingEntry {
        /// Name of the missing entry.
        key: String,
    },

    /// The entry codec failed to encode the settled value.
    #[error("failed to encode entry `{key}`: {source}")]
    Encode {
        /// Name of the entry being encoded.
        key: String,
        /// The codec failure.
        source: anyhow::Error,
    },
}
