//! Keel core types: reconcile outcomes, keys, selectors, patches and API errors

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod key;
pub mod labels;
pub mod patch;
pub mod selector;

pub use error::ApiError;
pub use key::{EventKey, KeyError, ObjectKey};
pub use patch::{JsonPatch, PatchOp};
pub use selector::{Requirement, Selector};

/// What a reconcile pass asks of its work queue.
///
/// | variant | queue action |
/// |---|---|
/// | `Done` | forget |
/// | `Retry` | rate-limited re-add |
/// | `AddAfter(d)` | forget, then re-add after `d` |
/// | `Fatal` | shut down the issuing reconciler's queue |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Retry,
    AddAfter(Duration),
    Fatal,
}

impl Outcome {
    /// Stable label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Retry => "retry",
            Outcome::AddAfter(_) => "add_after",
            Outcome::Fatal => "fatal",
        }
    }

    /// Merge two outcomes of independent sub-steps: the more urgent one wins.
    /// `Fatal > Retry > AddAfter(min) > Done`.
    pub fn merge(self, other: Outcome) -> Outcome {
        use Outcome::*;
        match (self, other) {
            (Fatal, _) | (_, Fatal) => Fatal,
            (Retry, _) | (_, Retry) => Retry,
            (AddAfter(a), AddAfter(b)) => AddAfter(a.min(b)),
            (AddAfter(a), Done) | (Done, AddAfter(a)) => AddAfter(a),
            (Done, Done) => Done,
        }
    }
}

/// Watch notification type as seen by receivers after no-op filtering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Action {
    Added,
    Modified,
    Deleted,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Added => "added",
            Action::Modified => "modified",
            Action::Deleted => "deleted",
        }
    }
}

pub mod prelude {
    pub use super::{Action, ApiError, EventKey, JsonPatch, ObjectKey, Outcome, PatchOp, Requirement, Selector};
}
