//! Per-file state machine: the single source of truth for valid transitions.
//!
//! The store consults this module on every status write; an invalid requested
//! transition is a programming error in the caller and must surface loudly
//! rather than being silently reverted.

use std::error::Error;
use std::fmt;

use crate::core::types::FileStatus;

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionInvalid {
    pub file_id: String,
    pub from: Option<FileStatus>,
    pub to: FileStatus,
}

impl fmt::Display for TransitionInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let from = self.from.map(FileStatus::as_str).unwrap_or("(absent)");
        write!(
            f,
            "invalid status transition for {}: {} -> {}",
            self.file_id,
            from,
            self.to.as_str()
        )
    }
}

impl Error for TransitionInvalid {}

/// Whether `from -> to` appears in the transition table.
///
/// A same-state write is not a transition and is always allowed (metadata and
/// inhibition updates reuse the status write path).
pub fn is_valid(from: Option<FileStatus>, to: FileStatus) -> bool {
    use FileStatus::*;
    let Some(from) = from else {
        // Entry creation: Discover deposits a fresh pending entry.
        return to == Pending;
    };
    if from == to {
        return true;
    }
    match (from, to) {
        // Transform acquires the scope lock.
        (Pending, InProgress) | (Retry, InProgress) => true,
        // Transform releases the lock on completion or failure; the TTL
        // guardrail releases zombies back to pending.
        (InProgress, Transformed) | (InProgress, Failed) | (InProgress, Pending) => true,
        (Transformed, Tested) => true,
        (Tested, Validated) | (Tested, NeedsReview) | (Tested, Failed) => true,
        // Tick-end failure promotion.
        (Failed, Retry) | (Failed, Skipped) => true,
        // Tick-start retry requeue.
        (Retry, Pending) => true,
        // External review decisions.
        (NeedsReview, Validated) | (NeedsReview, Retry) | (NeedsReview, Skipped) => true,
        _ => false,
    }
}

/// Validate a requested transition, returning the typed rejection on failure.
pub fn validate(
    file_id: &str,
    from: Option<FileStatus>,
    to: FileStatus,
) -> Result<(), TransitionInvalid> {
    if is_valid(from, to) {
        return Ok(());
    }
    Err(TransitionInvalid {
        file_id: file_id.to_string(),
        from,
        to,
    })
}
