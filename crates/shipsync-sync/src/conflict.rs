//! Watermark-based conflict detection.
//!
//! A mapping's `updated_at` is the last instant both sides were known to
//! agree on a document. A document edited after that instant on the side
//! receiving a change has diverged, and blindly applying the change would
//! discard the edit.

use shipsync_core::{DocumentMapping, Timestamp};

/// Outcome of a watermark comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCheck {
    /// Safe to apply.
    Clear,
    /// The target was edited after the watermark.
    Conflict {
        last_synced_at: Timestamp,
        updated_at: Timestamp,
    },
}

impl ConflictCheck {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ConflictCheck::Conflict { .. })
    }

    /// Human readable reason, sent to ships with conflict notices.
    pub fn reason(&self) -> Option<String> {
        match self {
            ConflictCheck::Clear => None,
            ConflictCheck::Conflict {
                last_synced_at,
                updated_at,
            } => Some(format!(
                "document modified at {} after last sync at {}",
                updated_at, last_synced_at
            )),
        }
    }
}

/// Compares document timestamps against mapping watermarks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Conflict iff the target document changed after the last sync.
    pub fn check(last_synced_at: Timestamp, updated_at: Timestamp) -> ConflictCheck {
        if updated_at > last_synced_at {
            ConflictCheck::Conflict {
                last_synced_at,
                updated_at,
            }
        } else {
            ConflictCheck::Clear
        }
    }

    pub fn check_mapping(mapping: &DocumentMapping, updated_at: Timestamp) -> ConflictCheck {
        Self::check(mapping.watermark(), updated_at)
    }
}
