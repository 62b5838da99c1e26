//! Last-write-wins resolution between a local model and an incoming one.
//!
//! # Rule
//!
//! - incoming stamp: `changed_at`, else `updated_at`
//! - local stamp: `changed_at` while dirty, else `updated_at`
//! - dirty local: incoming wins only with a strictly greater stamp
//! - clean local: incoming wins unless strictly older than `local.updated_at`
//!
//! A missing incoming stamp wins over a clean local model and loses to a
//! dirty one. This is single-field timestamp ordering, not a causal merge.

use crate::{Model, Timestamp};
use serde::{Deserialize, Serialize};

/// How an incoming model was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Incoming model replaces the local one
    AcceptRemote,
    /// Local model is kept
    KeepLocal,
}

/// Timestamp an incoming model is ordered by.
pub fn incoming_stamp(model: &Model) -> Option<Timestamp> {
    model.changed_at.filter(|t| *t > 0).or(model.updated_at)
}

/// Timestamp a local model is ordered by.
pub fn local_stamp(model: &Model) -> Option<Timestamp> {
    if model.is_dirty() {
        model.changed_at
    } else {
        model.updated_at
    }
}

/// Resolve an incoming model against the local state.
pub fn resolve(local: Option<&Model>, incoming: &Model) -> Resolution {
    let Some(local) = local else {
        return Resolution::AcceptRemote;
    };

    let theirs = incoming_stamp(incoming);
    let ours = local_stamp(local);

    let remote_wins = if local.is_dirty() {
        match (theirs, ours) {
            (Some(theirs), Some(ours)) => theirs > ours,
            _ => false,
        }
    } else {
        match (theirs, ours) {
            (Some(theirs), Some(ours)) => theirs >= ours,
            _ => true,
        }
    };

    if remote_wins {
        Resolution::AcceptRemote
    } else {
        Resolution::KeepLocal
    }
}
