//! Append-only change log.
//!
//! Every drained [`DiffReport`] is appended in dispatch order across all
//! collections. Entries are never mutated or removed; retention is left to
//! the host, which bounds the session lifetime.

use crate::{notifier::SubscriptionId, DiffReport, Notifier};

/// The change log of an engine.
#[derive(Debug, Default)]
pub struct History {
    entries: Vec<DiffReport>,
    notifier: Notifier<[DiffReport]>,
}

impl History {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a report and notify subscribers with the whole log.
    pub fn record(&mut self, report: DiffReport) {
        tracing::debug!(
            collection = %report.collection_id,
            changes = report.len(),
            "recording change set"
        );
        self.entries.push(report);
        self.notifier.notify(&self.entries);
    }

    /// Copy of the log.
    pub fn entries(&self) -> Vec<DiffReport> {
        self.entries.clone()
    }

    /// Copy of the entries of one collection.
    pub fn for_collection(&self, collection_id: &str) -> Vec<DiffReport> {
        self.entries
            .iter()
            .filter(|r| r.collection_id == collection_id)
            .cloned()
            .collect()
    }

    /// Most recent entry.
    pub fn last(&self) -> Option<&DiffReport> {
        self.entries.last()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribe to appends.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&[DiffReport]) + Send + 'static,
    {
        self.notifier.subscribe(listener)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }
}
