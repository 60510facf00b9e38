/// Debounced change detection over machine-index snapshots.
///
/// A single Vagrant operation can rewrite the index several times in quick
/// succession. [`ChangeDetector`] collapses a burst of raw notifications into
/// one reparse that happens `window` after the *last* notification, and turns
/// the resulting snapshot into the minimal set of [`ChangeEvent`]s relative to
/// the previous one.
///
/// The detector holds no timer of its own: it only records the deadline. The
/// async driver in [`crate::monitor`] sleeps until [`ChangeDetector::deadline`]
/// and then calls [`ChangeDetector::settle`].
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use crate::event::ChangeEvent;
use crate::index::Snapshot;

pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No reparse pending.
    Idle,
    /// A change was observed; waiting for the window to elapse.
    Debouncing,
}

#[derive(Debug)]
pub struct ChangeDetector {
    baseline: Arc<Snapshot>,
    window: Duration,
    deadline: Option<Instant>,
}

impl ChangeDetector {
    pub fn new(baseline: Snapshot, window: Duration) -> Self {
        Self {
            baseline: Arc::new(baseline),
            window,
            deadline: None,
        }
    }

    /// Snapshot the next diff will be computed against.
    pub fn baseline(&self) -> &Arc<Snapshot> {
        &self.baseline
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn phase(&self) -> Phase {
        if self.deadline.is_some() {
            Phase::Debouncing
        } else {
            Phase::Idle
        }
    }

    /// Records a raw filesystem notification observed at `now`.
    ///
    /// Any pending deadline is replaced, so only the last notification of a
    /// burst determines when the reparse happens.
    pub fn record_change(&mut self, now: Instant) {
        let restarted = self.deadline.is_some();
        self.deadline = Some(now + self.window);
        tracing::trace!(restarted, "debounce timer armed");
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Ends the debounce cycle with the freshly parsed `next` snapshot.
    ///
    /// `next` becomes the new baseline whether or not anything changed.
    pub fn settle(&mut self, next: Snapshot) -> Vec<ChangeEvent> {
        self.deadline = None;
        let events = diff(&self.baseline, &next);
        self.baseline = Arc::new(next);
        events
    }
}

/// Computes the events that turn `old` into `new`.
///
/// Order is removals, then additions, then state changes; each group is
/// sorted by machine id. Structurally equal snapshots produce no events.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<ChangeEvent> {
    if old == new {
        return Vec::new();
    }

    let removed = old
        .machines
        .iter()
        .filter(|(id, _)| !new.machines.contains_key(*id))
        .map(|(id, record)| ChangeEvent::Removed {
            id: id.clone(),
            last_known: record.clone(),
        });

    let added = new
        .machines
        .iter()
        .filter(|(id, _)| !old.machines.contains_key(*id))
        .map(|(id, record)| ChangeEvent::Added {
            id: id.clone(),
            record: record.clone(),
        });

    let state_changed = new.machines.iter().filter_map(|(id, record)| {
        let previous = old.machines.get(id)?;
        (previous.state != record.state).then(|| ChangeEvent::StateChanged {
            id: id.clone(),
            old_state: previous.state.clone(),
            new_state: record.state.clone(),
            record: record.clone(),
        })
    });

    removed.chain(added).chain(state_changed).collect()
}
