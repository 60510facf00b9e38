/// Drives a [`ChangeDetector`] from raw file notifications.
///
/// [`IndexMonitor::next_settled`] is cancel-safe: the pending deadline lives in
/// the detector, so dropping the future (e.g. because another `select!` branch
/// won) loses nothing.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};

use crate::detector::{ChangeDetector, Phase};
use crate::event::ChangeEvent;
use crate::index::{self, Snapshot};
use crate::watch::ChangeSource;

/// Outcome of one debounce cycle.
#[derive(Debug)]
pub struct Settled {
    /// Possibly empty when the file settled back into an equivalent state.
    pub events: Vec<ChangeEvent>,
    /// The snapshot that is now the baseline.
    pub snapshot: Arc<Snapshot>,
}

pub struct IndexMonitor {
    path: PathBuf,
    detector: ChangeDetector,
}

impl IndexMonitor {
    /// Parses the index once to establish the baseline. No events are produced
    /// for the initial load.
    pub fn new(path: impl Into<PathBuf>, window: Duration) -> Self {
        let path = path.into();
        let initial = index::parse(&path);
        if initial.is_empty() {
            tracing::info!(path = %path.display(), "machine index is empty or absent");
        } else {
            tracing::info!(path = %path.display(), machines = initial.len(), "loaded machine index");
        }
        let detector = ChangeDetector::new(initial, window);
        tracing::debug!(window_ms = detector.window().as_millis() as u64, "debounce window");
        Self { path, detector }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        self.detector.baseline()
    }

    #[cfg(test)]
    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Records a raw notification now, (re)arming the debounce deadline.
    pub fn notify(&mut self) {
        if self.detector.phase() == Phase::Idle {
            tracing::debug!(path = %self.path.display(), "index change observed");
        }
        self.detector.record_change(Instant::now());
    }

    /// Waits for notifications on `raw` until the debounce window elapses with
    /// no further notification, then reparses and diffs.
    ///
    /// Returns `None` once `raw` is closed and nothing is pending.
    pub async fn next_settled(&mut self, raw: &mut impl ChangeSource) -> Option<Settled> {
        loop {
            if self.detector.is_due(Instant::now()) {
                return Some(self.settle());
            }
            let Some(deadline) = self.detector.deadline() else {
                raw.next_change().await?;
                self.notify();
                continue;
            };

            tokio::select! {
                msg = raw.next_change() => match msg {
                    Some(()) => self.notify(),
                    None => {
                        sleep_until(deadline).await;
                        return Some(self.settle());
                    }
                },
                _ = sleep_until(deadline) => return Some(self.settle()),
            }
        }
    }

    /// Reparses the file immediately, ending any pending debounce cycle.
    pub fn settle(&mut self) -> Settled {
        let next = index::parse(&self.path);
        let events = self.detector.settle(next);
        let snapshot = Arc::clone(self.detector.baseline());
        if events.is_empty() {
            tracing::debug!("machine index settled without changes");
        } else {
            tracing::info!(events = events.len(), machines = snapshot.len(), "machine index changed");
        }
        Settled { events, snapshot }
    }
}
