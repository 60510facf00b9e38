/// Raw change notifications for a single file.
///
/// The parent directory is watched rather than the file itself so that
/// atomic saves (write to temp + rename) and delete/recreate cycles are seen,
/// and so the file does not have to exist yet when watching starts. When the
/// parent directory does not exist either (e.g. Vagrant has never run), the
/// nearest existing ancestor is watched instead and the watch moves down as
/// the missing directories appear.
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {0}")]
    InitFailed(#[from] notify::Error),
    #[error("Cannot watch {}: {reason}", path.display())]
    PathWatchFailed { path: PathBuf, reason: String },
}

/// Something that signals "the watched file may have changed".
///
/// `next_change` must be cancel-safe; it is polled inside `select!`.
pub trait ChangeSource {
    /// Resolves on the next raw change, or `None` once no more can arrive.
    async fn next_change(&mut self) -> Option<()>;
}

#[cfg(test)]
impl ChangeSource for mpsc::Receiver<()> {
    async fn next_change(&mut self) -> Option<()> {
        self.recv().await
    }
}

/// A missing source never fires.
impl<S: ChangeSource> ChangeSource for Option<S> {
    async fn next_change(&mut self) -> Option<()> {
        match self {
            Some(source) => source.next_change().await,
            None => std::future::pending().await,
        }
    }
}

/// Whether `event` is a content change of `target`.
pub fn is_change_of(event: &notify::Event, target: &Path) -> bool {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    );
    relevant_kind && event.paths.iter().any(|p| p == target)
}

/// Closest directory at or above `dir` that exists right now.
fn nearest_existing(dir: &Path) -> PathBuf {
    dir.ancestors()
        .find(|a| a.is_dir())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dir.to_path_buf())
}

/// Watches one file. Dropping it stops notifications.
pub struct FileWatch {
    watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Event>,
    target: PathBuf,
    /// Parent directory of `target`.
    dir: PathBuf,
    /// `dir`, or its nearest existing ancestor while `dir` is missing.
    watched: Option<PathBuf>,
}

impl FileWatch {
    pub fn new(path: &Path) -> Result<Self, WatchError> {
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .ok_or_else(|| WatchError::PathWatchFailed {
                path: path.to_path_buf(),
                reason: "path has no parent directory".to_string(),
            })?
            .to_path_buf();

        let (tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    // A full channel already guarantees a wake-up; dropping extras is fine.
                    let _ = tx.try_send(event);
                }
                Err(e) => tracing::warn!("file watcher error: {e}"),
            },
            NotifyConfig::default(),
        )?;

        let mut watch = Self {
            watcher,
            events,
            target: path.to_path_buf(),
            dir,
            watched: None,
        };
        watch.rearm()?;
        tracing::debug!(path = %path.display(), "watching");
        Ok(watch)
    }

    /// Moves the watch to the nearest existing directory on the way to the
    /// file. Returns whether the watched directory changed.
    fn rearm(&mut self) -> Result<bool, WatchError> {
        let next = nearest_existing(&self.dir);
        if self.watched.as_ref() == Some(&next) {
            return Ok(false);
        }
        self.watcher
            .watch(&next, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::PathWatchFailed {
                path: next.clone(),
                reason: e.to_string(),
            })?;
        if let Some(old) = self.watched.take() {
            // The old directory may be gone already.
            let _ = self.watcher.unwatch(&old);
        }
        if next != self.dir {
            tracing::info!(
                path = %self.target.display(),
                waiting_in = %next.display(),
                "directory missing; waiting for it to appear"
            );
        } else {
            tracing::debug!(dir = %next.display(), "watching directory");
        }
        self.watched = Some(next);
        Ok(true)
    }
}

impl ChangeSource for FileWatch {
    async fn next_change(&mut self) -> Option<()> {
        loop {
            let event = self.events.recv().await?;
            match self.rearm() {
                // The file may have been written before the new watch was in
                // place, so a moved watch always counts as a change.
                Ok(true) => return Some(()),
                Ok(false) => {}
                Err(e) => tracing::warn!("{e}"),
            }
            if is_change_of(&event, &self.target) {
                return Some(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn event(kind: EventKind, path: &str) -> notify::Event {
        notify::Event::new(kind).add_path(PathBuf::from(path))
    }

    // ── is_change_of ──────────────────────────────────────────────────────────

    #[test]
    fn modify_of_target_counts() {
        let e = event(EventKind::Modify(ModifyKind::Any), "/data/index");
        assert!(is_change_of(&e, Path::new("/data/index")));
    }

    #[test]
    fn sibling_files_are_ignored() {
        let e = event(EventKind::Create(CreateKind::File), "/data/index.lock");
        assert!(!is_change_of(&e, Path::new("/data/index")));
    }

    #[test]
    fn access_events_are_ignored() {
        let e = event(EventKind::Access(AccessKind::Any), "/data/index");
        assert!(!is_change_of(&e, Path::new("/data/index")));
    }

    // ── nearest_existing ──────────────────────────────────────────────────────

    #[test]
    fn nearest_existing_walks_up_to_a_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("data").join("machine-index");
        assert_eq!(nearest_existing(&missing), dir.path());
        std::fs::create_dir_all(&missing).unwrap();
        assert_eq!(nearest_existing(&missing), missing);
    }

    // ── FileWatch ─────────────────────────────────────────────────────────────

    #[test]
    fn relative_file_without_parent_is_rejected() {
        assert!(FileWatch::new(Path::new("index")).is_err());
    }

    #[test]
    fn missing_directory_watches_the_nearest_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("index");
        let watch = FileWatch::new(&path).unwrap();
        assert_eq!(watch.watched.as_deref(), Some(dir.path()));
        assert_eq!(watch.target, path);
    }

    #[tokio::test]
    async fn writes_to_the_file_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let mut watch = FileWatch::new(&path).unwrap();

        std::fs::write(&path, "{}").unwrap();
        let got = tokio::time::timeout(WAIT, watch.next_change()).await;
        assert_eq!(got.ok().flatten(), Some(()));
    }

    #[tokio::test]
    async fn directory_created_later_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let index_dir = dir.path().join("data").join("machine-index");
        let path = index_dir.join("index");
        let mut watch = FileWatch::new(&path).unwrap();

        std::fs::create_dir_all(&index_dir).unwrap();
        let got = tokio::time::timeout(WAIT, watch.next_change()).await;
        assert_eq!(got.ok().flatten(), Some(()));

        // `data/` may have been seen before `machine-index/` existed; keep
        // draining until the watch sits on the final directory.
        let deadline = tokio::time::Instant::now() + WAIT;
        while watch.watched.as_deref() != Some(index_dir.as_path()) {
            std::fs::write(dir.path().join("data").join("poke"), "").unwrap();
            let _ = tokio::time::timeout_at(deadline, watch.next_change()).await;
            assert!(tokio::time::Instant::now() < deadline, "watch never moved down");
        }

        std::fs::write(&path, "{}").unwrap();
        let got = tokio::time::timeout(WAIT, watch.next_change()).await;
        assert_eq!(got.ok().flatten(), Some(()));
    }

    #[tokio::test]
    async fn closed_channel_ends_and_missing_source_never_fires() {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        drop(tx);
        assert_eq!(rx.next_change().await, None);

        let mut none: Option<mpsc::Receiver<()>> = None;
        let got = tokio::time::timeout(Duration::from_millis(50), none.next_change()).await;
        assert!(got.is_err());
    }
}
