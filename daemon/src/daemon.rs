/// The daemon context: owns every long-lived component and the event loop.
///
/// A [`Daemon`] is created once at startup and dropped at shutdown; nothing
/// lives in globals. One-shot CLI commands build the same context and call
/// into it without running the loop.
use anyhow::{anyhow, Result};
use std::cell::RefCell;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};

use crate::bus::EventBus;
use crate::command::{PostTerminalAction, SystemCommand, VagrantCommand};
use crate::config::{self, Config};
use crate::dispatcher::{CommandDispatcher, DispatchError, GlobalStatus};
use crate::event::{ChangeEvent, ConfigChanged, Event};
use crate::launcher::Launcher;
use crate::monitor::{IndexMonitor, Settled};
use crate::overlay::ConfigOverlay;
use crate::paths;
use crate::settings::{Property, SettingError, SettingValue};
use crate::status::{self, DaemonState, DaemonStatus, MachineStatus};
use crate::watch::{ChangeSource, FileWatch};

/// Editors often write a config file in several steps; reload once they stop.
const CONFIG_SETTLE: Duration = Duration::from_millis(200);

pub struct Daemon<L> {
    config_path: PathBuf,
    status_path: PathBuf,
    config: Config,
    monitor: IndexMonitor,
    overlay: Rc<RefCell<ConfigOverlay>>,
    bus: EventBus<Event>,
    dispatcher: CommandDispatcher<L>,
    status: DaemonStatus,
}

impl<L: Launcher> Daemon<L> {
    /// Builds the context from an already loaded `config`.
    ///
    /// `index_override` takes precedence over `[daemon] index_path`.
    pub fn new(
        config_path: PathBuf,
        config: Config,
        index_override: Option<PathBuf>,
        launcher: L,
    ) -> Self {
        let index_path = index_override
            .or_else(|| config.daemon.index_path.clone())
            .unwrap_or_else(paths::machine_index_path);
        let window = Duration::from_millis(config.daemon.effective_debounce_ms());
        let monitor = IndexMonitor::new(index_path, window);

        let mut overlay = ConfigOverlay::new(config.global_settings(), config.machine_overrides());
        overlay.track(monitor.snapshot().ids());
        let overlay = Rc::new(RefCell::new(overlay));

        let dispatcher = CommandDispatcher::new(
            launcher,
            config.daemon.vagrant.clone(),
            Arc::clone(monitor.snapshot()),
        );

        let mut bus = EventBus::new();
        bus.subscribe(notifier(Rc::clone(&overlay)));

        let status_path = paths::status_file_path_for(&config_path);
        let status = DaemonStatus::new(monitor.path());

        Self {
            config_path,
            status_path,
            config,
            monitor,
            overlay,
            bus,
            dispatcher,
            status,
        }
    }

    pub fn index_path(&self) -> &Path {
        self.monitor.path()
    }

    pub fn subscribe(&mut self, subscriber: impl FnMut(&Event) + 'static) {
        self.bus.subscribe(subscriber);
    }

    /// Machines in display order with their resolved settings applied.
    pub fn machines(&mut self) -> &[MachineStatus] {
        self.status
            .refresh_machines(self.monitor.snapshot(), &mut self.overlay.borrow_mut());
        &self.status.machines
    }

    /// Runs a vagrant command. Without an explicit `post_action`, the machine's
    /// `post-terminal-action` setting applies.
    pub fn execute(
        &self,
        machine_id: &str,
        command: VagrantCommand,
        post_action: Option<PostTerminalAction>,
    ) -> Result<(), DispatchError> {
        let post_action = post_action.unwrap_or_else(|| {
            self.overlay
                .borrow_mut()
                .display_config(machine_id)
                .post_terminal_action()
        });
        self.dispatcher.execute(machine_id, command, post_action)
    }

    pub fn open(&self, machine_id: &str, target: SystemCommand) -> Result<(), DispatchError> {
        self.dispatcher.open(machine_id, target)
    }

    pub async fn global_status(&self) -> GlobalStatus {
        self.dispatcher.global_status().await
    }

    /// Sets a global default (`machine_id == None`) or a machine override from
    /// command-line text, saves the config file and publishes what changed.
    pub fn set_setting(
        &mut self,
        machine_id: Option<&str>,
        key: &str,
        value: &str,
    ) -> Result<Vec<ConfigChanged>> {
        let property =
            Property::from_name(key).ok_or_else(|| SettingError::Unknown(key.to_string()))?;
        let value = SettingValue::parse(property, value)
            .ok_or_else(|| anyhow!("'{value}' is not a valid value for '{key}'"))?;

        self.apply_and_save(|overlay| match machine_id {
            Some(id) => overlay.set_override(id, property, value),
            None => overlay.set_global(property, value),
        })
    }

    /// Drops a machine override, or restores a global default.
    pub fn reset_setting(&mut self, machine_id: Option<&str>, key: &str) -> Result<Vec<ConfigChanged>> {
        let property =
            Property::from_name(key).ok_or_else(|| SettingError::Unknown(key.to_string()))?;

        self.apply_and_save(|overlay| match machine_id {
            Some(id) => Ok(overlay.unset_override(id, property)),
            None => {
                let default = property
                    .default_value()
                    .ok_or(SettingError::NoGlobal(property))?;
                overlay.set_global(property, default)
            }
        })
    }

    /// Applies `edit` to the overlay and saves the config file. If the save
    /// fails the overlay is put back as it was and nothing is published.
    fn apply_and_save(
        &mut self,
        edit: impl FnOnce(&mut ConfigOverlay) -> Result<Vec<ConfigChanged>, SettingError>,
    ) -> Result<Vec<ConfigChanged>> {
        let (old_global, old_overrides) = {
            let overlay = self.overlay.borrow();
            (overlay.global().clone(), overlay.overrides().clone())
        };
        let changes = edit(&mut *self.overlay.borrow_mut())?;

        {
            let overlay = self.overlay.borrow();
            self.config.store(overlay.global(), overlay.overrides());
        }
        if let Err(e) = config::save(&self.config_path, &self.config) {
            self.overlay.borrow_mut().replace(old_global, old_overrides);
            let overlay = self.overlay.borrow();
            self.config.store(overlay.global(), overlay.overrides());
            return Err(e);
        }

        self.publish_config(&changes);
        Ok(changes)
    }

    fn publish_config(&mut self, changes: &[ConfigChanged]) {
        for change in changes {
            tracing::debug!(
                machine = %change.machine_id,
                properties = ?change.properties,
                "display config changed"
            );
        }
        let events: Vec<Event> = changes.iter().cloned().map(Event::Config).collect();
        self.bus.emit_all(&events);
    }

    /// Applies the outcome of a debounce cycle.
    pub fn apply_settled(&mut self, settled: Settled) {
        self.dispatcher.update_snapshot(Arc::clone(&settled.snapshot));
        self.overlay.borrow_mut().track(settled.snapshot.ids());

        if !settled.events.is_empty() {
            self.status.last_change = Some(chrono::Local::now().to_rfc3339());
        }
        self.write_status();

        for event in &settled.events {
            tracing::debug!(machine = event.id(), kind = event.kind(), "machine event");
        }
        let events: Vec<Event> = settled.events.into_iter().map(Event::Machine).collect();
        self.bus.emit_all(&events);
    }

    /// Re-reads the config file. On error the previous settings stay in effect.
    pub fn reload_config(&mut self) {
        let new_config = match config::load_or_default(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to reload config: {e:#}");
                self.status.error = Some(format!("Config reload failed: {e:#}"));
                self.write_status();
                return;
            }
        };
        if new_config.daemon != self.config.daemon {
            tracing::info!("[daemon] settings changed; they take effect after a restart");
        }

        let changes = self
            .overlay
            .borrow_mut()
            .replace(new_config.global_settings(), new_config.machine_overrides());
        self.config.global = new_config.global;
        self.config.machines = new_config.machines;
        self.status.error = None;
        tracing::info!(changes = changes.len(), "Config reloaded");

        self.write_status();
        self.publish_config(&changes);
    }

    fn write_status(&mut self) {
        self.status
            .refresh_machines(self.monitor.snapshot(), &mut self.overlay.borrow_mut());
        status::write_status(&self.status_path, &self.status);
    }

    /// Watches the index and config file until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        if let Some(dir) = self.config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!("Failed to create config directory {}: {e}", dir.display());
            }
        }
        let mut index_watch = watch_or_idle(self.monitor.path());
        let mut config_watch = watch_or_idle(&self.config_path);
        let mut config_deadline: Option<Instant> = None;

        self.status.state = DaemonState::Watching;
        self.write_status();
        tracing::info!(
            index = %self.monitor.path().display(),
            config = %self.config_path.display(),
            subscribers = self.bus.subscriber_count(),
            "watching"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                settled = self.monitor.next_settled(&mut index_watch) => match settled {
                    Some(settled) => self.apply_settled(settled),
                    None => break,
                },
                Some(()) = config_watch.next_change() => {
                    config_deadline = Some(Instant::now() + CONFIG_SETTLE);
                }
                _ = sleep_until(config_deadline.unwrap_or_else(Instant::now)), if config_deadline.is_some() => {
                    config_deadline = None;
                    self.reload_config();
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutting down");
                    break;
                }
            }
        }

        self.status.state = DaemonState::Stopped;
        self.write_status();
        Ok(())
    }
}

/// A failed watch becomes `None`, which never fires.
fn watch_or_idle(path: &Path) -> Option<FileWatch> {
    FileWatch::new(path)
        .inspect_err(|e| tracing::warn!("Not watching {}: {e}", path.display()))
        .ok()
}

/// Logs a user-facing notification for machine events, honouring each
/// machine's `notifications` setting.
fn notifier(overlay: Rc<RefCell<ConfigOverlay>>) -> impl FnMut(&Event) + 'static {
    move |event: &Event| {
        let Event::Machine(change) = event else { return };
        let mut overlay = overlay.borrow_mut();
        let cfg = overlay.display_config(change.id());
        if !cfg.notifications() {
            return;
        }
        let record = match change {
            ChangeEvent::Added { record, .. } | ChangeEvent::StateChanged { record, .. } => record,
            ChangeEvent::Removed { last_known, .. } => last_known,
        };
        let label = status::display_label(record, cfg.label());
        match change {
            ChangeEvent::Added { .. } => {
                tracing::info!(target: "notification", "{label} added ({})", record.state)
            }
            ChangeEvent::Removed { .. } => tracing::info!(target: "notification", "{label} removed"),
            ChangeEvent::StateChanged {
                old_state,
                new_state,
                ..
            } => tracing::info!(
                target: "notification",
                "{label} is now {new_state} (was {old_state})"
            ),
        }
    }
}

/// Loads the config at `path`, falling back to defaults on error.
pub fn load_config(path: &Path) -> (Config, Option<anyhow::Error>) {
    match config::load_or_default(path) {
        Ok(c) => (c, None),
        Err(e) => (Config::default(), Some(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::VAGRANTFILE;
    use std::io;

    #[derive(Default)]
    struct RecordingLauncher {
        scripts: RefCell<Vec<String>>,
    }

    impl Launcher for RecordingLauncher {
        fn locate(&self, program: &str) -> Option<PathBuf> {
            Some(PathBuf::from("/usr/bin").join(program))
        }

        fn open_terminal(&self, _cwd: &Path, script: Option<&str>) -> io::Result<()> {
            self.scripts.borrow_mut().push(script.unwrap_or_default().to_string());
            Ok(())
        }

        fn launch_default_handler(&self, _uri: &str) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        index: PathBuf,
        config: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let index = dir.path().join("index");
            let config = dir.path().join("cfg").join("config.toml");
            Self { dir, index, config }
        }

        fn machine_dir(&self, id: &str) -> PathBuf {
            let d = self.dir.path().join(id);
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(d.join(VAGRANTFILE), "").unwrap();
            d
        }

        fn write_index(&self, machines: &[(&str, &str)]) {
            self.write_index_at(&self.index, machines);
        }

        fn write_index_at(&self, path: &Path, machines: &[(&str, &str)]) {
            let entries: Vec<String> = machines
                .iter()
                .map(|(id, state)| {
                    let dir = self.machine_dir(id);
                    format!(
                        r#""{id}": {{"name": "{id}", "provider": "virtualbox", "state": "{state}", "vagrantfile_path": "{}"}}"#,
                        dir.display()
                    )
                })
                .collect();
            std::fs::write(
                path,
                format!(r#"{{"version": 1, "machines": {{{}}}}}"#, entries.join(",")),
            )
            .unwrap();
        }

        fn daemon(&self) -> Daemon<RecordingLauncher> {
            let (config, _) = load_config(&self.config);
            Daemon::new(
                self.config.clone(),
                config,
                Some(self.index.clone()),
                RecordingLauncher::default(),
            )
        }
    }

    fn resolve(daemon: &Daemon<RecordingLauncher>, machine: &str, key: &str) -> Option<SettingValue> {
        daemon.overlay.borrow_mut().resolve(machine, key)
    }

    fn recorder(daemon: &mut Daemon<RecordingLauncher>) -> Rc<RefCell<Vec<Event>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        daemon.subscribe(move |e: &Event| sink.borrow_mut().push(e.clone()));
        log
    }

    /// Polls `log` on real time until an event matches, giving up after 5s.
    async fn wait_for(log: &RefCell<Vec<Event>>, matches: impl Fn(&Event) -> bool) {
        for _ in 0..250 {
            if log.borrow().iter().any(&matches) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    // ── startup ───────────────────────────────────────────────────────────────

    #[test]
    fn startup_loads_index_without_events() {
        let f = Fixture::new();
        f.write_index(&[("a", "running")]);
        let mut d = f.daemon();
        let log = recorder(&mut d);
        assert_eq!(d.monitor.snapshot().len(), 1);
        assert_eq!(d.machines().len(), 1);
        assert!(log.borrow().is_empty());
        assert_eq!(d.index_path(), f.index.as_path());
    }

    // ── apply_settled ─────────────────────────────────────────────────────────

    #[test]
    fn settled_events_reach_subscribers_and_status_file() {
        let f = Fixture::new();
        f.write_index(&[("a", "running")]);
        let mut d = f.daemon();
        let log = recorder(&mut d);

        f.write_index(&[("a", "saved"), ("b", "poweroff")]);
        let settled = d.monitor.settle();
        d.apply_settled(settled);

        let kinds: Vec<_> = log
            .borrow()
            .iter()
            .map(|e| match e {
                Event::Machine(c) => c.kind(),
                Event::Config(_) => "config",
            })
            .collect();
        assert_eq!(kinds, vec!["added", "state-changed"]);

        let content = std::fs::read_to_string(&d.status_path).unwrap();
        let parsed: DaemonStatus = toml::from_str(&content).unwrap();
        assert_eq!(parsed.machines.len(), 2);
        assert!(parsed.last_change.is_some());
    }

    #[test]
    fn dispatcher_follows_settled_snapshot() {
        let f = Fixture::new();
        let mut d = f.daemon();
        assert!(d.open("a", SystemCommand::TERMINAL).is_err());

        f.write_index(&[("a", "running")]);
        let settled = d.monitor.settle();
        d.apply_settled(settled);
        d.open("a", SystemCommand::TERMINAL).unwrap();
    }

    // ── execute ───────────────────────────────────────────────────────────────

    #[test]
    fn execute_uses_resolved_post_action_by_default() {
        let f = Fixture::new();
        f.write_index(&[("a", "poweroff")]);
        let mut d = f.daemon();
        d.set_setting(Some("a"), "post-terminal-action", "exit").unwrap();

        d.execute("a", VagrantCommand::UP, None).unwrap();
        d.execute("a", VagrantCommand::UP, Some(PostTerminalAction::empty())).unwrap();

        let scripts = d.dispatcher.launcher().scripts.borrow();
        assert_eq!(scripts[0], "/usr/bin/vagrant up a; exit");
        assert_eq!(scripts[1], "/usr/bin/vagrant up a");
    }

    #[test]
    fn rejected_post_action_leaves_the_default_in_force() {
        let f = Fixture::new();
        f.write_index(&[("a", "poweroff")]);
        let mut d = f.daemon();

        assert!(d.set_setting(None, "post-terminal-action", "later").is_err());
        assert!(d.set_setting(Some("a"), "post-terminal-action", "later").is_err());
        assert!(!f.config.exists());

        d.execute("a", VagrantCommand::UP, None).unwrap();
        let scripts = d.dispatcher.launcher().scripts.borrow();
        // Default is pause-then-exit.
        assert!(scripts[0].starts_with("/usr/bin/vagrant up a; "), "{}", scripts[0]);
        assert!(scripts[0].contains("Press Enter to continue"), "{}", scripts[0]);
        assert!(scripts[0].ends_with("; exit"), "{}", scripts[0]);
    }

    #[test]
    fn execute_unknown_machine_is_validation_error() {
        let f = Fixture::new();
        let d = f.daemon();
        let err = d
            .execute("missing-id", VagrantCommand::UP, Some(PostTerminalAction::empty()))
            .unwrap_err();
        assert_eq!(err.title(), "Invalid machine id");
        assert!(d.dispatcher.launcher().scripts.borrow().is_empty());
    }

    // ── settings ──────────────────────────────────────────────────────────────

    #[test]
    fn set_setting_persists_and_publishes_minimal_change() {
        let f = Fixture::new();
        f.write_index(&[("a", "running"), ("b", "running")]);
        let mut d = f.daemon();
        let log = recorder(&mut d);

        let changes = d.set_setting(Some("a"), "label", "Frontend").unwrap();
        assert_eq!(
            changes,
            vec![ConfigChanged {
                machine_id: "a".into(),
                properties: vec![Property::Label],
            }]
        );
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(resolve(&d, "a", "label"), Some(SettingValue::Str("Frontend".into())));

        let saved = config::load_or_default(&f.config).unwrap();
        assert_eq!(
            saved.machine_overrides().get("a", Property::Label),
            Some(&SettingValue::Str("Frontend".into()))
        );
    }

    #[test]
    fn set_setting_rejects_unknown_key_and_bad_value() {
        let f = Fixture::new();
        let mut d = f.daemon();
        assert!(d.set_setting(None, "colour", "red").is_err());
        assert!(d.set_setting(None, "order", "first").is_err());
        assert!(d.set_setting(None, "label", "x").is_err());
        assert!(!f.config.exists());
    }

    #[test]
    fn failed_save_rolls_back_and_publishes_nothing() {
        let f = Fixture::new();
        f.write_index(&[("a", "running")]);
        // A regular file where the config directory should be.
        let blocker = f.dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let (config, _) = load_config(&f.config);
        let mut d = Daemon::new(
            blocker.join("config.toml"),
            config,
            Some(f.index.clone()),
            RecordingLauncher::default(),
        );
        let log = recorder(&mut d);

        assert!(d.set_setting(Some("a"), "label", "Frontend").is_err());
        assert!(d.set_setting(None, "order", "7").is_err());

        assert_eq!(resolve(&d, "a", "label"), None);
        assert_eq!(resolve(&d, "a", "order"), Some(SettingValue::Int(0)));
        assert!(d.overlay.borrow().overrides().get("a", Property::Label).is_none());
        assert!(d.config.machine_overrides().get("a", Property::Label).is_none());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn reset_restores_global_default() {
        let f = Fixture::new();
        f.write_index(&[("a", "running")]);
        let mut d = f.daemon();
        d.set_setting(None, "notifications", "false").unwrap();
        let changes = d.reset_setting(None, "notifications").unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(resolve(&d, "a", "notifications"), Some(SettingValue::Bool(true)));
        assert!(d.reset_setting(None, "label").is_err());
    }

    // ── reload_config ─────────────────────────────────────────────────────────

    #[test]
    fn reload_publishes_only_changed_pairs() {
        let f = Fixture::new();
        f.write_index(&[("a", "running"), ("b", "running")]);
        let mut d = f.daemon();
        let log = recorder(&mut d);

        std::fs::create_dir_all(f.config.parent().unwrap()).unwrap();
        std::fs::write(&f.config, "[machines.b]\ndisplay-vagrant-ssh = false\n").unwrap();
        d.reload_config();

        assert_eq!(
            *log.borrow(),
            vec![Event::Config(ConfigChanged {
                machine_id: "b".into(),
                properties: vec![Property::DisplayVagrantSsh],
            })]
        );

        // Reloading the same file again is silent.
        d.reload_config();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn broken_config_keeps_previous_settings() {
        let f = Fixture::new();
        f.write_index(&[("a", "running")]);
        let mut d = f.daemon();
        d.set_setting(Some("a"), "order", "4").unwrap();

        std::fs::write(&f.config, "not = [valid").unwrap();
        d.reload_config();
        assert_eq!(resolve(&d, "a", "order"), Some(SettingValue::Int(4)));
        assert!(d.status.error.is_some());
    }

    // ── run ───────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_stops_on_shutdown_and_marks_status() {
        let f = Fixture::new();
        f.write_index(&[("a", "running")]);
        let d = f.daemon();
        let status_path = d.status_path.clone();

        d.run(async {}).await.unwrap();

        let parsed: DaemonStatus =
            toml::from_str(&std::fs::read_to_string(status_path).unwrap()).unwrap();
        assert_eq!(parsed.state, DaemonState::Stopped);
        assert_eq!(parsed.machines.len(), 1);
    }

    #[tokio::test]
    async fn run_sees_index_whose_directory_appears_later() {
        let f = Fixture::new();
        let index_dir = f.dir.path().join("data").join("machine-index");
        let index = index_dir.join("index");
        let mut config = Config::default();
        config.daemon.debounce_ms = 50;
        let mut d = Daemon::new(
            f.config.clone(),
            config,
            Some(index.clone()),
            RecordingLauncher::default(),
        );
        let log = recorder(&mut d);

        d.run(async {
            std::fs::create_dir_all(&index_dir).unwrap();
            f.write_index_at(&index, &[("a", "running")]);
            wait_for(&log, |e| matches!(e, Event::Machine(ChangeEvent::Added { .. }))).await;
        })
        .await
        .unwrap();

        let ids: Vec<_> = log
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Machine(ChangeEvent::Added { id, .. }) => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn run_creates_config_directory_and_reloads_edits() {
        let f = Fixture::new();
        f.write_index(&[("a", "running")]);
        assert!(!f.config.parent().unwrap().exists());
        let mut d = f.daemon();
        let log = recorder(&mut d);

        d.run(async {
            assert!(f.config.parent().unwrap().is_dir());
            std::fs::write(&f.config, "[machines.a]\norder = 3\n").unwrap();
            wait_for(&log, |e| matches!(e, Event::Config(_))).await;
        })
        .await
        .unwrap();

        assert_eq!(
            *log.borrow(),
            vec![Event::Config(ConfigChanged {
                machine_id: "a".into(),
                properties: vec![Property::Order],
            })]
        );
    }
}
