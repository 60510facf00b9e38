use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::command::VagrantCommand;
use crate::index::{MachineRecord, Snapshot};
use crate::overlay::ConfigOverlay;
use crate::settings::PathDisplay;

/// Current operational state of the daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// Loading the index and config for the first time.
    Starting,
    /// Watching the machine index for changes.
    Watching,
    /// The daemon has shut down; the machine list is the last one seen.
    Stopped,
}

/// Runtime status written by the daemon next to its config file.
/// The panel UI reads this file (read-only) to render the machine menu.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: DaemonState,
    /// Machine index being watched.
    pub index_path: String,
    /// RFC 3339 timestamp of the last settled index change that produced events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change: Option<String>,
    /// Human-readable error message if the daemon encountered a non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machines in display order.
    #[serde(default)]
    pub machines: Vec<MachineStatus>,
}

/// One machine as the menu should show it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MachineStatus {
    pub id: String,
    pub label: String,
    pub order: i64,
    /// Omitted when `machine-path-display` is `hidden`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Omitted when `display-machine-state` is off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub provider: String,
    pub notifications: bool,
    pub post_terminal_action: String,
    /// Vagrant commands both available in the current state and enabled for display.
    pub commands: Vec<String>,
    pub system_commands: Vec<String>,
}

impl DaemonStatus {
    /// Constructs the initial status on daemon startup.
    pub fn new(index_path: &Path) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: DaemonState::Starting,
            index_path: index_path.display().to_string(),
            last_change: None,
            error: None,
            machines: Vec::new(),
        }
    }

    /// Rebuilds the machine list from `snapshot` and the resolved display settings.
    pub fn refresh_machines(&mut self, snapshot: &Snapshot, overlay: &mut ConfigOverlay) {
        let mut machines: Vec<MachineStatus> = snapshot
            .machines
            .values()
            .map(|record| machine_status(record, overlay))
            .collect();
        machines.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.label.cmp(&b.label)));
        self.machines = machines;
    }
}

/// Label shown for a machine: override, then its Vagrant name, then its directory.
pub fn display_label(record: &MachineRecord, label_override: Option<&str>) -> String {
    if let Some(label) = label_override.filter(|l| !l.is_empty()) {
        return label.to_string();
    }
    if !record.name.is_empty() && record.name != "default" {
        return record.name.clone();
    }
    record
        .vagrantfile_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| record.id.clone())
}

fn display_path(path: &Path, mode: PathDisplay) -> Option<String> {
    match mode {
        PathDisplay::Hidden => None,
        PathDisplay::Full => Some(path.display().to_string()),
        PathDisplay::Short => {
            let short = dirs::home_dir()
                .and_then(|home| path.strip_prefix(&home).ok().map(|rest| Path::new("~").join(rest)))
                .unwrap_or_else(|| path.to_path_buf());
            Some(short.display().to_string())
        }
    }
}

fn machine_status(record: &MachineRecord, overlay: &mut ConfigOverlay) -> MachineStatus {
    let cfg = overlay.display_config(&record.id);
    let commands = VagrantCommand::available_for(&record.state) & cfg.vagrant_commands();
    MachineStatus {
        id: record.id.clone(),
        label: display_label(record, cfg.label()),
        order: cfg.order(),
        path: display_path(&record.vagrantfile_path, cfg.path_display()),
        state: cfg.show_state().then(|| record.state.to_string()),
        provider: record.provider.clone(),
        notifications: cfg.notifications(),
        post_terminal_action: cfg.post_terminal_action().key().to_string(),
        commands: commands.names().into_iter().map(String::from).collect(),
        system_commands: cfg
            .system_commands()
            .names()
            .into_iter()
            .map(String::from)
            .collect(),
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Logs errors rather than panicking — a status write failure should
/// never crash the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                tracing::error!("Failed to write status file: {e}");
            }
        }
        Err(e) => tracing::error!("Failed to serialize status: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MachineState;
    use crate::settings::{GlobalSettings, MachineOverrides, Property, SettingValue};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn record(id: &str, name: &str, state: MachineState, dir: &str) -> MachineRecord {
        MachineRecord {
            id: id.to_string(),
            name: name.to_string(),
            provider: "virtualbox".to_string(),
            state,
            vagrantfile_path: PathBuf::from(dir),
            extra: BTreeMap::new(),
        }
    }

    fn snapshot(records: Vec<MachineRecord>) -> Snapshot {
        Snapshot {
            version: 1,
            machines: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    fn overlay() -> ConfigOverlay {
        ConfigOverlay::new(GlobalSettings::default(), MachineOverrides::default())
    }

    // ── DaemonStatus::new ─────────────────────────────────────────────────────

    #[test]
    fn new_starts_without_machines() {
        let s = DaemonStatus::new(Path::new("/idx"));
        assert_eq!(s.state, DaemonState::Starting);
        assert_eq!(s.index_path, "/idx");
        assert!(s.machines.is_empty());
        assert!(s.last_change.is_none());
        assert_eq!(s.version, env!("CARGO_PKG_VERSION"));
    }

    // ── display_label ─────────────────────────────────────────────────────────

    #[test]
    fn label_prefers_override_then_name_then_directory() {
        let named = record("a", "web", MachineState::Running, "/vms/project");
        let default = record("b", "default", MachineState::Running, "/vms/project");
        assert_eq!(display_label(&named, Some("Frontend")), "Frontend");
        assert_eq!(display_label(&named, Some("")), "web");
        assert_eq!(display_label(&named, None), "web");
        assert_eq!(display_label(&default, None), "project");
    }

    // ── refresh_machines ──────────────────────────────────────────────────────

    #[test]
    fn machines_are_sorted_by_order_then_label() {
        let snap = snapshot(vec![
            record("a", "zeta", MachineState::Running, "/vms/a"),
            record("b", "alpha", MachineState::Running, "/vms/b"),
            record("c", "mid", MachineState::Running, "/vms/c"),
        ]);
        let mut o = overlay();
        o.set_override("a", Property::Order, SettingValue::Int(-1)).unwrap();

        let mut s = DaemonStatus::new(Path::new("/idx"));
        s.refresh_machines(&snap, &mut o);
        let labels: Vec<_> = s.machines.iter().map(|m| m.label.as_str()).collect();
        assert_eq!(labels, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn commands_are_available_and_displayed() {
        let snap = snapshot(vec![record("a", "web", MachineState::Running, "/vms/a")]);
        let mut o = overlay();
        o.set_override("a", Property::DisplayVagrantSsh, SettingValue::Bool(false)).unwrap();

        let mut s = DaemonStatus::new(Path::new("/idx"));
        s.refresh_machines(&snap, &mut o);
        let m = &s.machines[0];
        assert_eq!(m.commands, vec!["provision", "rdp", "suspend", "halt", "destroy"]);
        assert_eq!(m.system_commands.len(), 4);
        assert_eq!(m.state.as_deref(), Some("running"));
        assert_eq!(m.post_terminal_action, "both");
    }

    #[test]
    fn hidden_path_and_state_are_omitted() {
        let snap = snapshot(vec![record("a", "web", MachineState::Saved, "/vms/a")]);
        let mut o = overlay();
        o.set_global(Property::MachinePathDisplay, SettingValue::Str("hidden".into())).unwrap();
        o.set_global(Property::DisplayMachineState, SettingValue::Bool(false)).unwrap();

        let mut s = DaemonStatus::new(Path::new("/idx"));
        s.refresh_machines(&snap, &mut o);
        assert!(s.machines[0].path.is_none());
        assert!(s.machines[0].state.is_none());

        let content = toml::to_string_pretty(&s).unwrap();
        assert!(!content.contains("path = \"/vms/a\""));
    }

    #[test]
    fn full_path_is_shown_verbatim() {
        assert_eq!(
            display_path(Path::new("/vms/a"), PathDisplay::Full).as_deref(),
            Some("/vms/a")
        );
        assert_eq!(
            display_path(Path::new("/vms/a"), PathDisplay::Short).as_deref(),
            Some("/vms/a")
        );
    }

    // ── write_status ──────────────────────────────────────────────────────────

    #[test]
    fn write_status_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("status.toml");
        write_status(&path, &DaemonStatus::new(Path::new("/idx")));
        assert!(path.exists());
    }

    #[test]
    fn write_status_content_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");

        let snap = snapshot(vec![record("a", "web", MachineState::Poweroff, "/vms/a")]);
        let mut original = DaemonStatus::new(Path::new("/idx"));
        original.state = DaemonState::Watching;
        original.refresh_machines(&snap, &mut overlay());

        write_status(&path, &original);

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: DaemonStatus = toml::from_str(&content).unwrap();
        assert_eq!(parsed.state, DaemonState::Watching);
        assert_eq!(parsed.machines, original.machines);
        assert!(!content.contains("error"));
    }
}
