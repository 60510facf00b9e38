/// Reader for Vagrant's machine index (`$VAGRANT_HOME/data/machine-index/index`).
///
/// Vagrant rewrites this JSON file whenever a machine changes state. The reader
/// turns it into an immutable [`Snapshot`]; any failure to read or parse it
/// yields [`Snapshot::empty`] instead of an error, because a half-written file
/// observed mid-update must never look like a fault to the user.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Last state Vagrant recorded for a machine.
///
/// States outside the known vocabulary are carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MachineState {
    Running,
    Poweroff,
    Shutoff,
    Saved,
    Preparing,
    Aborted,
    NotCreated,
    Other(String),
}

impl MachineState {
    pub fn as_str(&self) -> &str {
        match self {
            MachineState::Running => "running",
            MachineState::Poweroff => "poweroff",
            MachineState::Shutoff => "shutoff",
            MachineState::Saved => "saved",
            MachineState::Preparing => "preparing",
            MachineState::Aborted => "aborted",
            MachineState::NotCreated => "not_created",
            MachineState::Other(s) => s,
        }
    }

    /// `poweroff` (VirtualBox) and `shutoff` (libvirt) mean the same thing.
    pub fn is_stopped(&self) -> bool {
        matches!(self, MachineState::Poweroff | MachineState::Shutoff)
    }
}

impl From<String> for MachineState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => MachineState::Running,
            "poweroff" => MachineState::Poweroff,
            "shutoff" => MachineState::Shutoff,
            "saved" => MachineState::Saved,
            "preparing" => MachineState::Preparing,
            "aborted" => MachineState::Aborted,
            "not_created" => MachineState::NotCreated,
            _ => MachineState::Other(s),
        }
    }
}

impl From<&str> for MachineState {
    fn from(s: &str) -> Self {
        MachineState::from(s.to_string())
    }
}

impl From<MachineState> for String {
    fn from(state: MachineState) -> Self {
        match state {
            MachineState::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl Default for MachineState {
    fn default() -> Self {
        MachineState::Other("unknown".to_string())
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the machine index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    /// Key of the entry in the index; not part of the entry body.
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub state: MachineState,
    /// Directory holding the Vagrantfile. Not checked for existence here.
    #[serde(default)]
    pub vagrantfile_path: PathBuf,
    /// Fields this reader does not interpret (`local_data_path`, `updated_at`, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Immutable point-in-time parse of the machine index, keyed by machine id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub version: u64,
    pub machines: BTreeMap<String, MachineRecord>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&MachineRecord> {
        self.machines.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.machines.keys().map(String::as_str)
    }
}

/// Reads and parses the index at `path`. Never fails; see module docs.
pub fn parse(path: &Path) -> Snapshot {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            tracing::debug!(path = %path.display(), "machine index unreadable: {e}");
            return Snapshot::empty();
        }
    };
    parse_bytes(&bytes)
}

/// Parses index contents already in memory.
pub fn parse_bytes(bytes: &[u8]) -> Snapshot {
    let text = match std::str::from_utf8(bytes) {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!("machine index is not valid UTF-8: {e}");
            return Snapshot::empty();
        }
    };
    let root: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("machine index is not valid JSON: {e}");
            return Snapshot::empty();
        }
    };
    let Value::Object(mut root) = root else {
        tracing::debug!("machine index root is not an object");
        return Snapshot::empty();
    };
    let Some(Value::Object(entries)) = root.remove("machines") else {
        tracing::debug!("machine index has no `machines` object");
        return Snapshot::empty();
    };

    let version = root.get("version").and_then(Value::as_u64).unwrap_or(0);
    let mut machines = BTreeMap::new();
    for (id, body) in entries {
        match serde_json::from_value::<MachineRecord>(body) {
            Ok(mut record) => {
                record.id = id.clone();
                machines.insert(id, record);
            }
            Err(e) => tracing::debug!(machine = %id, "skipping malformed index entry: {e}"),
        }
    }

    Snapshot { version, machines }
}
