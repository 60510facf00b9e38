use crate::index::{MachineRecord, MachineState};
use crate::settings::Property;

/// A semantic change between two successive machine-index snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A machine id appeared in the index.
    Added { id: String, record: MachineRecord },
    /// A machine id disappeared from the index (or the index became unreadable).
    Removed { id: String, last_known: MachineRecord },
    /// A machine kept its id but Vagrant recorded a different state.
    StateChanged {
        id: String,
        old_state: MachineState,
        new_state: MachineState,
        record: MachineRecord,
    },
}

impl ChangeEvent {
    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Added { id, .. }
            | ChangeEvent::Removed { id, .. }
            | ChangeEvent::StateChanged { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Added { .. } => "added",
            ChangeEvent::Removed { .. } => "removed",
            ChangeEvent::StateChanged { .. } => "state-changed",
        }
    }
}

/// The resolved display properties of one machine that actually changed value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChanged {
    pub machine_id: String,
    pub properties: Vec<Property>,
}

/// Everything delivered to bus subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Machine(ChangeEvent),
    Config(ConfigChanged),
}
