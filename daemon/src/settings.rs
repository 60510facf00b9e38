/// Display-property schema and the two key/value stores it is read from.
///
/// - [`GlobalSettings`]: schema-backed defaults, addressed by kebab-case key.
///   Every property except `label` always has a value here.
/// - [`MachineOverrides`]: sparse per-machine values set by the user.
///
/// Values of the wrong type for their property, or outside the allowed words of
/// an enumerated property, are rejected on the way in.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::command::PostTerminalAction;

/// A single stored setting value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            SettingValue::Bool(_) => ValueKind::Bool,
            SettingValue::Int(_) => ValueKind::Int,
            SettingValue::Str(_) => ValueKind::Str,
        }
    }

    /// Parses command-line text as a value `property` accepts.
    pub fn parse(property: Property, text: &str) -> Option<Self> {
        let value = match property.kind() {
            ValueKind::Bool => match text {
                "true" | "yes" | "on" | "1" => SettingValue::Bool(true),
                "false" | "no" | "off" | "0" => SettingValue::Bool(false),
                _ => return None,
            },
            ValueKind::Int => SettingValue::Int(text.parse().ok()?),
            ValueKind::Str => SettingValue::Str(text.to_string()),
        };
        property.check(&value).ok().map(|()| value)
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => write!(f, "{b}"),
            SettingValue::Int(i) => write!(f, "{i}"),
            SettingValue::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Str,
}

/// Every per-machine display property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Property {
    Order,
    Label,
    Notifications,
    MachinePathDisplay,
    DisplayMachineState,
    PostTerminalAction,
    DisplayVagrantUp,
    DisplayVagrantUpProvision,
    DisplayVagrantUpSsh,
    DisplayVagrantUpRdp,
    DisplayVagrantProvision,
    DisplayVagrantSsh,
    DisplayVagrantRdp,
    DisplayVagrantResume,
    DisplayVagrantSuspend,
    DisplayVagrantHalt,
    DisplayVagrantDestroy,
    DisplayVagrantDestroyForce,
    DisplaySystemTerminal,
    DisplaySystemFileManager,
    DisplaySystemVagrantfile,
    DisplaySystemMachineConfig,
}

/// Schema row: property, kebab-case key, value type.
const SCHEMA: &[(Property, &str, ValueKind)] = &[
    (Property::Order, "order", ValueKind::Int),
    (Property::Label, "label", ValueKind::Str),
    (Property::Notifications, "notifications", ValueKind::Bool),
    (Property::MachinePathDisplay, "machine-path-display", ValueKind::Str),
    (Property::DisplayMachineState, "display-machine-state", ValueKind::Bool),
    (Property::PostTerminalAction, "post-terminal-action", ValueKind::Str),
    (Property::DisplayVagrantUp, "display-vagrant-up", ValueKind::Bool),
    (Property::DisplayVagrantUpProvision, "display-vagrant-up-provision", ValueKind::Bool),
    (Property::DisplayVagrantUpSsh, "display-vagrant-up-ssh", ValueKind::Bool),
    (Property::DisplayVagrantUpRdp, "display-vagrant-up-rdp", ValueKind::Bool),
    (Property::DisplayVagrantProvision, "display-vagrant-provision", ValueKind::Bool),
    (Property::DisplayVagrantSsh, "display-vagrant-ssh", ValueKind::Bool),
    (Property::DisplayVagrantRdp, "display-vagrant-rdp", ValueKind::Bool),
    (Property::DisplayVagrantResume, "display-vagrant-resume", ValueKind::Bool),
    (Property::DisplayVagrantSuspend, "display-vagrant-suspend", ValueKind::Bool),
    (Property::DisplayVagrantHalt, "display-vagrant-halt", ValueKind::Bool),
    (Property::DisplayVagrantDestroy, "display-vagrant-destroy", ValueKind::Bool),
    (Property::DisplayVagrantDestroyForce, "display-vagrant-destroy-force", ValueKind::Bool),
    (Property::DisplaySystemTerminal, "display-system-terminal", ValueKind::Bool),
    (Property::DisplaySystemFileManager, "display-system-file-manager", ValueKind::Bool),
    (Property::DisplaySystemVagrantfile, "display-system-vagrantfile", ValueKind::Bool),
    (Property::DisplaySystemMachineConfig, "display-system-machine-config", ValueKind::Bool),
];

impl Property {
    pub const ALL: [Property; 22] = [
        Property::Order,
        Property::Label,
        Property::Notifications,
        Property::MachinePathDisplay,
        Property::DisplayMachineState,
        Property::PostTerminalAction,
        Property::DisplayVagrantUp,
        Property::DisplayVagrantUpProvision,
        Property::DisplayVagrantUpSsh,
        Property::DisplayVagrantUpRdp,
        Property::DisplayVagrantProvision,
        Property::DisplayVagrantSsh,
        Property::DisplayVagrantRdp,
        Property::DisplayVagrantResume,
        Property::DisplayVagrantSuspend,
        Property::DisplayVagrantHalt,
        Property::DisplayVagrantDestroy,
        Property::DisplayVagrantDestroyForce,
        Property::DisplaySystemTerminal,
        Property::DisplaySystemFileManager,
        Property::DisplaySystemVagrantfile,
        Property::DisplaySystemMachineConfig,
    ];

    fn row(self) -> &'static (Property, &'static str, ValueKind) {
        // SCHEMA is declared in the same order as ALL.
        &SCHEMA[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.row().1
    }

    pub fn kind(self) -> ValueKind {
        self.row().2
    }

    pub fn from_name(name: &str) -> Option<Self> {
        SCHEMA.iter().find(|(_, n, _)| *n == name).map(|(p, _, _)| *p)
    }

    /// Schema default. `None` only for `label`, which has no global value.
    pub fn default_value(self) -> Option<SettingValue> {
        let value = match self {
            Property::Label => return None,
            Property::Order => SettingValue::Int(0),
            Property::MachinePathDisplay => SettingValue::Str(PathDisplay::Short.as_str().into()),
            Property::PostTerminalAction => SettingValue::Str("both".into()),
            Property::DisplayVagrantDestroyForce => SettingValue::Bool(false),
            _ => SettingValue::Bool(true),
        };
        Some(value)
    }

    /// Rejects values of the wrong kind and words an enumerated property does
    /// not know.
    pub fn check(self, value: &SettingValue) -> Result<(), SettingError> {
        if value.kind() != self.kind() {
            return Err(SettingError::WrongType(self));
        }
        let known = match (self, value.as_str()) {
            (Property::PostTerminalAction, Some(word)) => {
                PostTerminalAction::from_key(word).is_some()
            }
            (Property::MachinePathDisplay, Some(word)) => PathDisplay::from_name(word).is_some(),
            _ => true,
        };
        if !known {
            return Err(SettingError::InvalidValue(self, value.to_string()));
        }
        Ok(())
    }

    /// Whether the global store may hold this property.
    pub fn has_global(self) -> bool {
        self != Property::Label
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a machine's Vagrantfile directory is shown next to its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathDisplay {
    Hidden,
    Short,
    Full,
}

impl PathDisplay {
    pub fn as_str(self) -> &'static str {
        match self {
            PathDisplay::Hidden => "hidden",
            PathDisplay::Short => "short",
            PathDisplay::Full => "full",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hidden" => Some(PathDisplay::Hidden),
            "short" => Some(PathDisplay::Short),
            "full" => Some(PathDisplay::Full),
            _ => None,
        }
    }
}

/// Raw key/value table as it appears in the config file.
pub type RawSettings = BTreeMap<String, SettingValue>;

/// Checks a raw key/value pair against the schema.
fn validate(key: &str, value: &SettingValue) -> Option<Property> {
    let Some(property) = Property::from_name(key) else {
        tracing::warn!(key, "ignoring unknown setting");
        return None;
    };
    if let Err(e) = property.check(value) {
        tracing::warn!(key, %value, "ignoring setting: {e}");
        return None;
    }
    Some(property)
}

/// Global defaults: schema defaults overlaid with user-provided values.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    values: BTreeMap<Property, SettingValue>,
}

impl GlobalSettings {
    pub fn from_raw(raw: &RawSettings) -> Self {
        let mut settings = Self::default();
        for (key, value) in raw {
            if let Some(property) = validate(key, value) {
                if !property.has_global() {
                    tracing::warn!(key, "setting is per-machine only; ignoring global value");
                    continue;
                }
                settings.values.insert(property, value.clone());
            }
        }
        settings
    }

    pub fn get(&self, property: Property) -> Option<&SettingValue> {
        self.values.get(&property)
    }

    /// Returns whether the stored value changed.
    pub fn set(&mut self, property: Property, value: SettingValue) -> Result<bool, SettingError> {
        if !property.has_global() {
            return Err(SettingError::NoGlobal(property));
        }
        property.check(&value)?;
        Ok(self.values.insert(property, value.clone()).as_ref() != Some(&value))
    }

    /// Values that differ from the schema defaults, for writing back to disk.
    pub fn to_raw(&self) -> RawSettings {
        self.values
            .iter()
            .filter(|(p, v)| p.default_value().as_ref() != Some(*v))
            .map(|(p, v)| (p.name().to_string(), v.clone()))
            .collect()
    }
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            values: Property::ALL
                .iter()
                .filter_map(|p| p.default_value().map(|v| (*p, v)))
                .collect(),
        }
    }
}

/// Sparse per-machine overrides.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MachineOverrides {
    machines: BTreeMap<String, BTreeMap<Property, SettingValue>>,
}

impl MachineOverrides {
    pub fn from_raw(raw: &BTreeMap<String, RawSettings>) -> Self {
        let mut overrides = Self::default();
        for (machine_id, table) in raw {
            let values: BTreeMap<_, _> = table
                .iter()
                .filter_map(|(k, v)| validate(k, v).map(|p| (p, v.clone())))
                .collect();
            if !values.is_empty() {
                overrides.machines.insert(machine_id.clone(), values);
            }
        }
        overrides
    }

    pub fn get(&self, machine_id: &str, property: Property) -> Option<&SettingValue> {
        self.machines.get(machine_id)?.get(&property)
    }

    pub fn set(
        &mut self,
        machine_id: &str,
        property: Property,
        value: SettingValue,
    ) -> Result<bool, SettingError> {
        property.check(&value)?;
        let table = self.machines.entry(machine_id.to_string()).or_default();
        Ok(table.insert(property, value.clone()).as_ref() != Some(&value))
    }

    /// Removes an override so the global value applies again.
    pub fn unset(&mut self, machine_id: &str, property: Property) -> bool {
        let Some(table) = self.machines.get_mut(machine_id) else {
            return false;
        };
        let removed = table.remove(&property).is_some();
        if table.is_empty() {
            self.machines.remove(machine_id);
        }
        removed
    }

    pub fn machine_ids(&self) -> impl Iterator<Item = &str> {
        self.machines.keys().map(String::as_str)
    }

    pub fn to_raw(&self) -> BTreeMap<String, RawSettings> {
        self.machines
            .iter()
            .map(|(id, table)| {
                let raw = table
                    .iter()
                    .map(|(p, v)| (p.name().to_string(), v.clone()))
                    .collect();
                (id.clone(), raw)
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingError {
    #[error("unknown setting '{0}'")]
    Unknown(String),
    #[error("'{0}' can only be set per machine")]
    NoGlobal(Property),
    #[error("wrong value type for '{0}'")]
    WrongType(Property),
    #[error("'{1}' is not a valid value for '{0}'")]
    InvalidValue(Property, String),
}
