/// Per-machine display configuration resolved from two layers.
///
/// Lookup order for a property is: the machine's override, then the global
/// value, then nothing. `label` never falls back to a global value.
///
/// Whenever either layer changes, [`ConfigOverlay`] recomputes the affected
/// machines and reports exactly the (machine, property) pairs whose resolved
/// value moved, as [`ConfigChanged`] events.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::command::{PostTerminalAction, SystemCommand, VagrantCommand};
use crate::event::ConfigChanged;
use crate::settings::{
    GlobalSettings, MachineOverrides, PathDisplay, Property, SettingError, SettingValue,
};

const VAGRANT_DISPLAY: &[(Property, VagrantCommand)] = &[
    (Property::DisplayVagrantUp, VagrantCommand::UP),
    (Property::DisplayVagrantUpProvision, VagrantCommand::UP_PROVISION),
    (Property::DisplayVagrantUpSsh, VagrantCommand::UP_SSH),
    (Property::DisplayVagrantUpRdp, VagrantCommand::UP_RDP),
    (Property::DisplayVagrantProvision, VagrantCommand::PROVISION),
    (Property::DisplayVagrantSsh, VagrantCommand::SSH),
    (Property::DisplayVagrantRdp, VagrantCommand::RDP),
    (Property::DisplayVagrantResume, VagrantCommand::RESUME),
    (Property::DisplayVagrantSuspend, VagrantCommand::SUSPEND),
    (Property::DisplayVagrantHalt, VagrantCommand::HALT),
    (Property::DisplayVagrantDestroy, VagrantCommand::DESTROY),
    (Property::DisplayVagrantDestroyForce, VagrantCommand::DESTROY_FORCE),
];

const SYSTEM_DISPLAY: &[(Property, SystemCommand)] = &[
    (Property::DisplaySystemTerminal, SystemCommand::TERMINAL),
    (Property::DisplaySystemFileManager, SystemCommand::FILE_MANAGER),
    (Property::DisplaySystemVagrantfile, SystemCommand::VAGRANTFILE),
    (Property::DisplaySystemMachineConfig, SystemCommand::MACHINE_CONFIG),
];

/// Fully resolved properties of one machine. Always rebuilt as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    values: BTreeMap<Property, SettingValue>,
}

impl DisplayConfig {
    fn resolve(machine_id: &str, global: &GlobalSettings, overrides: &MachineOverrides) -> Self {
        let values = Property::ALL
            .iter()
            .filter_map(|p| {
                overrides
                    .get(machine_id, *p)
                    .or_else(|| global.get(*p))
                    .map(|v| (*p, v.clone()))
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, property: Property) -> Option<&SettingValue> {
        self.values.get(&property)
    }

    fn flag(&self, property: Property) -> bool {
        self.get(property).and_then(SettingValue::as_bool).unwrap_or(false)
    }

    pub fn order(&self) -> i64 {
        self.get(Property::Order).and_then(SettingValue::as_int).unwrap_or(0)
    }

    pub fn label(&self) -> Option<&str> {
        self.get(Property::Label).and_then(SettingValue::as_str)
    }

    pub fn notifications(&self) -> bool {
        self.flag(Property::Notifications)
    }

    pub fn show_state(&self) -> bool {
        self.flag(Property::DisplayMachineState)
    }

    pub fn path_display(&self) -> PathDisplay {
        self.get(Property::MachinePathDisplay)
            .and_then(SettingValue::as_str)
            .and_then(PathDisplay::from_name)
            .unwrap_or(PathDisplay::Short)
    }

    pub fn post_terminal_action(&self) -> PostTerminalAction {
        self.get(Property::PostTerminalAction)
            .and_then(SettingValue::as_str)
            .and_then(PostTerminalAction::from_key)
            .unwrap_or(PostTerminalAction::BOTH)
    }

    /// Vagrant commands the user wants shown for this machine.
    pub fn vagrant_commands(&self) -> VagrantCommand {
        VAGRANT_DISPLAY
            .iter()
            .filter(|(p, _)| self.flag(*p))
            .fold(VagrantCommand::empty(), |acc, (_, c)| acc | *c)
    }

    pub fn system_commands(&self) -> SystemCommand {
        SYSTEM_DISPLAY
            .iter()
            .filter(|(p, _)| self.flag(*p))
            .fold(SystemCommand::empty(), |acc, (_, c)| acc | *c)
    }

    fn changed_properties(&self, other: &DisplayConfig) -> Vec<Property> {
        Property::ALL
            .iter()
            .copied()
            .filter(|p| self.get(*p) != other.get(*p))
            .collect()
    }
}

pub struct ConfigOverlay {
    global: GlobalSettings,
    overrides: MachineOverrides,
    /// Machines currently present in the index.
    tracked: BTreeSet<String>,
    cache: HashMap<String, DisplayConfig>,
}

impl ConfigOverlay {
    pub fn new(global: GlobalSettings, overrides: MachineOverrides) -> Self {
        Self {
            global,
            overrides,
            tracked: BTreeSet::new(),
            cache: HashMap::new(),
        }
    }

    pub fn global(&self) -> &GlobalSettings {
        &self.global
    }

    pub fn overrides(&self) -> &MachineOverrides {
        &self.overrides
    }

    /// Replaces the set of machines whose configuration is watched for changes.
    pub fn track<'a>(&mut self, machine_ids: impl IntoIterator<Item = &'a str>) {
        self.tracked = machine_ids.into_iter().map(str::to_string).collect();
        self.cache.retain(|id, _| self.tracked.contains(id));
    }

    /// Resolves `property` by name. Unknown names resolve to `None`.
    pub fn resolve(&mut self, machine_id: &str, property: &str) -> Option<SettingValue> {
        let property = Property::from_name(property)?;
        self.display_config(machine_id).get(property).cloned()
    }

    pub fn display_config(&mut self, machine_id: &str) -> &DisplayConfig {
        let (global, overrides) = (&self.global, &self.overrides);
        self.cache
            .entry(machine_id.to_string())
            .or_insert_with(|| DisplayConfig::resolve(machine_id, global, overrides))
    }

    pub fn set_global(
        &mut self,
        property: Property,
        value: SettingValue,
    ) -> Result<Vec<ConfigChanged>, SettingError> {
        let before = self.snapshot(self.all_machines());
        if !self.global.set(property, value)? {
            return Ok(Vec::new());
        }
        Ok(self.commit(before))
    }

    pub fn set_override(
        &mut self,
        machine_id: &str,
        property: Property,
        value: SettingValue,
    ) -> Result<Vec<ConfigChanged>, SettingError> {
        let before = self.snapshot(vec![machine_id.to_string()]);
        if !self.overrides.set(machine_id, property, value)? {
            return Ok(Vec::new());
        }
        Ok(self.commit(before))
    }

    pub fn unset_override(&mut self, machine_id: &str, property: Property) -> Vec<ConfigChanged> {
        let before = self.snapshot(vec![machine_id.to_string()]);
        if !self.overrides.unset(machine_id, property) {
            return Vec::new();
        }
        self.commit(before)
    }

    /// Swaps both layers, e.g. after the config file was reloaded.
    pub fn replace(
        &mut self,
        global: GlobalSettings,
        overrides: MachineOverrides,
    ) -> Vec<ConfigChanged> {
        if global == self.global && overrides == self.overrides {
            return Vec::new();
        }
        let mut machines = self.all_machines();
        machines.extend(overrides.machine_ids().map(str::to_string));
        machines.sort();
        machines.dedup();

        let before = self.snapshot(machines);
        self.global = global;
        self.overrides = overrides;
        self.commit(before)
    }

    fn all_machines(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tracked.iter().cloned().collect();
        ids.extend(self.overrides.machine_ids().map(str::to_string));
        ids.sort();
        ids.dedup();
        ids
    }

    fn snapshot(&mut self, machines: Vec<String>) -> Vec<(String, DisplayConfig)> {
        machines
            .into_iter()
            .map(|id| {
                let config = self.display_config(&id).clone();
                (id, config)
            })
            .collect()
    }

    /// Rebuilds the cache and diffs it against `before`.
    fn commit(&mut self, before: Vec<(String, DisplayConfig)>) -> Vec<ConfigChanged> {
        self.cache.clear();
        before
            .into_iter()
            .filter_map(|(machine_id, old)| {
                let properties = old.changed_properties(self.display_config(&machine_id));
                if properties.is_empty() {
                    None
                } else {
                    Some(ConfigChanged {
                        machine_id,
                        properties,
                    })
                }
            })
            .collect()
    }
}
