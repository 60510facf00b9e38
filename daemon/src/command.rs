/// Logical commands a user can run against a machine.
///
/// Each command is a distinct bit so a set of visible commands fits in one
/// integer. Keys used in the config file and on the command line are looked up
/// through explicit tables, never through the flag identifiers that
/// `bitflags` exposes via its own `from_name`.
use bitflags::bitflags;

use crate::index::MachineState;

bitflags! {
    /// Commands run through the `vagrant` executable in a terminal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VagrantCommand: u32 {
        const UP            = 1 << 0;
        const UP_PROVISION  = 1 << 1;
        const UP_SSH        = 1 << 2;
        const UP_RDP        = 1 << 3;
        const PROVISION     = 1 << 4;
        const SSH           = 1 << 5;
        const RDP           = 1 << 6;
        const RESUME        = 1 << 7;
        const SUSPEND       = 1 << 8;
        const HALT          = 1 << 9;
        const DESTROY       = 1 << 10;
        const DESTROY_FORCE = 1 << 11;
    }
}

bitflags! {
    /// Commands handed to the desktop rather than to vagrant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SystemCommand: u32 {
        const TERMINAL       = 1 << 0;
        const FILE_MANAGER   = 1 << 1;
        const VAGRANTFILE    = 1 << 2;
        const MACHINE_CONFIG = 1 << 3;
    }
}

bitflags! {
    /// What happens to the terminal session once a vagrant command finishes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PostTerminalAction: u32 {
        const PAUSE = 1 << 0;
        const EXIT  = 1 << 1;
        const BOTH  = Self::PAUSE.bits() | Self::EXIT.bits();
    }
}

const VAGRANT_NAMES: &[(&str, VagrantCommand)] = &[
    ("up", VagrantCommand::UP),
    ("up-provision", VagrantCommand::UP_PROVISION),
    ("up-ssh", VagrantCommand::UP_SSH),
    ("up-rdp", VagrantCommand::UP_RDP),
    ("provision", VagrantCommand::PROVISION),
    ("ssh", VagrantCommand::SSH),
    ("rdp", VagrantCommand::RDP),
    ("resume", VagrantCommand::RESUME),
    ("suspend", VagrantCommand::SUSPEND),
    ("halt", VagrantCommand::HALT),
    ("destroy", VagrantCommand::DESTROY),
    ("destroy-force", VagrantCommand::DESTROY_FORCE),
];

const SYSTEM_NAMES: &[(&str, SystemCommand)] = &[
    ("terminal", SystemCommand::TERMINAL),
    ("file-manager", SystemCommand::FILE_MANAGER),
    ("vagrantfile", SystemCommand::VAGRANTFILE),
    ("machine-config", SystemCommand::MACHINE_CONFIG),
];

const POST_ACTION_NAMES: &[(&str, PostTerminalAction)] = &[
    ("none", PostTerminalAction::empty()),
    ("pause", PostTerminalAction::PAUSE),
    ("exit", PostTerminalAction::EXIT),
    ("both", PostTerminalAction::BOTH),
];

fn lookup<T: Copy>(table: &[(&str, T)], name: &str) -> Option<T> {
    table.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
}

fn reverse<T: PartialEq>(table: &[(&'static str, T)], value: &T) -> Option<&'static str> {
    table.iter().find(|(_, v)| v == value).map(|(n, _)| *n)
}

impl VagrantCommand {
    /// Single-bit command for `key`; `"none"` maps to the empty set.
    pub fn from_key(key: &str) -> Option<Self> {
        if key == "none" {
            return Some(Self::empty());
        }
        lookup(VAGRANT_NAMES, key)
    }

    /// Key of a single-bit command.
    pub fn key(self) -> Option<&'static str> {
        if self.is_empty() {
            return Some("none");
        }
        reverse(VAGRANT_NAMES, &self)
    }

    /// Names of every bit in the set, in declaration order.
    pub fn names(self) -> Vec<&'static str> {
        VAGRANT_NAMES
            .iter()
            .filter(|(_, c)| self.contains(*c))
            .map(|(n, _)| *n)
            .collect()
    }

    /// `vagrant` argument lists run in sequence for a single-bit command.
    pub fn invocations(self) -> &'static [&'static [&'static str]] {
        match self {
            Self::UP => &[&["up"]],
            Self::UP_PROVISION => &[&["up", "--provision"]],
            Self::UP_SSH => &[&["up"], &["ssh"]],
            Self::UP_RDP => &[&["up"], &["rdp"]],
            Self::PROVISION => &[&["provision"]],
            Self::SSH => &[&["ssh"]],
            Self::RDP => &[&["rdp"]],
            Self::RESUME => &[&["resume"]],
            Self::SUSPEND => &[&["suspend"]],
            Self::HALT => &[&["halt"]],
            Self::DESTROY => &[&["destroy"]],
            Self::DESTROY_FORCE => &[&["destroy", "--force"]],
            _ => &[],
        }
    }

    /// Commands that make sense for a machine in `state`.
    pub fn available_for(state: &MachineState) -> Self {
        let destroy = Self::DESTROY | Self::DESTROY_FORCE;
        match state {
            MachineState::Running => {
                Self::PROVISION | Self::SSH | Self::RDP | Self::SUSPEND | Self::HALT | destroy
            }
            MachineState::Saved => Self::UP | Self::RESUME | Self::HALT | destroy,
            MachineState::Preparing => Self::empty(),
            MachineState::Aborted | MachineState::NotCreated => {
                Self::UP | Self::UP_PROVISION | Self::UP_SSH | Self::UP_RDP | destroy
            }
            s if s.is_stopped() => {
                Self::UP | Self::UP_PROVISION | Self::UP_SSH | Self::UP_RDP | destroy
            }
            _ => Self::all(),
        }
    }
}

impl SystemCommand {
    pub fn from_key(key: &str) -> Option<Self> {
        if key == "none" {
            return Some(Self::empty());
        }
        lookup(SYSTEM_NAMES, key)
    }

    pub fn key(self) -> Option<&'static str> {
        if self.is_empty() {
            return Some("none");
        }
        reverse(SYSTEM_NAMES, &self)
    }

    pub fn names(self) -> Vec<&'static str> {
        SYSTEM_NAMES
            .iter()
            .filter(|(_, c)| self.contains(*c))
            .map(|(n, _)| *n)
            .collect()
    }
}

impl PostTerminalAction {
    pub fn from_key(key: &str) -> Option<Self> {
        lookup(POST_ACTION_NAMES, key)
    }

    pub fn key(self) -> &'static str {
        reverse(POST_ACTION_NAMES, &self).unwrap_or("none")
    }
}
