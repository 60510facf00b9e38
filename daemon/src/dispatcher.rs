/// Turns a (machine, logical command) pair into an external process.
///
/// Every call validates the machine first: it must exist in the current
/// snapshot, its Vagrantfile directory must exist and contain a `Vagrantfile`,
/// and (for vagrant commands) the `vagrant` executable must be resolvable.
/// A failed check returns a [`DispatchError`] and nothing is spawned.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::{PostTerminalAction, SystemCommand, VagrantCommand};
use crate::index::{MachineRecord, Snapshot};
use crate::launcher::Launcher;

pub const VAGRANTFILE: &str = "Vagrantfile";
pub const DEFAULT_VAGRANT: &str = "vagrant";

const PAUSE_FRAGMENT: &str = "echo; printf 'Press Enter to continue...'; read -r _";
const EXIT_FRAGMENT: &str = "exit";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No machine with id '{id}' in the machine index")]
    InvalidMachine { id: String },
    #[error("Machine directory {} does not exist or is not a directory", path.display())]
    InvalidPath { path: PathBuf },
    #[error("No Vagrantfile found in {}", path.display())]
    MissingVagrantfile { path: PathBuf },
    #[error("No machine configuration directory at {}", path.display())]
    MissingMachineConfig { path: PathBuf },
    #[error("The '{program}' executable could not be found on PATH")]
    VagrantNotFound { program: String },
    #[error("'{command}' is not a single runnable command")]
    InvalidCommand { command: String },
    #[error("Failed to launch {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl DispatchError {
    /// Short machine-readable title for notifications.
    pub fn title(&self) -> &'static str {
        match self {
            DispatchError::InvalidMachine { .. } => "Invalid machine id",
            DispatchError::InvalidPath { .. } => "Invalid machine path",
            DispatchError::MissingVagrantfile { .. } => "Missing Vagrantfile",
            DispatchError::MissingMachineConfig { .. } => "Missing machine config",
            DispatchError::VagrantNotFound { .. } => "Vagrant not installed",
            DispatchError::InvalidCommand { .. } => "Invalid command",
            DispatchError::Spawn { .. } => "Launch failed",
        }
    }

    pub fn is_validation(&self) -> bool {
        !matches!(self, DispatchError::Spawn { .. })
    }
}

/// Captured result of `vagrant global-status`.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalStatus {
    /// `None` when the process could not be started or was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// One row of the `vagrant global-status` table.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalStatusEntry {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub state: String,
    pub directory: String,
}

impl GlobalStatus {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Rows between the dashed separator and the first blank line.
    pub fn entries(&self) -> Vec<GlobalStatusEntry> {
        self.stdout
            .lines()
            .skip_while(|l| !l.trim_start().starts_with("---"))
            .skip(1)
            .take_while(|l| !l.trim().is_empty())
            .filter_map(|line| {
                let mut cols = line.split_whitespace();
                let id = cols.next()?.to_string();
                let name = cols.next()?.to_string();
                let provider = cols.next()?.to_string();
                let state = cols.next()?.to_string();
                let directory = cols.collect::<Vec<_>>().join(" ");
                if directory.is_empty() {
                    return None;
                }
                Some(GlobalStatusEntry {
                    id,
                    name,
                    provider,
                    state,
                    directory,
                })
            })
            .collect()
    }
}

pub struct CommandDispatcher<L> {
    launcher: L,
    vagrant: String,
    snapshot: Arc<Snapshot>,
}

impl<L: Launcher> CommandDispatcher<L> {
    pub fn new(launcher: L, vagrant: impl Into<String>, snapshot: Arc<Snapshot>) -> Self {
        Self {
            launcher,
            vagrant: vagrant.into(),
            snapshot,
        }
    }

    /// Points the dispatcher at the latest settled snapshot.
    pub fn update_snapshot(&mut self, snapshot: Arc<Snapshot>) {
        self.snapshot = snapshot;
    }

    #[cfg(test)]
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Runs `command` for `machine_id` in a terminal opened in its directory.
    pub fn execute(
        &self,
        machine_id: &str,
        command: VagrantCommand,
        post_action: PostTerminalAction,
    ) -> Result<(), DispatchError> {
        let record = self.validate(machine_id)?;
        if command.invocations().is_empty() {
            return Err(DispatchError::InvalidCommand {
                command: format!("{command:?}"),
            });
        }
        let vagrant = self.locate_vagrant()?;
        let line = build_command_line(&vagrant, record, command, post_action);

        tracing::info!(
            machine = machine_id,
            command = command.key().unwrap_or_default(),
            line = %line,
            "running vagrant command"
        );
        self.launcher
            .open_terminal(&record.vagrantfile_path, Some(&line))
            .map_err(|source| DispatchError::Spawn {
                what: "terminal",
                source,
            })
    }

    /// Opens a terminal, file manager, Vagrantfile or machine directory.
    pub fn open(&self, machine_id: &str, target: SystemCommand) -> Result<(), DispatchError> {
        let record = self.validate(machine_id)?;
        let dir = &record.vagrantfile_path;

        let path = match target {
            SystemCommand::TERMINAL => {
                tracing::info!(machine = machine_id, "opening terminal");
                return self
                    .launcher
                    .open_terminal(dir, None)
                    .map_err(|source| DispatchError::Spawn {
                        what: "terminal",
                        source,
                    });
            }
            SystemCommand::FILE_MANAGER => dir.clone(),
            SystemCommand::VAGRANTFILE => dir.join(VAGRANTFILE),
            SystemCommand::MACHINE_CONFIG => {
                let path = machine_config_dir(record);
                if !path.is_dir() {
                    tracing::debug!(path = %path.display(), "machine config directory missing");
                    return Err(DispatchError::MissingMachineConfig { path });
                }
                path
            }
            other => {
                return Err(DispatchError::InvalidCommand {
                    command: format!("{other:?}"),
                })
            }
        };

        let uri = file_uri(&path)?;
        tracing::info!(
            machine = machine_id,
            target = target.key().unwrap_or_default(),
            %uri,
            "opening with default handler"
        );
        self.launcher
            .launch_default_handler(&uri)
            .map_err(|source| DispatchError::Spawn {
                what: "default handler",
                source,
            })
    }

    /// Runs `vagrant global-status` and captures its output.
    ///
    /// Never fails: a launch error is reported through the returned payload.
    pub async fn global_status(&self) -> GlobalStatus {
        let output = tokio::process::Command::new(&self.vagrant)
            .args(["global-status", "--prune"])
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(out) => GlobalStatus {
                exit_code: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            },
            Err(e) => {
                tracing::warn!(program = %self.vagrant, "global-status failed to start: {e}");
                GlobalStatus {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                }
            }
        }
    }

    fn validate(&self, machine_id: &str) -> Result<&MachineRecord, DispatchError> {
        let Some(record) = self.snapshot.get(machine_id) else {
            tracing::debug!(machine = machine_id, "not in machine index");
            return Err(DispatchError::InvalidMachine {
                id: machine_id.to_string(),
            });
        };
        let dir = &record.vagrantfile_path;
        if !dir.is_dir() {
            tracing::debug!(machine = machine_id, path = %dir.display(), "machine directory missing");
            return Err(DispatchError::InvalidPath { path: dir.clone() });
        }
        if !dir.join(VAGRANTFILE).is_file() {
            tracing::debug!(machine = machine_id, path = %dir.display(), "Vagrantfile missing");
            return Err(DispatchError::MissingVagrantfile { path: dir.clone() });
        }
        Ok(record)
    }

    fn locate_vagrant(&self) -> Result<PathBuf, DispatchError> {
        self.launcher
            .locate(&self.vagrant)
            .ok_or_else(|| DispatchError::VagrantNotFound {
                program: self.vagrant.clone(),
            })
    }
}

/// `<dir>/.vagrant/machines/<name>/<provider>`.
pub fn machine_config_dir(record: &MachineRecord) -> PathBuf {
    record
        .vagrantfile_path
        .join(".vagrant")
        .join("machines")
        .join(&record.name)
        .join(&record.provider)
}

fn file_uri(path: &Path) -> Result<String, DispatchError> {
    url::Url::from_file_path(path)
        .map(String::from)
        .map_err(|()| DispatchError::InvalidPath {
            path: path.to_path_buf(),
        })
}

/// Quotes `s` for a POSIX shell unless it is obviously safe.
fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Shell line run in the terminal for a single-bit `command`.
pub fn build_command_line(
    vagrant: &Path,
    record: &MachineRecord,
    command: VagrantCommand,
    post_action: PostTerminalAction,
) -> String {
    let program = shell_quote(&vagrant.to_string_lossy());
    let steps: Vec<String> = command
        .invocations()
        .iter()
        .map(|args| {
            let mut parts = vec![program.clone()];
            parts.extend(args.iter().map(|a| a.to_string()));
            if !record.name.is_empty() {
                parts.push(shell_quote(&record.name));
            }
            parts.join(" ")
        })
        .collect();

    let mut line = steps.join(" && ");
    if post_action.contains(PostTerminalAction::PAUSE) {
        line.push_str("; ");
        line.push_str(PAUSE_FRAGMENT);
    }
    if post_action.contains(PostTerminalAction::EXIT) {
        line.push_str("; ");
        line.push_str(EXIT_FRAGMENT);
    }
    line
}
