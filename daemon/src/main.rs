mod bus;
mod command;
mod config;
mod daemon;
mod detector;
mod dispatcher;
mod event;
mod index;
mod launcher;
mod logging;
mod monitor;
mod overlay;
mod paths;
mod settings;
mod status;
mod watch;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use crate::command::{PostTerminalAction, SystemCommand, VagrantCommand};
use crate::daemon::Daemon;
use crate::dispatcher::DispatchError;
use crate::event::{ChangeEvent, Event};
use crate::launcher::SystemLauncher;

#[derive(Parser)]
#[command(
    name = "vagrant-monitor",
    version,
    about = "Watches the Vagrant machine index and runs machine commands"
)]
struct Cli {
    /// Config file [default: <config dir>/vagrant-monitor/config.toml]
    #[arg(long, global = true, env = "VAGRANT_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Machine index to watch instead of `$VAGRANT_HOME/data/machine-index/index`
    #[arg(long, global = true)]
    index: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the machine index and config file until interrupted (default)
    Watch,
    /// Print known machines in display order
    List,
    /// Run a vagrant command for a machine in a new terminal
    Exec {
        machine: String,
        /// up, up-provision, up-ssh, up-rdp, provision, ssh, rdp, resume, suspend, halt,
        /// destroy, destroy-force
        command: String,
        /// none, pause, exit or both [default: the machine's post-terminal-action]
        #[arg(long)]
        post_action: Option<String>,
    },
    /// Open a terminal, file manager, Vagrantfile or machine config for a machine
    Open {
        machine: String,
        /// terminal, file-manager, vagrantfile or machine-config
        target: String,
    },
    /// Run `vagrant global-status --prune` and print the result
    GlobalStatus,
    /// Set a global display default, or a machine override with --machine
    Set {
        #[arg(long)]
        machine: Option<String>,
        key: String,
        value: String,
    },
    /// Restore a global default, or drop a machine override with --machine
    Reset {
        #[arg(long)]
        machine: Option<String>,
        key: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = cli.config.unwrap_or_else(paths::config_file_path);
    let (config, load_error) = daemon::load_config(&config_path);
    logging::init(&config.daemon.log_level);
    if let Some(e) = load_error {
        tracing::warn!("[config] Error (using defaults): {e:#}");
    }

    let launcher = SystemLauncher::new(config.daemon.terminal.clone());
    let daemon = Daemon::new(config_path, config, cli.index, launcher);

    match run(cli.command.unwrap_or(Command::Watch), daemon).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<DispatchError>() {
                Some(d) if d.is_validation() => eprintln!("{}: {d}", d.title()),
                Some(d) => eprintln!("{}: {e:#}", d.title()),
                None => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

/// One line per event on stdout, for consumers reading the daemon's output.
fn print_event(event: &Event) {
    match event {
        Event::Machine(change) => match change {
            ChangeEvent::Added { id, record } => println!("added {id} {}", record.state),
            ChangeEvent::Removed { id, .. } => println!("removed {id}"),
            ChangeEvent::StateChanged {
                id,
                old_state,
                new_state,
                ..
            } => println!("state-changed {id} {old_state} {new_state}"),
        },
        Event::Config(change) => {
            let names: Vec<_> = change.properties.iter().map(|p| p.name()).collect();
            println!("config-changed {} {}", change.machine_id, names.join(","));
        }
    }
}

async fn run(command: Command, mut daemon: Daemon<SystemLauncher>) -> Result<()> {
    match command {
        Command::Watch => {
            println!("vagrant-monitor v{} started", env!("CARGO_PKG_VERSION"));
            daemon.subscribe(print_event);
            daemon
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Cannot listen for Ctrl+C: {e}");
                        std::future::pending::<()>().await;
                    }
                })
                .await
        }

        Command::List => {
            let index = daemon.index_path().display().to_string();
            let machines = daemon.machines();
            if machines.is_empty() {
                println!("No machines in {index}");
            }
            for m in machines {
                println!(
                    "{:<24} {:<12} {:<10} {}  {}",
                    m.label,
                    m.state.as_deref().unwrap_or("-"),
                    m.provider,
                    m.path.as_deref().unwrap_or(""),
                    m.id
                );
            }
            Ok(())
        }

        Command::Exec {
            machine,
            command,
            post_action,
        } => {
            let command = VagrantCommand::from_key(&command).ok_or_else(|| {
                anyhow!(
                    "unknown vagrant command '{command}' (expected one of: {})",
                    VagrantCommand::all().names().join(", ")
                )
            })?;
            let post_action = post_action
                .map(|name| {
                    PostTerminalAction::from_key(&name)
                        .ok_or_else(|| anyhow!("unknown post action '{name}'"))
                })
                .transpose()?;
            daemon.execute(&machine, command, post_action)?;
            Ok(())
        }

        Command::Open { machine, target } => {
            let target = SystemCommand::from_key(&target)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    anyhow!(
                        "unknown target '{target}' (expected one of: {})",
                        SystemCommand::all().names().join(", ")
                    )
                })?;
            daemon.open(&machine, target)?;
            Ok(())
        }

        Command::GlobalStatus => {
            let status = daemon.global_status().await;
            let entries = status.entries();
            if entries.is_empty() {
                print!("{}", status.stdout);
            }
            for e in &entries {
                println!(
                    "{:<8} {:<16} {:<12} {:<10} {}",
                    e.id, e.name, e.provider, e.state, e.directory
                );
            }
            if !status.success() {
                eprint!("{}", status.stderr);
                match status.exit_code {
                    Some(code) => bail!("vagrant global-status exited with status {code}"),
                    None => bail!("vagrant global-status did not run to completion"),
                }
            }
            Ok(())
        }

        Command::Set {
            machine,
            key,
            value,
        } => {
            let changes = daemon.set_setting(machine.as_deref(), &key, &value)?;
            println!("{} machine(s) affected", changes.len());
            Ok(())
        }

        Command::Reset { machine, key } => {
            let changes = daemon.reset_setting(machine.as_deref(), &key)?;
            println!("{} machine(s) affected", changes.len());
            Ok(())
        }
    }
}
