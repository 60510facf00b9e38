/// Process-spawning collaborator used by the dispatcher.
///
/// The trait is the seam between deciding *what* to run and actually starting
/// processes, so the dispatcher can be exercised without a desktop session.
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const DEFAULT_TERMINAL: &[&str] = &["x-terminal-emulator", "-e"];

pub trait Launcher {
    /// Resolves `program` on `PATH` (or checks it, if already a path).
    fn locate(&self, program: &str) -> Option<PathBuf>;

    /// Opens a terminal in `cwd`, running `script` through `sh` first when given.
    /// The session drops into the user's shell afterwards unless the script exits.
    fn open_terminal(&self, cwd: &Path, script: Option<&str>) -> io::Result<()>;

    /// Hands `uri` to the desktop's default handler for it.
    fn launch_default_handler(&self, uri: &str) -> io::Result<()>;
}

/// Launcher that starts real processes, fire-and-forget.
#[derive(Debug, Clone)]
pub struct SystemLauncher {
    /// Terminal program plus the flag that introduces the command to run.
    terminal: Vec<String>,
}

impl SystemLauncher {
    pub fn new(terminal: Vec<String>) -> Self {
        let terminal = if terminal.is_empty() {
            DEFAULT_TERMINAL.iter().map(|s| s.to_string()).collect()
        } else {
            terminal
        };
        Self { terminal }
    }

    /// Full argv used to run `script` inside the terminal.
    pub fn terminal_argv(&self, script: Option<&str>) -> Vec<String> {
        let body = match script {
            Some(s) => format!("{s}; exec \"${{SHELL:-sh}}\""),
            None => "exec \"${SHELL:-sh}\"".to_string(),
        };
        let mut argv = self.terminal.clone();
        argv.extend(["sh".to_string(), "-c".to_string(), body]);
        argv
    }
}

impl Default for SystemLauncher {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn spawn_detached(argv: &[String], cwd: Option<&Path>) -> io::Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let child = cmd.spawn()?;
    tracing::debug!(pid = child.id(), %program, "spawned");
    Ok(())
}

#[cfg(target_os = "macos")]
const DEFAULT_HANDLER: &str = "open";
#[cfg(not(target_os = "macos"))]
const DEFAULT_HANDLER: &str = "xdg-open";

impl Launcher for SystemLauncher {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    fn open_terminal(&self, cwd: &Path, script: Option<&str>) -> io::Result<()> {
        spawn_detached(&self.terminal_argv(script), Some(cwd))
    }

    fn launch_default_handler(&self, uri: &str) -> io::Result<()> {
        spawn_detached(&[DEFAULT_HANDLER.to_string(), uri.to_string()], None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_terminal_falls_back_to_default() {
        let l = SystemLauncher::new(Vec::new());
        assert_eq!(l.terminal_argv(None)[..2], ["x-terminal-emulator", "-e"]);
    }

    #[test]
    fn script_runs_through_sh_then_keeps_shell() {
        let l = SystemLauncher::new(vec!["foot".into()]);
        let argv = l.terminal_argv(Some("vagrant up"));
        assert_eq!(argv[..3], ["foot", "sh", "-c"]);
        assert_eq!(argv[3], "vagrant up; exec \"${SHELL:-sh}\"");
    }

    #[test]
    fn plain_terminal_just_starts_a_shell() {
        let l = SystemLauncher::new(vec!["foot".into()]);
        assert_eq!(l.terminal_argv(None).last().unwrap(), "exec \"${SHELL:-sh}\"");
    }

    #[test]
    fn spawn_rejects_empty_argv() {
        let err = spawn_detached(&[], None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn spawn_reports_missing_program() {
        let argv = vec!["definitely-not-a-real-program-4f1c".to_string()];
        assert!(spawn_detached(&argv, None).is_err());
    }

    #[test]
    fn locate_misses_unknown_program() {
        assert!(SystemLauncher::default().locate("definitely-not-a-real-program-4f1c").is_none());
    }
}
