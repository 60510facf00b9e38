/// Canonical file paths used by the daemon.
///
///   - `$VAGRANT_HOME/data/machine-index/index`  Written by Vagrant, read here.
///   - `<config dir>/vagrant-monitor/config.toml` Display settings and daemon options.
///   - `<config dir>/vagrant-monitor/status.toml` Written here, read by the panel UI.
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "vagrant-monitor";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";
const VAGRANT_HOME_DIR: &str = ".vagrant.d";

/// `$VAGRANT_HOME`, defaulting to `~/.vagrant.d`.
pub fn vagrant_home() -> PathBuf {
    vagrant_home_from(std::env::var_os("VAGRANT_HOME").map(PathBuf::from), dirs::home_dir())
}

fn vagrant_home_from(env: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    match env {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => home.unwrap_or_default().join(VAGRANT_HOME_DIR),
    }
}

pub fn machine_index_path() -> PathBuf {
    machine_index_in(&vagrant_home())
}

fn machine_index_in(vagrant_home: &Path) -> PathBuf {
    vagrant_home.join("data").join("machine-index").join("index")
}

/// Returns the application directory under the user's config dir.
pub fn app_data_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_default()
        .join(APP_DIR_NAME)
}

pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

/// The status file always sits next to the config file in use.
pub fn status_file_path_for(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map(|p| p.join(STATUS_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(STATUS_FILE_NAME))
}
