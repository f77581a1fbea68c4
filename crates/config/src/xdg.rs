//! XDG base directory resolution.
//!
//! No XDG crate is in the dependency stack this implementation inherited, so
//! resolution is done directly against `$XDG_*_HOME` with the conventional
//! `$HOME`-relative fallback, the same way the original Python `get_app_dirs`
//! helper did it.

use std::env;
use std::path::PathBuf;

const APP_NAME: &str = "mkv2cast";

fn home_dir() -> PathBuf {
    env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

fn xdg_dir(var: &str, fallback_relative: &str) -> PathBuf {
    env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(fallback_relative))
}

/// `$XDG_CONFIG_HOME/mkv2cast`, defaulting to `~/.config/mkv2cast`.
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join(APP_NAME)
}

/// `$XDG_STATE_HOME/mkv2cast`, defaulting to `~/.local/state/mkv2cast`.
pub fn state_dir() -> PathBuf {
    xdg_dir("XDG_STATE_HOME", ".local/state").join(APP_NAME)
}

/// `$XDG_CACHE_HOME/mkv2cast`, defaulting to `~/.cache/mkv2cast`.
pub fn cache_dir() -> PathBuf {
    xdg_dir("XDG_CACHE_HOME", ".cache").join(APP_NAME)
}

/// Path of the user config file under `config_dir()`.
pub fn user_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Path of the system-wide config file (not XDG-scoped; fixed per Unix convention).
pub fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/mkv2cast/config.toml")
}

/// Path of the history log under `state_dir()`.
pub fn history_log_path() -> PathBuf {
    state_dir().join("history.jsonl")
}

/// Directory holding per-job log files under `state_dir()`.
pub fn logs_dir() -> PathBuf {
    state_dir().join("logs")
}

/// Directory holding temporary encode outputs under `cache_dir()`.
pub fn tmp_dir() -> PathBuf {
    cache_dir().join("tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_respects_xdg_config_home() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("XDG_CONFIG_HOME", "/tmp/xdgtest");
        assert_eq!(config_dir(), PathBuf::from("/tmp/xdgtest/mkv2cast"));
        env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    fn test_state_dir_falls_back_to_home() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::remove_var("XDG_STATE_HOME");
        env::set_var("HOME", "/tmp/homefallback");
        assert_eq!(
            state_dir(),
            PathBuf::from("/tmp/homefallback/.local/state/mkv2cast")
        );
    }

    use std::sync::Mutex;
    static ENV_MUTEX: Mutex<()> = Mutex::new(());
}
