use std::path::{Path, PathBuf};
use std::time::Duration;

use mirrorsync_core::config::state_dir_at;

/// Quiet period after the last config change before jobs are reloaded.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn state_root(home: &Path) -> PathBuf {
    state_dir_at(home)
}

pub fn socket_path(home: &Path) -> PathBuf {
    state_root(home).join(DAEMON_SOCKET)
}

pub fn history_dir(home: &Path) -> PathBuf {
    state_root(home).join("history")
}
