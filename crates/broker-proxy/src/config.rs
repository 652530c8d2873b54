//! Proxy settings as stored in `config.toml` under `[proxy]`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::BusLayout;

/// File name of the PID file inside the root directory.
pub const PID_FILE_NAME: &str = "broker-proxy.pid";

/// Which host-side path the container's bus socket appears under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutKind {
    /// `<root>/runtime/bus`
    #[default]
    RuntimeDir,
    /// `<root>/run/user/<uid>/bus`
    UserRuntime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Root directory of the container installation.
    /// Supports ~ and environment variables. Default: $XDG_DATA_HOME/intuneme
    pub root: Option<String>,
    /// Bus socket layout under the root.
    pub layout: LayoutKind,
    /// UID used by the `user-runtime` layout. Default: the invoking user.
    pub uid: Option<u32>,
    /// PID file path. Default: <root>/broker-proxy.pid
    pub pid_file: Option<String>,
    /// Give up on a forwarded call after this many seconds.
    /// Unset means wait as long as the container broker takes.
    pub call_timeout_secs: Option<u64>,
    /// How many times to check for the container bus socket before dialing.
    pub socket_wait_retries: u32,
    /// Delay between socket checks, in milliseconds.
    pub socket_wait_interval_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            root: None,
            layout: LayoutKind::RuntimeDir,
            uid: None,
            pid_file: None,
            call_timeout_secs: None,
            socket_wait_retries: 30,
            socket_wait_interval_ms: 1000,
        }
    }
}

impl ProxyConfig {
    /// Resolve the layout, filling in `default_uid` when none is configured.
    pub fn bus_layout(&self, default_uid: u32) -> BusLayout {
        match self.layout {
            LayoutKind::RuntimeDir => BusLayout::RuntimeDir,
            LayoutKind::UserRuntime => BusLayout::UserRuntime {
                uid: self.uid.unwrap_or(default_uid),
            },
        }
    }

    /// PID file for `root`, unless overridden.
    pub fn pid_file_path(&self, root: &Path) -> PathBuf {
        match self.pid_file {
            Some(ref path) => PathBuf::from(path),
            None => root.join(PID_FILE_NAME),
        }
    }

    /// Per-call timeout, `None` if unset or zero.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn socket_wait_interval(&self) -> Duration {
        Duration::from_millis(self.socket_wait_interval_ms)
    }
}
