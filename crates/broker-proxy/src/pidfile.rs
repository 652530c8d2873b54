//! PID-file lease for the single proxy instance.
//!
//! The proxy runs in the foreground and is started and stopped by unrelated
//! tooling (D-Bus activation, `broker-proxy run`, `broker-proxy stop`). The PID
//! file is the only coordination primitive between them; liveness is checked
//! by sending signal 0 to the recorded PID.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use rustix::process::{Pid, Signal, kill_process, test_kill_process};
use serde::Serialize;

/// Interval between liveness checks while waiting for a stopped holder.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long `release` waits for the holder to exit before removing the file.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A PID file written by the current process.
#[derive(Debug)]
pub struct SingletonLease {
    path: PathBuf,
    pid: u32,
}

impl SingletonLease {
    /// Write the current PID to `path`.
    ///
    /// Does not look for an existing holder; call [`probe`] first when
    /// exclusivity matters.
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pid = std::process::id();
        fs::write(&path, pid.to_string())?;
        debug!("wrote pid {} to {}", pid, path.display());
        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove the PID file on clean exit.
    ///
    /// The file is left alone if another process has since overwritten it.
    pub fn remove(self) {
        match read_pid(&self.path) {
            Some(pid) if pid != self.pid => {
                debug!(
                    "pid file {} now belongs to pid {}, leaving it",
                    self.path.display(),
                    pid
                );
            }
            _ => {
                if let Err(e) = fs::remove_file(&self.path) {
                    debug!("removing pid file {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

/// Result of probing a PID file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Probe {
    /// PID recorded in the file, or 0 if it could not be read.
    pub pid: u32,
    /// Whether that process accepted signal 0.
    pub alive: bool,
}

/// Read the PID file and check whether the recorded process is alive.
///
/// Returns `pid: 0, alive: false` when the file is missing or unparsable. A
/// parsed PID is returned even when the process is gone.
pub fn probe(path: impl AsRef<Path>) -> Probe {
    match read_pid(path.as_ref()) {
        Some(pid) => Probe {
            pid,
            alive: is_alive(pid),
        },
        None => Probe {
            pid: 0,
            alive: false,
        },
    }
}

/// Stop the process recorded in `path` and remove the file.
///
/// Sends SIGINT, waits up to [`STOP_TIMEOUT`] for the process to go away and
/// then removes the file whether or not it did. Every failure is ignored:
/// stopping something that is not running is not an error.
pub fn release(path: impl AsRef<Path>) {
    let path = path.as_ref();
    if !path.exists() {
        debug!("no pid file at {}", path.display());
        return;
    }

    match read_pid(path) {
        Some(pid) => interrupt_and_wait(pid),
        None => debug!("unreadable pid file at {}, removing it", path.display()),
    }

    if let Err(e) = fs::remove_file(path) {
        debug!("removing pid file {}: {}", path.display(), e);
    }
}

fn interrupt_and_wait(pid: u32) {
    if let Some(target) = to_pid(pid) {
        match kill_process(target, Signal::INT) {
            Ok(()) => {
                info!("sent SIGINT to broker proxy (pid {pid})");
                if !wait_for_exit(pid, STOP_TIMEOUT, STOP_POLL_INTERVAL) {
                    debug!("pid {pid} still alive after {STOP_TIMEOUT:?}");
                }
            }
            Err(e) => debug!("signalling pid {pid}: {e}"),
        }
    }
}

fn wait_for_exit(pid: u32, timeout: Duration, interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        thread::sleep(interval);
    }
    !is_alive(pid)
}

fn read_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().and_then(Pid::from_raw)
}

fn is_alive(pid: u32) -> bool {
    to_pid(pid).is_some_and(|target| test_kill_process(target).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    /// A PID far above the default `pid_max`.
    const DEAD_PID: u32 = 999_999_999;

    #[test]
    fn test_acquire_then_probe_reports_current_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker-proxy.pid");

        let lease = SingletonLease::acquire(&path).unwrap();
        assert_eq!(lease.pid(), std::process::id());
        assert_eq!(fs::read_to_string(&path).unwrap(), std::process::id().to_string());

        let result = probe(&path);
        assert_eq!(result.pid, std::process::id());
        assert!(result.alive);
    }

    #[test]
    fn test_acquire_fails_on_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("broker-proxy.pid");
        assert!(SingletonLease::acquire(&path).is_err());
    }

    #[test]
    fn test_probe_missing_file() {
        let result = probe("/nonexistent/path/test.pid");
        assert_eq!(result, Probe { pid: 0, alive: false });
    }

    #[test]
    fn test_probe_garbage_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pid");
        fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(probe(&path), Probe { pid: 0, alive: false });

        fs::write(&path, "-42").unwrap();
        assert_eq!(probe(&path), Probe { pid: 0, alive: false });
    }

    #[test]
    fn test_probe_dead_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead.pid");
        fs::write(&path, DEAD_PID.to_string()).unwrap();

        let result = probe(&path);
        assert_eq!(result.pid, DEAD_PID);
        assert!(!result.alive);
    }

    #[test]
    fn test_probe_tolerates_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("newline.pid");
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        assert!(probe(&path).alive);
    }

    #[test]
    fn test_release_missing_file_is_noop() {
        release("/nonexistent/path/test.pid");
    }

    #[test]
    fn test_release_stale_file_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.pid");
        fs::write(&path, DEAD_PID.to_string()).unwrap();

        release(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_release_garbage_file_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.pid");
        fs::write(&path, "not-a-pid").unwrap();

        release(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_release_stops_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("child.pid");

        let mut child = Command::new("sleep")
            .arg("60")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        fs::write(&path, child.id().to_string()).unwrap();
        assert!(probe(&path).alive);

        // Reap the child in the background so it does not linger as a zombie,
        // which would still answer signal 0.
        let reaper = thread::spawn(move || child.wait());

        release(&path);
        assert!(!path.exists());

        let status = reaper.join().unwrap().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_lease_remove_deletes_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("own.pid");

        let lease = SingletonLease::acquire(&path).unwrap();
        lease.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_lease_remove_keeps_file_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.pid");

        let lease = SingletonLease::acquire(&path).unwrap();
        fs::write(&path, DEAD_PID.to_string()).unwrap();
        lease.remove();
        assert!(path.exists());
    }
}
