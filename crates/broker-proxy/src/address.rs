//! Container bus address resolution.
//!
//! The container's session bus socket is reached through the host filesystem.
//! Everything here is a pure path computation except [`wait_for_socket`], the
//! bounded readiness poll callers run before dialing.

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

/// Name of the bus socket inside the runtime directory.
const BUS_SOCKET: &str = "bus";

/// Where the container's session bus socket shows up on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusLayout {
    /// `<root>/runtime/bus`. The host directory `<root>/runtime` is
    /// bind-mounted into the container as `/run/user/<uid>`.
    #[default]
    RuntimeDir,
    /// `<root>/run/user/<uid>/bus`, reached through the container's root
    /// filesystem.
    UserRuntime { uid: u32 },
}

/// Host-side directory bind-mounted as the container user's runtime dir.
pub fn runtime_dir(root: &Path) -> PathBuf {
    root.join("runtime")
}

/// The `(host, container)` bind mount pair for the runtime directory.
pub fn runtime_bind_mount(root: &Path, uid: u32) -> (PathBuf, PathBuf) {
    (runtime_dir(root), PathBuf::from(format!("/run/user/{uid}")))
}

/// Host-side path of the container's session bus socket.
pub fn session_bus_socket_path(root: &Path, layout: BusLayout) -> PathBuf {
    match layout {
        BusLayout::RuntimeDir => runtime_dir(root).join(BUS_SOCKET),
        BusLayout::UserRuntime { uid } => root
            .join("run")
            .join("user")
            .join(uid.to_string())
            .join(BUS_SOCKET),
    }
}

/// D-Bus address (`unix:path=...`) of the container's session bus.
pub fn container_bus_address(root: &Path, layout: BusLayout) -> String {
    let socket = session_bus_socket_path(root, layout);
    format!("unix:path={}", escape_address_value(socket.as_os_str().as_bytes()))
}

/// Escape a value for use inside a D-Bus address.
///
/// Bytes outside `[-0-9A-Za-z_/.\*]` are written as `%XX`.
fn escape_address_value(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    for &byte in value {
        match byte {
            b'-' | b'_' | b'/' | b'.' | b'\\' | b'*' => out.push(byte as char),
            b if b.is_ascii_alphanumeric() => out.push(b as char),
            b => out.push_str(&format!("%{b:02x}")),
        }
    }
    out
}

/// Poll until `path` exists, up to `retries` checks spaced `interval` apart.
///
/// Returns whether the socket appeared. The container's bus comes up some
/// time after the container itself, so callers run this before dialing.
pub async fn wait_for_socket(path: &Path, retries: u32, interval: Duration) -> bool {
    for attempt in 0..retries {
        if path.exists() {
            return true;
        }
        debug!(
            "waiting for container bus socket {} ({}/{})",
            path.display(),
            attempt + 1,
            retries
        );
        tokio::time::sleep(interval).await;
    }
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_dir_layout() {
        let root = Path::new("/tmp/intuneme");
        assert_eq!(runtime_dir(root), PathBuf::from("/tmp/intuneme/runtime"));
        assert_eq!(
            session_bus_socket_path(root, BusLayout::RuntimeDir),
            PathBuf::from("/tmp/intuneme/runtime/bus")
        );
        assert_eq!(
            container_bus_address(root, BusLayout::RuntimeDir),
            "unix:path=/tmp/intuneme/runtime/bus"
        );
    }

    #[test]
    fn test_user_runtime_layout() {
        let root = Path::new("/var/lib/machines/intuneme");
        assert_eq!(
            container_bus_address(root, BusLayout::UserRuntime { uid: 1000 }),
            "unix:path=/var/lib/machines/intuneme/run/user/1000/bus"
        );

        let other = container_bus_address(Path::new("/tmp/rootfs"), BusLayout::UserRuntime { uid: 5001 });
        assert!(other.starts_with("unix:path="));
        assert!(other.ends_with("/tmp/rootfs/run/user/5001/bus"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let root = Path::new("/home/alice/.local/share/intuneme");
        for layout in [BusLayout::RuntimeDir, BusLayout::UserRuntime { uid: 42 }] {
            let first = container_bus_address(root, layout);
            let second = container_bus_address(root, layout);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_address_escapes_special_bytes() {
        let addr = container_bus_address(Path::new("/tmp/my root"), BusLayout::RuntimeDir);
        assert_eq!(addr, "unix:path=/tmp/my%20root/runtime/bus");

        let raw = std::ffi::OsStr::from_bytes(b"/tmp/r\xff");
        let addr = container_bus_address(Path::new(raw), BusLayout::RuntimeDir);
        assert_eq!(addr, "unix:path=/tmp/r%ff/runtime/bus");

        let addr = container_bus_address(Path::new("/tmp/a,b=c"), BusLayout::RuntimeDir);
        assert_eq!(addr, "unix:path=/tmp/a%2cb%3dc/runtime/bus");
    }

    #[test]
    fn test_runtime_bind_mount() {
        let (host, container) = runtime_bind_mount(Path::new("/tmp/intuneme"), 1000);
        assert_eq!(host, PathBuf::from("/tmp/intuneme/runtime"));
        assert_eq!(container, PathBuf::from("/run/user/1000"));
    }

    #[tokio::test]
    async fn test_wait_for_socket_present() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("bus");
        std::fs::write(&socket, b"").unwrap();

        assert!(wait_for_socket(&socket, 3, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_for_socket_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("bus");

        let started = std::time::Instant::now();
        assert!(!wait_for_socket(&socket, 3, Duration::from_millis(20)).await);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_wait_for_socket_appears_later() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("bus");
        let writer = socket.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            std::fs::write(writer, b"").unwrap();
        });

        assert!(wait_for_socket(&socket, 50, Duration::from_millis(10)).await);
    }
}
