//! D-Bus service activation file for the proxy.
//!
//! With the file installed, the host session bus starts `broker-proxy run`
//! the first time an application calls the broker name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

/// Subcommand the activation file launches.
pub const RUN_SUBCOMMAND: &str = "run";

/// Contents of the `.service` file for `bus_name`.
pub fn service_file_content(bus_name: &str, exec_path: &Path) -> String {
    format!(
        "[D-BUS Service]\nName={bus_name}\nExec={} {RUN_SUBCOMMAND}\n",
        exec_path.display()
    )
}

/// `<data_dir>/dbus-1/services/<bus_name>.service`
pub fn service_file_path_in(data_dir: &Path, bus_name: &str) -> PathBuf {
    data_dir
        .join("dbus-1")
        .join("services")
        .join(format!("{bus_name}.service"))
}

/// Per-user location of the activation file, under `$XDG_DATA_HOME`.
pub fn service_file_path(bus_name: &str) -> Option<PathBuf> {
    let data_dir = std::env::var_os("XDG_DATA_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))?;
    Some(service_file_path_in(&data_dir, bus_name))
}

/// Write the activation file, creating parent directories.
pub fn install(path: &Path, bus_name: &str, exec_path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, service_file_content(bus_name, exec_path))?;
    debug!("installed activation file {}", path.display());
    Ok(())
}

/// Remove the activation file. Returns whether a file was removed.
pub fn remove(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
