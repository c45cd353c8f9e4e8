//! Runtime and state directories for supervised services
//!
//! Every gateway run is namespaced by an identifier derived from the absolute
//! path of its config file, and each service gets its own subdirectory below
//! that. Two gateways started from different config files never share
//! sockets or state.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::io;
use std::path::{Path, PathBuf};

/// Directory name used below the platform base directories
pub const APP_NAME: &str = "devgate";

/// Number of base64 characters kept from the config path digest
const SCOPE_ID_LEN: usize = 11;

/// Platform base directories for ephemeral and durable per-user data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseDirs {
    /// Ephemeral data (sockets, pid files). Cleared on logout/reboot.
    pub runtime: PathBuf,
    /// Durable data (logs, databases).
    pub state: PathBuf,
}

impl BaseDirs {
    pub fn new(runtime: impl Into<PathBuf>, state: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            state: state.into(),
        }
    }

    /// Resolve the current user's platform directories
    pub fn platform() -> Self {
        let runtime = dirs_next::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(runtime.join(APP_NAME), state_base().join(APP_NAME))
    }
}

#[cfg(unix)]
fn state_base() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs_next::home_dir().map(|home| home.join(".local").join("state")))
        .unwrap_or_else(std::env::temp_dir)
}

#[cfg(not(unix))]
fn state_base() -> PathBuf {
    dirs_next::data_local_dir().unwrap_or_else(std::env::temp_dir)
}

/// A (runtime dir, state dir) pair below a namespace subdirectory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryScope {
    base: BaseDirs,
    subdir: PathBuf,
}

impl DirectoryScope {
    pub fn new(base: BaseDirs, subdir: impl Into<PathBuf>) -> Self {
        Self {
            base,
            subdir: subdir.into(),
        }
    }

    /// Scope for a gateway driven by the config file at `path`
    pub fn for_config(path: &Path) -> Self {
        Self::for_config_with_base(path, BaseDirs::platform())
    }

    pub fn for_config_with_base(path: &Path, base: BaseDirs) -> Self {
        Self::new(base, scope_id(&absolute_path(path)))
    }

    /// Namespace this scope further, typically by service name
    pub fn join(&self, name: impl AsRef<Path>) -> Self {
        Self {
            base: self.base.clone(),
            subdir: self.subdir.join(name),
        }
    }

    pub fn subdir(&self) -> &Path {
        &self.subdir
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.base.runtime.join(&self.subdir)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base.state.join(&self.subdir)
    }

    /// Create both directories (and parents) if absent
    pub fn create_all(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.runtime_dir())?;
        std::fs::create_dir_all(self.state_dir())
    }
}

/// Stable identifier for a config path: the first 11 characters of the
/// base64-encoded SHA-1 digest of the path string.
///
/// SHA-1 is used as a fingerprint here, not for any security property.
pub fn scope_id(path: &Path) -> String {
    let digest = Sha1::digest(path.to_string_lossy().as_bytes());
    let mut encoded = STANDARD.encode(digest);
    encoded.truncate(SCOPE_ID_LEN);
    encoded
}

/// Absolute form of `path`, following symlinks when the path exists
fn absolute_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
