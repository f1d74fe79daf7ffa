//! Persisted per-package pipeline state
//!
//! Each package directory holds a `status.json` recording how far the
//! pipeline got. It is rewritten (temp file + rename) after every
//! transition, so a crash leaves either the old or the new record.

use crate::core::output;
use crate::error::{Error, IoContext, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const STATUS_FILE: &str = "status.json";

/// Sentinel written once a package is installed
pub const INSTALLED_MARKER: &str = "__package_installed";

/// Pipeline stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageState {
    NotFetched,
    Fetched,
    Verified,
    Unpacked,
    Patched,
    Built,
    Installed,
}

impl PackageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFetched => "not-fetched",
            Self::Fetched => "fetched",
            Self::Verified => "verified",
            Self::Unpacked => "unpacked",
            Self::Patched => "patched",
            Self::Built => "built",
            Self::Installed => "installed",
        }
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The status record of one package directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatus {
    pub name: String,
    pub version: String,
    /// Identity key of the cached source
    pub key: String,
    pub state: PackageState,
    /// Unix timestamp of the last transition
    pub updated_at: u64,
}

impl PackageStatus {
    pub fn new(name: &str, version: &str, key: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            key: key.to_string(),
            state: PackageState::NotFetched,
            updated_at: now(),
        }
    }

    /// Current state of `pkg_dir` for the given package identity.
    ///
    /// A record written for another version or source is discarded. A tree
    /// that only carries the installed marker counts as installed, and an
    /// `Installed` record whose marker was deleted starts over.
    pub fn read(pkg_dir: &Path, name: &str, version: &str, key: &str) -> Result<Self> {
        if let Some(record) = Self::load(pkg_dir)? {
            if record.name == name && record.version == version && record.key == key {
                if record.state == PackageState::Installed
                    && !pkg_dir.join(INSTALLED_MARKER).exists()
                {
                    debug!(package = name, "installed marker removed, starting over");
                    return Ok(Self::new(name, version, key));
                }
                return Ok(record);
            }
            debug!(
                recorded_version = %record.version,
                recorded_key = %record.key,
                "status record belongs to another source, starting over"
            );
            return Ok(Self::new(name, version, key));
        }

        let mut status = Self::new(name, version, key);
        if pkg_dir.join(INSTALLED_MARKER).exists() {
            status.state = PackageState::Installed;
        }
        Ok(status)
    }

    /// Load the raw record, if any. An unreadable record is ignored with a
    /// warning.
    pub fn load(pkg_dir: &Path) -> Result<Option<Self>> {
        let path = pkg_dir.join(STATUS_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(format!("cannot read {}", path.display()), e)),
        };
        match serde_json::from_str(&text) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring corrupt status record");
                output::warning(&format!("ignoring corrupt {}", path.display()));
                Ok(None)
            }
        }
    }

    /// Write the record atomically.
    pub fn save(&self, pkg_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(pkg_dir)
            .io_context(|| format!("cannot create {}", pkg_dir.display()))?;
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::Manifest {
            path: pkg_dir.join(STATUS_FILE),
            reason: e.to_string(),
        })?;

        let mut temp = tempfile::Builder::new()
            .prefix(".status-")
            .tempfile_in(pkg_dir)
            .io_context(|| format!("cannot create temp file in {}", pkg_dir.display()))?;
        temp.write_all(json.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .io_context(|| "cannot write status record")?;
        temp.persist(pkg_dir.join(STATUS_FILE))
            .map_err(|e| Error::io("cannot replace status record", e.error))?;
        Ok(())
    }

    /// Move to `state` and persist. Reaching `Installed` also drops the marker.
    pub fn advance(&mut self, state: PackageState, pkg_dir: &Path) -> Result<()> {
        debug!(package = %self.name, from = %self.state, to = %state, "transition");
        self.state = state;
        self.updated_at = now();
        self.save(pkg_dir)?;
        if state == PackageState::Installed {
            std::fs::write(pkg_dir.join(INSTALLED_MARKER), b"")
                .io_context(|| "cannot write installed marker")?;
        }
        Ok(())
    }

    /// Remove the record and the installed marker.
    pub fn clear(pkg_dir: &Path) -> Result<()> {
        for name in [STATUS_FILE, INSTALLED_MARKER] {
            let path = pkg_dir.join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(format!("cannot remove {}", path.display()), e)),
            }
        }
        Ok(())
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
