//! `srcfetch.toml` parsing
//!
//! A manifest has one `[settings]` table and any number of `[[package]]`
//! tables. Relative paths in it resolve against the manifest's directory.

use crate::acquire::download::url_filename;
use crate::acquire::fetcher::{FetchSource, default_git_key};
use crate::acquire::hash::Checksum;
use crate::acquire::verify::VerifyMode;
use crate::build::patch::PatchPolicy;
use crate::error::{Error, IoContext, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub const DEFAULT_MANIFEST: &str = "srcfetch.toml";

/// Parsed manifest
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub settings: Settings,

    #[serde(default, rename = "package")]
    pub packages: Vec<PackageSpec>,

    /// Directory relative paths resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// The `[settings]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub cache_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub prefix: Option<PathBuf>,
    pub target: Option<String>,
    /// Parallel jobs for builds; 0 means one per CPU
    pub jobs: usize,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub patch_strip: u32,
    pub patch_policy: PatchPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: None,
            work_dir: None,
            prefix: None,
            target: None,
            jobs: 0,
            retry_attempts: 100,
            retry_delay_secs: 10,
            patch_strip: 1,
            patch_policy: PatchPolicy::BestEffort,
        }
    }
}

/// One `[[package]]` table
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,

    /// Plain download URL
    pub url: Option<String>,
    /// Repository URL, used together with `revision`
    pub git: Option<String>,
    pub revision: Option<String>,

    /// Identity key override
    pub file: Option<String>,
    pub checksum: Option<Checksum>,
    #[serde(default)]
    pub verify: VerifyMode,

    /// Patch directory
    pub patches: Option<PathBuf>,

    /// Build in `<pkg_dir>/build` instead of the source tree
    #[serde(default)]
    pub out_of_tree: bool,

    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub uninstall: Vec<String>,
    #[serde(default)]
    pub diagnostic_logs: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl PackageSpec {
    /// `<name>-<version>`, the package directory name
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    pub fn source(&self) -> Result<FetchSource> {
        match (&self.url, &self.git) {
            (Some(url), None) => Ok(FetchSource::Url(url.clone())),
            (None, Some(git)) => Ok(FetchSource::Git {
                url: git.clone(),
                revision: self
                    .revision
                    .clone()
                    .ok_or(Error::MissingParameter("revision"))?,
            }),
            _ => Err(Error::InvalidArgument {
                what: "package source (set exactly one of url or git)",
                value: self.name.clone(),
            }),
        }
    }

    /// Identity key of the cached source: `file` when given, otherwise
    /// derived from the source.
    pub fn key(&self) -> Result<String> {
        if let Some(file) = &self.file {
            return Ok(file.clone());
        }
        match self.source()? {
            FetchSource::Url(url) => Ok(url_filename(&url)),
            FetchSource::Git { revision, .. } => {
                Ok(default_git_key(&self.name, &self.version, &revision))
            }
        }
    }
}

impl Manifest {
    /// Read and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).io_context(|| format!("cannot read {}", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&text, base_dir).map_err(|e| match e {
            Error::Manifest { reason, .. } => Error::Manifest {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate manifest text.
    pub fn parse(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut manifest: Manifest = toml::from_str(text).map_err(|e| Error::Manifest {
            path: PathBuf::from(DEFAULT_MANIFEST),
            reason: e.to_string(),
        })?;
        manifest.base_dir = base_dir.into();
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::Manifest {
            path: PathBuf::from(DEFAULT_MANIFEST),
            reason,
        };

        let mut seen = HashSet::new();
        for pkg in &self.packages {
            for (field, value) in [("name", &pkg.name), ("version", &pkg.version)] {
                if value.is_empty() || value.contains(['/', '\\']) {
                    return Err(invalid(format!(
                        "package {:?}: invalid {} {:?}",
                        pkg.name, field, value
                    )));
                }
            }
            if !seen.insert(pkg.name.as_str()) {
                return Err(invalid(format!("duplicate package {:?}", pkg.name)));
            }
            match (&pkg.url, &pkg.git, &pkg.revision) {
                (Some(_), Some(_), _) => {
                    return Err(invalid(format!(
                        "package {:?}: url and git are mutually exclusive",
                        pkg.name
                    )));
                }
                (None, None, _) => {
                    return Err(invalid(format!(
                        "package {:?}: needs url or git",
                        pkg.name
                    )));
                }
                (None, Some(_), None) => {
                    return Err(invalid(format!(
                        "package {:?}: git requires revision",
                        pkg.name
                    )));
                }
                _ => {}
            }
            let key = pkg.key()?;
            if key.is_empty() {
                return Err(invalid(format!(
                    "package {:?}: cannot derive a file name from the url; set `file`",
                    pkg.name
                )));
            }
        }
        Ok(())
    }

    pub fn package(&self, name: &str) -> Option<&PackageSpec> {
        self.packages.iter().find(|p| p.name == name)
    }

    /// Packages named in `names` in the given order, or all when empty.
    pub fn select(&self, names: &[String]) -> Result<Vec<&PackageSpec>> {
        if names.is_empty() {
            return Ok(self.packages.iter().collect());
        }
        names
            .iter()
            .map(|n| {
                self.package(n).ok_or_else(|| Error::InvalidArgument {
                    what: "package name (not in manifest)",
                    value: n.clone(),
                })
            })
            .collect()
    }

    /// Resolve a manifest path: `~/` expands to the home directory,
    /// relative paths are taken from the manifest directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if let Ok(rest) = path.strip_prefix("~")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Cache directory: setting, else the user cache dir.
    pub fn cache_dir(&self) -> PathBuf {
        match &self.settings.cache_dir {
            Some(dir) => self.resolve(dir),
            None => dirs::cache_dir()
                .map(|d| d.join("srcfetch"))
                .unwrap_or_else(|| self.base_dir.join(".srcfetch-cache")),
        }
    }

    pub fn work_dir(&self) -> PathBuf {
        let dir = self
            .settings
            .work_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("work"));
        self.resolve(&dir)
    }

    pub fn patch_dir(&self, pkg: &PackageSpec) -> Option<PathBuf> {
        pkg.patches.as_deref().map(|p| self.resolve(p))
    }
}
