//! Identity-keyed source cache
//!
//! Every source lives at `cache_dir/<key>`. A fetch is a no-op once that
//! file exists; otherwise a file of the same name already sitting in the
//! target directory is adopted, and only then does anything touch the
//! network. New entries are assembled in temp files inside the cache
//! directory and renamed into place once complete, so the cache only ever
//! holds whole files.

use super::archive::ArchiveBuilder;
use super::download::{HttpClient, url_filename, validate_http_url};
use super::git::{self, validate_git_url};
use super::retry::RetryPolicy;
use crate::build::codec::{ArchiveFormat, Compression};
use crate::core::interrupt::Interrupt;
use crate::core::lock::acquire_lock;
use crate::core::output;
use crate::core::progress::with_spinner;
use crate::error::{Error, IoContext, Result};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

/// Where a source comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    /// Plain HTTP(S) download
    Url(String),
    /// Version-control checkout pinned to a revision
    Git { url: String, revision: String },
}

/// One source to bring into the cache and link into `target_dir`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub source: FetchSource,
    pub key: String,
    pub target_dir: PathBuf,
}

impl FetchRequest {
    /// Download request keyed by the URL's last path segment.
    pub fn url(url: impl Into<String>, target_dir: impl Into<PathBuf>) -> Self {
        let url = url.into();
        Self {
            key: url_filename(&url),
            source: FetchSource::Url(url),
            target_dir: target_dir.into(),
        }
    }

    pub fn git(
        url: impl Into<String>,
        revision: impl Into<String>,
        key: impl Into<String>,
        target_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: FetchSource::Git {
                url: url.into(),
                revision: revision.into(),
            },
            key: key.into(),
            target_dir: target_dir.into(),
        }
    }

    /// Override the identity key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

/// Default identity key of a checkout: `<name>-<version>-<rev[..12]>.tar.xz`.
pub fn default_git_key(name: &str, version: &str, revision: &str) -> String {
    let short: String = revision.chars().take(12).collect();
    format!("{}-{}-{}.tar.xz", name, version, short)
}

/// How the cache entry came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    CacheHit,
    Adopted,
    Downloaded,
    Cloned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub cache_path: PathBuf,
    pub target_path: PathBuf,
    pub outcome: FetchOutcome,
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    cache_dir: PathBuf,
    retry: RetryPolicy,
    interrupt: Interrupt,
    http: HttpClient,
}

impl Fetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            retry: RetryPolicy::NETWORK,
            interrupt: Interrupt::new(),
            http: HttpClient::default(),
        }
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.http = HttpClient::new(connect, read);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key)
    }

    /// Make `cache_dir/<key>` exist and link it into the target directory.
    pub fn fetch(&self, request: &FetchRequest) -> Result<Fetched> {
        validate_request(request)?;
        let key = request.key.as_str();

        std::fs::create_dir_all(&self.cache_dir)
            .io_context(|| format!("cannot create cache dir {}", self.cache_dir.display()))?;
        std::fs::create_dir_all(&request.target_dir).io_context(|| {
            format!("cannot create directory {}", request.target_dir.display())
        })?;

        let _lock = acquire_lock(
            &self.cache_dir.join(format!(".{}.lock", key)),
            &format!("cache entry {}", key),
        )?;

        let cache_path = self.cache_path(key);
        let target_path = request.target_dir.join(key);

        let outcome = if cache_path.exists() {
            output::skip(&format!("{} already cached", key));
            FetchOutcome::CacheHit
        } else if is_regular_file(&target_path) {
            self.adopt(&target_path, &cache_path)?;
            output::detail(&format!("adopted {} into cache", key));
            FetchOutcome::Adopted
        } else {
            match &request.source {
                FetchSource::Url(url) => {
                    self.download(url, key, &cache_path)?;
                    FetchOutcome::Downloaded
                }
                FetchSource::Git { url, revision } => {
                    self.clone_to_archive(url, revision, key, &cache_path)?;
                    FetchOutcome::Cloned
                }
            }
        };
        debug!(key, ?outcome, "cache entry ready");

        link_back(&cache_path, &target_path)?;

        Ok(Fetched {
            cache_path,
            target_path,
            outcome,
        })
    }

    fn temp_file(&self, prefix: &str) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(&self.cache_dir)
            .io_context(|| format!("cannot create temp file in {}", self.cache_dir.display()))
    }

    fn download(&self, url: &str, key: &str, cache_path: &Path) -> Result<()> {
        output::sub_action(&format!("Downloading {}", key));
        let mut temp = self.temp_file(".download-")?;

        self.retry
            .run(&format!("download {}", key), &self.interrupt, |attempt| {
                debug!(url, attempt, "download attempt");
                let file = temp.as_file_mut();
                file.set_len(0)
                    .and_then(|_| file.seek(SeekFrom::Start(0)))
                    .io_context(|| "cannot reset temp file")?;
                self.http.download_to(url, file, &self.interrupt)
            })?;

        persist(temp, cache_path)
    }

    fn clone_to_archive(&self, url: &str, revision: &str, key: &str, cache_path: &Path) -> Result<()> {
        output::sub_action(&format!("Checking out {} at {}", key, revision));
        let compression = match ArchiveFormat::from_path(Path::new(key)) {
            Some(ArchiveFormat::Tar(c)) if c != Compression::Lzip => c,
            _ => {
                return Err(Error::InvalidArgument {
                    what: "identity key for a checkout (must name a tar archive)",
                    value: key.to_string(),
                });
            }
        };
        let root_name = ArchiveFormat::strip_extension(key).unwrap_or(key);

        let checkout = git::checkout(url, revision, &self.cache_dir, &self.retry, &self.interrupt)?;

        let temp = self.temp_file(".archive-")?;
        let (file, entries) = with_spinner(&format!("archiving {}", key), || {
            ArchiveBuilder::new(root_name, checkout.commit_time)
                .interrupt(self.interrupt.clone())
                .write_to(&checkout.tree(), temp.as_file(), compression)
        })?;
        file.sync_all()
            .io_context(|| format!("cannot sync archive for {}", key))?;
        debug!(key, entries, "archived checkout");
        self.interrupt.check()?;

        persist(temp, cache_path)
    }

    /// Move a pre-existing file into the cache. Across filesystems the
    /// file is copied into a temp file and renamed, then the original removed.
    fn adopt(&self, from: &Path, cache_path: &Path) -> Result<()> {
        if std::fs::rename(from, cache_path).is_ok() {
            return Ok(());
        }
        let mut temp = self.temp_file(".adopt-")?;
        let mut source =
            std::fs::File::open(from).io_context(|| format!("cannot open {}", from.display()))?;
        std::io::copy(&mut source, temp.as_file_mut())
            .and_then(|_| temp.as_file().sync_all())
            .io_context(|| format!("cannot copy {} into cache", from.display()))?;
        persist(temp, cache_path)?;
        std::fs::remove_file(from).io_context(|| format!("cannot remove {}", from.display()))
    }
}

fn validate_request(request: &FetchRequest) -> Result<()> {
    let key = request.key.as_str();
    if key.is_empty() {
        return Err(Error::MissingParameter("identity key"));
    }
    if key.contains(['/', '\\']) || key == "." || key == ".." {
        return Err(Error::InvalidArgument {
            what: "identity key",
            value: key.to_string(),
        });
    }
    match &request.source {
        FetchSource::Url(url) => validate_http_url(url),
        FetchSource::Git { url, revision } => {
            validate_git_url(url)?;
            if revision.is_empty() {
                return Err(Error::MissingParameter("revision"));
            }
            Ok(())
        }
    }
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_file())
        .unwrap_or(false)
}

fn persist(temp: NamedTempFile, dest: &Path) -> Result<()> {
    temp.persist(dest)
        .map(drop)
        .map_err(|e| Error::io(format!("cannot move into {}", dest.display()), e.error))
}

/// Point `target` at the cache entry unless something usable is already there.
fn link_back(cache_path: &Path, target: &Path) -> Result<()> {
    if target == cache_path {
        return Ok(());
    }
    match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.file_type().is_symlink() && !target.exists() => {
            // dangling link from an older cache location
            std::fs::remove_file(target)
                .io_context(|| format!("cannot remove stale link {}", target.display()))?;
        }
        Ok(_) => return Ok(()),
        Err(_) => {}
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(cache_path, target)
            .io_context(|| format!("cannot link {}", target.display()))
    }
    #[cfg(not(unix))]
    {
        std::fs::copy(cache_path, target)
            .map(drop)
            .io_context(|| format!("cannot copy to {}", target.display()))
    }
}
