//! Integrity verification of cached sources
//!
//! A checksum is only meaningful together with the [`VerifyMode`] it was
//! established with:
//!
//! - `raw`: the file bytes, for release tarballs and binary downloads.
//! - `tar-content`: the logical content of the tar archive (entry kinds,
//!   paths, link targets and file contents in archive order). Stable across
//!   compressors, compression levels and tar metadata; used for archives
//!   built from version-controlled checkouts.
//! - `decompressed`: the decompressed but still tar-encoded stream. Sensitive
//!   to timestamps and permissions; kept for hashes established that way.

use crate::build::codec::{ArchiveFormat, Compression};
use crate::core::output;
use crate::core::progress::{ProgressGuard, create_spinner};
use crate::error::{Error, IoContext, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use super::hash::{Checksum, HashAlgorithm, Hasher, hash_reader};

/// What bytes a checksum covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMode {
    #[default]
    Raw,
    #[serde(alias = "tar-extract")]
    TarContent,
    #[serde(alias = "xz-extract")]
    Decompressed,
}

impl VerifyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::TarContent => "tar-content",
            Self::Decompressed => "decompressed",
        }
    }
}

impl fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerifyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(Self::Raw),
            "tar-content" | "tar-extract" => Ok(Self::TarContent),
            "decompressed" | "xz-extract" => Ok(Self::Decompressed),
            other => Err(Error::InvalidArgument {
                what: "verify mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Outcome of a verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Match { actual: String },
    Mismatch { expected: String, actual: String },
    Missing,
}

impl Verification {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }
}

/// Compute the digest of `path` under `mode`.
pub fn compute(path: &Path, algorithm: HashAlgorithm, mode: VerifyMode) -> Result<String> {
    let mut hasher = algorithm.hasher();
    match mode {
        VerifyMode::Raw => {
            let mut file = std::fs::File::open(path)
                .io_context(|| format!("cannot open {}", path.display()))?;
            hash_reader(&mut file, &mut hasher)
                .io_context(|| format!("read error in {}", path.display()))?;
        }
        VerifyMode::Decompressed => {
            let mut reader = tar_compression(path, mode)?.open(path)?;
            hash_reader(&mut reader, &mut hasher)
                .io_context(|| format!("cannot decompress {}", path.display()))?;
        }
        VerifyMode::TarContent => {
            let reader = tar_compression(path, mode)?.open(path)?;
            hash_tar_content(reader, &mut hasher)
                .io_context(|| format!("cannot read tar content of {}", path.display()))?;
        }
    }
    Ok(hasher.finalize_hex())
}

fn tar_compression(path: &Path, mode: VerifyMode) -> Result<Compression> {
    ArchiveFormat::detect(path)?.compression().ok_or_else(|| {
        Error::UnsupportedFormat(format!(
            "{} verification needs a tar archive: {}",
            mode,
            path.display()
        ))
    })
}

/// Hash the logical content of a tar stream.
///
/// Each entry contributes a kind tag, its length-prefixed path, the
/// length-prefixed link target (links) or contents (regular files).
/// Metadata such as mtime, owner and mode is left out.
pub fn hash_tar_content<R: Read>(reader: R, hasher: &mut Hasher) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let tag = match entry.header().entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous => b'f',
            tar::EntryType::Directory => b'd',
            tar::EntryType::Symlink => b'l',
            tar::EntryType::Link => b'h',
            // pax globals, devices and fifos are not content
            _ => continue,
        };

        let path = entry.path()?.to_string_lossy().into_owned();
        let path = path.trim_start_matches("./").trim_end_matches('/');
        if path.is_empty() || path == "." {
            continue;
        }

        hasher.update(&[tag]);
        frame(hasher, path.as_bytes());

        match tag {
            b'l' | b'h' => {
                let target = entry
                    .link_name()?
                    .map(|l| l.to_string_lossy().into_owned())
                    .unwrap_or_default();
                frame(hasher, target.as_bytes());
            }
            b'f' => {
                hasher.update(&entry.size().to_le_bytes());
                io::copy(&mut entry, hasher)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn frame(hasher: &mut Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Verify `path` against `expected` under `mode`.
pub fn verify(path: &Path, expected: &Checksum, mode: VerifyMode) -> Result<Verification> {
    if !path.exists() {
        return Ok(Verification::Missing);
    }

    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let _guard = ProgressGuard::new(create_spinner(&format!("checksum {}", name)));

    let actual = compute(path, expected.algorithm, mode)?;
    if expected.matches(&actual) {
        Ok(Verification::Match { actual })
    } else {
        Ok(Verification::Mismatch {
            expected: expected.value.clone(),
            actual,
        })
    }
}

/// Verify and turn anything but a match into an error.
pub fn verify_or_fail(path: &Path, expected: &Checksum, mode: VerifyMode) -> Result<()> {
    output::detail(&format!(
        "verifying {} ({}) of {}",
        expected.algorithm.name().to_lowercase(),
        mode,
        path.display()
    ));
    match verify(path, expected, mode)? {
        Verification::Match { .. } => Ok(()),
        Verification::Missing => Err(Error::NotFound(path.to_path_buf())),
        Verification::Mismatch { expected: e, actual } => Err(Error::HashMismatch {
            algorithm: expected.algorithm.name(),
            path: path.to_path_buf(),
            expected: e,
            actual,
        }),
    }
}
