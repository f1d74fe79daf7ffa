//! Idempotent source acquisition and build cache
//!
//! srcfetch fetches package sources from HTTP(S) URLs or git revisions into a
//! shared, content-addressed-by-name cache, verifies them, unpacks them, applies
//! patches and runs each package's build and install commands. Every stage is
//! recorded, so re-running a finished pipeline does no work and an interrupted
//! one resumes at the stage that did not complete.
//!
//! # Example manifest
//!
//! ```toml
//! [settings]
//! cache_dir = "~/.cache/srcfetch"
//! target = "aarch64-linux-gnu"
//!
//! [[package]]
//! name = "zlib"
//! version = "1.3.1"
//! url = "https://zlib.net/zlib-1.3.1.tar.xz"
//! checksum = "sha256:38ef96b8dfe510d42707d9c781877914792541133e1870841463bfa73f883e32"
//! patches = "patches/zlib"
//! build = ["./configure --prefix=$PREFIX", "make -j$NPROC"]
//! install = ["make install"]
//! ```
//!
//! # Building blocks
//!
//! - [`acquire::Fetcher`] - cache-first download and git checkout
//! - [`acquire::ArchiveBuilder`] - reproducible tarballs from source trees
//! - [`acquire::verify`] - checksum verification in raw or tar-content mode
//! - [`acquire::RetryPolicy`] - bounded retries for transient failures
//! - [`build::unpack`] - safe extraction with single-root promotion
//! - [`build::PatchApplier`] - ordered patch application
//! - [`package::PackageCache`] - the per-package state machine

pub mod acquire;
pub mod build;
pub mod core;
pub mod error;
pub mod package;

pub use acquire::{Checksum, Fetcher, HashAlgorithm, RetryPolicy, VerifyMode};
pub use crate::core::interrupt::Interrupt;
pub use crate::core::output;
pub use error::{Error, Result};
pub use package::{Manifest, PackageCache, PackageSpec, PackageState};
