//! Source acquisition: download, checkout, archive, cache and verify.

pub mod archive;
pub mod download;
pub mod fetcher;
pub mod git;
pub mod hash;
pub mod retry;
pub mod verify;

pub use archive::ArchiveBuilder;
pub use fetcher::{FetchOutcome, FetchRequest, FetchSource, Fetched, Fetcher, default_git_key};
pub use hash::{Checksum, HashAlgorithm};
pub use retry::RetryPolicy;
pub use verify::{Verification, VerifyMode};
