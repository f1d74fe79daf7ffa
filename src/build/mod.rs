//! Preparing fetched sources: unpack, patch, build.

pub mod codec;
pub mod extract;
pub mod patch;
pub mod steps;

pub use codec::{ArchiveFormat, Compression};
pub use extract::{Unpacked, unpack};
pub use patch::{PatchApplier, PatchPolicy, PatchReport};
pub use steps::{ShellCmd, StepRunner};
