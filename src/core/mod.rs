//! Shared infrastructure: terminal output, progress bars, locks and signal
//! handling.

pub mod interrupt;
pub mod lock;
pub mod output;
pub mod progress;
