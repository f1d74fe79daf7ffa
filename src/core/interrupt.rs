//! SIGINT/SIGTERM handling
//!
//! The signal handler only records the signal number. Long-running transfers
//! poll an [`Interrupt`] between chunks and bail out with
//! [`Error::Interrupted`]; unwinding drops the temp-file guards, so no partial
//! file survives. The binary then exits with `128 + signal`.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: libc::c_int) {
    PENDING_SIGNAL.store(signal, Ordering::SeqCst);
}

/// Install the recording handler for SIGINT and SIGTERM.
#[cfg(unix)]
pub fn install_handlers() -> Result<()> {
    for signal in [libc::SIGINT, libc::SIGTERM] {
        let handler = record_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only performs an atomic store.
        let previous = unsafe { libc::signal(signal, handler) };
        if previous == libc::SIG_ERR {
            return Err(Error::io(
                format!("cannot install handler for signal {}", signal),
                std::io::Error::last_os_error(),
            ));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_handlers() -> Result<()> {
    Ok(())
}

/// Signal received since [`install_handlers`], if any.
pub fn pending_signal() -> Option<i32> {
    match PENDING_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        signal => Some(signal),
    }
}

/// Process exit status conventionally used after being stopped by `signal`.
pub fn exit_status(signal: i32) -> u8 {
    (128 + signal).clamp(0, 255) as u8
}

/// Cancellation source polled by fetch and archive operations.
///
/// Observes process signals, and can also be triggered by hand (tests,
/// embedding applications).
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    manual: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn trigger(&self) {
        self.manual.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.manual.load(Ordering::SeqCst) || pending_signal().is_some()
    }

    /// Fail with [`Error::Interrupted`] once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}
