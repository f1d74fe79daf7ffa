//! Plain HTTP(S) downloads
//!
//! Streams a response body into an already-open file, polling the interrupt
//! between chunks. The caller owns the destination (a temp file in the
//! cache directory) and decides when the result becomes visible.

use crate::core::interrupt::Interrupt;
use crate::core::output;
use crate::core::progress::{ProgressGuard, create_spinner, upgrade_to_bytes};
use crate::error::{Error, IoContext, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// Default connect timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// A stalled transfer is abandoned (and retried) after this long without data
const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

/// Connect timeout from `SRCFETCH_HTTP_TIMEOUT`, or the default.
/// Read once and cached.
fn connect_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let secs = std::env::var("SRCFETCH_HTTP_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        Duration::from_secs(secs.clamp(5, 300))
    })
}

/// Blocking HTTP client used for source downloads
#[derive(Debug, Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(
            connect_timeout(),
            Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
        )
    }
}

impl HttpClient {
    pub fn new(connect: Duration, read: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect)
            .timeout_read(read)
            .user_agent(concat!("srcfetch/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }

    /// Download `url` into `dest`, returning the number of bytes written.
    ///
    /// Transport and read failures map to [`Error::Network`], HTTP error
    /// statuses to [`Error::HttpStatus`]; both feed the retry policy.
    pub fn download_to(&self, url: &str, dest: &mut File, interrupt: &Interrupt) -> Result<u64> {
        validate_http_url(url)?;
        interrupt.check()?;
        debug!(url, "GET");

        let response = self.agent.get(url).call().map_err(|e| match e {
            ureq::Error::Status(status, _) => Error::HttpStatus {
                url: url.to_string(),
                status,
            },
            ureq::Error::Transport(t) => Error::Network {
                url: url.to_string(),
                message: t.to_string(),
            },
        })?;

        let expected_len: Option<u64> = response
            .header("content-length")
            .and_then(|s| s.parse().ok());

        let guard = ProgressGuard::new(create_spinner(&format!(
            "downloading {}",
            url_filename(url)
        )));
        if let Some(len) = expected_len {
            upgrade_to_bytes(guard.bar(), len);
        }

        let mut reader = response.into_reader();
        let mut buffer = [0u8; 64 * 1024];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut buffer).map_err(|e| Error::Network {
                url: url.to_string(),
                message: format!("read error: {}", e),
            })?;
            if n == 0 {
                break;
            }
            dest.write_all(&buffer[..n])
                .io_context(|| "write error while downloading")?;
            total += n as u64;
            guard.bar().set_position(total);
            interrupt.check()?;
        }

        if let Some(len) = expected_len
            && len != total
        {
            return Err(Error::Network {
                url: url.to_string(),
                message: format!("truncated transfer: {} of {} bytes", total, len),
            });
        }

        dest.flush().io_context(|| "flush error while downloading")?;
        dest.sync_all()
            .io_context(|| "sync error while downloading")?;

        output::detail(&format!("downloaded {} ({} bytes)", url_filename(url), total));
        Ok(total)
    }
}

/// Reject anything but http:// and https:// URLs.
pub fn validate_http_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(Error::MissingParameter("url"));
    }
    let lower = url.to_lowercase();
    if lower.starts_with("https://") || lower.starts_with("http://") {
        Ok(())
    } else {
        Err(Error::InvalidArgument {
            what: "download URL (only http:// and https:// are supported)",
            value: url.to_string(),
        })
    }
}

/// Last path segment of a URL, without query string or fragment.
///
/// Returns an empty string when the URL has no usable file name.
pub fn url_filename(url: &str) -> String {
    let clean = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = clean.split_once("://").map(|(_, rest)| rest).unwrap_or(clean);
    match after_scheme.split_once('/') {
        Some((_, path)) => path.rsplit('/').next().unwrap_or("").to_string(),
        None => String::new(),
    }
}
