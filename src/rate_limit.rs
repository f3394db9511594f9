//! Rate-limit policy and run pacing.
//!
//! The server reports rate limiting in-band: a response with `success: false`
//! and an error text containing `error-too-many-requests` plus a mandatory
//! wait ("... must wait 12 seconds ..."). [`with_retry`] absorbs those by
//! sleeping and retrying the same request; every other error kind is fatal.
//!
//! [`Pacing`] is the run's single politeness pause, slept after each
//! successful call. It is an explicit value threaded through the exporter,
//! not a global, and it only ever shrinks: when the server demands a wait
//! shorter than the configured pause, the shorter value becomes the pause
//! for the remainder of the run.

use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, warn};

use crate::api::{ApiError, ApiResponse};

/// Waits at or above this are treated as a server-side problem and abort the
/// run instead of sleeping.
pub const WAIT_CEILING_SECS: u64 = 300;

static WAIT_SECONDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)must wait (\d+) seconds").unwrap());

/// Classify an API error text. Returns the mandatory wait for a retryable
/// rate-limit error, or the fatal [`ApiError`] otherwise.
pub fn required_wait(error: &str) -> Result<Duration, ApiError> {
    if !error.contains("error-too-many-requests") {
        return Err(ApiError::Api(error.to_string()));
    }
    let seconds: u64 = WAIT_SECONDS
        .captures(error)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| ApiError::UnparseableRateLimit(error.to_string()))?;
    if seconds >= WAIT_CEILING_SECS {
        return Err(ApiError::ExcessiveRateLimitWait(seconds));
    }
    Ok(Duration::from_secs(seconds))
}

/// The politeness pause inserted between successive API calls.
#[derive(Debug, Clone)]
pub struct Pacing {
    pause: Duration,
}

impl Pacing {
    pub fn new(pause: Duration) -> Self {
        Self { pause }
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Sleep the current pause. Called after every successful API call.
    pub fn rest(&self) {
        if !self.pause.is_zero() {
            thread::sleep(self.pause);
        }
    }

    /// Shrink the pause to the server-reported mandatory wait if that is
    /// shorter. The pause never grows back within a run.
    pub fn absorb(&mut self, wait: Duration) {
        if wait < self.pause {
            debug!(
                from_secs = self.pause.as_secs(),
                to_secs = wait.as_secs(),
                "shrinking politeness pause for the rest of this run"
            );
            self.pause = wait;
        }
    }

    /// Handle an in-band API error: sleep out a retryable rate limit, or
    /// return the fatal error kind.
    fn handle_error(&mut self, error: &str) -> Result<(), ApiError> {
        error!("error response from API endpoint: {error}");
        let wait = required_wait(error)?;
        self.absorb(wait);
        warn!(
            wait_secs = wait.as_secs(),
            "rate limited; sleeping before retrying the request"
        );
        thread::sleep(wait);
        Ok(())
    }
}

/// Issue `call` until it reports in-band success, sleeping out rate limits
/// in between. Transport failures and fatal API errors propagate.
pub fn with_retry<T, F>(pacing: &mut Pacing, mut call: F) -> Result<T, ApiError>
where
    T: ApiResponse,
    F: FnMut() -> Result<T, ApiError>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        debug!(attempt, "invoking API");
        let response = call()?;
        if response.is_success() {
            return Ok(response);
        }
        let error = response.error_text().to_string();
        pacing.handle_error(&error)?;
    }
}
