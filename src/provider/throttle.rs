//! Process-wide request throttle for the remote provider.
//!
//! [`Throttle`] enforces a minimum interval between any two outbound calls
//! that share it, regardless of which operation issues them. The interval is
//! `period / max_requests_per_period`. All callers serialize on one gate, so
//! the rate cap applies across every worker holding the same `Arc<Throttle>`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use relay_core::provider::Throttle;
//!
//! # async fn example() {
//! let throttle = Throttle::per_period(35, Duration::from_secs(1));
//!
//! // First call proceeds immediately
//! throttle.acquire().await;
//!
//! // Second call waits until 1/35 s has passed since the first
//! throttle.acquire().await;
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative throttle delay (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Shared minimum-interval gate for provider requests.
///
/// Designed to be wrapped in `Arc` and shared by every client instance that
/// talks to the same provider account.
#[derive(Debug)]
pub struct Throttle {
    /// Minimum time between two consecutive calls.
    interval: Duration,

    /// Time of the last call through this gate.
    /// `None` until the first call, which proceeds immediately.
    last_request: Mutex<Option<Instant>>,

    /// Total delay applied so far (in milliseconds), for excessive-throttling warnings.
    cumulative_delay_ms: AtomicU64,
}

impl Throttle {
    /// Creates a throttle with an explicit minimum interval.
    #[must_use]
    #[instrument(skip_all, fields(interval_ms = interval.as_millis()))]
    pub fn new(interval: Duration) -> Self {
        debug!("creating provider throttle");
        Self {
            interval,
            last_request: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    /// Creates a throttle allowing at most `max_requests` calls per `period`.
    ///
    /// A `max_requests` of zero disables throttling.
    ///
    /// ```
    /// use std::time::Duration;
    /// use relay_core::provider::Throttle;
    ///
    /// let throttle = Throttle::per_period(4, Duration::from_secs(1));
    /// assert_eq!(throttle.interval(), Duration::from_millis(250));
    /// ```
    #[must_use]
    pub fn per_period(max_requests: u32, period: Duration) -> Self {
        if max_requests == 0 {
            return Self::disabled();
        }
        Self::new(period / max_requests)
    }

    /// Creates a throttle that never delays.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Returns the minimum interval between calls.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until the interval since the previous call has elapsed, then
    /// stamps the current time as the new previous call.
    ///
    /// The gate is released as soon as the stamp is taken, so a long-running
    /// request does not hold other callers back beyond the interval.
    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }

        let mut last_request_guard = self.last_request.lock().await;

        if let Some(last_request) = *last_request_guard {
            let elapsed = last_request.elapsed();

            if elapsed < self.interval {
                let delay = self.interval.saturating_sub(elapsed);
                let cumulative = self.add_cumulative_delay(delay);

                debug!(
                    delay_ms = delay.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "throttling provider request"
                );

                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD
                    && cumulative.saturating_sub(delay) < CUMULATIVE_DELAY_WARNING_THRESHOLD
                {
                    warn!(
                        cumulative_delay_secs = cumulative.as_secs(),
                        "provider throttle has delayed requests for over 30s in total"
                    );
                }

                tokio::time::sleep(delay).await;
            }
        }

        *last_request_guard = Some(Instant::now());
    }

    /// Returns the total delay applied so far.
    #[must_use]
    pub fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::SeqCst))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports integer seconds and HTTP-date (RFC 7231). Returns `None` if the
/// value cannot be parsed. Caps excessive values at 1 hour.
///
/// ```
/// use std::time::Duration;
/// use relay_core::provider::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    let duration = datetime
        .duration_since(std::time::SystemTime::now())
        .unwrap_or(Duration::ZERO);
    Some(duration.min(MAX_RETRY_AFTER))
}
