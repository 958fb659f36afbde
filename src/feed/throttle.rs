//! Pacing between consecutive fetches against the same host.
//!
//! Several feeds often live on one server. When a configured interval
//! is set, a run sleeps for it before hitting a host it just hit;
//! switching hosts resets the clock. The state is one host string, not
//! a timetable.

use std::time::Duration;

/// Tracks the host of the previous fetch in a run.
#[derive(Debug, Default)]
pub struct FetchThrottle {
    last_host: Option<String>,
}

impl FetchThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `interval` if `url` points at the same host as the
    /// previous call. Always records `url`'s host as the new previous
    /// host (an unparseable URL clears it).
    pub async fn pace(&mut self, url: &str, interval: Duration) {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));

        if !interval.is_zero() {
            if let (Some(prev), Some(next)) = (self.last_host.as_deref(), host.as_deref()) {
                if prev == next {
                    tracing::debug!(host = %next, delay = ?interval, "throttling same-host fetch");
                    tokio::time::sleep(interval).await;
                }
            }
        }
        self.last_host = host;
    }
}
