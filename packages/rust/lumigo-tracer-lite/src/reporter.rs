//! Best-effort delivery of reports to the collector edge.
//!
//! A report is one POST of a JSON array. The call is bounded by the edge timeout,
//! never retried, and never fails: the outcome is only the elapsed time, or `0` when
//! nothing was delivered.

use crate::constants::defaults;
use crate::error::TracerError;
use crate::logger::Logger;
use std::time::{Duration, Instant};

static LOGGER: Logger = Logger::const_new("reporter");

/// Sends report bodies to the edge.
#[derive(Debug, Clone)]
pub struct Reporter {
    client: Option<reqwest::Client>,
    host: Option<String>,
    should_report: bool,
    timeout: Duration,
}

impl Reporter {
    /// Creates a reporter. An empty `host` selects the region-templated default.
    pub fn new(host: Option<String>, should_report: bool, timeout: Duration) -> Self {
        let client = if should_report {
            match reqwest::Client::builder().timeout(timeout).build() {
                Ok(client) => Some(client),
                Err(e) => {
                    LOGGER.error(format!("Failed to build HTTP client, reporting is disabled: {e}"));
                    None
                }
            }
        } else {
            None
        };
        Self {
            client,
            host: host.filter(|h| !h.is_empty()),
            should_report,
            timeout,
        }
    }

    /// A reporter that never sends anything.
    pub fn disabled() -> Self {
        Self::new(None, false, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.should_report && self.client.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The endpoint reports for `region` go to.
    pub fn endpoint(&self, region: &str) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => defaults::EDGE_HOST.replace("{region}", region),
        }
    }

    /// Posts `body` and returns the elapsed milliseconds, or `0` when nothing was
    /// delivered (disabled, network error, timeout or non-2xx status).
    pub async fn send(&self, region: &str, body: String) -> u64 {
        let Some(client) = self.client.as_ref().filter(|_| self.should_report) else {
            LOGGER.debug("Reporting is disabled, not sending spans");
            return 0;
        };
        let endpoint = self.endpoint(region);

        match post(client, &endpoint, body).await {
            Ok(elapsed) => elapsed,
            Err(e) => {
                LOGGER.error(format!("Could not report json to {endpoint}: {e}"));
                0
            }
        }
    }
}

#[tracing::instrument(skip_all, fields(http.url = %endpoint, http.status_code))]
async fn post(client: &reqwest::Client, endpoint: &str, body: String) -> Result<u64, TracerError> {
    tracing::debug!(name = "sending report", size = body.len());

    let start = Instant::now();
    let response = client
        .post(endpoint)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await?;
    let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let status = response.status();
    tracing::Span::current().record("http.status_code", status.as_u16());
    if !status.is_success() {
        tracing::warn!(
            name = "error posting report",
            status = status.as_u16(),
            status_text = %status.canonical_reason().unwrap_or("Unknown status"),
        );
        return Ok(0);
    }

    LOGGER.info(format!("Successful reporting, code: {}", status.as_u16()));
    // A delivered report always counts as at least one millisecond.
    Ok(elapsed.max(1))
}
