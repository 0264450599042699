//! HTTP client for the container action-proxy protocol.
//!
//! Two endpoints, both POST with a `{"value": ...}` envelope:
//! - `/init` carries the user code; 200/202 means initialized.
//! - `/run` carries the activation arguments; the response body is read up
//!   to a configured cap and flagged as truncated beyond it.

use std::time::Duration;

use serde_json::json;

use crate::driver::{DriverError, RunError, RunOutcome};

/// Responses whose declared length exceeds `max_body * HARD_LIMIT_FACTOR`
/// are aborted instead of read and truncated.
const HARD_LIMIT_FACTOR: u64 = 32;

const INIT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ContainerClient {
    http: reqwest::Client,
    max_body: usize,
}

impl ContainerClient {
    pub fn new(max_body: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            max_body,
        }
    }

    /// Post user code to `/init`. Any non-2xx status or transport failure is
    /// an init failure with the response body as diagnostic.
    pub async fn init(
        &self,
        address: &str,
        payload: &serde_json::Value,
    ) -> Result<(), DriverError> {
        let url = format!("http://{}/init", address);
        let response = self
            .http
            .post(&url)
            .timeout(INIT_TIMEOUT)
            .json(&json!({ "value": payload }))
            .send()
            .await
            .map_err(|e| DriverError::Init {
                diagnostic: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let diagnostic = response.text().await.unwrap_or_default();
        Err(DriverError::Init {
            diagnostic: format!("/init returned {}: {}", status.as_u16(), diagnostic),
        })
    }

    /// Post arguments to `/run` with a per-request deadline. The body is
    /// read incrementally and truncated at the configured cap.
    pub async fn run(
        &self,
        address: &str,
        args: &serde_json::Value,
        deadline: Duration,
    ) -> Result<RunOutcome, DriverError> {
        let url = format!("http://{}/run", address);
        let response = self
            .http
            .post(&url)
            .timeout(deadline)
            .json(&json!({ "value": args }))
            .send()
            .await
            .map_err(|e| map_transport_error(e, deadline))?;

        let status_code = response.status().as_u16();

        if let Some(len) = response.content_length()
            && len > self.max_body as u64 * HARD_LIMIT_FACTOR
        {
            return Err(RunError::TooLarge(len).into());
        }

        let mut body = Vec::with_capacity(1024);
        let mut truncated = false;
        let mut response = response;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(map_transport_error(e, deadline)),
            };
            if truncated {
                continue;
            }
            let room = self.max_body - body.len();
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
            } else {
                body.extend_from_slice(&chunk);
            }
        }

        Ok(RunOutcome {
            status_code,
            body: String::from_utf8_lossy(&body).into_owned(),
            truncated,
        })
    }
}

fn map_transport_error(e: reqwest::Error, deadline: Duration) -> DriverError {
    if e.is_timeout() {
        RunError::Timeout(deadline).into()
    } else {
        RunError::Connection(e.to_string()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_error_maps_through_driver_error() {
        let err: DriverError = RunError::Timeout(Duration::from_secs(1)).into();
        assert!(matches!(err, DriverError::Run(RunError::Timeout(_))));
    }

    #[test]
    fn test_client_keeps_configured_cap() {
        let client = ContainerClient::new(1024);
        assert_eq!(client.max_body, 1024);
    }
}
