//! HTTP implementation of the task source.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::TaskSource;
use crate::error::TransportError;
use crate::jobs::{ControlSignal, JobPayload, PollResponse, StatusReport};

#[derive(Debug, Serialize)]
struct PollRequest<'a> {
    agent_id: &'a str,
    capacity: usize,
}

/// Talks to `POST /agent/poll`, `POST /agent/status` and
/// `GET /api/status/{phone}`. One client is shared by every slot.
#[derive(Debug, Clone)]
pub struct HttpTaskSource {
    base_url: String,
    agent_id: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTaskSource {
    pub fn new(base_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent_id: agent_id.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `/api/status/{phone}` with the phone percent-encoded as one segment.
    fn control_url(&self, phone: &str) -> Result<reqwest::Url, TransportError> {
        const ENDPOINT: &str = "/api/status";
        let invalid = |reason: String| TransportError::Request {
            endpoint: ENDPOINT.to_string(),
            reason,
        };
        let mut url = reqwest::Url::parse(&self.url(ENDPOINT)).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("base URL cannot carry a path".to_string()))?
            .push(phone);
        Ok(url)
    }

    async fn send(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        let resp = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl TaskSource for HttpTaskSource {
    async fn poll(&self, capacity: usize) -> Result<Vec<JobPayload>, TransportError> {
        const ENDPOINT: &str = "/agent/poll";
        let body = PollRequest {
            agent_id: &self.agent_id,
            capacity,
        };
        let resp = self
            .send(ENDPOINT, self.client.post(self.url(ENDPOINT)).json(&body))
            .await?;
        let parsed: PollResponse =
            resp.json()
                .await
                .map_err(|e| TransportError::InvalidResponse {
                    endpoint: ENDPOINT.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(capacity, received = parsed.jobs.len(), "Poll answered");
        Ok(parsed.into_jobs())
    }

    async fn post_status(&self, report: &StatusReport) -> Result<(), TransportError> {
        const ENDPOINT: &str = "/agent/status";
        self.send(ENDPOINT, self.client.post(self.url(ENDPOINT)).json(report))
            .await?;
        Ok(())
    }

    async fn control(&self, phone: &str) -> Result<ControlSignal, TransportError> {
        let endpoint = format!("/api/status/{phone}");
        let url = self.control_url(phone)?;
        let resp = self.send(&endpoint, self.client.get(url)).await?;
        resp.json()
            .await
            .map_err(|e| TransportError::InvalidResponse {
                endpoint,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let source = HttpTaskSource::new("http://handler:8000/", "agent-1");
        assert_eq!(source.url("/agent/poll"), "http://handler:8000/agent/poll");
    }

    #[test]
    fn control_url_encodes_phone_as_one_segment() {
        let source = HttpTaskSource::new("http://handler:8000/", "agent-1");
        let url = source.control_url("+1 555/7").unwrap();
        assert_eq!(url.as_str(), "http://handler:8000/api/status/+1%20555%2F7");

        let plain = source.control_url("79990001122").unwrap();
        assert_eq!(plain.as_str(), "http://handler:8000/api/status/79990001122");
    }

    #[test]
    fn poll_request_shape() {
        let body = serde_json::to_value(PollRequest {
            agent_id: "agent-1",
            capacity: 3,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"agent_id": "agent-1", "capacity": 3}));
    }
}
