//! Verification-code delivery boundary.
//!
//! The session asks an external service to wait for a callback code on the
//! task's number. The call blocks for up to the requested timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// Answer from the code service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeResponse {
    pub status: String,
    /// Some services send the code as a number.
    #[serde(default)]
    pub code: Option<Value>,
}

impl CodeResponse {
    pub fn success(code: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            code: Some(Value::String(code.into())),
        }
    }

    /// The delivered code, when the service reports success.
    pub fn code(&self) -> Option<String> {
        if self.status != "success" {
            return None;
        }
        match self.code.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[async_trait]
pub trait CodeProvider: Send + Sync {
    /// Wait up to `timeout` for a code delivered to `phone`.
    /// `Ok(None)` means the service answered without a code.
    async fn request_callback_code(
        &self,
        phone: &str,
        timeout: Duration,
    ) -> Result<Option<CodeResponse>, TransportError>;
}

#[derive(Debug, Serialize)]
struct WaitRequest<'a> {
    phone_number: &'a str,
    timeout: u64,
}

/// HTTP code service: `POST {url} {phone_number, timeout}`.
#[derive(Debug, Clone)]
pub struct HttpCodeProvider {
    url: String,
    client: reqwest::Client,
    /// Added to the wait timeout for the HTTP request itself.
    grace: Duration,
}

impl HttpCodeProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            grace: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl CodeProvider for HttpCodeProvider {
    async fn request_callback_code(
        &self,
        phone: &str,
        timeout: Duration,
    ) -> Result<Option<CodeResponse>, TransportError> {
        let body = WaitRequest {
            phone_number: phone.trim_start_matches('+'),
            timeout: timeout.as_secs(),
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .timeout(timeout + self.grace)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                endpoint: self.url.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(TransportError::Status {
                endpoint: self.url.clone(),
                status: resp.status().as_u16(),
            });
        }

        let parsed: Option<CodeResponse> =
            resp.json()
                .await
                .map_err(|e| TransportError::InvalidResponse {
                    endpoint: self.url.clone(),
                    reason: e.to_string(),
                })?;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_requires_success_status() {
        let ok: CodeResponse = serde_json::from_str(r#"{"status":"success","code":"4821"}"#).unwrap();
        assert_eq!(ok.code().as_deref(), Some("4821"));

        let numeric: CodeResponse =
            serde_json::from_str(r#"{"status":"success","code":482193}"#).unwrap();
        assert_eq!(numeric.code().as_deref(), Some("482193"));

        let pending: CodeResponse =
            serde_json::from_str(r#"{"status":"timeout","code":"4821"}"#).unwrap();
        assert_eq!(pending.code(), None);

        let empty: CodeResponse = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert_eq!(empty.code(), None);
    }

    #[test]
    fn wait_request_strips_plus() {
        let body = serde_json::to_value(WaitRequest {
            phone_number: "+79990001122".trim_start_matches('+'),
            timeout: 120,
        })
        .unwrap();
        assert_eq!(body["phone_number"], "79990001122");
    }
}
