//! Job data model: tasks, slots, status reports and control signals.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;

/// A job exactly as the remote task source returned it.
///
/// `phone` is optional here so that a malformed job can still be queued,
/// claimed and dropped by a worker with a warning. A `phone` that is not
/// a string reads as missing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Every other field, kept for forward compatibility.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl JobPayload {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: Some(phone.into()),
            attributes: Map::new(),
        }
    }
}

impl From<Value> for JobPayload {
    fn from(value: Value) -> Self {
        let mut attributes = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let phone = match attributes.remove("phone") {
            Some(Value::String(phone)) => Some(phone),
            _ => None,
        };
        Self { phone, attributes }
    }
}

/// One unit of work. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub phone: String,
    pub attributes: Map<String, Value>,
}

impl Task {
    /// String attribute lookup.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

impl TryFrom<JobPayload> for Task {
    type Error = TaskError;

    fn try_from(payload: JobPayload) -> Result<Self, Self::Error> {
        let phone = payload
            .phone
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .ok_or(TaskError::Malformed { field: "phone" })?;
        Ok(Self {
            phone,
            attributes: payload.attributes,
        })
    }
}

/// A persistent execution unit bound to one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    /// Stable identifier, also sent as `emulator` in status reports.
    pub id: String,
    /// Connection string for the device transport.
    pub device_address: String,
}

impl Slot {
    /// A slot whose id is its device address.
    pub fn from_address(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            id: address.clone(),
            device_address: address,
        }
    }

    /// Port component of the address: `host:port` or legacy `name-port`.
    pub fn port(&self) -> Option<u16> {
        let raw = match self.device_address.rsplit_once(':') {
            Some((_, port)) => port,
            None => self.device_address.rsplit_once('-')?.1,
        };
        raw.parse().ok()
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Status values understood by the remote task source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Starting,
    ReadyForCode,
    Completed,
    Failed,
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::ReadyForCode => "ready_for_code",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Payload for `POST /agent/status`. Empty optionals are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub phone: String,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn new(phone: impl Into<String>, status: ReportStatus) -> Self {
        Self {
            phone: phone.into(),
            status,
            emulator: None,
            code: None,
            error: None,
        }
    }

    pub fn with_emulator(mut self, emulator: impl Into<String>) -> Self {
        self.emulator = Some(emulator.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into()).filter(|s: &String| !s.is_empty());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into()).filter(|s: &String| !s.is_empty());
        self
    }
}

/// Per-task control flags polled by a running session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignal {
    #[serde(default)]
    pub stop_requested: bool,
    /// Advisory only: logged, never changes control flow.
    #[serde(default)]
    pub second_code_requested: bool,
}

/// Response of `POST /agent/poll`. Entries stay raw so one bad job
/// cannot fail the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub jobs: Vec<Value>,
}

impl PollResponse {
    pub fn into_jobs(self) -> Vec<JobPayload> {
        self.jobs.into_iter().map(JobPayload::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn job_payload_keeps_unknown_fields() {
        let payload = JobPayload::from(json!({"phone": "+79990001122", "country": "ru", "priority": 3}));
        assert_eq!(payload.phone.as_deref(), Some("+79990001122"));
        assert_eq!(payload.attributes.len(), 2);

        let task = Task::try_from(payload).unwrap();
        assert_eq!(task.attribute("country"), Some("ru"));
        assert_eq!(task.attribute("priority"), None);
    }

    #[test]
    fn missing_or_blank_phone_is_malformed() {
        let payload = JobPayload::from(json!({"country": "ru"}));
        assert!(matches!(
            Task::try_from(payload),
            Err(TaskError::Malformed { field: "phone" })
        ));
        assert!(Task::try_from(JobPayload::new("   ")).is_err());
    }

    #[test]
    fn mixed_poll_batch_keeps_every_entry() {
        let response: PollResponse = serde_json::from_str(
            r#"{"jobs":[{"phone":"+79990001"},{"phone":79990002},{"phone":"+79990003"},"junk"]}"#,
        )
        .unwrap();
        let tasks: Vec<Result<Task, TaskError>> =
            response.into_jobs().into_iter().map(Task::try_from).collect();

        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[0].as_ref().unwrap().phone, "+79990001");
        assert!(matches!(tasks[1], Err(TaskError::Malformed { field: "phone" })));
        assert_eq!(tasks[2].as_ref().unwrap().phone, "+79990003");
        assert!(tasks[3].is_err());
    }

    #[test]
    fn slot_port_parsing() {
        assert_eq!(Slot::from_address("127.0.0.1:21503").port(), Some(21503));
        assert_eq!(Slot::from_address("emulator-5554").port(), Some(5554));
        assert_eq!(Slot::from_address("device").port(), None);
        assert_eq!(Slot::from_address("127.0.0.1:abc").port(), None);
    }

    #[test]
    fn status_report_omits_empty_fields() {
        let report = StatusReport::new("+1555", ReportStatus::ReadyForCode)
            .with_emulator("127.0.0.1:21503")
            .with_code("");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "phone": "+1555",
                "status": "ready_for_code",
                "emulator": "127.0.0.1:21503"
            })
        );
    }

    #[test]
    fn control_signal_defaults_missing_flags() {
        let signal: ControlSignal = serde_json::from_str(r#"{"stop_requested":true}"#).unwrap();
        assert!(signal.stop_requested);
        assert!(!signal.second_code_requested);

        let empty: ControlSignal = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ControlSignal::default());
    }
}
