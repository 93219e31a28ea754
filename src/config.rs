//! Configuration types.
//!
//! The agent is configured entirely from the environment. Session timings
//! are compiled-in defaults and are not runtime-mutable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::FallbackSlots;
use crate::error::ConfigError;

/// Default remote task source.
const DEFAULT_HANDLER_URL: &str = "http://127.0.0.1:8000";

/// Default secondary code pattern: a five digit code following a keyword.
pub const DEFAULT_SECONDARY_CODE_PATTERN: &str = r"(?i)(?:code|код|login)[:\s-]*(\d{5})";

/// Agent-level configuration (the enumerated env surface).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the remote task source.
    pub handler_url: String,
    /// Identity sent with every poll.
    pub agent_id: String,
    /// Slot count used when device discovery finds nothing.
    pub fallback_slot_count: usize,
    /// Sleep when there is no capacity or no work.
    pub poll_interval: Duration,
    /// Sleep after a transport failure. Always longer than `poll_interval`.
    pub poll_backoff: Duration,
    /// Pause after a non-empty poll before the next cycle.
    pub settle_delay: Duration,
    /// How long a worker waits on the queue before re-checking shutdown.
    pub worker_poll_interval: Duration,
    /// Delivery attempts per status report.
    pub status_retry: u32,
    /// Delay between status delivery attempts.
    pub status_retry_delay: Duration,
    /// Per-request timeout for the remote task source.
    pub request_timeout: Duration,
    /// Device transport binary.
    pub adb_path: String,
    /// First port of generated fallback device addresses.
    pub device_base_port: u16,
    /// Port step between generated fallback device addresses.
    pub device_port_step: u16,
    /// Verification code service endpoint.
    pub code_service_url: Option<String>,
    /// Stage playbook location.
    pub playbook_path: Option<PathBuf>,
    /// Rolling log directory.
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            handler_url: DEFAULT_HANDLER_URL.to_string(),
            agent_id: "agent".to_string(),
            fallback_slot_count: 10,
            poll_interval: Duration::from_secs(5),
            poll_backoff: Duration::from_secs(10),
            settle_delay: Duration::from_millis(500),
            worker_poll_interval: Duration::from_secs(1),
            status_retry: 3,
            status_retry_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(15),
            adb_path: "adb".to_string(),
            device_base_port: 21503,
            device_port_step: 10,
            code_service_url: None,
            playbook_path: None,
            log_dir: None,
        }
    }
}

impl AgentConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys keep defaults;
    /// set-but-invalid keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let handler_url = lookup("HANDLER_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(defaults.handler_url);

        let agent_id = lookup("AGENT_ID")
            .filter(|s| !s.trim().is_empty())
            .or_else(local_hostname)
            .unwrap_or(defaults.agent_id);

        let fallback_slot_count = parse_or(&lookup, "EMULATOR_COUNT", defaults.fallback_slot_count)?;
        let poll_interval = parse_secs_or(&lookup, "POLL_INTERVAL", defaults.poll_interval)?;
        let poll_backoff = parse_secs_or(&lookup, "POLL_BACKOFF", defaults.poll_backoff)?;
        let status_retry: u32 = parse_or(&lookup, "STATUS_RETRY", defaults.status_retry)?;
        let device_base_port = parse_or(&lookup, "DEVICE_BASE_PORT", defaults.device_base_port)?;
        let device_port_step = parse_or(&lookup, "DEVICE_PORT_STEP", defaults.device_port_step)?;

        if status_retry == 0 {
            return Err(ConfigError::InvalidValue {
                key: "STATUS_RETRY".into(),
                message: "must be at least 1".into(),
            });
        }
        if poll_backoff <= poll_interval {
            return Err(ConfigError::InvalidValue {
                key: "POLL_BACKOFF".into(),
                message: format!(
                    "must be longer than POLL_INTERVAL ({:?} <= {:?})",
                    poll_backoff, poll_interval
                ),
            });
        }

        Ok(Self {
            handler_url,
            agent_id,
            fallback_slot_count,
            poll_interval,
            poll_backoff,
            status_retry,
            adb_path: lookup("ADB_PATH").unwrap_or(defaults.adb_path),
            device_base_port,
            device_port_step,
            code_service_url: lookup("CODE_SERVICE_URL").filter(|s| !s.is_empty()),
            playbook_path: lookup("PLAYBOOK_PATH").map(PathBuf::from),
            log_dir: lookup("AGENT_LOG_DIR").map(PathBuf::from),
            ..defaults
        })
    }

    /// Code service URL; sessions cannot run without it.
    pub fn require_code_service_url(&self) -> Result<&str, ConfigError> {
        self.code_service_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "CODE_SERVICE_URL".into(),
                hint: "Set it to the verification code service endpoint.".into(),
            })
    }

    /// Playbook location; sessions cannot run without it.
    pub fn require_playbook_path(&self) -> Result<&Path, ConfigError> {
        self.playbook_path
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "PLAYBOOK_PATH".into(),
                hint: "Point it at a JSON playbook describing the stage steps.".into(),
            })
    }

    pub fn fallback_slots(&self) -> FallbackSlots {
        FallbackSlots {
            count: self.fallback_slot_count,
            base_port: self.device_base_port,
            port_step: self.device_port_step,
        }
    }
}

/// Timings and patterns for one execution session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between polls inside every waiting stage.
    pub poll_interval: Duration,
    pub prepare_timeout: Duration,
    pub number_entry_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub method_selection_timeout: Duration,
    /// Bound on the external verification code delivery.
    pub code_wait_timeout: Duration,
    pub code_entry_timeout: Duration,
    pub profile_timeout: Duration,
    pub main_screen_timeout: Duration,
    /// First secondary code detection window.
    pub first_code_timeout: Duration,
    /// Second code monitoring window, re-armed on every new code.
    pub second_code_window: Duration,
    /// Interval between screen snapshots while scanning for codes.
    pub code_scan_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub secondary_code_pattern: String,
    /// Case-insensitive substrings marking an app-level rejection.
    pub blocked_patterns: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            prepare_timeout: Duration::from_secs(30),
            number_entry_timeout: Duration::from_secs(15),
            confirmation_timeout: Duration::from_secs(20),
            method_selection_timeout: Duration::from_secs(15),
            code_wait_timeout: Duration::from_secs(120),
            code_entry_timeout: Duration::from_secs(10),
            profile_timeout: Duration::from_secs(40),
            main_screen_timeout: Duration::from_secs(90),
            first_code_timeout: Duration::from_secs(120),
            second_code_window: Duration::from_secs(240),
            code_scan_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(120),
            secondary_code_pattern: DEFAULT_SECONDARY_CODE_PATTERN.to_string(),
            blocked_patterns: vec![
                "banned".to_string(),
                "not allowed to use".to_string(),
                "blocked".to_string(),
            ],
        }
    }
}

fn local_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(str::to_string))
        .filter(|h| !h.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

fn parse_secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let secs: f64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = AgentConfig::from_lookup(lookup_from(&[("AGENT_ID", "agent-7")])).unwrap();
        assert_eq!(config.agent_id, "agent-7");
        assert_eq!(config.fallback_slot_count, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.poll_backoff, Duration::from_secs(10));
        assert_eq!(config.status_retry, 3);
        assert!(config.code_service_url.is_none());
    }

    #[test]
    fn parses_fractional_intervals() {
        let config = AgentConfig::from_lookup(lookup_from(&[
            ("POLL_INTERVAL", "0.5"),
            ("POLL_BACKOFF", "2.5"),
            ("HANDLER_URL", "http://handler:8000/"),
        ]))
        .unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.poll_backoff, Duration::from_millis(2500));
        assert_eq!(config.handler_url, "http://handler:8000");
    }

    #[test]
    fn rejects_invalid_numbers() {
        let err = AgentConfig::from_lookup(lookup_from(&[("EMULATOR_COUNT", "ten")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "EMULATOR_COUNT"));
    }

    #[test]
    fn backoff_must_exceed_interval() {
        let err = AgentConfig::from_lookup(lookup_from(&[
            ("POLL_INTERVAL", "10"),
            ("POLL_BACKOFF", "5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "POLL_BACKOFF"));
    }

    #[test]
    fn session_collaborators_are_required() {
        let config = AgentConfig::from_lookup(lookup_from(&[])).unwrap();
        assert!(matches!(
            config.require_code_service_url(),
            Err(ConfigError::MissingRequired { .. })
        ));
        assert!(config.require_playbook_path().is_err());

        let config = AgentConfig::from_lookup(lookup_from(&[
            ("CODE_SERVICE_URL", "http://codes:9000/wait"),
            ("PLAYBOOK_PATH", "/etc/agent/playbook.json"),
            ("EMULATOR_COUNT", "3"),
        ]))
        .unwrap();
        assert_eq!(config.require_code_service_url().unwrap(), "http://codes:9000/wait");
        assert_eq!(
            config.require_playbook_path().unwrap(),
            Path::new("/etc/agent/playbook.json")
        );
        assert_eq!(config.fallback_slots().generate().len(), 3);
    }

    #[test]
    fn zero_status_retry_rejected() {
        assert!(AgentConfig::from_lookup(lookup_from(&[("STATUS_RETRY", "0")])).is_err());
    }

    #[test]
    fn session_defaults_match_staged_timeouts() {
        let config = SessionConfig::default();
        assert_eq!(config.code_wait_timeout, Duration::from_secs(120));
        assert_eq!(config.main_screen_timeout, Duration::from_secs(90));
        assert_eq!(config.first_code_timeout, Duration::from_secs(120));
        assert_eq!(config.second_code_window, Duration::from_secs(240));
        assert!(regex::Regex::new(&config.secondary_code_pattern).is_ok());
    }
}
