//! ADB transport for [`DeviceControl`].
//!
//! Every call shells out to `adb -s <address> ...` with a timeout. The
//! child is killed if the timeout fires.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{DeviceControl, Point};
use crate::error::DeviceError;

/// Default timeout for a single shell call.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the UI hierarchy is dumped on the device.
const REMOTE_DUMP_PATH: &str = "/data/local/tmp/window_dump.xml";

#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb_path: String,
    address: String,
}

impl AdbDevice {
    pub fn new(adb_path: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
            address: address.into(),
        }
    }

    async fn exec(&self, args: &[&str], timeout: Duration) -> Result<String, DeviceError> {
        let mut cmd = Command::new(&self.adb_path);
        cmd.arg("-s")
            .arg(&self.address)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| DeviceError::Timeout(timeout))?
            .map_err(|e| DeviceError::Spawn {
                program: self.adb_path.clone(),
                reason: e.to_string(),
            })?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Escape text for `input text`: spaces become `%s`, quotes are escaped.
pub fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            ' ' => out.push_str("%s"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            other => out.push(other),
        }
    }
    out
}

#[async_trait]
impl DeviceControl for AdbDevice {
    async fn run_shell(&self, command: &str, timeout: Duration) -> Option<String> {
        let mut args = vec!["shell"];
        args.extend(command.split_whitespace());
        match self.exec(&args, timeout).await {
            Ok(out) => Some(out),
            Err(e) => {
                debug!(device = %self.address, command, error = %e, "Shell call failed");
                None
            }
        }
    }

    async fn tap(&self, point: Point) {
        self.run_shell(&format!("input tap {} {}", point.x, point.y), DEFAULT_TIMEOUT)
            .await;
    }

    async fn input_text(&self, text: &str) {
        self.run_shell(&format!("input text {}", escape_input_text(text)), DEFAULT_TIMEOUT)
            .await;
    }

    async fn key_event(&self, code: u32) {
        self.run_shell(&format!("input keyevent {code}"), DEFAULT_TIMEOUT)
            .await;
    }

    async fn snapshot(&self) -> String {
        for _ in 0..2 {
            let dumped = self
                .run_shell(
                    &format!("uiautomator dump {REMOTE_DUMP_PATH}"),
                    Duration::from_secs(15),
                )
                .await
                .is_some_and(|out| out.contains("dumped to"));
            if dumped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        match self
            .run_shell(&format!("cat {REMOTE_DUMP_PATH}"), Duration::from_secs(5))
            .await
        {
            Some(xml) => xml,
            None => {
                warn!(device = %self.address, "Screen snapshot unavailable");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_spaces_and_quotes() {
        assert_eq!(escape_input_text("Alex Smith"), "Alex%sSmith");
        assert_eq!(escape_input_text(r#"it's "x""#), r#"it\'s%s\"x\""#);
        assert_eq!(escape_input_text("12345"), "12345");
    }

    #[tokio::test]
    async fn missing_binary_degrades_to_none() {
        let device = AdbDevice::new("/nonexistent/adb-binary", "127.0.0.1:21503");
        assert!(device.run_shell("echo hi", Duration::from_secs(1)).await.is_none());
        assert!(device.snapshot().await.is_empty());
    }
}
