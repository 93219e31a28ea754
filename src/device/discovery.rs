//! Slot discovery from the device transport.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::jobs::Slot;

/// How to synthesise slots when discovery finds no devices.
#[derive(Debug, Clone, Copy)]
pub struct FallbackSlots {
    pub count: usize,
    pub base_port: u16,
    pub port_step: u16,
}

impl FallbackSlots {
    pub fn generate(&self) -> Vec<Slot> {
        (0..self.count)
            .filter_map(|i| {
                let offset = u16::try_from(i).ok()?.checked_mul(self.port_step)?;
                let port = self.base_port.checked_add(offset)?;
                Some(Slot::from_address(format!("127.0.0.1:{port}")))
            })
            .collect()
    }
}

/// Parse `adb devices` output into slots (only entries in `device` state).
pub fn parse_device_list(output: &str) -> Vec<Slot> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let address = parts.next()?;
            (parts.next()? == "device").then(|| Slot::from_address(address))
        })
        .collect()
}

/// List attached devices, falling back to generated addresses.
pub async fn discover_slots(adb_path: &str, fallback: FallbackSlots) -> Vec<Slot> {
    let listed = tokio::time::timeout(
        Duration::from_secs(10),
        Command::new(adb_path)
            .arg("devices")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match listed {
        Ok(Ok(output)) => {
            let slots = parse_device_list(&String::from_utf8_lossy(&output.stdout));
            if !slots.is_empty() {
                info!(count = slots.len(), "Discovered devices");
                return slots;
            }
            warn!("No attached devices reported");
        }
        Ok(Err(e)) => warn!(error = %e, adb = %adb_path, "Failed to list devices"),
        Err(_) => warn!(adb = %adb_path, "Listing devices timed out"),
    }

    let slots = fallback.generate();
    warn!(count = slots.len(), "Using generated device addresses");
    slots
}
