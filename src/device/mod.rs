//! Device control boundary.
//!
//! Sessions drive a device only through [`DeviceControl`]. Calls never
//! raise: a failed or timed-out call yields `None` or an empty string and
//! the caller's wait loop simply tries again.

pub mod adb;
pub mod discovery;

pub use adb::AdbDevice;
pub use discovery::{FallbackSlots, discover_slots};

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Android key code for backspace.
pub const KEYCODE_DEL: u32 = 67;
/// Android key code for enter.
pub const KEYCODE_ENTER: u32 = 66;

/// Screen coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Element predicate. Every set field must match; `index` picks among
/// multiple matches in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Selector {
    /// Case-insensitive substring of the node.
    pub text: Option<String>,
    pub resource_id: Option<String>,
    pub class_name: Option<String>,
    pub index: usize,
}

impl Selector {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn resource_id(id: impl Into<String>) -> Self {
        Self {
            resource_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn class_name(class: impl Into<String>) -> Self {
        Self {
            class_name: Some(class.into()),
            ..Self::default()
        }
    }

    pub fn nth(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    fn matches(&self, node: &str) -> bool {
        if let Some(text) = &self.text
            && !node.to_lowercase().contains(&text.to_lowercase())
        {
            return false;
        }
        if let Some(id) = &self.resource_id
            && !node.contains(id.as_str())
        {
            return false;
        }
        if let Some(class) = &self.class_name
            && !node.contains(class.as_str())
        {
            return false;
        }
        true
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = self
            .text
            .as_deref()
            .or(self.resource_id.as_deref())
            .or(self.class_name.as_deref())
            .unwrap_or("*");
        if self.index > 0 {
            write!(f, "{label}[{}]", self.index)
        } else {
            write!(f, "{label}")
        }
    }
}

static NODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<node [^>]*>").expect("valid node regex"));
static BOUNDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"bounds="\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]""#).expect("valid bounds regex")
});

/// Locate `selector` in a UI hierarchy snapshot and return the centre of
/// its bounds.
pub fn find_in_snapshot(snapshot: &str, selector: &Selector) -> Option<Point> {
    NODE_RE
        .find_iter(snapshot)
        .map(|m| m.as_str())
        .filter(|node| selector.matches(node))
        .filter_map(|node| {
            let caps = BOUNDS_RE.captures(node)?;
            let coord = |i: usize| caps.get(i)?.as_str().parse::<i32>().ok();
            let (x1, y1, x2, y2) = (coord(1)?, coord(2)?, coord(3)?, coord(4)?);
            Some(Point {
                x: (x1 + x2) / 2,
                y: (y1 + y2) / 2,
            })
        })
        .nth(selector.index)
}

/// Operations a session may perform on its device.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Run a shell command on the device. `None` on failure or timeout.
    async fn run_shell(&self, command: &str, timeout: Duration) -> Option<String>;

    async fn tap(&self, point: Point);

    async fn input_text(&self, text: &str);

    async fn key_event(&self, code: u32);

    /// Current screen content. Empty when unavailable. Element lookup
    /// runs over this with `find_in_snapshot`, one dump per check.
    async fn snapshot(&self) -> String;
}
