use serde::{Deserialize, Serialize};

/// Lifecycle of one live capture. `Stopped` is terminal; a new capture needs
/// a new `LiveCapture`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CaptureStatus {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// Counters reported when a capture stops.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSummary {
    pub delivered: u64,
    pub stored: u64,
    pub store_failures: u64,
}
