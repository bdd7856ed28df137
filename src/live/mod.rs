mod claims;
mod controller;
mod fan_in;
mod state;

pub use claims::{CaptureClaims, ClaimGuard};
pub use controller::{ActivationReport, LiveCapture, LiveEvent, LIVE_INTERVAL_PARAM};
pub use state::{CaptureStatus, CaptureSummary};
