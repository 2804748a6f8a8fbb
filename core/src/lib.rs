// MeshRelay — relay selection spine
//
// "Pick a relay, stand by it, and never let the mesh's churn
//  reach the person holding the phone."
//
// The candidate table fans out through debounced live views into a single
// state machine that owns the current selection; everything else holds a
// handle.

pub mod announce;
pub mod bridge;
pub mod config;
pub mod control;
pub mod reactive;
pub mod selection;
pub mod store;
pub mod telemetry;

use thiserror::Error;

pub use announce::{AnnounceStore, AvailableRelaysState, CandidateRelay};
pub use bridge::ControlHandle;
pub use config::RelayControlConfig;
pub use control::RelayControl;
pub use selection::{RelayLoadState, SelectedRelay};
pub use telemetry::{TelemetryEvent, TelemetrySink};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RelayControlError {
    /// Durable write failed; the previously persisted value stays
    /// authoritative until a retry succeeds
    #[error("storage error: {0}")]
    Storage(String),
    /// Candidate source momentarily unreadable; resolved by the next
    /// debounced trigger
    #[error("candidate query failed: {0}")]
    QueryFailed(String),
    /// Caller-side deadline elapsed without a reply
    #[error("request timed out")]
    Timeout,
    /// The control loop is gone; the request completed with this single
    /// failure instead of hanging
    #[error("control loop not running")]
    Disconnected,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_now_is_sane() {
        // After 2020, before 2100
        let now = unix_now();
        assert!(now > 1_577_836_800);
        assert!(now < 4_102_444_800);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            RelayControlError::Timeout.to_string(),
            "request timed out"
        );
        assert_eq!(
            RelayControlError::Storage("disk full".to_string()).to_string(),
            "storage error: disk full"
        );
    }
}
