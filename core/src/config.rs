//! Control-loop tunables
//!
//! Defaults are the shipped behavior; validation rejects configurations the
//! loop cannot run safely with.

use crate::RelayControlError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayControlConfig {
    /// Whether the loop may pick relays on its own
    pub auto_select_enabled: bool,
    /// Drop the persisted selection when the candidate table empties
    pub clear_selection_on_empty: bool,
    /// Coalescing window for announce-table change notifications
    pub debounce_window: Duration,
    /// How long a live view keeps its upstream after the last observer leaves
    pub subscriber_grace: Duration,
    /// Mandatory stability period after each automatic selection
    pub cooldown: Duration,
    /// Sliding window the loop detector counts selections over
    pub loop_window: Duration,
    /// Selections within the window that count as oscillation
    pub loop_threshold: usize,
    /// First backoff delay; doubles per consecutive detection
    pub backoff_base: Duration,
    /// Ceiling for the exponential backoff
    pub backoff_max: Duration,
    /// Quiet period after which the consecutive-loop counter resets
    pub loop_count_reset_after: Duration,
    /// Caller-side deadline for bridge requests
    pub request_timeout: Duration,
    /// Candidate table bound (top-N by recency)
    pub max_candidates: usize,
}

impl Default for RelayControlConfig {
    fn default() -> Self {
        Self {
            auto_select_enabled: true,
            clear_selection_on_empty: false,
            debounce_window: Duration::from_millis(1_000),
            subscriber_grace: Duration::from_millis(5_000),
            cooldown: Duration::from_secs(30),
            loop_window: Duration::from_secs(60),
            loop_threshold: 3,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(300),
            loop_count_reset_after: Duration::from_secs(180),
            request_timeout: Duration::from_millis(5_000),
            max_candidates: 50,
        }
    }
}

impl RelayControlConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), RelayControlError> {
        if self.debounce_window.is_zero() {
            return Err(RelayControlError::InvalidConfig(
                "debounce_window must be non-zero".to_string(),
            ));
        }
        if self.loop_window.is_zero() {
            return Err(RelayControlError::InvalidConfig(
                "loop_window must be non-zero".to_string(),
            ));
        }
        if self.loop_threshold < 2 {
            return Err(RelayControlError::InvalidConfig(
                "loop_threshold below 2 would flag every selection".to_string(),
            ));
        }
        if self.backoff_base > self.backoff_max {
            return Err(RelayControlError::InvalidConfig(
                "backoff_base exceeds backoff_max".to_string(),
            ));
        }
        if self.backoff_base.is_zero() {
            return Err(RelayControlError::InvalidConfig(
                "backoff_base must be non-zero".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(RelayControlError::InvalidConfig(
                "request_timeout must be non-zero".to_string(),
            ));
        }
        if self.max_candidates == 0 {
            return Err(RelayControlError::InvalidConfig(
                "max_candidates must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
