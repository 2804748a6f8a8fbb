//! Candidate relay records and the list states derived from them

use crate::RelayControlError;
use serde::{Deserialize, Serialize};

/// Relay identifiers are hex-encoded 16-byte destination hashes.
pub const RELAY_ID_HEX_LEN: usize = 32;

/// A relay peer eligible for automatic selection.
///
/// One record per `relay_id`; re-announces overwrite the previous record.
/// Everything the selection policy looks at is captured here so each
/// evaluation works on an immutable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRelay {
    /// Hex-encoded destination hash — canonical identity
    pub relay_id: String,
    /// Human-readable name carried in the announce app data, if any
    pub display_name: Option<String>,
    /// Last time an announce was received (Unix seconds)
    pub last_seen: u64,
    /// Path length to the relay; lower is better
    pub hops: u8,
    /// Advertised per-transfer limit in KB; higher is better
    pub transfer_limit: u32,
    /// User-pinned favorite, wins ties regardless of cost
    pub favorite: bool,
    /// Name of the interface the announce arrived on
    pub receiving_interface: Option<String>,
}

impl CandidateRelay {
    pub fn new(relay_id: impl Into<String>, hops: u8) -> Self {
        Self {
            relay_id: relay_id.into(),
            display_name: None,
            last_seen: crate::unix_now(),
            hops,
            transfer_limit: 0,
            favorite: false,
            receiving_interface: None,
        }
    }

    /// Update last seen time to now
    pub fn mark_seen(&mut self) {
        self.last_seen = crate::unix_now();
    }
}

/// Validate a relay identifier at an API boundary.
pub fn validate_relay_id(relay_id: &str) -> Result<(), RelayControlError> {
    if relay_id.len() != RELAY_ID_HEX_LEN {
        return Err(RelayControlError::InvalidInput(format!(
            "relay id must be {} hex chars, got {}",
            RELAY_ID_HEX_LEN,
            relay_id.len()
        )));
    }
    hex::decode(relay_id)
        .map(|_| ())
        .map_err(|_| RelayControlError::InvalidInput("relay id is not valid hex".to_string()))
}

/// Candidate list as observed downstream of the distributor.
///
/// `Unavailable` is the in-band representation of a failed candidate query;
/// errors never cross the subscription boundary as panics or `Err` values.
#[derive(Debug, Clone, PartialEq)]
pub enum AvailableRelaysState {
    Loading,
    Loaded(Vec<CandidateRelay>),
    Unavailable(String),
}

impl AvailableRelaysState {
    pub fn relays(&self) -> Option<&[CandidateRelay]> {
        match self {
            AvailableRelaysState::Loaded(relays) => Some(relays),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, AvailableRelaysState::Loading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_relay_id_accepts_destination_hash() {
        assert!(validate_relay_id("00112233445566778899aabbccddeeff").is_ok());
    }

    #[test]
    fn test_validate_relay_id_rejects_wrong_length() {
        assert!(validate_relay_id("0011").is_err());
        assert!(validate_relay_id("").is_err());
    }

    #[test]
    fn test_validate_relay_id_rejects_non_hex() {
        assert!(validate_relay_id("zz112233445566778899aabbccddeeff").is_err());
    }

    #[test]
    fn test_candidate_defaults() {
        let relay = CandidateRelay::new("00112233445566778899aabbccddeeff", 2);
        assert_eq!(relay.hops, 2);
        assert!(!relay.favorite);
        assert!(relay.last_seen > 0);
    }

    #[test]
    fn test_mark_seen_advances() {
        let mut relay = CandidateRelay::new("00112233445566778899aabbccddeeff", 1);
        let before = relay.last_seen;
        relay.mark_seen();
        assert!(relay.last_seen >= before);
    }
}
