//! Candidate ranking policy
//!
//! Fewest hops wins. Ties go to user favorites, then to the relay
//! advertising the highest transfer limit, and finally to the smallest
//! identifier so a given candidate set always ranks the same way.

use crate::announce::CandidateRelay;
use std::cmp::Reverse;

/// Pick the best candidate from a snapshot, if any.
pub fn choose(candidates: &[CandidateRelay]) -> Option<&CandidateRelay> {
    candidates.iter().min_by_key(|relay| {
        (
            relay.hops,
            Reverse(relay.favorite),
            Reverse(relay.transfer_limit),
            relay.relay_id.clone(),
        )
    })
}
