//! Relay announce ingestion — the bounded, observable candidate table
//!
//! Candidates arrive as announces from the mesh and are kept in a small
//! recency-bounded table. The control loop only ever reads snapshots.

pub mod store;
pub mod types;

pub use store::AnnounceStore;
pub use types::{validate_relay_id, AvailableRelaysState, CandidateRelay};
