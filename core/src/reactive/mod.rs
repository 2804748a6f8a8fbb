//! Reactive distribution layer
//!
//! Live views fan the announce table out to observers with explicit
//! start/stop lifecycle; the debouncer keeps the control loop from
//! re-evaluating on every raw table change.

pub mod debounce;
pub mod distributor;

pub use debounce::{debounce, debounce_receiver};
pub use distributor::{LiveView, RelayDistributor, ViewSubscription};
