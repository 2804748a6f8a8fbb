//! Request surface for remote callers
//!
//! UI processes never touch the state machine directly; they hold a
//! `ControlHandle` whose requests are funneled into the machine's command
//! channel. Every request resolves exactly one of success or failure:
//! replies travel over one-shot channels (a sender can complete at most
//! once) and each call carries a single caller-side timeout, so a crashed
//! or hung callee still produces exactly one failure.

use crate::announce::{validate_relay_id, AvailableRelaysState};
use crate::reactive::{LiveView, ViewSubscription};
use crate::selection::machine::ControlCommand;
use crate::selection::RelayLoadState;
use crate::RelayControlError;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Handle to a running control loop.
///
/// Cloneable and cheap; all clones talk to the same machine.
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<ControlCommand>,
    ready: watch::Receiver<bool>,
    relays: LiveView<AvailableRelaysState>,
    timeout: Duration,
}

impl ControlHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<ControlCommand>,
        ready: watch::Receiver<bool>,
        relays: LiveView<AvailableRelaysState>,
        timeout: Duration,
    ) -> Self {
        Self {
            commands,
            ready,
            relays,
            timeout,
        }
    }

    /// Resolve once the machine has rehydrated and will answer requests.
    ///
    /// Fires immediately on connections established after startup, so
    /// callers never need a fixed warm-up delay before their first request.
    pub async fn wait_ready(&self) -> Result<(), RelayControlError> {
        let mut ready = self.ready.clone();
        let wait = async move {
            while !*ready.borrow_and_update() {
                if ready.changed().await.is_err() {
                    return Err(RelayControlError::Disconnected);
                }
            }
            Ok(())
        };
        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| RelayControlError::Timeout)?
    }

    /// Current selection, answered without blocking the caller on any
    /// selection work in progress.
    pub async fn current_selection(&self) -> Result<RelayLoadState, RelayControlError> {
        self.request(|reply| ControlCommand::CurrentSelection { reply })
            .await
    }

    /// Subscribe to selection changes. New subscribers immediately observe
    /// the latest value.
    pub async fn subscribe_selection(
        &self,
    ) -> Result<watch::Receiver<RelayLoadState>, RelayControlError> {
        self.request(|reply| ControlCommand::SubscribeSelection { reply })
            .await
    }

    /// Pin the selection to a relay, or clear the pin with `None`.
    pub async fn set_manual_override(
        &self,
        relay_id: Option<String>,
    ) -> Result<(), RelayControlError> {
        if let Some(relay_id) = &relay_id {
            validate_relay_id(relay_id)?;
        }
        self.request(|reply| ControlCommand::SetManualOverride { relay_id, reply })
            .await?
    }

    /// Enable or disable automatic selection at runtime.
    pub async fn set_auto_select(&self, enabled: bool) -> Result<(), RelayControlError> {
        self.request(|reply| ControlCommand::SetAutoSelect { enabled, reply })
            .await
    }

    /// Observe the live candidate list. The subscription participates in
    /// the distributor's reference counting.
    pub fn subscribe_available_relays(&self) -> ViewSubscription<AvailableRelaysState> {
        self.relays.subscribe()
    }

    /// Ask the machine to stop. Pending requests fail their callers' way.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(ControlCommand::Shutdown).await;
    }

    /// One command round-trip under the caller-side deadline.
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, RelayControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = make(reply_tx);
        let exchange = async {
            self.commands
                .send(command)
                .await
                .map_err(|_| RelayControlError::Disconnected)?;
            reply_rx.await.map_err(|_| RelayControlError::Disconnected)
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Err(_) => Err(RelayControlError::Timeout),
            Ok(result) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Handle wired to nothing useful: commands are accepted but never
    /// answered, like a callee that hung after receiving the request.
    fn hung_handle() -> (
        ControlHandle,
        mpsc::Receiver<ControlCommand>,
        watch::Sender<bool>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (ready_tx, ready_rx) = watch::channel(false);
        let relays = LiveView::new(AvailableRelaysState::Loading, Duration::from_secs(5), |_tx| {
            tokio::spawn(async {})
        });
        (
            ControlHandle::new(
                command_tx,
                ready_rx,
                relays,
                Duration::from_millis(5_000),
            ),
            command_rx,
            ready_tx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_callee_times_out_exactly_once() {
        let (handle, _command_rx, _ready_tx) = hung_handle();
        let result = handle.current_selection().await;
        assert_eq!(result, Err(RelayControlError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_callee_fails_fast() {
        let (handle, command_rx, _ready_tx) = hung_handle();
        drop(command_rx);
        let result = handle.current_selection().await;
        assert_eq!(result, Err(RelayControlError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callee_crash_after_receipt_fails_once() {
        let (handle, mut command_rx, _ready_tx) = hung_handle();
        // Callee takes the request, then dies without replying
        let consumer = tokio::spawn(async move {
            let command = command_rx.recv().await;
            drop(command);
            drop(command_rx);
        });
        let result = handle.current_selection().await;
        assert_eq!(result, Err(RelayControlError::Disconnected));
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_id_validated_at_boundary() {
        let (handle, _command_rx, _ready_tx) = hung_handle();
        let result = handle.set_manual_override(Some("nope".to_string())).await;
        assert!(matches!(result, Err(RelayControlError::InvalidInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_times_out_when_never_ready() {
        let (handle, _command_rx, _ready_tx) = hung_handle();
        assert_eq!(handle.wait_ready().await, Err(RelayControlError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_resolves_once_signalled() {
        let (handle, _command_rx, ready_tx) = hung_handle();
        ready_tx.send(true).unwrap();
        assert_eq!(handle.wait_ready().await, Ok(()));
        // And again immediately for a later connection
        assert_eq!(handle.wait_ready().await, Ok(()));
    }
}
