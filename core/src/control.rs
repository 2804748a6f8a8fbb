//! Control-loop assembly
//!
//! One `RelayControl` per process owns the real state machine. Everything
//! else, including other processes, holds `ControlHandle` projections.
//! There is no static or ambient instance.

use crate::announce::AnnounceStore;
use crate::bridge::ControlHandle;
use crate::config::RelayControlConfig;
use crate::reactive::{debounce, RelayDistributor};
use crate::selection::machine::ControlCommand;
use crate::selection::{RelayLoadState, SelectionMachine, SelectionStore};
use crate::store::StorageBackend;
use crate::telemetry::TelemetrySink;
use crate::RelayControlError;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct RelayControl {
    handle: ControlHandle,
    distributor: RelayDistributor,
    telemetry: TelemetrySink,
    machine: JoinHandle<()>,
}

impl RelayControl {
    /// Build and start the control loop. Must be called from within a Tokio
    /// runtime; the machine task and the distributor's upstream live on it.
    pub fn start(
        announces: Arc<AnnounceStore>,
        selection_backend: Arc<dyn StorageBackend>,
        config: RelayControlConfig,
    ) -> Result<Self, RelayControlError> {
        config.validate()?;

        let telemetry = TelemetrySink::default();
        let distributor = RelayDistributor::new(announces, &config);

        // The machine consumes the same view the bridge hands out, one
        // debounce window behind the raw table
        let triggers = debounce(distributor.subscribe_available(), config.debounce_window);

        let (command_tx, command_rx) = mpsc::channel(64);
        let (published_tx, _) = watch::channel(RelayLoadState::Loading);
        let (ready_tx, ready_rx) = watch::channel(false);

        let machine = SelectionMachine::spawn(
            config.clone(),
            SelectionStore::new(selection_backend),
            telemetry.clone(),
            triggers,
            command_rx,
            published_tx,
            ready_tx,
        );

        let handle = ControlHandle::new(
            command_tx,
            ready_rx,
            distributor.available_relays().clone(),
            config.request_timeout,
        );

        tracing::info!("relay control loop started");
        Ok(Self {
            handle,
            distributor,
            telemetry,
            machine,
        })
    }

    /// A projection for callers, including remote ones.
    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    pub fn distributor(&self) -> &RelayDistributor {
        &self.distributor
    }

    pub fn telemetry(&self) -> &TelemetrySink {
        &self.telemetry
    }

    /// Stop the machine, then tear the reactive layer down immediately so
    /// backing storage is released without waiting out grace periods.
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        if let Err(e) = self.machine.await {
            tracing::warn!(error = %e, "selection machine did not stop cleanly");
        }
        self.distributor.shutdown();
        tracing::info!("relay control loop stopped");
    }
}
