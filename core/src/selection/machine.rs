//! The selection state machine
//!
//! One spawned task owns every mutation of the current selection. Debounced
//! candidate changes, bridge requests and timer expiries all arrive through
//! this task, so transitions never race and selection updates are totally
//! ordered by arrival.

use super::loop_detect::LoopDetector;
use super::policy;
use super::store::{PersistedSelection, SelectionStore};
use crate::announce::{AvailableRelaysState, CandidateRelay};
use crate::config::RelayControlConfig;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::RelayControlError;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// The externally visible selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedRelay {
    pub relay_id: String,
    /// Set by the user rather than the automatic loop
    pub manual: bool,
    /// When this selection became current (Unix seconds)
    pub since: u64,
}

/// Projection of the machine state for observers.
///
/// `Loading` only appears before the machine has rehydrated; after that the
/// value is always `Loaded`, with `None` meaning "settled, nothing
/// selected".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayLoadState {
    Loading,
    Loaded(Option<SelectedRelay>),
}

impl RelayLoadState {
    pub fn relay(&self) -> Option<&SelectedRelay> {
        match self {
            RelayLoadState::Loaded(Some(relay)) => Some(relay),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, RelayLoadState::Loading)
    }
}

/// Internal control-loop state.
///
/// `Selecting` persists across an event-loop turn only when the selection
/// could not be durably recorded; it then retries on the next trigger.
#[derive(Debug, Clone, PartialEq)]
enum SelectionState {
    Idle,
    Selecting { candidate: CandidateRelay },
    Stable { until: Instant },
    BackingOff { until: Instant },
}

/// Requests funneled into the machine's serialization point.
#[derive(Debug)]
pub(crate) enum ControlCommand {
    CurrentSelection {
        reply: oneshot::Sender<RelayLoadState>,
    },
    SubscribeSelection {
        reply: oneshot::Sender<watch::Receiver<RelayLoadState>>,
    },
    SetManualOverride {
        relay_id: Option<String>,
        reply: oneshot::Sender<Result<(), RelayControlError>>,
    },
    SetAutoSelect {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

pub struct SelectionMachine {
    config: RelayControlConfig,
    store: SelectionStore,
    telemetry: TelemetrySink,
    detector: LoopDetector,
    state: SelectionState,
    auto_select: bool,
    manual_override: bool,
    /// Last durably recorded selection — what observers may rely on
    current_relay_id: Option<String>,
    /// Most recent candidate snapshot, kept for override lookups
    last_snapshot: Vec<CandidateRelay>,
    published: watch::Sender<RelayLoadState>,
    ready: watch::Sender<bool>,
}

impl SelectionMachine {
    /// Spawn the machine task. All further interaction goes through the
    /// trigger stream and the command channel.
    pub(crate) fn spawn(
        config: RelayControlConfig,
        store: SelectionStore,
        telemetry: TelemetrySink,
        triggers: mpsc::Receiver<AvailableRelaysState>,
        commands: mpsc::Receiver<ControlCommand>,
        published: watch::Sender<RelayLoadState>,
        ready: watch::Sender<bool>,
    ) -> JoinHandle<()> {
        let detector = LoopDetector::new(&config);
        let auto_select = config.auto_select_enabled;
        let machine = Self {
            config,
            store,
            telemetry,
            detector,
            state: SelectionState::Idle,
            auto_select,
            manual_override: false,
            current_relay_id: None,
            last_snapshot: Vec::new(),
            published,
            ready,
        };
        tokio::spawn(machine.run(triggers, commands))
    }

    async fn run(
        mut self,
        mut triggers: mpsc::Receiver<AvailableRelaysState>,
        mut commands: mpsc::Receiver<ControlCommand>,
    ) {
        self.initialize();

        loop {
            let deadline = self.next_deadline();
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                trigger = triggers.recv() => match trigger {
                    Some(state) => self.on_candidates_changed(state),
                    None => break,
                },
                command = commands.recv() => match command {
                    Some(ControlCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                _ = timer => self.on_deadline(),
            }
        }

        tracing::debug!("selection machine stopped");
    }

    /// Rehydrate from the persisted record so observers never see a
    /// "nothing selected" flash across a restart.
    fn initialize(&mut self) {
        let persisted = match self.store.load() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "could not load persisted selection");
                PersistedSelection::default()
            }
        };

        self.manual_override = persisted.manual_override;
        self.current_relay_id = persisted.current_relay_id.clone();

        let display = persisted.current_relay_id.map(|relay_id| SelectedRelay {
            relay_id,
            manual: persisted.manual_override,
            since: crate::unix_now(),
        });
        if let Some(relay) = &display {
            tracing::info!(relay = %relay.relay_id, manual = relay.manual, "restored selection");
        }
        self.publish(RelayLoadState::Loaded(display));
        let _ = self.ready.send_replace(true);
    }

    fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            SelectionState::Stable { until } | SelectionState::BackingOff { until } => Some(*until),
            _ => None,
        }
    }

    /// Retire an elapsed cooldown or backoff.
    ///
    /// Called lazily from the trigger path as well as from the timer, so a
    /// trigger arriving in the same turn as an expiry is not spuriously
    /// swallowed by the guard.
    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        match &self.state {
            SelectionState::Stable { until } if now >= *until => {
                tracing::trace!("cooldown elapsed");
                self.state = SelectionState::Idle;
            }
            SelectionState::BackingOff { until } if now >= *until => {
                tracing::debug!("backoff elapsed, automatic selection resumes");
                self.state = SelectionState::Idle;
            }
            _ => {}
        }
    }

    fn on_candidates_changed(&mut self, state: AvailableRelaysState) {
        self.expire_deadlines();
        let relays = match state {
            AvailableRelaysState::Loaded(relays) => relays,
            AvailableRelaysState::Loading => return,
            AvailableRelaysState::Unavailable(e) => {
                // Transient; the next debounced trigger retries the query
                tracing::debug!(error = %e, "candidate source unavailable");
                return;
            }
        };
        self.last_snapshot = relays;

        if self.manual_override {
            return;
        }

        match &self.state {
            SelectionState::Idle => {
                if self.auto_select {
                    self.evaluate();
                }
            }
            // Retry a selection whose persist failed, re-ranking against
            // the fresh snapshot
            SelectionState::Selecting { candidate } => {
                let pending = candidate.relay_id.clone();
                tracing::debug!(pending = %pending, "retrying unpersisted selection");
                self.evaluate();
            }
            // Guard: cooldown and backoff swallow triggers even if an
            // upstream layer forgot to stop notifying
            SelectionState::Stable { .. } | SelectionState::BackingOff { .. } => {
                tracing::trace!("trigger ignored while not idle");
            }
        }
    }

    fn evaluate(&mut self) {
        if self.last_snapshot.is_empty() {
            if self.config.clear_selection_on_empty && self.current_relay_id.is_some() {
                let record = PersistedSelection {
                    current_relay_id: None,
                    manual_override: false,
                };
                match self.store.save(&record) {
                    Ok(()) => {
                        tracing::info!("candidate table empty, cleared selection");
                        self.current_relay_id = None;
                        self.publish(RelayLoadState::Loaded(None));
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to clear selection"),
                }
            }
            self.state = SelectionState::Idle;
            return;
        }

        let Some(chosen) = policy::choose(&self.last_snapshot) else {
            self.state = SelectionState::Idle;
            return;
        };
        let chosen = chosen.clone();

        // Re-picking the relay we already have is not a selection event
        if Some(&chosen.relay_id) == self.current_relay_id.as_ref() {
            self.state = SelectionState::Idle;
            return;
        }

        self.commit(chosen);
    }

    fn commit(&mut self, candidate: CandidateRelay) {
        let record = PersistedSelection {
            current_relay_id: Some(candidate.relay_id.clone()),
            manual_override: false,
        };
        if let Err(e) = self.store.save(&record) {
            // Keep exposing the previous persisted value; retry on the next
            // debounced trigger. A half-applied selection never escapes.
            tracing::warn!(relay = %candidate.relay_id, error = %e,
                "selection persist failed, will retry");
            self.state = SelectionState::Selecting { candidate };
            return;
        }

        let now = Instant::now();
        self.current_relay_id = Some(candidate.relay_id.clone());
        self.publish(RelayLoadState::Loaded(Some(SelectedRelay {
            relay_id: candidate.relay_id.clone(),
            manual: false,
            since: crate::unix_now(),
        })));
        tracing::info!(relay = %candidate.relay_id, hops = candidate.hops, "relay selected");

        match self.detector.record_at(now) {
            Some(signal) => {
                self.telemetry.emit(TelemetryEvent::SelectionLoopDetected {
                    count: signal.events_in_window,
                    window_seconds: self.detector.window_seconds(),
                });
                tracing::warn!(
                    delay_secs = signal.delay.as_secs(),
                    consecutive = signal.consecutive,
                    "suspending automatic selection"
                );
                self.state = SelectionState::BackingOff {
                    until: now + signal.delay,
                };
            }
            None => {
                self.state = SelectionState::Stable {
                    until: now + self.config.cooldown,
                };
            }
        }
    }

    fn on_deadline(&mut self) {
        self.expire_deadlines();
    }

    fn on_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::CurrentSelection { reply } => {
                let _ = reply.send(self.published.borrow().clone());
            }
            ControlCommand::SubscribeSelection { reply } => {
                let _ = reply.send(self.published.subscribe());
            }
            ControlCommand::SetManualOverride { relay_id, reply } => {
                let _ = reply.send(self.apply_override(relay_id));
            }
            ControlCommand::SetAutoSelect { enabled, reply } => {
                tracing::info!(enabled, "automatic selection toggled");
                self.auto_select = enabled;
                let _ = reply.send(());
            }
            // Handled by the event loop
            ControlCommand::Shutdown => {}
        }
    }

    fn apply_override(&mut self, relay_id: Option<String>) -> Result<(), RelayControlError> {
        match relay_id {
            Some(relay_id) => {
                let record = PersistedSelection {
                    current_relay_id: Some(relay_id.clone()),
                    manual_override: true,
                };
                self.store.save(&record)?;
                self.manual_override = true;
                self.current_relay_id = Some(relay_id.clone());
                // Pending cooldown or backoff is moot while overridden
                self.state = SelectionState::Idle;
                tracing::info!(relay = %relay_id, "manual override set");
                self.publish(RelayLoadState::Loaded(Some(SelectedRelay {
                    relay_id,
                    manual: true,
                    since: crate::unix_now(),
                })));
                Ok(())
            }
            None => {
                let record = PersistedSelection {
                    current_relay_id: self.current_relay_id.clone(),
                    manual_override: false,
                };
                self.store.save(&record)?;
                self.manual_override = false;
                self.state = SelectionState::Idle;
                tracing::info!("manual override cleared");
                let display = self.current_relay_id.clone().map(|relay_id| SelectedRelay {
                    relay_id,
                    manual: false,
                    since: crate::unix_now(),
                });
                self.publish(RelayLoadState::Loaded(display));
                Ok(())
            }
        }
    }

    fn publish(&self, next: RelayLoadState) {
        self.published.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
