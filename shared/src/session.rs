use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, instrument, warn};

use crate::capabilities::{CancelHandle, HttpShell, KvBackend};
use crate::config::{ClientConfig, ConfigError};
use crate::device_store::DeviceStore;
use crate::error::SessionError;
use crate::history::{HistoryState, HistoryView};
use crate::model::{
    Driver, EndTripPayload, EntryId, IdempotencyKey, OfflineQueueEntry, ProblemReport,
    QueuedAction, StartTripPayload, TripSession,
};
use crate::problem_queue::{ProblemDraft, ProblemQueue};
use crate::replay::{OfflineReplayer, ReplayReport};
use crate::sync_client::{Ack, SyncClient, SyncOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    LoggedOut,
    Idle,
    TripActive,
    /// Only held while the trip-end call is in flight.
    TripEnding,
}

impl SessionState {
    /// Cold-start state as the store describes it.
    pub fn derive<K: KvBackend>(store: &DeviceStore<K>) -> Self {
        if !store.is_logged_in() {
            SessionState::LoggedOut
        } else if store.has_active_trip() {
            SessionState::TripActive
        } else {
            SessionState::Idle
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::LoggedOut => "logged out",
            SessionState::Idle => "idle",
            SessionState::TripActive => "on a trip",
            SessionState::TripEnding => "ending a trip",
        })
    }
}

/// Why an action went to the offline queue instead of the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum QueueCause {
    Unreachable { reason: String },
    Rejected { message: String, status: u16 },
    /// Not sent: older actions were still queued and could not be replayed.
    Behind { ahead: usize },
}

/// Result of a trip or problem action. The local transition has happened
/// either way; this says whether the server has it yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ActionOutcome {
    Delivered {
        message: Option<String>,
    },
    Queued {
        entry_id: EntryId,
        cause: QueueCause,
    },
}

impl ActionOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, ActionOutcome::Delivered { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTripSummary {
    pub vehicle_number: String,
    pub start_time: DateTime<Utc>,
    pub elapsed: String,
}

/// Everything the driver's home screen shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub state: SessionState,
    pub driver_name: Option<String>,
    pub registration_number: Option<String>,
    pub active_trip: Option<ActiveTripSummary>,
    pub pending_problem_count: usize,
    pub offline_queue_len: usize,
    pub dead_letter_count: usize,
    pub online: bool,
    pub last_sync: Option<DateTime<Utc>>,
}

/// The driver's session on this device.
///
/// Every action takes `&mut self`, so actions never overlap. A network failure
/// never blocks a trip transition: the local state moves on and the action is
/// queued for replay.
pub struct Session<K: KvBackend, S: HttpShell> {
    store: DeviceStore<K>,
    client: SyncClient<S>,
    replayer: OfflineReplayer,
    history: HistoryView,
    state: SessionState,
    online: bool,
}

impl<K: KvBackend, S: HttpShell> Session<K, S> {
    pub fn new(
        store: DeviceStore<K>,
        shell: S,
        config: &ClientConfig,
    ) -> Result<Self, ConfigError> {
        let client = SyncClient::new(shell, config)?;
        let replayer = OfflineReplayer::new(config.replay.clone())?;
        let state = SessionState::derive(&store);
        info!(state = %state, "session restored");
        Ok(Self {
            store,
            client,
            replayer,
            history: HistoryView::new(),
            state,
            online: true,
        })
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            // A trip end that never finished (its future was dropped) left
            // the store untouched.
            SessionState::TripEnding => SessionState::derive(&self.store),
            state => state,
        }
    }

    pub fn store(&self) -> &DeviceStore<K> {
        &self.store
    }

    pub fn client(&self) -> &SyncClient<S> {
        &self.client
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.client.cancel_handle()
    }

    pub fn history(&self) -> &HistoryView {
        &self.history
    }

    pub fn driver(&self) -> Option<Driver> {
        self.store.driver()
    }

    pub fn current_trip(&self) -> Option<TripSession> {
        self.store.trip()
    }

    pub fn pending_problems(&self) -> Vec<ProblemReport> {
        self.store.pending_problems()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    #[instrument(skip(self))]
    pub async fn login(&mut self, registration_number: &str) -> Result<Driver, SessionError> {
        self.expect_state(&[SessionState::LoggedOut], "log in")?;
        let registration_number = registration_number.trim();
        if registration_number.is_empty() {
            return Err(SessionError::MissingField {
                field: "registration_number",
            });
        }

        match self.client.login(registration_number).await {
            SyncOutcome::Success(name) => {
                let driver = Driver {
                    registration_number: registration_number.to_string(),
                    name,
                    logged_in: true,
                };
                self.store.set_driver(&driver);
                self.state = SessionState::Idle;
                info!("driver logged in");
                Ok(driver)
            }
            SyncOutcome::ServerRejected { message, .. } => {
                warn!("login rejected");
                Err(SessionError::LoginRejected { message })
            }
            SyncOutcome::Unreachable { reason } => {
                warn!(reason = %reason, "login failed, server unreachable");
                Err(SessionError::LoginUnreachable { reason })
            }
        }
    }

    #[instrument(skip(self, now))]
    pub async fn start_trip(
        &mut self,
        vehicle_number: &str,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome, SessionError> {
        self.expect_state(&[SessionState::Idle], "start a trip")?;
        let vehicle_number = vehicle_number.trim();
        if vehicle_number.is_empty() {
            return Err(SessionError::MissingField {
                field: "vehicle_number",
            });
        }
        let driver = self.current_driver()?;

        let trip = TripSession::start(vehicle_number, &driver.registration_number, now);
        let payload = StartTripPayload {
            vehicle_number: trip.vehicle_number.clone(),
            driver_number: trip.driver_number.clone(),
            timestamp: now,
        };
        let ahead = self.catch_up(now).await;
        let outcome = self.submit(QueuedAction::StartTrip(payload), ahead, now).await;

        self.store.set_trip(&trip);
        self.state = SessionState::TripActive;
        info!(trip_id = %trip.id, "trip started");

        Ok(outcome)
    }

    #[instrument(skip(self, draft, now))]
    pub async fn report_problem(
        &mut self,
        draft: ProblemDraft,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome, SessionError> {
        self.expect_state(&[SessionState::TripActive], "report a problem")?;
        let trip = self.current_trip_or_err()?;
        let driver = self.current_driver()?;
        let report = draft.into_report(&trip.vehicle_number, &driver.registration_number, now)?;

        let ahead = self.catch_up(now).await;
        let outcome = self
            .submit(QueuedAction::ReportProblem(report.clone()), ahead, now)
            .await;
        if !outcome.is_delivered() {
            ProblemQueue::new(&mut self.store).add(&report);
        }
        info!(problem_id = %report.id, severity = %report.severity, "problem reported");

        Ok(outcome)
    }

    #[instrument(skip(self, now))]
    pub async fn end_trip(&mut self, now: DateTime<Utc>) -> Result<ActionOutcome, SessionError> {
        self.expect_state(&[SessionState::TripActive], "end a trip")?;
        let mut trip = self.current_trip_or_err()?;
        let driver = self.current_driver()?;

        self.state = SessionState::TripEnding;
        // Replaying first may deliver queued reports and take them off the
        // pending list, so it runs before the bundle is built.
        let ahead = self.catch_up(now).await;

        // Read, not drained: if this call is abandoned mid-flight the pending
        // list must still be there.
        let problems = ProblemQueue::new(&mut self.store).list();
        let bundled: Vec<_> = problems.iter().map(|p| p.id.clone()).collect();
        let payload = EndTripPayload {
            vehicle_number: trip.vehicle_number.clone(),
            driver_number: driver.registration_number.clone(),
            timestamp: now,
            problems,
        };
        let result = self.submit(QueuedAction::EndTrip(payload), ahead, now).await;

        // The bundle replaces any individual submission of the same problems.
        let superseded = self
            .store
            .remove_offline_entries_where(|e| bundled.iter().any(|id| e.reports_problem(id)));
        if superseded > 0 {
            info!(superseded, "dropped queued problem reports folded into trip end");
        }

        trip.finish(now);
        ProblemQueue::new(&mut self.store).drain();
        self.store.clear_trip();
        self.state = SessionState::Idle;
        info!(
            trip_id = %trip.id,
            problems = bundled.len(),
            duration = %trip.elapsed_label(now),
            "trip ended"
        );

        Ok(result)
    }

    /// Clears driver, trip and pending problems. The offline queue is kept.
    #[instrument(skip(self))]
    pub fn logout(&mut self) -> Result<(), SessionError> {
        self.expect_state(&[SessionState::Idle, SessionState::TripActive], "log out")?;
        if self.store.has_active_trip() {
            warn!("logging out with an active trip");
        }
        self.store.clear_driver();
        self.store.clear_trip();
        self.store.clear_pending_problems();
        self.history = HistoryView::new();
        self.state = SessionState::LoggedOut;
        info!("driver logged out");
        Ok(())
    }

    /// Loads the logged-in driver's history into [`Session::history`].
    pub async fn load_history(&mut self) -> Result<&HistoryState, SessionError> {
        self.expect_state(
            &[SessionState::Idle, SessionState::TripActive],
            "view history",
        )?;
        let driver = self.current_driver()?;
        Ok(self
            .history
            .load(&self.client, &driver.registration_number)
            .await)
    }

    /// Records a connectivity change. Coming back online replays the whole
    /// queue, ignoring any pending backoff, and then sends a heartbeat.
    #[instrument(skip(self, now))]
    pub async fn set_connectivity(
        &mut self,
        online: bool,
        now: DateTime<Utc>,
    ) -> Option<ReplayReport> {
        let was_online = std::mem::replace(&mut self.online, online);
        if was_online || !online {
            return None;
        }
        let rescheduled = self.store.clear_backoff();
        info!(rescheduled, "connectivity restored");
        let report = self.replay_due(now).await;
        self.sync_heartbeat(now).await;
        Some(report)
    }

    /// Replays whatever in the offline queue is due at `now`.
    pub async fn replay_due(&mut self, now: DateTime<Utc>) -> ReplayReport {
        self.replayer.replay(&mut self.store, &self.client, now).await
    }

    #[instrument(skip(self, now))]
    pub async fn sync_heartbeat(&mut self, now: DateTime<Utc>) -> SyncOutcome<Ack> {
        let outcome = self.client.sync(now, &IdempotencyKey::generate()).await;
        if outcome.is_success() {
            self.store.set_last_sync(now);
        }
        outcome
    }

    pub fn dashboard(&self, now: DateTime<Utc>) -> Dashboard {
        let driver = self.store.driver().filter(|d| d.logged_in);
        let active_trip = self
            .store
            .trip()
            .filter(|t| t.is_active)
            .map(|t| ActiveTripSummary {
                elapsed: t.elapsed_label(now),
                vehicle_number: t.vehicle_number,
                start_time: t.start_time,
            });
        Dashboard {
            state: self.state(),
            driver_name: driver.as_ref().map(|d| d.name.clone()),
            registration_number: driver.map(|d| d.registration_number),
            active_trip,
            pending_problem_count: self.store.pending_problems().len(),
            offline_queue_len: self.store.offline_queue().len(),
            dead_letter_count: self.store.dead_letters().len(),
            online: self.online,
            last_sync: self.store.last_sync(),
        }
    }

    fn expect_state(
        &mut self,
        allowed: &[SessionState],
        action: &'static str,
    ) -> Result<(), SessionError> {
        self.state = self.state();
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                state: self.state,
                action,
            })
        }
    }

    fn current_driver(&self) -> Result<Driver, SessionError> {
        self.store
            .driver()
            .filter(|d| d.logged_in)
            .ok_or(SessionError::InvalidTransition {
                state: SessionState::LoggedOut,
                action: "continue without a driver",
            })
    }

    fn current_trip_or_err(&self) -> Result<TripSession, SessionError> {
        self.store
            .trip()
            .filter(|t| t.is_active)
            .ok_or(SessionError::InvalidTransition {
                state: SessionState::Idle,
                action: "continue without an active trip",
            })
    }

    /// Replays anything still queued so a new action cannot overtake it.
    /// Returns how many entries are still waiting.
    async fn catch_up(&mut self, now: DateTime<Utc>) -> usize {
        if self.store.offline_queue().is_empty() {
            return 0;
        }
        self.replay_due(now).await.remaining
    }

    /// Sends `action` unless `ahead` older entries are still queued, in which
    /// case it joins the end of the queue unsent.
    async fn submit(
        &mut self,
        action: QueuedAction,
        ahead: usize,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        let key = IdempotencyKey::generate();
        if ahead > 0 {
            return self.enqueue(action, key, QueueCause::Behind { ahead }, now);
        }

        let cause = match self.client.deliver(&action, &key).await {
            SyncOutcome::Success(ack) => {
                return ActionOutcome::Delivered {
                    message: ack.message,
                }
            }
            SyncOutcome::ServerRejected { message, status } => {
                QueueCause::Rejected { message, status }
            }
            SyncOutcome::Unreachable { reason } => QueueCause::Unreachable { reason },
        };
        self.enqueue(action, key, cause, now)
    }

    fn enqueue(
        &mut self,
        action: QueuedAction,
        key: IdempotencyKey,
        cause: QueueCause,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        let entry = OfflineQueueEntry::new(action, key, now);
        warn!(
            entry_id = %entry.id,
            action = entry.action.tag(),
            cause = ?cause,
            "action queued for replay"
        );
        self.store.add_to_offline_queue(&entry);
        ActionOutcome::Queued {
            entry_id: entry.id,
            cause,
        }
    }
}
