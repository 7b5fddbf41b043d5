//! Trial Session Controller: start, restore, sync and expire a trial.
//!
//! Per tab the controller moves `Idle → Starting → {Active, Failed}`; `Failed`
//! is announced with [`TrialEvent::StartFailed`] and drops back to `Idle` with the
//! button re-enabled. `Active` returns to `Idle` on expiry. View changes go out on
//! a `watch` channel and trial changes on the [`EventBus`], so nothing needs a page
//! reload to pick them up.

use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use crate::client::BackendClient;
use crate::countdown::{Countdown, DEFAULT_FALLBACK_DURATION};
use crate::error::SyncError;
use crate::events::{EventBus, TrialEvent};
use crate::gate::UserAccessSnapshot;
use crate::state::{StoredTrialState, TrialState};
use crate::store::TrialStore;
use crate::tier::Tier;

pub const GENERIC_START_ERROR: &str = "Could not start trial. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    Idle,
    Starting,
    Active,
    Failed,
}

/// What the start-trial widget should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialView {
    pub button_visible: bool,
    pub button_enabled: bool,
    pub active_styling: bool,
    pub status_text: Option<String>,
}

impl TrialView {
    pub fn idle(status_text: Option<String>) -> Self {
        Self {
            button_visible: true,
            button_enabled: true,
            active_styling: false,
            status_text,
        }
    }

    fn starting() -> Self {
        Self {
            button_visible: true,
            button_enabled: false,
            active_styling: false,
            status_text: Some("Starting trial…".to_string()),
        }
    }

    fn active() -> Self {
        Self {
            button_visible: false,
            button_enabled: false,
            active_styling: true,
            status_text: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(TrialState),
    Failed(String),
    /// A start is already in flight or a trial is running.
    Ignored(TrialPhase),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Active(TrialState),
    Inactive,
    /// The server did not give a usable answer; local state was left alone.
    Skipped,
}

pub struct TrialSessionController {
    client: BackendClient,
    store: Arc<TrialStore>,
    events: EventBus,
    phase: Mutex<TrialPhase>,
    view: watch::Sender<TrialView>,
    fallback: Duration,
}

impl TrialSessionController {
    pub fn new(client: BackendClient, store: Arc<TrialStore>, events: EventBus) -> Self {
        let (view, _rx) = watch::channel(TrialView::idle(None));
        Self {
            client,
            store,
            events,
            phase: Mutex::new(TrialPhase::Idle),
            view,
            fallback: DEFAULT_FALLBACK_DURATION,
        }
    }

    /// Trial length assumed for a cached trial with no usable start.
    pub fn with_fallback_duration(mut self, fallback: Duration) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn phase(&self) -> TrialPhase {
        *self.lock_phase()
    }

    pub fn view(&self) -> TrialView {
        self.view.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<TrialView> {
        self.view.subscribe()
    }

    pub fn store(&self) -> &Arc<TrialStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// POSTs the start-trial endpoint once. No retry; a failure re-enables the button.
    pub async fn start_trial(&self) -> StartOutcome {
        {
            let mut phase = self.lock_phase();
            match *phase {
                TrialPhase::Starting | TrialPhase::Active => return StartOutcome::Ignored(*phase),
                TrialPhase::Idle | TrialPhase::Failed => *phase = TrialPhase::Starting,
            }
        }
        self.view.send_replace(TrialView::starting());
        tracing::info!(backend = %self.client.base_url(), "starting trial");

        let result = match self.client.start_trial().await {
            Ok(resp) if resp.succeeded() => resp
                .trial_state()
                .map_err(|e| format!("Trial start failed: {}", e)),
            Ok(resp) => Err(resp
                .error
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| GENERIC_START_ERROR.to_string())),
            Err(e) => {
                tracing::warn!(error = %e, "start-trial request failed");
                Err(GENERIC_START_ERROR.to_string())
            }
        };

        match result {
            Ok(state) => {
                self.activate(state.clone());
                tracing::info!(expires_at = %state.expires_at, "trial started");
                self.events.publish(TrialEvent::Started(state.clone()));
                StartOutcome::Started(state)
            }
            Err(message) => {
                self.set_phase(TrialPhase::Failed);
                tracing::warn!(status = %message, "trial start rejected");
                self.events.publish(TrialEvent::StartFailed(message.clone()));
                self.set_phase(TrialPhase::Idle);
                self.view.send_replace(TrialView::idle(Some(message.clone())));
                StartOutcome::Failed(message)
            }
        }
    }

    /// Picks up a trial cached by an earlier run. A cache with the active flag and a
    /// live expiry is kept even without a start time; anything else is cleared.
    pub fn restore(&self) -> Option<TrialState> {
        let stored = match self.store.load() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "trial store unreadable");
                return None;
            }
        };
        if stored.is_empty() {
            return None;
        }
        match self.recover(&stored) {
            Some(state) => {
                self.set_phase(TrialPhase::Active);
                self.view.send_replace(TrialView::active());
                tracing::info!(expires_at = %state.expires_at, "restored cached trial");
                Some(state)
            }
            None => {
                tracing::info!("discarding inactive or expired trial state");
                self.clear_store();
                None
            }
        }
    }

    /// Live trial from cached strings; the start falls back to `expires_at - fallback`.
    fn recover(&self, stored: &StoredTrialState) -> Option<TrialState> {
        if !stored.is_active() {
            return None;
        }
        let countdown = Countdown::parse(
            stored.expires_at.as_deref()?,
            stored.started_at.as_deref(),
            self.fallback,
        );
        let (started_at, expires_at) = (countdown.started_at()?, countdown.expires_at()?);
        if Utc::now() >= expires_at {
            return None;
        }
        let plan_limits_from = match stored.plan_limits_from.as_deref().map(str::parse::<Tier>) {
            Some(Ok(t)) => t,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "cached plan tier unreadable; assuming gold");
                Tier::Gold
            }
            None => Tier::Gold,
        };
        Some(TrialState {
            active: true,
            started_at,
            expires_at,
            plan_limits_from,
        })
    }

    /// Mirrors `/api/session-lite` into the store. The last successful fetch wins.
    pub async fn sync_session(&self) -> Result<SyncOutcome, SyncError> {
        let session = self.client.session_lite().await?;
        if !session.ok {
            tracing::debug!("session-lite returned ok=false; keeping local state");
            return Ok(SyncOutcome::Skipped);
        }
        match session.trial_state() {
            Some(Ok(state)) => {
                if self.phase() != TrialPhase::Starting {
                    self.activate(state.clone());
                }
                self.events.publish(TrialEvent::Synced { active: true });
                Ok(SyncOutcome::Active(state))
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "session reports an unusable trial");
                Ok(SyncOutcome::Skipped)
            }
            None => {
                let was_cached = self.store.load().map(|s| !s.is_empty()).unwrap_or(true);
                if was_cached {
                    self.clear_store();
                    self.events.publish(TrialEvent::Cleared);
                }
                if self.phase() == TrialPhase::Active {
                    self.set_phase(TrialPhase::Idle);
                    self.view.send_replace(TrialView::idle(None));
                }
                self.events.publish(TrialEvent::Synced { active: false });
                Ok(SyncOutcome::Inactive)
            }
        }
    }

    /// Access snapshot for this page load, from `/api/user-plan`.
    pub async fn refresh_access(&self) -> Result<UserAccessSnapshot, SyncError> {
        let plan = self.client.user_plan().await?;
        Ok(plan.snapshot()?)
    }

    /// Countdown hit zero: the start button comes back.
    pub fn on_expired(&self) {
        let mut phase = self.lock_phase();
        if *phase == TrialPhase::Active {
            *phase = TrialPhase::Idle;
            drop(phase);
            self.view.send_replace(TrialView::idle(None));
            tracing::info!("trial expired; start button restored");
        }
    }

    fn activate(&self, state: TrialState) {
        if let Err(e) = self.store.save(&state) {
            tracing::warn!(error = %e, "failed to persist trial state");
        }
        self.set_phase(TrialPhase::Active);
        self.view.send_replace(TrialView::active());
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            tracing::warn!(error = %e, "failed to clear trial state");
        }
    }

    fn set_phase(&self, next: TrialPhase) {
        *self.lock_phase() = next;
    }

    fn lock_phase(&self) -> MutexGuard<'_, TrialPhase> {
        self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }
}
