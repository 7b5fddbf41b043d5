//! trialsync core library.
//! Client-side mirror of server-authoritative trial and tier state: countdown,
//! trial state store, access gate, and the trial session controller.

pub mod client;
pub mod config;
pub mod controller;
pub mod countdown;
pub mod error;
pub mod events;
pub mod gate;
pub mod state;
pub mod store;
pub mod tier;

pub use client::{BackendClient, Entitlements, Me, SessionLite, StartTrialResponse, UserPlan};
pub use config::TrialSyncConfig;
pub use controller::{StartOutcome, SyncOutcome, TrialPhase, TrialSessionController, TrialView};
pub use countdown::{
    render_ring_svg, Clock, ColorBand, Countdown, CountdownFrame, CountdownHandle,
    CountdownOutcome, CountdownRenderer, CountdownTimer, FrameData, SystemClock,
    DEFAULT_FALLBACK_DURATION,
};
pub use error::{ClientError, StoreError, SyncError, TrialError};
pub use events::{EventBus, TrialEvent};
pub use gate::{
    AccessGate, GateDecision, GateRegistry, GateReport, LockSurface, MemorySurface,
    ReferralTrialPolicy, UserAccessSnapshot,
};
pub use state::{StoredTrialState, TrialState};
pub use store::{KeyValueStore, MemoryStore, SledStore, TrialStore};
pub use tier::{check_tier_access, RequiredTier, Tier, TierScheme};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
