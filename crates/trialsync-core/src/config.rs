//! Client configuration.
//!
//! Precedence: env `TRIALSYNC_CONFIG` path > `config/trialsync` > defaults, then
//! `TRIALSYNC__*` environment overrides (e.g. `TRIALSYNC__API_BASE_URL`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::gate::{GateRegistry, ReferralTrialPolicy};
use crate::tier::{RequiredTier, Tier, TierScheme};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSyncConfig {
    /// Backend origin, e.g. `https://companion.example.com`.
    pub api_base_url: String,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Sled directory standing in for browser local storage.
    pub storage_path: String,
    /// Seconds between `/api/session-lite` polls.
    pub poll_interval_secs: u64,
    /// Countdown repaint interval.
    pub tick_millis: u64,
    /// Trial length assumed when the start timestamp is missing.
    pub fallback_duration_secs: u64,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub tier_scheme: TierScheme,
    #[serde(default)]
    pub referral_trial_policy: ReferralTrialPolicy,
    /// Gated element id → required tier (`bronze`..`gold`, `free`..`max`, or `referral`).
    #[serde(default)]
    pub gated_elements: BTreeMap<String, String>,
}

impl Default for TrialSyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
            auth_token: None,
            storage_path: "./data/trialsync".to_string(),
            poll_interval_secs: 30,
            tick_millis: 1000,
            fallback_duration_secs: 5 * 60 * 60,
            request_timeout_secs: 30,
            tier_scheme: TierScheme::Metal,
            referral_trial_policy: ReferralTrialPolicy::TrialDoesNotUnlock,
            gated_elements: BTreeMap::new(),
        }
    }
}

impl TrialSyncConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("TRIALSYNC_CONFIG").unwrap_or_else(|_| "config/trialsync".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Defaults, then `path` (with or without `.toml`) if present, then environment.
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let d = Self::default();
        let builder = config::Config::builder()
            .set_default("api_base_url", d.api_base_url)?
            .set_default("storage_path", d.storage_path)?
            .set_default("poll_interval_secs", d.poll_interval_secs as i64)?
            .set_default("tick_millis", d.tick_millis as i64)?
            .set_default("fallback_duration_secs", d.fallback_duration_secs as i64)?
            .set_default("request_timeout_secs", d.request_timeout_secs as i64)?
            .set_default("tier_scheme", "metal")?
            .set_default("referral_trial_policy", "trial_does_not_unlock")?;

        let builder = if path.exists() || path.with_extension("toml").exists() {
            builder.add_source(config::File::with_name(&path.to_string_lossy()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("TRIALSYNC").separator("__"))
            .build()?;

        built.try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(10))
    }

    pub fn fallback_duration(&self) -> Duration {
        Duration::from_secs(self.fallback_duration_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Tier name under the configured scheme.
    pub fn tier_name(&self, tier: Tier) -> &'static str {
        tier.name(self.tier_scheme)
    }

    /// Gate registry from `gated_elements`; unparsable requirements are skipped.
    pub fn registry(&self) -> GateRegistry {
        let mut registry = GateRegistry::new();
        for (id, required) in &self.gated_elements {
            match required.parse::<RequiredTier>() {
                Ok(r) => {
                    registry.register(id.clone(), r);
                }
                Err(e) => tracing::warn!(element = %id, error = %e, "skipping gated element"),
            }
        }
        registry
    }
}
