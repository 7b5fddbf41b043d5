//! Backend client for the trial, session and plan endpoints.
//!
//! Response bodies vary between deployments, so every field is defaulted and
//! partial JSON still decodes. A non-2xx response whose body decodes is handed back
//! as-is (the `ok` flag carries the failure); anything else is a [`ClientError`].

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{ClientError, TrialError};
use crate::gate::UserAccessSnapshot;
use crate::state::TrialState;
use crate::tier::Tier;

pub const START_TRIAL_PATH: &str = "/api/start-trial";
pub const SESSION_LITE_PATH: &str = "/api/session-lite";
pub const USER_PLAN_PATH: &str = "/api/user-plan";
pub const ME_PATH: &str = "/v1/me";
pub const ENTITLEMENTS_PATH: &str = "/v1/entitlements";
pub const TRIAL_START_V1_PATH: &str = "/v1/trial/start";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Reply to a trial start (`/api/start-trial` or `/v1/trial/start`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StartTrialResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default, alias = "active")]
    pub trial_active: bool,
    #[serde(default, alias = "started_at")]
    pub trial_started_at: Option<String>,
    #[serde(default, alias = "expires_at")]
    pub trial_expires_at: Option<String>,
    #[serde(default)]
    pub plan_limits_from: Option<String>,
    #[serde(default, alias = "message")]
    pub error: Option<String>,
}

impl StartTrialResponse {
    pub fn succeeded(&self) -> bool {
        self.ok && self.trial_active
    }

    /// The trial described by a successful reply.
    pub fn trial_state(&self) -> Result<TrialState, TrialError> {
        let started = self
            .trial_started_at
            .as_deref()
            .ok_or(TrialError::Missing("trial_started_at"))?;
        let expires = self
            .trial_expires_at
            .as_deref()
            .ok_or(TrialError::Missing("trial_expires_at"))?;
        TrialState::from_timestamps(started, expires, self.plan_limits_from.as_deref())
    }
}

/// `/api/session-lite`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionLite {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub trial_active: bool,
    #[serde(default)]
    pub trial_expires_at: Option<String>,
    #[serde(default)]
    pub trial_started_at: Option<String>,
    #[serde(default)]
    pub plan_limits_from: Option<String>,
}

impl SessionLite {
    /// The active trial, when the session reports one with usable timestamps.
    pub fn trial_state(&self) -> Option<Result<TrialState, TrialError>> {
        if !self.trial_active {
            return None;
        }
        let (Some(started), Some(expires)) = (
            self.trial_started_at.as_deref(),
            self.trial_expires_at.as_deref(),
        ) else {
            return Some(Err(TrialError::Missing("trial_started_at/trial_expires_at")));
        };
        Some(TrialState::from_timestamps(
            started,
            expires,
            self.plan_limits_from.as_deref(),
        ))
    }
}

/// `/api/user-plan`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserPlan {
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub trial_active: bool,
    #[serde(default)]
    pub unlocked_tiers: Vec<String>,
    #[serde(default)]
    pub referral_unlocked: bool,
}

impl UserPlan {
    /// Access snapshot for the gate. An empty plan is treated as the lowest tier.
    pub fn snapshot(&self) -> Result<UserAccessSnapshot, TrialError> {
        let tier = if self.plan.trim().is_empty() {
            Tier::Bronze
        } else {
            self.plan.parse()?
        };
        let unlocked_tiers: BTreeSet<Tier> = self
            .unlocked_tiers
            .iter()
            .filter_map(|t| match t.parse() {
                Ok(t) => Some(t),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unlocked tier");
                    None
                }
            })
            .collect();
        Ok(UserAccessSnapshot {
            tier,
            trial_active: self.trial_active,
            unlocked_tiers,
            referral_unlocked: self.referral_unlocked,
        })
    }
}

/// `/v1/me`; fields beyond tier and trial flag are kept raw.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Me {
    #[serde(default, alias = "plan")]
    pub tier: Option<String>,
    #[serde(default)]
    pub trial_active: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `/v1/entitlements`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Entitlements {
    #[serde(default, alias = "plan")]
    pub tier: Option<String>,
    #[serde(default)]
    pub trial_active: bool,
    #[serde(default)]
    pub limits: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Entitlements {
    /// Numeric usage limit by name (e.g. `messages_per_day`).
    pub fn limit(&self, name: &str) -> Option<u64> {
        self.limits.get(name).and_then(|v| v.as_u64())
    }
}

/// Authenticated JSON client for the backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self::with_timeout(base_url, auth_token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn start_trial(&self) -> Result<StartTrialResponse, ClientError> {
        self.post_empty(START_TRIAL_PATH).await
    }

    pub async fn start_trial_v1(&self) -> Result<StartTrialResponse, ClientError> {
        self.post_empty(TRIAL_START_V1_PATH).await
    }

    pub async fn session_lite(&self) -> Result<SessionLite, ClientError> {
        self.get(SESSION_LITE_PATH).await
    }

    pub async fn user_plan(&self) -> Result<UserPlan, ClientError> {
        self.get(USER_PLAN_PATH).await
    }

    pub async fn me(&self) -> Result<Me, ClientError> {
        self.get(ME_PATH).await
    }

    pub async fn entitlements(&self) -> Result<Entitlements, ClientError> {
        self.get(ENTITLEMENTS_PATH).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let req = self.authorize(self.client.get(self.url(path)));
        self.send(path, req).await
    }

    async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let req = self
            .authorize(self.client.post(self.url(path)))
            .json(&serde_json::json!({}));
        self.send(path, req).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        path: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let res = req.send().await.map_err(|source| ClientError::Transport {
            path: path.to_string(),
            source,
        })?;
        let status = res.status();
        let text = res.text().await.map_err(|source| ClientError::Transport {
            path: path.to_string(),
            source,
        })?;

        match serde_json::from_str::<T>(&text) {
            Ok(parsed) => {
                if !status.is_success() {
                    tracing::debug!(path, status = status.as_u16(), "non-success status with JSON body");
                }
                Ok(parsed)
            }
            Err(_) if !status.is_success() => Err(ClientError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: text,
            }),
            Err(e) => Err(ClientError::Decode {
                path: path.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
