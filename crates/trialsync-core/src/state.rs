//! Trial state as the client caches it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrialError;
use crate::tier::Tier;

/// A complete trial record. The server is authoritative; this is the last
/// successful copy the client saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialState {
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub plan_limits_from: Tier,
}

impl TrialState {
    /// Builds an active trial from the server's ISO-8601 timestamps.
    /// `plan_limits_from` defaults to gold when the server omits it.
    pub fn from_timestamps(
        started_at: &str,
        expires_at: &str,
        plan_limits_from: Option<&str>,
    ) -> Result<Self, TrialError> {
        let started_at = parse_timestamp("trial_started_at", started_at)?;
        let expires_at = parse_timestamp("trial_expires_at", expires_at)?;
        if expires_at <= started_at {
            return Err(TrialError::NonPositiveDuration);
        }
        let plan_limits_from = match plan_limits_from.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s.parse()?,
            None => Tier::Gold,
        };
        Ok(Self {
            active: true,
            started_at,
            expires_at,
            plan_limits_from,
        })
    }

    pub fn duration(&self) -> chrono::Duration {
        self.expires_at - self.started_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What storage actually holds: any of the four fields may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTrialState {
    pub active: Option<bool>,
    pub started_at: Option<String>,
    pub expires_at: Option<String>,
    pub plan_limits_from: Option<String>,
}

impl StoredTrialState {
    pub fn is_empty(&self) -> bool {
        self.active.is_none()
            && self.started_at.is_none()
            && self.expires_at.is_none()
            && self.plan_limits_from.is_none()
    }

    /// True only when the active flag was written as `true`.
    pub fn is_active(&self) -> bool {
        self.active == Some(true)
    }

    /// Converts to a [`TrialState`] when every field is present and valid.
    pub fn complete(&self) -> Result<TrialState, TrialError> {
        let active = self.active.ok_or(TrialError::Missing("trial_active"))?;
        let started = self
            .started_at
            .as_deref()
            .ok_or(TrialError::Missing("trial_started_at"))?;
        let expires = self
            .expires_at
            .as_deref()
            .ok_or(TrialError::Missing("trial_expires_at"))?;
        let tier = self
            .plan_limits_from
            .as_deref()
            .ok_or(TrialError::Missing("trial_plan_limits_from"))?;
        Ok(TrialState {
            active,
            started_at: parse_timestamp("trial_started_at", started)?,
            expires_at: parse_timestamp("trial_expires_at", expires)?,
            plan_limits_from: tier.parse()?,
        })
    }
}

impl From<&TrialState> for StoredTrialState {
    fn from(s: &TrialState) -> Self {
        Self {
            active: Some(s.active),
            started_at: Some(format_timestamp(s.started_at)),
            expires_at: Some(format_timestamp(s.expires_at)),
            plan_limits_from: Some(s.plan_limits_from.to_string()),
        }
    }
}

pub(crate) fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, TrialError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| TrialError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

pub(crate) fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_timestamps_computes_duration() {
        let s = TrialState::from_timestamps(
            "2025-01-01T00:00:00Z",
            "2025-01-01T05:00:00Z",
            Some("max"),
        )
        .unwrap();
        assert!(s.active);
        assert_eq!(s.duration(), chrono::Duration::hours(5));
        assert_eq!(s.plan_limits_from, Tier::Gold);
    }

    #[test]
    fn rejects_reversed_or_malformed_timestamps() {
        assert_eq!(
            TrialState::from_timestamps("2025-01-01T05:00:00Z", "2025-01-01T00:00:00Z", None),
            Err(TrialError::NonPositiveDuration)
        );
        assert!(matches!(
            TrialState::from_timestamps("yesterday", "2025-01-01T00:00:00Z", None),
            Err(TrialError::InvalidTimestamp { field: "trial_started_at", .. })
        ));
    }

    #[test]
    fn partial_state_reports_missing_field() {
        let partial = StoredTrialState {
            active: Some(true),
            expires_at: Some("2025-01-01T05:00:00Z".into()),
            ..Default::default()
        };
        assert!(!partial.is_empty());
        assert!(partial.is_active());
        assert_eq!(partial.complete(), Err(TrialError::Missing("trial_started_at")));
    }

    #[test]
    fn offset_timestamps_normalise_to_utc() {
        let s = TrialState::from_timestamps(
            "2025-01-01T02:00:00+02:00",
            "2025-01-01T05:00:00Z",
            None,
        )
        .unwrap();
        assert_eq!(format_timestamp(s.started_at), "2025-01-01T00:00:00Z");
    }
}
