//! Subscription tiers and the tier-access rule.
//!
//! The backend names the same three levels two ways (`bronze/silver/gold` on the
//! companion pages, `free/growth/max` on the plan endpoints). Both parse into one
//! ordered [`Tier`]; [`TierScheme`] only affects how a tier is displayed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TrialError;

/// Subscription level. Ordered `Bronze < Silver < Gold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Bronze, Tier::Silver, Tier::Gold];

    /// Rank used by the access rule: bronze 1, silver 2, gold 3.
    pub fn rank(self) -> u8 {
        match self {
            Tier::Bronze => 1,
            Tier::Silver => 2,
            Tier::Gold => 3,
        }
    }

    /// Name of this tier under the given scheme.
    pub fn name(self, scheme: TierScheme) -> &'static str {
        match (scheme, self) {
            (TierScheme::Metal, Tier::Bronze) => "bronze",
            (TierScheme::Metal, Tier::Silver) => "silver",
            (TierScheme::Metal, Tier::Gold) => "gold",
            (TierScheme::Plan, Tier::Bronze) => "free",
            (TierScheme::Plan, Tier::Silver) => "growth",
            (TierScheme::Plan, Tier::Gold) => "max",
        }
    }
}

impl FromStr for Tier {
    type Err = TrialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bronze" | "free" => Ok(Tier::Bronze),
            "silver" | "growth" => Ok(Tier::Silver),
            "gold" | "max" => Ok(Tier::Gold),
            _ => Err(TrialError::UnknownTier(s.to_string())),
        }
    }
}

impl TryFrom<String> for Tier {
    type Error = TrialError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Tier> for String {
    fn from(t: Tier) -> Self {
        t.name(TierScheme::Metal).to_string()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name(TierScheme::Metal))
    }
}

/// Naming used when a tier is shown or persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierScheme {
    /// bronze / silver / gold
    #[default]
    Metal,
    /// free / growth / max
    Plan,
}

/// Minimum requirement attached to a gated element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredTier {
    Tier(Tier),
    /// Referral rewards: unlocked only when the server says so.
    Referral,
}

impl FromStr for RequiredTier {
    type Err = TrialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("referral") {
            return Ok(RequiredTier::Referral);
        }
        s.parse().map(RequiredTier::Tier)
    }
}

impl From<Tier> for RequiredTier {
    fn from(t: Tier) -> Self {
        RequiredTier::Tier(t)
    }
}

/// `trial_active || rank(user) >= rank(required)`.
pub fn check_tier_access(user: Tier, required: Tier, trial_active: bool) -> bool {
    trial_active || user.rank() >= required.rank()
}
