//! Access Gate: lock or unlock tier-annotated UI elements.
//!
//! Elements are registered explicitly in a [`GateRegistry`] (element id →
//! [`RequiredTier`]) and applied to any [`LockSurface`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::tier::{check_tier_access, RequiredTier, Tier};

pub const LOCKED_CLASS: &str = "tier-locked";

/// Per page load view of what the user may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccessSnapshot {
    pub tier: Tier,
    pub trial_active: bool,
    /// Tiers the server unlocked explicitly (promotions, grants).
    #[serde(default)]
    pub unlocked_tiers: BTreeSet<Tier>,
    /// Server flag for referral rewards.
    #[serde(default)]
    pub referral_unlocked: bool,
}

impl UserAccessSnapshot {
    pub fn new(tier: Tier, trial_active: bool) -> Self {
        Self {
            tier,
            trial_active,
            unlocked_tiers: BTreeSet::new(),
            referral_unlocked: false,
        }
    }
}

/// Whether an active trial also opens referral-only items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralTrialPolicy {
    #[default]
    TrialDoesNotUnlock,
    TrialUnlocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub required: RequiredTier,
    pub unlocked: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateReport {
    pub locked: usize,
    pub unlocked: usize,
}

/// Element id → minimum requirement.
#[derive(Debug, Clone, Default)]
pub struct GateRegistry {
    elements: BTreeMap<String, RequiredTier>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, required: impl Into<RequiredTier>) -> &mut Self {
        self.elements.insert(id.into(), required.into());
        self
    }

    pub fn get(&self, id: &str) -> Option<RequiredTier> {
        self.elements.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Elements in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, RequiredTier)> {
        self.elements.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Where lock state is drawn.
pub trait LockSurface {
    fn set_locked_class(&mut self, id: &str, locked: bool);
    fn has_overlay(&self, id: &str) -> bool;
    fn insert_overlay(&mut self, id: &str, required: RequiredTier);
    fn remove_overlay(&mut self, id: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccessGate {
    policy: ReferralTrialPolicy,
}

impl AccessGate {
    pub fn new(policy: ReferralTrialPolicy) -> Self {
        Self { policy }
    }

    pub fn decide(&self, snapshot: &UserAccessSnapshot, required: RequiredTier) -> GateDecision {
        let unlocked = match required {
            RequiredTier::Tier(t) => {
                check_tier_access(snapshot.tier, t, snapshot.trial_active)
                    || snapshot.unlocked_tiers.contains(&t)
            }
            RequiredTier::Referral => {
                snapshot.referral_unlocked
                    || (snapshot.trial_active && self.policy == ReferralTrialPolicy::TrialUnlocks)
            }
        };
        GateDecision { required, unlocked }
    }

    pub fn evaluate<'a>(
        &'a self,
        registry: &'a GateRegistry,
        snapshot: &'a UserAccessSnapshot,
    ) -> impl Iterator<Item = (&'a str, GateDecision)> + 'a {
        registry
            .iter()
            .map(move |(id, required)| (id, self.decide(snapshot, required)))
    }

    /// Draws every registered element. Safe to call repeatedly.
    pub fn apply(
        &self,
        registry: &GateRegistry,
        snapshot: &UserAccessSnapshot,
        surface: &mut dyn LockSurface,
    ) -> GateReport {
        let mut report = GateReport::default();
        for (id, decision) in self.evaluate(registry, snapshot) {
            surface.set_locked_class(id, !decision.unlocked);
            if decision.unlocked {
                if surface.has_overlay(id) {
                    surface.remove_overlay(id);
                }
                report.unlocked += 1;
            } else {
                if !surface.has_overlay(id) {
                    surface.insert_overlay(id, decision.required);
                }
                report.locked += 1;
            }
        }
        tracing::debug!(
            locked = report.locked,
            unlocked = report.unlocked,
            tier = %snapshot.tier,
            trial_active = snapshot.trial_active,
            "access gate applied"
        );
        report
    }
}

/// Lock state kept in memory; one entry per element touched.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    classes: HashMap<String, BTreeSet<String>>,
    overlays: HashMap<String, usize>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.classes
            .get(id)
            .map(|c| c.contains(LOCKED_CLASS))
            .unwrap_or(false)
    }

    /// Overlay nodes attached to `id`; never more than one after `apply`.
    pub fn overlay_count(&self, id: &str) -> usize {
        self.overlays.get(id).copied().unwrap_or(0)
    }
}

impl LockSurface for MemorySurface {
    fn set_locked_class(&mut self, id: &str, locked: bool) {
        let classes = self.classes.entry(id.to_string()).or_default();
        if locked {
            classes.insert(LOCKED_CLASS.to_string());
        } else {
            classes.remove(LOCKED_CLASS);
        }
    }

    fn has_overlay(&self, id: &str) -> bool {
        self.overlay_count(id) > 0
    }

    fn insert_overlay(&mut self, id: &str, _required: RequiredTier) {
        *self.overlays.entry(id.to_string()).or_insert(0) += 1;
    }

    fn remove_overlay(&mut self, id: &str) {
        self.overlays.remove(id);
    }
}
