//! Tier policy defaults (C7), mirroring [`crate::config::TierPolicyConfig`].

#[derive(Debug, Clone)]
pub struct TierPolicy {
    pub hot_max_age_days: u32,
    pub warm_max_age_days: u32,
    pub auto_promote: bool,
    pub auto_demote: bool,
    pub min_access_count_to_promote: u32,
    pub max_promotions_per_run: usize,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            hot_max_age_days: 1,
            warm_max_age_days: 30,
            auto_promote: true,
            auto_demote: true,
            min_access_count_to_promote: 2,
            max_promotions_per_run: 100,
        }
    }
}

impl From<&crate::config::TierPolicyConfig> for TierPolicy {
    fn from(cfg: &crate::config::TierPolicyConfig) -> Self {
        Self {
            hot_max_age_days: cfg.hot_max_age_days,
            warm_max_age_days: cfg.warm_max_age_days,
            auto_promote: cfg.auto_promote,
            auto_demote: cfg.auto_demote,
            min_access_count_to_promote: cfg.min_access_count_to_promote,
            max_promotions_per_run: cfg.max_promotions_per_run,
        }
    }
}

impl TierPolicy {
    #[must_use]
    pub fn max_age_days(&self, tier: crate::types::Tier) -> Option<u32> {
        match tier {
            crate::types::Tier::Hot => Some(self.hot_max_age_days),
            crate::types::Tier::Warm => Some(self.warm_max_age_days),
            crate::types::Tier::Cold => None,
        }
    }

    #[must_use]
    pub fn demotion_target(tier: crate::types::Tier) -> Option<crate::types::Tier> {
        match tier {
            crate::types::Tier::Hot => Some(crate::types::Tier::Warm),
            crate::types::Tier::Warm => Some(crate::types::Tier::Cold),
            crate::types::Tier::Cold => None,
        }
    }

    #[must_use]
    pub fn promotion_target(tier: crate::types::Tier) -> Option<crate::types::Tier> {
        match tier {
            crate::types::Tier::Cold => Some(crate::types::Tier::Warm),
            crate::types::Tier::Warm => Some(crate::types::Tier::Hot),
            crate::types::Tier::Hot => None,
        }
    }
}
