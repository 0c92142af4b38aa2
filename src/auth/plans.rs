use crate::constants::{
    FREE_REQUESTS_PER_MINUTE, FREE_TOKENS_PER_DAY, PRO_REQUESTS_PER_MINUTE, PRO_TOKENS_PER_DAY,
};

/// Subscription tier attached to an account. Accounts without a ledger row
/// are treated as free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
}

/// Per-plan throttling ceilings
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub requests_per_minute: u32,
    pub tokens_per_day: u64,
}

impl PlanTier {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Self::Free),
            "pro" => Some(Self::Pro),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }

    pub fn limits(&self) -> PlanLimits {
        match self {
            Self::Free => PlanLimits {
                requests_per_minute: FREE_REQUESTS_PER_MINUTE,
                tokens_per_day: FREE_TOKENS_PER_DAY,
            },
            Self::Pro => PlanLimits {
                requests_per_minute: PRO_REQUESTS_PER_MINUTE,
                tokens_per_day: PRO_TOKENS_PER_DAY,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_known_tiers_only() {
        assert_eq!(PlanTier::parse("free"), Some(PlanTier::Free));
        assert_eq!(PlanTier::parse("pro"), Some(PlanTier::Pro));
        assert_eq!(PlanTier::parse("enterprise"), None);
        assert_eq!(PlanTier::parse(""), None);
    }

    #[test]
    fn pro_ceilings_exceed_free() {
        let free = PlanTier::Free.limits();
        let pro = PlanTier::Pro.limits();
        assert!(pro.requests_per_minute > free.requests_per_minute);
        assert!(pro.tokens_per_day > free.tokens_per_day);
    }
}
