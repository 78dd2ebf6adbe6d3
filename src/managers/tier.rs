use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BotError;

/// Subscription tier of a server. Ordered from smallest to largest plan.
///
/// Stored as a single character in the `servers.tier` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    A,
    B,
    C,
    D,
    E,
}

impl Tier {
    pub fn as_char(self) -> char {
        match self {
            Tier::A => 'A',
            Tier::B => 'B',
            Tier::C => 'C',
            Tier::D => 'D',
            Tier::E => 'E',
        }
    }

    /// Parse the stored column value. Also accepts the legacy `tier_X` spelling.
    pub fn from_code(code: &str) -> Option<Tier> {
        let code = code.trim();
        let code = code.strip_prefix("tier_").unwrap_or(code);
        let mut chars = code.chars();
        let c = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        match c.to_ascii_uppercase() {
            'A' => Some(Tier::A),
            'B' => Some(Tier::B),
            'C' => Some(Tier::C),
            'D' => Some(Tier::D),
            'E' => Some(Tier::E),
            _ => None,
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::A
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

impl FromStr for Tier {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::from_code(s).ok_or_else(|| BotError::InvalidConfiguration {
            key: "tier".to_string(),
            message: format!("unknown tier '{}'", s),
        })
    }
}

/// A member-count lower bound at which a tier starts to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThreshold {
    pub min_members: u64,
    pub tier: Tier,
}

/// Parse `A:0,B:251,...` into thresholds, rejecting lists that are empty or
/// not strictly ascending in `min_members`.
pub fn parse_thresholds(raw: &str) -> crate::error::Result<Vec<TierThreshold>> {
    let invalid = |message: String| BotError::InvalidConfiguration {
        key: "TIER_THRESHOLDS".to_string(),
        message,
    };

    let mut thresholds = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (tier, min) = part
            .split_once(':')
            .ok_or_else(|| invalid(format!("expected tier:minMembers, got '{}'", part)))?;
        let tier = Tier::from_code(tier).ok_or_else(|| invalid(format!("unknown tier '{}'", tier)))?;
        let min_members = min
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(format!("invalid member count '{}'", min)))?;
        thresholds.push(TierThreshold { min_members, tier });
    }

    if thresholds.is_empty() {
        return Err(invalid("no thresholds configured".to_string()));
    }
    if thresholds
        .windows(2)
        .any(|w| w[0].min_members >= w[1].min_members)
    {
        return Err(invalid("thresholds must be ascending by member count".to_string()));
    }

    Ok(thresholds)
}

/// Resolve the tier for a member count.
///
/// Returns the tier of the highest threshold whose `min_members` is at most
/// `member_count`, or the lowest configured tier when the count is below all
/// of them. `thresholds` must be sorted ascending by `min_members`.
pub fn resolve_tier(member_count: u64, thresholds: &[TierThreshold]) -> Tier {
    let lowest = thresholds
        .iter()
        .map(|t| t.tier)
        .min()
        .unwrap_or_default();

    thresholds
        .iter()
        .take_while(|t| t.min_members <= member_count)
        .map(|t| t.tier)
        .max()
        .unwrap_or(lowest)
}

/// Largest member count the tier covers, `None` when it has no upper bound.
pub fn member_limit(tier: Tier, thresholds: &[TierThreshold]) -> Option<u64> {
    thresholds
        .iter()
        .find(|t| t.tier > tier)
        .map(|t| t.min_members.saturating_sub(1))
}

/// Default plan table: A up to 250 members, B up to 500, C up to 1000,
/// D up to 5000, E above.
pub fn default_thresholds() -> Vec<TierThreshold> {
    vec![
        TierThreshold { min_members: 0, tier: Tier::A },
        TierThreshold { min_members: 251, tier: Tier::B },
        TierThreshold { min_members: 501, tier: Tier::C },
        TierThreshold { min_members: 1001, tier: Tier::D },
        TierThreshold { min_members: 5001, tier: Tier::E },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_TIERS: [Tier; 5] = [Tier::A, Tier::B, Tier::C, Tier::D, Tier::E];

    #[test]
    fn test_member_limit_from_next_threshold() {
        let thresholds = default_thresholds();
        assert_eq!(member_limit(Tier::A, &thresholds), Some(250));
        assert_eq!(member_limit(Tier::D, &thresholds), Some(5000));
        assert_eq!(member_limit(Tier::E, &thresholds), None);
    }

    #[test]
    fn test_resolve_tier_crossing_threshold() {
        let thresholds = parse_thresholds("A:0,B:100").unwrap();
        assert_eq!(resolve_tier(95, &thresholds), Tier::A);
        assert_eq!(resolve_tier(101, &thresholds), Tier::B);
        assert_eq!(resolve_tier(100, &thresholds), Tier::B);
    }

    #[test]
    fn test_resolve_tier_below_all_thresholds() {
        let thresholds = parse_thresholds("B:10,C:20").unwrap();
        assert_eq!(resolve_tier(3, &thresholds), Tier::B);
    }

    #[test]
    fn test_default_thresholds_match_plan_table() {
        let thresholds = default_thresholds();
        assert_eq!(resolve_tier(250, &thresholds), Tier::A);
        assert_eq!(resolve_tier(251, &thresholds), Tier::B);
        assert_eq!(resolve_tier(1000, &thresholds), Tier::C);
        assert_eq!(resolve_tier(5000, &thresholds), Tier::D);
        assert_eq!(resolve_tier(1_000_000, &thresholds), Tier::E);
    }

    #[test]
    fn test_parse_thresholds_rejects_bad_input() {
        assert!(parse_thresholds("").is_err());
        assert!(parse_thresholds("A:0,B:0").is_err());
        assert!(parse_thresholds("A:10,B:5").is_err());
        assert!(parse_thresholds("Z:0").is_err());
        assert!(parse_thresholds("A=0").is_err());
    }

    #[test]
    fn test_tier_codes() {
        assert_eq!(Tier::from_code("a"), Some(Tier::A));
        assert_eq!(Tier::from_code("tier_C"), Some(Tier::C));
        assert_eq!(Tier::from_code("AB"), None);
        assert_eq!(Tier::default().to_string(), "A");
        assert!(Tier::A < Tier::E);
    }

    proptest! {
        #[test]
        fn prop_resolve_tier_is_monotonic(
            mins in proptest::collection::btree_set(0u64..10_000, 1..5),
            a in 0u64..20_000,
            b in 0u64..20_000,
        ) {
            let thresholds: Vec<TierThreshold> = mins
                .into_iter()
                .zip(ALL_TIERS)
                .map(|(min_members, tier)| TierThreshold { min_members, tier })
                .collect();
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(resolve_tier(low, &thresholds) <= resolve_tier(high, &thresholds));
        }
    }
}
