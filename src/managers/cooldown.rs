use chrono::{DateTime, Duration, Utc};

/// Outcome of a cooldown check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownDecision {
    pub allowed: bool,
    /// Time left until the next attempt is allowed. Zero when allowed.
    pub remaining: Duration,
}

/// Decide whether a verification attempt may start now.
///
/// A user with no previous attempt is never gated.
pub fn can_attempt(
    last_attempt_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> CooldownDecision {
    let Some(last) = last_attempt_at else {
        return CooldownDecision {
            allowed: true,
            remaining: Duration::zero(),
        };
    };

    let elapsed = now - last;
    if elapsed >= cooldown {
        CooldownDecision {
            allowed: true,
            remaining: Duration::zero(),
        }
    } else {
        CooldownDecision {
            allowed: false,
            remaining: cooldown - elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_first_attempt_is_never_gated() {
        let decision = can_attempt(None, at(0), Duration::seconds(3600));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Duration::zero());
    }

    #[test]
    fn test_reverify_inside_cooldown_is_rejected() {
        let decision = can_attempt(Some(at(0)), at(1), Duration::seconds(3600));
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, Duration::seconds(3599));
    }

    #[test]
    fn test_exact_boundary_is_allowed() {
        let decision = can_attempt(Some(at(0)), at(60), Duration::seconds(60));
        assert!(decision.allowed);
    }

    proptest! {
        #[test]
        fn prop_allowed_iff_elapsed_reaches_cooldown(
            last in -1_000_000i64..1_000_000,
            now in -1_000_000i64..1_000_000,
            cooldown in 0i64..100_000,
        ) {
            let cooldown = Duration::seconds(cooldown);
            let decision = can_attempt(Some(at(last)), at(now), cooldown);
            let elapsed = at(now) - at(last);
            prop_assert_eq!(decision.allowed, !(elapsed < cooldown));
            if !decision.allowed {
                prop_assert_eq!(decision.remaining, cooldown - elapsed);
            }
        }

        #[test]
        fn prop_null_last_attempt_always_allowed(now in -1_000_000i64..1_000_000, cooldown in 0i64..100_000) {
            prop_assert!(can_attempt(None, at(now), Duration::seconds(cooldown)).allowed);
        }
    }
}
