// Retry interval computation for the listener loops.
// Pure functions of (call site, policy, consecutive-error count, previous
// interval); the caller supplies the RNG so tests can seed it.

use rand::Rng;
use std::time::Duration;

/// Ceiling for the progressive (exponential) policy.
pub const MAX_PROGRESSIVE_INTERVAL: Duration = Duration::from_secs(300);

/// Base coefficient for the progressive policy.
const PROGRESSIVE_COEFFICIENT: f64 = 1.5;

/// Fixed interval used by the legacy policy for session creation and
/// keepalive probes.
pub const LEGACY_FIXED_INTERVAL: Duration = Duration::from_secs(30);

/// Legacy get-next-message range while the error streak is short.
const LEGACY_EARLY_RANGE: (u64, u64) = (15, 30);

/// Legacy get-next-message range once the streak exceeds the early limit.
const LEGACY_LATE_RANGE: (u64, u64) = (30, 60);

/// Error streak length up to which the early range applies.
const LEGACY_EARLY_RETRY_LIMIT: u32 = 5;

/// Range for the idle poll interval (no message, no error).
const IDLE_RANGE: (u64, u64) = (5, 15);

/// Which retry loop is asking for an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCall {
    SessionCreate,
    GetNextMessage,
    KeepAlive,
}

/// The backoff policy in effect, selected by the
/// `ENABLE_PROGRESSIVE_RETRY_BACKOFF` knob at loop entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Progressive,
    Legacy,
}

/// Compute the next retry interval.
///
/// `consecutive_errors` counts the current error streak starting at 1.
/// `previous` is the interval used for the prior retry, if any; the legacy
/// randomized draw never repeats it exactly.
pub fn retry_interval(
    call: RetryCall,
    policy: BackoffPolicy,
    consecutive_errors: u32,
    previous: Option<Duration>,
    rng: &mut impl Rng,
) -> Duration {
    match policy {
        BackoffPolicy::Progressive => progressive_interval(consecutive_errors),
        BackoffPolicy::Legacy => match call {
            RetryCall::SessionCreate | RetryCall::KeepAlive => LEGACY_FIXED_INTERVAL,
            RetryCall::GetNextMessage => {
                let (low, high) = if consecutive_errors <= LEGACY_EARLY_RETRY_LIMIT {
                    LEGACY_EARLY_RANGE
                } else {
                    LEGACY_LATE_RANGE
                };
                random_interval_avoiding(low, high, previous, rng)
            }
        },
    }
}

/// The progressive interval: `min(1.5 * 2^n, 300)` seconds.
pub fn progressive_interval(consecutive_errors: u32) -> Duration {
    // The ceiling dominates long before the shift could overflow.
    let n = consecutive_errors.min(16);
    let secs = (PROGRESSIVE_COEFFICIENT * f64::from(1u32 << n)).min(300.0);
    Duration::from_secs_f64(secs)
}

/// The idle poll interval: random in `[5, 15]` seconds, independent of any
/// error streak.
pub fn idle_interval(rng: &mut impl Rng) -> Duration {
    Duration::from_secs(rng.gen_range(IDLE_RANGE.0..=IDLE_RANGE.1))
}

/// Draw a whole-second interval in `[low, high]`, redrawing while the draw
/// equals the previous interval so two consecutive retries never share the
/// exact same delay.
fn random_interval_avoiding(
    low: u64,
    high: u64,
    previous: Option<Duration>,
    rng: &mut impl Rng,
) -> Duration {
    let previous_secs = previous
        .filter(|p| p.subsec_nanos() == 0)
        .map(|p| p.as_secs());

    let mut draw = rng.gen_range(low..=high);
    if high > low {
        while Some(draw) == previous_secs {
            draw = rng.gen_range(low..=high);
        }
    }
    Duration::from_secs(draw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5eed)
    }

    #[test]
    fn progressive_is_monotonic_up_to_ceiling() {
        let mut last = Duration::ZERO;
        for n in 0..32 {
            let interval = progressive_interval(n);
            assert!(interval >= last, "interval({n}) regressed");
            assert!(interval <= MAX_PROGRESSIVE_INTERVAL);
            last = interval;
        }
        assert_eq!(progressive_interval(31), MAX_PROGRESSIVE_INTERVAL);
    }

    #[test]
    fn progressive_ignores_call_site() {
        let mut r = rng();
        for call in [
            RetryCall::SessionCreate,
            RetryCall::GetNextMessage,
            RetryCall::KeepAlive,
        ] {
            assert_eq!(
                retry_interval(call, BackoffPolicy::Progressive, 3, None, &mut r),
                progressive_interval(3)
            );
        }
    }

    #[test]
    fn legacy_session_create_and_keepalive_are_fixed() {
        let mut r = rng();
        for n in 1..10 {
            assert_eq!(
                retry_interval(RetryCall::SessionCreate, BackoffPolicy::Legacy, n, None, &mut r),
                LEGACY_FIXED_INTERVAL
            );
            assert_eq!(
                retry_interval(RetryCall::KeepAlive, BackoffPolicy::Legacy, n, None, &mut r),
                LEGACY_FIXED_INTERVAL
            );
        }
    }

    #[test]
    fn legacy_get_message_ranges() {
        let mut r = rng();
        for n in 1..=5 {
            let interval =
                retry_interval(RetryCall::GetNextMessage, BackoffPolicy::Legacy, n, None, &mut r);
            assert!((15..=30).contains(&interval.as_secs()), "early range at n={n}");
        }
        for n in 6..=20 {
            let interval =
                retry_interval(RetryCall::GetNextMessage, BackoffPolicy::Legacy, n, None, &mut r);
            assert!((30..=60).contains(&interval.as_secs()), "late range at n={n}");
        }
    }

    #[test]
    fn legacy_get_message_never_repeats_previous_draw() {
        let mut r = rng();
        let mut previous = None;
        for n in 1..500 {
            let interval = retry_interval(
                RetryCall::GetNextMessage,
                BackoffPolicy::Legacy,
                n % 10 + 1,
                previous,
                &mut r,
            );
            if let Some(prev) = previous {
                assert_ne!(interval, prev, "repeated draw at iteration {n}");
            }
            previous = Some(interval);
        }
    }

    #[test]
    fn idle_interval_in_range() {
        let mut r = rng();
        for _ in 0..200 {
            let interval = idle_interval(&mut r);
            assert!((5..=15).contains(&interval.as_secs()));
        }
    }
}
