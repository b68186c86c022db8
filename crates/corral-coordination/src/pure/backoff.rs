//! Backoff between contended optimistic rounds.

/// Result of one backoff computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffResult {
    /// Pause before the next round, jitter included.
    pub sleep_ms: u64,
    /// Base backoff for the round after that.
    pub next_backoff_ms: u64,
}

/// Exponential backoff with additive jitter.
///
/// `jitter_seed` is any random value; the applied jitter is
/// `jitter_seed % (current_backoff_ms / 2 + 1)`. The base doubles each round
/// and never exceeds `max_backoff_ms`.
///
/// All arithmetic saturates; the function never panics.
#[inline]
pub fn compute_backoff_with_jitter(current_backoff_ms: u64, max_backoff_ms: u64, jitter_seed: u64) -> BackoffResult {
    let max_jitter = current_backoff_ms.saturating_div(2).saturating_add(1);
    let jitter = jitter_seed % max_jitter;

    BackoffResult {
        sleep_ms: current_backoff_ms.saturating_add(jitter),
        next_backoff_ms: current_backoff_ms.saturating_mul(2).min(max_backoff_ms),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn doubles_until_capped() {
        let first = compute_backoff_with_jitter(10, 1_000, 0);
        assert_eq!(first, BackoffResult {
            sleep_ms: 10,
            next_backoff_ms: 20
        });

        let capped = compute_backoff_with_jitter(800, 1_000, 0);
        assert_eq!(capped.next_backoff_ms, 1_000);
    }

    #[test]
    fn jitter_is_bounded_by_half_the_backoff() {
        assert_eq!(compute_backoff_with_jitter(100, 1_000, 25).sleep_ms, 125);
        assert_eq!(compute_backoff_with_jitter(100, 1_000, 51).sleep_ms, 100);
    }

    #[test]
    fn zero_backoff_has_no_jitter() {
        let result = compute_backoff_with_jitter(0, 1_000, u64::MAX);
        assert_eq!(result.sleep_ms, 0);
        assert_eq!(result.next_backoff_ms, 0);
    }

    proptest! {
        #[test]
        fn never_exceeds_bounds(current in 0u64..u64::MAX / 4, max in 0u64..u64::MAX / 4, seed in any::<u64>()) {
            let result = compute_backoff_with_jitter(current, max, seed);
            prop_assert!(result.sleep_ms >= current);
            prop_assert!(result.sleep_ms <= current + current / 2);
            prop_assert!(result.next_backoff_ms <= max);
        }
    }
}
