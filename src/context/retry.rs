//! Timeout processing shared by the aging pass and error indications.

use std::fmt;
use std::time::Duration;

use quanta::Instant;
use rand::Rng;

use super::{EntryId, PoolCore};
use crate::transport::Transport;

/// Outcome of processing one timed-out entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timeout {
    /// The request went out again.
    Resent,
    /// The retry count or the timeout budget is used up.
    Exhausted,
    /// A resend was due but failed.
    SendFailed,
}

/// Next per-attempt timeout in stepped mode.
///
/// The candidate is `(retries + 1) * min`, randomized to `[t - t/5, t + t/5)`.
/// When it would carry the cumulative timeout past `total`, it is clamped to
/// what is left of `total` but never below `min`.
pub(crate) fn stepped_timeout<R: Rng>(
    retries: u32,
    min: Duration,
    cum: Duration,
    total: Duration,
    rng: &mut R,
) -> Duration {
    let t = (min.as_micros() as u64).saturating_mul(retries as u64 + 1);
    let spread = t / 5;
    let t = if spread == 0 {
        t
    } else {
        rng.random_range(t - spread..t + spread)
    };
    let t = Duration::from_micros(t);

    if cum < total && cum + t > total {
        (total - cum).max(min)
    } else {
        t
    }
}

impl<T: Transport, Tag: Copy + fmt::Debug> PoolCore<T, Tag> {
    /// Decide whether a timed-out entry is retried, and retry it.
    pub(super) fn process_timeout(&mut self, i: usize, now: Instant) -> Timeout {
        let min = self.cfg.min_timeout;
        let e = &mut self.entries[i];
        e.timestamp = now;

        let retry = if min.is_zero() {
            e.retries < self.cfg.max_retries
        } else {
            e.cum_timeout += e.resp_timeout;
            e.resp_timeout =
                stepped_timeout(e.retries, min, e.cum_timeout, e.total_timeout, &mut self.rng);
            e.cum_timeout < e.total_timeout
        };

        if !retry {
            self.stats.retries_exhausted += 1;
            log::debug!(
                "madsweep: no response from lid {:#x} after {} attempts, tid {:#x}",
                e.lid,
                e.retries,
                e.tid
            );
            return Timeout::Exhausted;
        }

        match self.send(EntryId(i as u32)) {
            Ok(()) => Timeout::Resent,
            Err(_) => {
                log::error!("madsweep: cannot resend request in context entry[{}]", i);
                Timeout::SendFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_stepped_timeout_envelope() {
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..100 {
            let t = stepped_timeout(2, 100 * MS, Duration::ZERO, 10_000 * MS, &mut rng);
            assert!(t >= 240 * MS && t < 360 * MS, "{t:?}");
        }
    }

    #[test]
    fn test_stepped_timeout_clamps() {
        let mut rng = SmallRng::seed_from_u64(2);
        // 150 ms left of the budget.
        let t = stepped_timeout(1, 100 * MS, 100 * MS, 250 * MS, &mut rng);
        assert_eq!(t, 150 * MS);
        // 20 ms left: raised to the minimum.
        let t = stepped_timeout(1, 100 * MS, 230 * MS, 250 * MS, &mut rng);
        assert_eq!(t, 100 * MS);
        // Budget already spent: no clamp.
        let t = stepped_timeout(2, 100 * MS, 250 * MS, 250 * MS, &mut rng);
        assert!(t >= 240 * MS);
    }

    #[test]
    fn test_tiny_timeout_not_randomized() {
        let mut rng = SmallRng::seed_from_u64(3);
        let t = stepped_timeout(0, Duration::from_micros(4), Duration::ZERO, MS, &mut rng);
        assert_eq!(t, Duration::from_micros(4));
    }
}
