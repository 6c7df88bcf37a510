//! Search over an effectively unbounded, monotone index space.
//!
//! The predicate must be false on some (possibly empty) run of indices
//! starting at `min` and true from then on. The search doubles its distance
//! from `min` until it sees `true`, then bisects the bracket it found, so
//! finding index `i` costs `O(log(i - min))` probes.
//!
//! The batch variants let a probe report how far it actually looked. A list
//! call against object storage, for example, returns many names at once; if
//! the probe already saw where the run of `true` begins, the search stops
//! there without further round trips.
//!
//! The domain is `u64`. A predicate that is still false at `u64::MAX` is
//! treated as true there.

use std::future::Future;

/// Smallest `i >= min` with `pred(i) == true`.
pub fn search(min: u64, mut pred: impl FnMut(u64) -> bool) -> u64 {
    search_batch(min, |i| (pred(i), i))
}

/// Like [`search`], but `pred(i)` probes `i` and possibly more indices after
/// it, stopping at the first one where its condition holds. It returns
/// `(holds_at_last_checked, last_checked)` with `last_checked >= i`.
pub fn search_batch(min: u64, mut pred: impl FnMut(u64) -> (bool, u64)) -> u64 {
    let mut planner = ProbePlanner::new(min);
    loop {
        match planner.next_probe() {
            Step::Probe(i) => {
                let (hit, last_checked) = pred(i);
                planner.observe(hit, last_checked);
            }
            Step::Done(found) => return found,
        }
    }
}

/// Async, fallible [`search_batch`]. The first probe error aborts the search.
pub async fn try_search_batch<F, Fut, E>(min: u64, mut pred: F) -> Result<u64, E>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<(bool, u64), E>>,
{
    let mut planner = ProbePlanner::new(min);
    loop {
        match planner.next_probe() {
            Step::Probe(i) => {
                let (hit, last_checked) = pred(i).await?;
                planner.observe(hit, last_checked);
            }
            Step::Done(found) => return Ok(found),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Probe(u64),
    Done(u64),
}

/// Offsets are relative to `min`, so the search runs over `[0, end]`.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Expand { high: u64 },
    Bisect { lo: u64, hi: u64, mid: u64 },
    Done(u64),
}

#[derive(Debug)]
struct ProbePlanner {
    min: u64,
    end: u64,
    phase: Phase,
}

impl ProbePlanner {
    fn new(min: u64) -> Self {
        Self {
            min,
            end: u64::MAX - min,
            phase: Phase::Expand { high: 0 },
        }
    }

    fn next_probe(&mut self) -> Step {
        match self.phase {
            Phase::Expand { high } => Step::Probe(self.min + high),
            Phase::Bisect { lo, hi, .. } if lo >= hi => {
                self.phase = Phase::Done(lo);
                Step::Done(self.min + lo)
            }
            Phase::Bisect { lo, hi, .. } => {
                let mid = lo + (hi - lo) / 2;
                self.phase = Phase::Bisect { lo, hi, mid };
                Step::Probe(self.min + mid)
            }
            Phase::Done(offset) => Step::Done(self.min + offset),
        }
    }

    fn observe(&mut self, hit: bool, last_checked: u64) {
        self.phase = match self.phase {
            Phase::Expand { high } => {
                let last = last_checked.saturating_sub(self.min).min(self.end);
                if hit {
                    if last > high {
                        Phase::Done(last)
                    } else {
                        // The threshold lies in [0, high]; high itself is known true.
                        Phase::Bisect { lo: 0, hi: high, mid: 0 }
                    }
                } else if high == self.end {
                    Phase::Done(self.end)
                } else {
                    let doubled = if high == 0 { 1 } else { high.saturating_mul(2) };
                    Phase::Expand {
                        high: doubled.max(last.saturating_add(1)).min(self.end),
                    }
                }
            }
            Phase::Bisect { lo, hi, mid } => {
                if hit {
                    Phase::Bisect { lo, hi: mid, mid }
                } else {
                    Phase::Bisect { lo: mid + 1, hi, mid }
                }
            }
            done @ Phase::Done(_) => done,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // (next, min, expected probes)
    const CASES: &[(u64, u64, usize)] = &[
        (0, 0, 1),
        (0, 6, 1),
        (100, 1, 16),
        (4096, 100, 26),
        (1_000_000, 0, 42),
        (1_000_000_000, 0, 62),
        (9_999_999_999, 0, 70),
        (9_999_999_999, 9_999_999_999, 1),
    ];

    #[test]
    fn test_search_probe_counts() {
        for &(next, min, expected_probes) in CASES {
            let mut probes = 0;
            let found = search(min, |i| {
                probes += 1;
                i >= next
            });
            assert_eq!(found, next.max(min), "next={next} min={min}");
            assert_eq!(probes, expected_probes, "next={next} min={min}");
        }
    }

    #[test]
    fn test_batch_probe_skips_ahead() {
        for &(next, min, _) in CASES {
            let mut probes = 0;
            let found = search_batch(min, |_| {
                probes += 1;
                // pretend the probe scanned all the way to `next`
                (true, next)
            });
            assert_eq!(found, next.max(min), "next={next} min={min}");
            assert_eq!(probes, 1, "next={next} min={min}");
        }
    }

    #[test]
    fn test_all_false_saturates() {
        assert_eq!(search(0, |_| false), u64::MAX);
        assert_eq!(search(u64::MAX - 3, |_| false), u64::MAX);
        assert_eq!(search(u64::MAX, |_| false), u64::MAX);
    }

    #[test]
    fn test_threshold_near_domain_end() {
        let next = u64::MAX - 10;
        assert_eq!(search(5, |i| i >= next), next);
    }

    #[tokio::test]
    async fn test_try_search_batch_propagates_error() {
        let result: Result<u64, &'static str> = try_search_batch(0, |i| async move {
            if i >= 4 {
                Err("store unavailable")
            } else {
                Ok((false, i))
            }
        })
        .await;
        assert_eq!(result, Err("store unavailable"));

        let ok: Result<u64, &'static str> =
            try_search_batch(3, |i| async move { Ok((i >= 40, i)) }).await;
        assert_eq!(ok, Ok(40));
    }

    proptest! {
        #[test]
        fn prop_finds_smallest_true(min in 0u64..1_000_000, offset in 0u64..1_000_000) {
            let next = min + offset;
            let mut probes = 0u32;
            let found = search(min, |i| { probes += 1; i >= next });
            prop_assert_eq!(found, next);
            let bits = 64 - offset.leading_zeros();
            let bound = 2 * bits + 3;
            prop_assert!(probes <= bound, "probes={} bound={}", probes, bound);
        }
    }
}
