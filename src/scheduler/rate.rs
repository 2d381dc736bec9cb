// Admission bookkeeping for the scheduler loop.

use std::time::Duration;

use crate::config::PatternConfig;

/// Dialogs `pattern` expects to have been placed `elapsed` into the run.
///
/// Constant runs at `calls_per_second` from the start. RampUp climbs linearly
/// from 0 to `calls_per_second` over `duration_secs`, then stays flat; a zero
/// duration is the same as Constant.
pub fn expected_calls(pattern: &PatternConfig, calls_per_second: f64, elapsed: Duration) -> u64 {
    let t = elapsed.as_secs_f64();
    let calls = match *pattern {
        PatternConfig::RampUp { duration_secs } if duration_secs > 0 => {
            let ramp = duration_secs as f64;
            let ramped = t.min(ramp);
            calls_per_second * (ramped * ramped / (2.0 * ramp) + (t - ramp).max(0.0))
        }
        _ => calls_per_second * t,
    };
    calls.max(0.0) as u64
}

/// Active/placed/terminated counters for one run.
/// Owned by the scheduler loop, the single admission point.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    ceiling: usize,
    target: u64,
    active: usize,
    placed: u64,
    terminated: u64,
    peak_active: usize,
}

impl RateLimitState {
    pub fn new(ceiling: usize, target: u64) -> Self {
        Self {
            ceiling,
            target,
            active: 0,
            placed: 0,
            terminated: 0,
            peak_active: 0,
        }
    }

    /// Calls the pattern is still owed: `expected - placed`.
    pub fn rate_budget(&self, expected: u64) -> u64 {
        expected.saturating_sub(self.placed)
    }

    /// How many dialogs may start now: `min(rate_budget, ceiling - active, target - placed)`.
    pub fn admissible(&self, rate_budget: u64) -> u64 {
        let free_slots = self.ceiling.saturating_sub(self.active) as u64;
        let remaining = self.target.saturating_sub(self.placed);
        rate_budget.min(free_slots).min(remaining)
    }

    /// Count one admission. Returns false (and changes nothing) when the
    /// ceiling or the target would be exceeded.
    pub fn admit(&mut self) -> bool {
        if self.active >= self.ceiling || self.placed >= self.target {
            return false;
        }
        self.active += 1;
        self.placed += 1;
        self.peak_active = self.peak_active.max(self.active);
        true
    }

    /// Count one dialog reaching a terminal state.
    pub fn release(&mut self) {
        if self.active > 0 {
            self.active -= 1;
            self.terminated += 1;
        }
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn placed(&self) -> u64 {
        self.placed
    }

    pub fn terminated(&self) -> u64 {
        self.terminated
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active
    }

    pub fn target_reached(&self) -> bool {
        self.terminated >= self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn constant_pattern_expects_rate_times_elapsed() {
        assert_eq!(expected_calls(&PatternConfig::Constant, 100.0, secs(0.0)), 0);
        assert_eq!(expected_calls(&PatternConfig::Constant, 100.0, secs(1.5)), 150);
        assert_eq!(expected_calls(&PatternConfig::Constant, 0.5, secs(3.0)), 1);
    }

    #[test]
    fn ramp_up_is_quadratic_then_linear() {
        let ramp = PatternConfig::RampUp { duration_secs: 10 };
        // 100 cps reached at t=10: 0.5 * 100 * 10 = 500 calls by then
        assert_eq!(expected_calls(&ramp, 100.0, secs(1.0)), 5);
        assert_eq!(expected_calls(&ramp, 100.0, secs(5.0)), 125);
        assert_eq!(expected_calls(&ramp, 100.0, secs(10.0)), 500);
        assert_eq!(expected_calls(&ramp, 100.0, secs(15.0)), 1000);
    }

    #[test]
    fn zero_length_ramp_is_constant() {
        let ramp = PatternConfig::RampUp { duration_secs: 0 };
        assert_eq!(expected_calls(&ramp, 40.0, secs(2.0)), 80);
    }

    #[test]
    fn rate_budget_subtracts_placed_calls() {
        let mut state = RateLimitState::new(10, 100);
        assert_eq!(state.rate_budget(3), 3);
        assert!(state.admit());
        assert!(state.admit());
        assert_eq!(state.rate_budget(3), 1);
        assert_eq!(state.rate_budget(1), 0);
    }

    #[test]
    fn admissible_takes_the_smallest_limit() {
        let mut state = RateLimitState::new(5, 100);
        assert_eq!(state.admissible(3), 3);
        assert_eq!(state.admissible(10), 5);
        for _ in 0..4 {
            assert!(state.admit());
        }
        assert_eq!(state.admissible(10), 1);

        let near_target = RateLimitState::new(50, 2);
        assert_eq!(near_target.admissible(10), 2);
    }

    #[test]
    fn admit_refuses_beyond_ceiling() {
        let mut state = RateLimitState::new(2, 10);
        assert!(state.admit());
        assert!(state.admit());
        assert!(!state.admit());
        assert_eq!(state.active(), 2);
        assert_eq!(state.placed(), 2);
    }

    #[test]
    fn admit_refuses_beyond_target() {
        let mut state = RateLimitState::new(10, 1);
        assert!(state.admit());
        assert!(!state.admit());
        state.release();
        assert!(!state.admit());
        assert!(state.target_reached());
    }

    #[test]
    fn release_frees_a_slot_and_counts_termination() {
        let mut state = RateLimitState::new(1, 3);
        assert!(state.admit());
        state.release();
        assert_eq!(state.active(), 0);
        assert_eq!(state.terminated(), 1);
        assert!(state.admit());
        assert_eq!(state.peak_active(), 1);
    }

    #[test]
    fn release_without_active_is_ignored() {
        let mut state = RateLimitState::new(1, 3);
        state.release();
        assert_eq!(state.terminated(), 0);
    }

    // --- Property: アクティブ数は上限を超えない ---

    #[derive(Debug, Clone)]
    enum Op {
        Tick(u64),
        Release,
    }

    fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![(0u64..50).prop_map(Op::Tick), Just(Op::Release)],
            0..200,
        )
    }

    proptest! {
        #[test]
        fn prop_ramp_up_never_decreases_or_leads_constant(
            ramp in 0u64..120,
            cps in 0.1f64..1000.0,
            a_ms in 0u64..300_000,
            b_ms in 0u64..300_000,
        ) {
            let pattern = PatternConfig::RampUp { duration_secs: ramp };
            let (lo, hi) = (Duration::from_millis(a_ms.min(b_ms)), Duration::from_millis(a_ms.max(b_ms)));
            prop_assert!(expected_calls(&pattern, cps, lo) <= expected_calls(&pattern, cps, hi));
            prop_assert!(expected_calls(&pattern, cps, hi) <= expected_calls(&PatternConfig::Constant, cps, hi));
        }

        #[test]
        fn prop_active_never_exceeds_ceiling(
            ceiling in 1usize..20,
            target in 1u64..500,
            ops in arb_ops(),
        ) {
            let mut state = RateLimitState::new(ceiling, target);
            for op in ops {
                match op {
                    Op::Tick(budget) => {
                        for _ in 0..state.admissible(budget) {
                            prop_assert!(state.admit());
                        }
                    }
                    Op::Release => state.release(),
                }
                prop_assert!(state.active() <= ceiling);
                prop_assert!(state.peak_active() <= ceiling);
                prop_assert!(state.placed() <= target);
                prop_assert_eq!(state.placed(), state.terminated() + state.active() as u64);
            }
        }
    }
}
