// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Randomized action source for the stress driver.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// What a stress job does when it runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum StressAction {
    /// Post one follow-up job to the current dispatcher.
    Post,
    /// Post a burst of follow-up jobs to the current dispatcher.
    PostMany(usize),
    /// Post a follow-up job after a short delay.
    PostDelayed,
    /// Post one follow-up job to the other dispatcher and one to the current.
    PostOther,
    /// End the current dispatcher.
    End,
}

/// Hands out a bounded number of random actions. Once the budget runs low every draw ends the
/// dispatcher, so a stress run always terminates. The same seed yields the same actions.
#[derive(Debug)]
pub struct StressSource {
    rng: StdRng,
    remaining: usize,
    max_burst: usize,
}

impl StressSource {
    pub fn new(seed: u64, budget: usize, max_burst: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            remaining: budget,
            max_burst: max_burst.max(1),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn next_action(&mut self) -> StressAction {
        if self.remaining < 5 {
            self.remaining = 0;
            return StressAction::End;
        }
        self.remaining -= 1;

        match self.rng.random_range(0..=5) {
            0 | 5 => StressAction::Post,
            1 => StressAction::PostMany(self.rng.random_range(1..=self.max_burst)),
            2 => StressAction::PostDelayed,
            3 => StressAction::PostOther,
            _ => StressAction::End,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_actions() {
        let mut a = StressSource::new(7, 100, 20);
        let mut b = StressSource::new(7, 100, 20);
        for _ in 0..100 {
            assert_eq!(a.next_action(), b.next_action());
        }
    }

    #[test]
    fn test_exhausted_budget_always_ends() {
        let mut source = StressSource::new(1, 6, 3);
        source.next_action();
        source.next_action();
        assert_eq!(source.next_action(), StressAction::End);
        assert_eq!(source.remaining(), 0);
        assert_eq!(source.next_action(), StressAction::End);
    }

    #[test]
    fn test_bursts_stay_within_max_burst() {
        let mut source = StressSource::new(0, 10_000, 9);
        let mut bursts = 0;
        while source.remaining() > 0 {
            if let StressAction::PostMany(count) = source.next_action() {
                assert!((1..=9).contains(&count), "burst of {count}");
                bursts += 1;
            }
        }
        assert!(bursts > 0);
    }
}
