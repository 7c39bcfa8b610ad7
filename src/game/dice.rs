//! Dice sources
//!
//! The session state never owns randomness; the actor hands it a roller on
//! every roll so outcomes can be scripted in tests.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of die outcomes
pub trait DieRoller: Send {
    /// Draw a value in `1..=faces`
    fn roll(&mut self, faces: u32) -> u32;
}

/// Uniformly distributed die backed by a seedable RNG
pub struct RandomDie {
    rng: StdRng,
}

impl RandomDie {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic die for reproducible sessions
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomDie {
    fn default() -> Self {
        Self::new()
    }
}

impl DieRoller for RandomDie {
    fn roll(&mut self, faces: u32) -> u32 {
        self.rng.gen_range(1..=faces.max(1))
    }
}

/// Plays back a fixed list of outcomes, then keeps repeating the fallback
pub struct ScriptedDie {
    outcomes: VecDeque<u32>,
    fallback: u32,
}

impl ScriptedDie {
    pub fn new(outcomes: impl IntoIterator<Item = u32>) -> Self {
        Self {
            outcomes: outcomes.into_iter().collect(),
            fallback: 2,
        }
    }

    /// Value returned once the script runs out
    pub fn with_fallback(mut self, fallback: u32) -> Self {
        self.fallback = fallback;
        self
    }

    /// Outcomes not yet consumed
    pub fn remaining(&self) -> usize {
        self.outcomes.len()
    }
}

impl DieRoller for ScriptedDie {
    fn roll(&mut self, faces: u32) -> u32 {
        let value = self.outcomes.pop_front().unwrap_or(self.fallback);
        value.clamp(1, faces.max(1))
    }
}
