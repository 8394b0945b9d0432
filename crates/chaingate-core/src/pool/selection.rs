//! Weighted random endpoint selection.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::endpoint::Endpoint;

/// Source of uniform draws in `[0, 1)`. Injectable so selection is
/// deterministic under test.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Replays a fixed sequence of draws, cycling when exhausted.
#[derive(Debug)]
pub struct SequenceRandom {
    draws: Vec<f64>,
    cursor: AtomicUsize,
}

impl SequenceRandom {
    pub fn new(draws: Vec<f64>) -> Self {
        Self {
            draws,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl RandomSource for SequenceRandom {
    fn next_f64(&self) -> f64 {
        if self.draws.is_empty() {
            return 0.0;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.draws.len();
        self.draws[i]
    }
}

/// Index picked by a cumulative-weight binary search for `draw` in `[0, 1)`.
///
/// Zero-weight entries are never picked unless every weight is zero, in which
/// case the first entry wins.
pub fn weighted_index(weights: &[u64], draw: f64) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let cumulative: Vec<u64> = weights
        .iter()
        .scan(0u64, |acc, w| {
            *acc = acc.saturating_add(*w);
            Some(*acc)
        })
        .collect();
    let total = *cumulative.last()?;
    if total == 0 {
        return Some(0);
    }
    let target = (draw.clamp(0.0, 1.0) * total as f64) as u64;
    let idx = cumulative.partition_point(|&c| c <= target);
    Some(idx.min(weights.len() - 1))
}

/// Pick one endpoint with probability proportional to its weight.
pub fn select_for_load_balancing<'a>(
    candidates: &'a [Endpoint],
    rng: &dyn RandomSource,
) -> Option<&'a Endpoint> {
    let weights: Vec<u64> = candidates.iter().map(|e| e.weight as u64).collect();
    weighted_index(&weights, rng.next_f64()).map(|i| &candidates[i])
}
