//! Weighted random selection over resolved addresses

use rand::Rng;
use rand::seq::IndexedRandom;
use tracing::debug;

use crate::address::{Address, ResolverState};

/// Picks one address per call, proportionally to instance weight.
pub struct Picker;

impl Picker {
    /// Addresses whose instance is not marked unhealthy
    pub fn healthy(state: &ResolverState) -> Vec<&Address> {
        state
            .addresses
            .iter()
            .filter(|a| a.instance.is_healthy())
            .collect()
    }

    /// Weighted random choice among healthy addresses. Instances without a
    /// weight count as 1.0.
    pub fn pick(state: &ResolverState) -> Option<&Address> {
        let healthy = Self::healthy(state);
        if healthy.is_empty() {
            debug!("No healthy address to pick from");
            return None;
        }

        let weight = |a: &Address| a.instance.weight.unwrap_or(1.0);
        let total: f64 = healthy.iter().map(|a| weight(a)).sum();
        if total <= 0.0 {
            return healthy.choose(&mut rand::rng()).copied();
        }

        let target = rand::rng().random::<f64>() * total;
        let mut sum = 0.0;
        for address in &healthy {
            sum += weight(address);
            if target < sum {
                return Some(*address);
            }
        }
        // Rounding can leave target == total
        healthy.last().copied()
    }

    /// Uniform random choice among healthy addresses.
    pub fn random(state: &ResolverState) -> Option<&Address> {
        Self::healthy(state).choose(&mut rand::rng()).copied()
    }
}
