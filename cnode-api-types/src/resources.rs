use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// A resource vector over the dimensions the scheduler reasons about.
///
/// Kept as a plain struct of `f64`s (rather than a generic map) because the
/// dimension set is small and fixed, the same shape `ChunkStat` (a plain
/// struct of counters) uses in the teacher rather than a generic registry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ResourceVector {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
    pub user_slots: f64,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector {
        cpu: 0.0,
        memory: 0.0,
        network: 0.0,
        user_slots: 0.0,
    };

    pub fn max(self, other: Self) -> Self {
        ResourceVector {
            cpu: self.cpu.max(other.cpu),
            memory: self.memory.max(other.memory),
            network: self.network.max(other.network),
            user_slots: self.user_slots.max(other.user_slots),
        }
    }

    pub fn min(self, other: Self) -> Self {
        ResourceVector {
            cpu: self.cpu.min(other.cpu),
            memory: self.memory.min(other.memory),
            network: self.network.min(other.network),
            user_slots: self.user_slots.min(other.user_slots),
        }
    }

    pub fn scale(self, factor: f64) -> Self {
        ResourceVector {
            cpu: self.cpu * factor,
            memory: self.memory * factor,
            network: self.network * factor,
            user_slots: self.user_slots * factor,
        }
    }

    /// Dominant-resource share of `self` against `total`: the maximum, over
    /// all dimensions, of `self[dim] / total[dim]` (0 if `total[dim]` is 0
    /// and `self[dim]` is 0, infinite practically capped at 1.0 by callers).
    pub fn dominant_share(self, total: ResourceVector) -> f64 {
        let dims = [
            ratio(self.cpu, total.cpu),
            ratio(self.memory, total.memory),
            ratio(self.network, total.network),
            ratio(self.user_slots, total.user_slots),
        ];
        dims.into_iter().fold(0.0_f64, f64::max)
    }

    /// True if every dimension of `self` is `<=` the matching dimension of
    /// `other` within `epsilon`.
    pub fn fits_within(self, other: Self, epsilon: f64) -> bool {
        self.cpu <= other.cpu + epsilon
            && self.memory <= other.memory + epsilon
            && self.network <= other.network + epsilon
            && self.user_slots <= other.user_slots + epsilon
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator <= 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

impl Add for ResourceVector {
    type Output = ResourceVector;
    fn add(self, rhs: Self) -> Self::Output {
        ResourceVector {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            network: self.network + rhs.network,
            user_slots: self.user_slots + rhs.user_slots,
        }
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for ResourceVector {
    type Output = ResourceVector;
    fn sub(self, rhs: Self) -> Self::Output {
        ResourceVector {
            cpu: self.cpu - rhs.cpu,
            memory: self.memory - rhs.memory,
            network: self.network - rhs.network,
            user_slots: self.user_slots - rhs.user_slots,
        }
    }
}

impl SubAssign for ResourceVector {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dominant_share_picks_the_binding_dimension() {
        let usage = ResourceVector {
            cpu: 5.0,
            memory: 1.0,
            network: 0.0,
            user_slots: 0.0,
        };
        let total = ResourceVector {
            cpu: 10.0,
            memory: 10.0,
            network: 10.0,
            user_slots: 10.0,
        };
        assert_eq!(usage.dominant_share(total), 0.5);
    }

    #[test]
    fn fits_within_respects_epsilon() {
        let a = ResourceVector {
            cpu: 1.0001,
            ..ResourceVector::ZERO
        };
        let b = ResourceVector {
            cpu: 1.0,
            ..ResourceVector::ZERO
        };
        assert!(a.fits_within(b, 1e-3));
        assert!(!a.fits_within(b, 1e-6));
    }
}
