//! Graduated response to host memory pressure

use std::sync::atomic::Ordering;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::tile_cache::{Counters, TileCache};

/// Memory pressure reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Moderate,
    High,
    Critical,
}

impl PressureLevel {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            PressureLevel::Normal => 0,
            PressureLevel::Moderate => 1,
            PressureLevel::High => 2,
            PressureLevel::Critical => 3,
        }
    }

    #[must_use]
    pub fn from_u8(level: u8) -> Self {
        match level {
            0 => PressureLevel::Normal,
            1 => PressureLevel::Moderate,
            2 => PressureLevel::High,
            _ => PressureLevel::Critical,
        }
    }

    /// Share of the baseline L2 limits allowed at this level
    #[must_use]
    pub fn l2_fraction(self) -> f64 {
        match self {
            PressureLevel::Normal => 1.0,
            PressureLevel::Moderate => 0.75,
            PressureLevel::High => 0.5,
            PressureLevel::Critical => 0.25,
        }
    }
}

fn fraction(value: usize, share: f64) -> usize {
    ((value as f64 * share) as usize).max(1)
}

impl TileCache {
    #[must_use]
    pub fn pressure_level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.pressure.load(Ordering::Relaxed))
    }

    /// Shrinks the cache for `level`, always relative to the baseline limits.
    ///
    /// Moderate and above cut L2 to 75/50/25% of baseline. High also halves
    /// L1; critical empties L1 and drops tiles a higher scale fully covers.
    /// Returns how many entries were dropped.
    pub fn apply_memory_pressure(&self, level: PressureLevel) -> usize {
        if level == PressureLevel::Normal {
            return self.restore_memory_limits();
        }

        let share = level.l2_fraction();
        let l2_entries = fraction(self.baseline.l2_max_entries, share);
        let l2_bytes = fraction(self.baseline.l2_max_bytes, share);
        let l1_entries = match level {
            PressureLevel::Normal | PressureLevel::Moderate => self.baseline.l1_max_entries,
            PressureLevel::High | PressureLevel::Critical => {
                fraction(self.baseline.l1_max_entries, 0.5)
            }
        };

        let mut dropped = {
            let mut l1 = self.lock_l1();
            let mut l2 = self.lock_l2();

            let mut dropped = l1.set_limits(l1_entries, None).len();
            if level == PressureLevel::Critical {
                dropped += l1.clear();
            }

            let evicted = l2.store.set_limits(l2_entries, Some(l2_bytes));
            for (key, _) in &evicted {
                l2.index.remove(key);
                l1.remove(key);
            }
            Counters::bump(&self.counters.evictions, evicted.len() as u64);
            dropped + evicted.len()
        };

        if level == PressureLevel::Critical {
            dropped += self.evict_intermediate_scales();
        }

        self.pressure.store(level.as_u8(), Ordering::Relaxed);
        warn!(
            "memory pressure {level:?}: L2 limited to {l2_entries} entries / {} MiB, {dropped} entries dropped",
            l2_bytes / (1024 * 1024)
        );
        dropped
    }

    /// Returns to the baseline limits once pressure subsides.
    pub fn restore_memory_limits(&self) -> usize {
        let mut l1 = self.lock_l1();
        let mut l2 = self.lock_l2();
        let dropped = l1.set_limits(self.baseline.l1_max_entries, None).len();
        // Growing limits never evicts; the result is empty
        let evicted = l2
            .store
            .set_limits(self.baseline.l2_max_entries, Some(self.baseline.l2_max_bytes));
        for (key, _) in &evicted {
            l2.index.remove(key);
            l1.remove(key);
        }
        drop(l2);
        drop(l1);

        if self.pressure.swap(0, Ordering::Relaxed) != 0 {
            info!("memory pressure cleared, cache limits restored");
        }
        dropped + evicted.len()
    }
}
