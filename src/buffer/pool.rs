use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::region::Region;

const FREE: u8 = 0;
const ACQUIRED: u8 = 1;

/// Errors from the buffer pool
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// Every slot of the fitting tier is held; callers fall back to copying
    #[error("no free buffer slot for {min_size} bytes")]
    PoolExhausted { min_size: usize },

    #[error("requested {requested} bytes but the largest tier holds {largest}")]
    TooLarge { requested: usize, largest: usize },

    #[error("payload of {len} bytes exceeds slot capacity of {capacity} bytes")]
    Overflow { len: usize, capacity: usize },
}

/// One size tier: `slots` regions of `slot_size` bytes each
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub slot_size: usize,
    pub slots: usize,
}

/// Buffer pool configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Enabled size tiers; sorted by slot size when the pool is built
    pub tiers: Vec<TierConfig>,
    /// Try shared mappings first; heap buffers are always the fallback
    pub prefer_shared: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                // 256px tile
                TierConfig {
                    slot_size: 256 * 256 * 4,
                    slots: 16,
                },
                // 512px tile
                TierConfig {
                    slot_size: 512 * 512 * 4,
                    slots: 8,
                },
                // Letter page at 2x
                TierConfig {
                    slot_size: 1224 * 1584 * 4,
                    slots: 2,
                },
            ],
            prefer_shared: true,
        }
    }
}

struct Slot {
    region: Region,
    state: AtomicU8,
}

struct Tier {
    slot_size: usize,
    slots: Box<[Slot]>,
}

struct Inner {
    tiers: Vec<Tier>,
    shared: bool,
}

/// Point-in-time occupancy of one tier
#[derive(Clone, Copy, Debug, Serialize)]
pub struct TierStats {
    pub slot_size: usize,
    pub slots: usize,
    pub acquired: usize,
}

/// Fixed pool of pre-allocated pixel buffers, tiered by size.
///
/// Slots change owner only through an atomic compare-and-swap on acquire and
/// an atomic store on release, so workers and the coordinator may race on the
/// same tier without a lock. A tier never grows: when all its slots are held,
/// `acquire` misses and the caller takes the copying path.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// Builds every configured tier up front.
    ///
    /// If a shared mapping cannot be created the whole pool falls back to
    /// heap buffers and reports `is_shared() == false`.
    #[must_use]
    pub fn new(config: &BufferPoolConfig) -> Self {
        let mut tiers_config = config.tiers.clone();
        tiers_config.retain(|tier| tier.slot_size > 0 && tier.slots > 0);
        tiers_config.sort_by_key(|tier| tier.slot_size);

        let tiers = if config.prefer_shared {
            match Self::build_tiers(&tiers_config, Region::map_shared) {
                Ok(tiers) => Some(tiers),
                Err(e) => {
                    warn!("shared buffers unavailable, using heap buffers: {e}");
                    None
                }
            }
        } else {
            None
        };

        let (tiers, shared) = match tiers {
            Some(tiers) => (tiers, true),
            None => {
                let tiers = Self::build_tiers(&tiers_config, |len| Ok(Region::heap(len)))
                    .unwrap_or_default();
                (tiers, false)
            }
        };

        let total_mb = tiers
            .iter()
            .map(|tier| tier.slot_size * tier.slots.len())
            .sum::<usize>() as f64
            / (1024.0 * 1024.0);
        info!(
            "buffer pool initialized: {} tiers, {total_mb:.1} MB, shared={shared}",
            tiers.len()
        );

        Self {
            inner: Arc::new(Inner { tiers, shared }),
        }
    }

    /// A pool with no tiers; every acquire misses.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Inner {
                tiers: Vec::new(),
                shared: false,
            }),
        }
    }

    fn build_tiers(
        configs: &[TierConfig],
        mut alloc: impl FnMut(usize) -> std::io::Result<Region>,
    ) -> std::io::Result<Vec<Tier>> {
        configs
            .iter()
            .map(|config| {
                let slots = (0..config.slots)
                    .map(|_| {
                        Ok(Slot {
                            region: alloc(config.slot_size)?,
                            state: AtomicU8::new(FREE),
                        })
                    })
                    .collect::<std::io::Result<Vec<_>>>()?;
                Ok(Tier {
                    slot_size: config.slot_size,
                    slots: slots.into_boxed_slice(),
                })
            })
            .collect()
    }

    /// Acquires a free slot from the smallest tier that fits `min_size`.
    ///
    /// Returns `None` when that tier is exhausted or nothing is large enough.
    #[must_use]
    pub fn acquire(&self, min_size: usize) -> Option<BufferLease> {
        match self.try_acquire(min_size) {
            Ok(lease) => Some(lease),
            Err(e) => {
                debug!("buffer acquire missed: {e}");
                None
            }
        }
    }

    /// Like [`BufferPool::acquire`] but reports why a slot was not handed out.
    pub fn try_acquire(&self, min_size: usize) -> Result<BufferLease, BufferError> {
        let Some(tier_index) = self
            .inner
            .tiers
            .iter()
            .position(|tier| tier.slot_size >= min_size)
        else {
            return Err(BufferError::TooLarge {
                requested: min_size,
                largest: self.largest_slot(),
            });
        };

        let tier = &self.inner.tiers[tier_index];
        for (slot_index, slot) in tier.slots.iter().enumerate() {
            if slot
                .state
                .compare_exchange(FREE, ACQUIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(BufferLease {
                    pool: Arc::clone(&self.inner),
                    tier: tier_index,
                    slot: slot_index,
                    len: 0,
                });
            }
        }

        Err(BufferError::PoolExhausted { min_size })
    }

    /// Returns a slot to the pool. Equivalent to dropping the lease.
    pub fn release(&self, lease: BufferLease) {
        drop(lease);
    }

    /// Whether slots are backed by shared mappings
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.inner.shared
    }

    /// Largest slot size across all tiers, 0 when disabled
    #[must_use]
    pub fn largest_slot(&self) -> usize {
        self.inner
            .tiers
            .last()
            .map_or(0, |tier| tier.slot_size)
    }

    /// Number of free slots in the tier that would serve `min_size`
    #[must_use]
    pub fn available(&self, min_size: usize) -> usize {
        self.inner
            .tiers
            .iter()
            .find(|tier| tier.slot_size >= min_size)
            .map_or(0, |tier| {
                tier.slots
                    .iter()
                    .filter(|slot| slot.state.load(Ordering::Acquire) == FREE)
                    .count()
            })
    }

    #[must_use]
    pub fn stats(&self) -> Vec<TierStats> {
        self.inner
            .tiers
            .iter()
            .map(|tier| TierStats {
                slot_size: tier.slot_size,
                slots: tier.slots.len(),
                acquired: tier
                    .slots
                    .iter()
                    .filter(|slot| slot.state.load(Ordering::Acquire) == ACQUIRED)
                    .count(),
            })
            .collect()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("shared", &self.inner.shared)
            .field("tiers", &self.stats())
            .finish()
    }
}

/// Exclusive hold on one buffer slot.
///
/// The slot is released when the lease is dropped, so a slot can never be
/// released twice or used after release.
pub struct BufferLease {
    pool: Arc<Inner>,
    tier: usize,
    slot: usize,
    len: usize,
}

impl BufferLease {
    fn slot(&self) -> &Slot {
        &self.pool.tiers[self.tier].slots[self.slot]
    }

    /// Index of the slot within its tier
    #[must_use]
    pub fn index(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slot().region.len()
    }

    /// Number of payload bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the backing memory is a shared mapping; when false the
    /// consumer has to copy anyway, so a redundant copy can be skipped
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.slot().region.is_shared()
    }

    /// Exposes the first `len` bytes of the slot for writing and marks them
    /// as the payload.
    pub fn writable(&mut self, len: usize) -> Result<&mut [u8], BufferError> {
        let capacity = self.capacity();
        if len > capacity {
            return Err(BufferError::Overflow { len, capacity });
        }
        self.len = len;
        // SAFETY: the lease owns the slot (state is ACQUIRED) and `&mut self`
        // guarantees no other borrow of the bytes is alive.
        let bytes = unsafe { self.slot().region.bytes_mut() };
        Ok(&mut bytes[..len])
    }

    /// The payload bytes for writing
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.len;
        // SAFETY: as in `writable`.
        let bytes = unsafe { self.slot().region.bytes_mut() };
        &mut bytes[..len]
    }

    /// Copies `data` into the slot.
    pub fn write(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.writable(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// The payload bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        // SAFETY: the lease owns the slot; shared borrows of `self` cannot
        // coexist with the mutable borrow handed out by `writable`.
        let bytes = unsafe { self.slot().region.bytes() };
        &bytes[..self.len]
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("tier", &self.tier)
            .field("slot", &self.slot)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        let previous = self.slot().state.swap(FREE, Ordering::Release);
        debug_assert_eq!(previous, ACQUIRED, "buffer slot released while free");
    }
}
