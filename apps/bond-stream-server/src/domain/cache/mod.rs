//! Latest-State Bond Cache
//!
//! The cache stage's canonical table: every bond ever seen gets a stable
//! slot index assigned in first-seen order, and each slot holds the
//! serialized form of the bond's latest enriched state (plus the structured
//! record for the query API).
//!
//! # Concurrency
//!
//! A single lock guards the id→slot map, the slot array, and (implicitly,
//! as the array length) the live count, so the map insert, slot write, and
//! live-count advance of an upsert are one critical section. Readers take
//! the lock only long enough to clone the refcounted slot contents for
//! `[0, live_count)`; a reader can never observe a slot index that has not
//! been written. Slot *content* is not frozen against concurrent upserts,
//! an accepted weak-consistency trade-off favoring throughput.
//!
//! # Capacity
//!
//! Slots are never reused, so the table is bounded by a fixed capacity.
//! Exceeding it is a configuration error, not a recoverable condition: the
//! caller is expected to treat [`CacheError::CapacityExceeded`] as fatal.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::bond::{BondUpdate, EnrichedBond};

// =============================================================================
// Errors
// =============================================================================

/// Errors from cache maintenance.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Every slot is in use; the instrument universe outgrew the
    /// configured capacity. Unrecoverable.
    #[error("bond cache capacity exceeded: all {capacity} slots in use")]
    CapacityExceeded {
        /// The configured slot capacity.
        capacity: usize,
    },

    /// Bond state could not be serialized.
    #[error("failed to serialize bond state: {0}")]
    Serialize(#[from] serde_json::Error),
}

// =============================================================================
// Cache
// =============================================================================

/// One slot: the latest serialized state plus the structured record.
struct CacheSlot {
    serialized: Arc<str>,
    entry: Arc<EnrichedBond>,
}

/// Table state guarded by the cache lock.
struct CacheTable {
    slots: Vec<CacheSlot>,
    index_by_id: HashMap<String, usize>,
}

/// Concurrently readable latest-state table for all bonds.
///
/// # Example
///
/// ```rust
/// use bond_stream_server::domain::analytics::enrich;
/// use bond_stream_server::domain::bond::Bond;
/// use bond_stream_server::domain::cache::StatusCache;
///
/// let cache = StatusCache::new(16);
/// let bond = Bond {
///     id: "UST-000001".to_string(),
///     price: 1000,
///     face_value: 100,
///     coupon: 4,
///     duration_days: 730,
/// };
/// let update = cache.apply(enrich(&bond, chrono::Utc::now())).unwrap();
/// assert_eq!(update.bond_id, "UST-000001");
/// assert_eq!(cache.snapshot().len(), 1);
/// ```
pub struct StatusCache {
    capacity: usize,
    inner: RwLock<CacheTable>,
}

impl StatusCache {
    /// Create an empty cache bounded to `capacity` distinct bonds.
    ///
    /// The slot array is allocated up front so it never reallocates while
    /// the pipeline runs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(CacheTable {
                slots: Vec::with_capacity(capacity),
                index_by_id: HashMap::new(),
            }),
        }
    }

    /// Upsert one enriched bond and return the change notification.
    ///
    /// A new id is assigned the next sequential slot (fatally erroring if
    /// capacity is exhausted); an existing id overwrites its slot in place,
    /// index unchanged.
    pub fn apply(&self, enriched: EnrichedBond) -> Result<BondUpdate, CacheError> {
        // Serialize outside the critical section.
        let serialized: Arc<str> = serde_json::to_string(&enriched)?.into();
        let bond_id = enriched.id.clone();
        let entry = Arc::new(enriched);

        let mut table = self.inner.write();
        Self::upsert_locked(&mut table, self.capacity, Arc::clone(&serialized), entry)?;
        drop(table);

        Ok(BondUpdate {
            bond_id,
            serialized,
        })
    }

    /// One-time bulk load of the starting universe.
    ///
    /// Intended to run before the pipeline (and any reader) starts: the
    /// whole seed is loaded under one lock acquisition, slots assigned in
    /// input order. Duplicate ids in the seed upsert like `apply`.
    pub fn initialize(&self, seed: Vec<EnrichedBond>) -> Result<(), CacheError> {
        let mut table = self.inner.write();
        for enriched in seed {
            let serialized: Arc<str> = serde_json::to_string(&enriched)?.into();
            Self::upsert_locked(&mut table, self.capacity, serialized, Arc::new(enriched))?;
        }
        Ok(())
    }

    /// Serialized latest state of every bond, slots `[0, live_count)` at
    /// the instant of the call.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<str>> {
        let table = self.inner.read();
        table
            .slots
            .iter()
            .map(|slot| Arc::clone(&slot.serialized))
            .collect()
    }

    /// Structured variant of [`snapshot`](Self::snapshot) for the query API.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<EnrichedBond>> {
        let table = self.inner.read();
        table
            .slots
            .iter()
            .map(|slot| Arc::clone(&slot.entry))
            .collect()
    }

    /// Slot index assigned to `id`, if it has been seen.
    #[must_use]
    pub fn slot_of(&self, id: &str) -> Option<usize> {
        self.inner.read().index_by_id.get(id).copied()
    }

    /// Number of distinct bonds seen so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().slots.len()
    }

    /// Whether the cache holds no bonds yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().slots.is_empty()
    }

    /// The configured slot capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn upsert_locked(
        table: &mut CacheTable,
        capacity: usize,
        serialized: Arc<str>,
        entry: Arc<EnrichedBond>,
    ) -> Result<(), CacheError> {
        let existing = table.index_by_id.get(entry.id.as_str()).copied();
        match existing {
            Some(slot) => {
                table.slots[slot] = CacheSlot { serialized, entry };
            }
            None => {
                if table.slots.len() == capacity {
                    return Err(CacheError::CapacityExceeded { capacity });
                }
                table.index_by_id.insert(entry.id.clone(), table.slots.len());
                table.slots.push(CacheSlot { serialized, entry });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
