//! Memory budgets, per-operator pools, and cooperative arbitration.
//!
//! A [`MemoryManager`] owns the engine-level budget. Every operator instance
//! gets a child [`MemoryPool`] and tracks two numbers in it:
//! - `used`: bytes the operator currently holds
//! - `reserved`: bytes granted by the manager, always `>= used`
//!
//! Reservations grow transactionally through [`MemoryPool::maybe_reserve`].
//! When the manager cannot grant a request it asks other pools to reclaim by
//! leaving a reclaim request that the owning operator honours at its next
//! batch boundary. Pools inside a reclaimable section are asked first; the
//! rest are only asked when those cannot cover the request. Pools never
//! block and take no locks on the hot path.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::error::{Result, StrataError};

/// Shared engine-level budget manager.
#[derive(Debug)]
pub struct MemoryManager {
    capacity_bytes: usize,
    reserved_bytes: AtomicUsize,
    reservation_failures: AtomicU64,
    pools: Mutex<Vec<Weak<MemoryPool>>>,
}

impl MemoryManager {
    /// Create a manager with an engine-level budget. `usize::MAX` disables the limit.
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity_bytes,
            reserved_bytes: AtomicUsize::new(0),
            reservation_failures: AtomicU64::new(0),
            pools: Mutex::new(Vec::new()),
        })
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Bytes currently reserved by all pools.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes.load(Ordering::Acquire)
    }

    pub fn available_bytes(&self) -> usize {
        self.capacity_bytes.saturating_sub(self.reserved_bytes())
    }

    /// Number of reservation requests the manager could not grant.
    pub fn reservation_failures(&self) -> u64 {
        self.reservation_failures.load(Ordering::Relaxed)
    }

    /// Create a named child pool.
    pub fn add_pool(self: &Arc<Self>, name: impl Into<String>) -> Arc<MemoryPool> {
        let pool = Arc::new(MemoryPool {
            name: name.into(),
            manager: Arc::clone(self),
            used_bytes: AtomicUsize::new(0),
            reserved_bytes: AtomicUsize::new(0),
            reclaimable: AtomicBool::new(false),
            in_reclaimable_section: AtomicBool::new(false),
            reclaim_request_bytes: AtomicUsize::new(0),
        });
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.retain(|p| p.strong_count() > 0);
        pools.push(Arc::downgrade(&pool));
        pool
    }

    fn try_grow(&self, bytes: usize) -> bool {
        if bytes == 0 {
            return true;
        }
        loop {
            let current = self.reserved_bytes.load(Ordering::Acquire);
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.capacity_bytes {
                return false;
            }
            if self
                .reserved_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn shrink(&self, bytes: usize) {
        if bytes > 0 {
            self.reserved_bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
    }

    /// Grant `bytes` to `requestor` or ask other reclaimable pools to free memory.
    ///
    /// Returns `false` when the bytes are not available right now. Reclaim
    /// requests are cooperative: the targeted operators spill at their next
    /// batch boundary. Victims inside their reclaimable section come first,
    /// then the largest users.
    fn arbitrate(&self, requestor: &MemoryPool, bytes: usize) -> bool {
        if self.try_grow(bytes) {
            return true;
        }
        self.reservation_failures.fetch_add(1, Ordering::Relaxed);

        let mut candidates = {
            let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
            pools
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|p| !std::ptr::eq(p.as_ref(), requestor))
                .filter(|p| p.is_reclaimable() && p.used_bytes() > 0)
                .collect::<Vec<_>>()
        };
        candidates.sort_by_key(|p| {
            (
                std::cmp::Reverse(p.in_reclaimable_section()),
                std::cmp::Reverse(p.used_bytes()),
            )
        });

        let mut requested = 0_usize;
        for pool in candidates {
            if requested >= bytes {
                break;
            }
            let target = pool.used_bytes();
            pool.request_reclaim(target);
            requested = requested.saturating_add(target);
            debug!(
                requestor = requestor.name(),
                victim = pool.name(),
                target_bytes = target,
                in_section = pool.in_reclaimable_section(),
                "memory arbitration requested reclaim"
            );
        }
        false
    }
}

/// Per-operator child pool.
#[derive(Debug)]
pub struct MemoryPool {
    name: String,
    manager: Arc<MemoryManager>,
    used_bytes: AtomicUsize,
    reserved_bytes: AtomicUsize,
    reclaimable: AtomicBool,
    in_reclaimable_section: AtomicBool,
    reclaim_request_bytes: AtomicUsize,
}

impl MemoryPool {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes.load(Ordering::Acquire)
    }

    /// Reserved bytes not yet used.
    pub fn available_reservation(&self) -> usize {
        self.reserved_bytes().saturating_sub(self.used_bytes())
    }

    /// Try to grow the reservation by `bytes`. Transactional: on failure nothing changes.
    pub fn maybe_reserve(&self, bytes: usize) -> bool {
        if self.manager.arbitrate(self, bytes) {
            self.reserved_bytes.fetch_add(bytes, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Return the unused part of the reservation to the manager.
    pub fn release(&self) {
        let used = self.used_bytes();
        let reserved = self.reserved_bytes();
        if reserved > used {
            self.reserved_bytes.store(used, Ordering::Release);
            self.manager.shrink(reserved - used);
        }
    }

    /// Record the bytes the owner now holds, growing the reservation if needed.
    ///
    /// # Errors
    /// Returns [`StrataError::ResourceExhausted`] when the manager cannot cover
    /// the growth. Callers are expected to have spilled before getting here.
    pub fn set_used(&self, bytes: usize) -> Result<()> {
        let reserved = self.reserved_bytes();
        if bytes > reserved {
            let grow = bytes - reserved;
            if !self.manager.try_grow(grow) {
                self.manager
                    .reservation_failures
                    .fetch_add(1, Ordering::Relaxed);
                return Err(StrataError::ResourceExhausted(format!(
                    "memory pool {} cannot grow by {grow} bytes: usage {}, reservation {reserved}, \
                     manager reserved {} of capacity {}",
                    self.name,
                    self.used_bytes(),
                    self.manager.reserved_bytes(),
                    self.manager.capacity_bytes
                )));
            }
            self.reserved_bytes.fetch_add(grow, Ordering::AcqRel);
        }
        self.used_bytes.store(bytes, Ordering::Release);
        crate::metrics::global_metrics().set_memory_pool_used(&self.name, bytes);
        Ok(())
    }

    /// Marks whether the owning operator can spill at all.
    pub fn set_reclaimable(&self, reclaimable: bool) {
        self.reclaimable.store(reclaimable, Ordering::Release);
    }

    pub fn is_reclaimable(&self) -> bool {
        self.reclaimable.load(Ordering::Acquire)
    }

    /// True while the owner is inside a [`ReclaimableSectionGuard`].
    pub fn in_reclaimable_section(&self) -> bool {
        self.in_reclaimable_section.load(Ordering::Acquire)
    }

    pub fn request_reclaim(&self, target_bytes: usize) {
        self.reclaim_request_bytes
            .fetch_max(target_bytes.max(1), Ordering::AcqRel);
    }

    /// Take a pending reclaim request, returning its target bytes.
    pub fn take_reclaim_request(&self) -> Option<usize> {
        match self.reclaim_request_bytes.swap(0, Ordering::AcqRel) {
            0 => None,
            target => Some(target),
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        self.manager.shrink(*self.reserved_bytes.get_mut());
    }
}

/// Marks a window during which the pool owner may be spilled to satisfy arbitration.
#[derive(Debug)]
pub struct ReclaimableSectionGuard<'a> {
    pool: &'a MemoryPool,
    previous: bool,
}

impl<'a> ReclaimableSectionGuard<'a> {
    pub fn new(pool: &'a MemoryPool) -> Self {
        let previous = pool.in_reclaimable_section.swap(true, Ordering::AcqRel);
        Self { pool, previous }
    }
}

impl Drop for ReclaimableSectionGuard<'_> {
    fn drop(&mut self) {
        self.pool
            .in_reclaimable_section
            .store(self.previous, Ordering::Release);
    }
}
