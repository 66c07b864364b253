//! Resource Grid Pools
//!
//! Fixed cyclic sets of resource grids. A grid is selected arithmetically
//! from the slot (`system_slot mod nof_slots`) and the sector, so the same
//! grid instance recurs every `nof_slots` slots. `nof_slots` must divide
//! the SFN period so the cycle holds across the wrap.
//!
//! Two flavours are provided:
//! - [`GenericResourceGridPool`] never clears grids. Channel kernels must
//!   overwrite every resource element they own on each reuse.
//! - [`AsynchronousResourceGridPool`] zeroes a grid `expire_timeout_slots`
//!   after it was issued, on a dedicated executor.

use super::resource_grid::{ResourceGrid, ResourceGridDimensions};
use crate::LayerError;
use common::types::SlotPoint;
use interfaces::TaskExecutor;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Identifies the grid requested for a slot and sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceGridContext {
    /// Slot the grid is used for
    pub slot: SlotPoint,
    /// Sector (cell) index
    pub sector: usize,
}

impl fmt::Display for ResourceGridContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot={} sector={}", self.slot, self.sector)
    }
}

struct PooledGrid {
    id: usize,
    grid: Mutex<ResourceGrid>,
    /// Live `SharedResourceGrid` handles
    borrows: AtomicUsize,
    /// Set when the grid expired and must be zeroed before its next access
    pending_zero: AtomicBool,
}

impl PooledGrid {
    fn lock(&self) -> MutexGuard<'_, ResourceGrid> {
        let mut grid = self.grid.lock();
        if self.pending_zero.swap(false, Ordering::AcqRel) {
            grid.set_all_zero();
        }
        grid
    }
}

/// Handle onto one pooled resource grid.
///
/// The grid stays borrowed while any handle is alive; the pool refuses to
/// issue it again until every handle has been dropped.
pub struct SharedResourceGrid {
    inner: Arc<PooledGrid>,
}

impl SharedResourceGrid {
    fn issue(inner: &Arc<PooledGrid>, context: &ResourceGridContext) -> Self {
        let previous = inner.borrows.fetch_add(1, Ordering::AcqRel);
        assert!(
            previous == 0,
            "resource grid {} requested for {} is still in use",
            inner.id,
            context
        );
        Self { inner: inner.clone() }
    }

    /// Position of the grid in its pool
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Lock the grid for reading or writing
    pub fn lock(&self) -> MutexGuard<'_, ResourceGrid> {
        self.inner.lock()
    }

    /// Whether both handles refer to the same pooled grid
    pub fn ptr_eq(&self, other: &SharedResourceGrid) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Clone for SharedResourceGrid {
    fn clone(&self) -> Self {
        self.inner.borrows.fetch_add(1, Ordering::AcqRel);
        Self { inner: self.inner.clone() }
    }
}

impl Drop for SharedResourceGrid {
    fn drop(&mut self) {
        self.inner.borrows.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for SharedResourceGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedResourceGrid").field("id", &self.inner.id).finish()
    }
}

/// Resource grid pool interface
pub trait ResourceGridPool: Send + Sync {
    /// Get the grid for a slot and sector.
    ///
    /// Never blocks. Requesting a grid that is still borrowed is fatal.
    fn get_resource_grid(&self, context: &ResourceGridContext) -> SharedResourceGrid;

    /// Total number of grids owned by the pool
    fn nof_grids(&self) -> usize;
}

struct GridStorage {
    nof_slots: usize,
    nof_sectors: usize,
    grids: Vec<Arc<PooledGrid>>,
}

impl GridStorage {
    fn new(nof_slots: usize, nof_sectors: usize, dims: ResourceGridDimensions) -> Result<Self, LayerError> {
        if nof_slots == 0 || nof_sectors == 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "Resource grid pool needs at least one slot and one sector (slots={}, sectors={})",
                nof_slots, nof_sectors
            )));
        }

        let grids = (0..nof_slots * nof_sectors)
            .map(|id| {
                Ok(Arc::new(PooledGrid {
                    id,
                    grid: Mutex::new(ResourceGrid::new(dims)?),
                    borrows: AtomicUsize::new(0),
                    pending_zero: AtomicBool::new(false),
                }))
            })
            .collect::<Result<Vec<_>, LayerError>>()?;

        debug!(
            "Allocated {} resource grids ({} slots x {} sectors, {:?})",
            grids.len(),
            nof_slots,
            nof_sectors,
            dims
        );

        Ok(Self { nof_slots, nof_sectors, grids })
    }

    fn index(&self, context: &ResourceGridContext) -> usize {
        assert!(
            context.sector < self.nof_sectors,
            "sector {} out of range (nof_sectors={})",
            context.sector,
            self.nof_sectors
        );
        let slot_index = context.slot.cycle_index(self.nof_slots);
        slot_index * self.nof_sectors + context.sector
    }

    fn issue(&self, index: usize, context: &ResourceGridContext) -> SharedResourceGrid {
        trace!("Issuing resource grid {} for {}", index, context);
        SharedResourceGrid::issue(&self.grids[index], context)
    }
}

/// Synchronous pool without automatic clearing
pub struct GenericResourceGridPool {
    storage: GridStorage,
}

impl GenericResourceGridPool {
    /// Create `nof_slots` x `nof_sectors` grids of the given dimensions
    pub fn new(nof_slots: usize, nof_sectors: usize, dims: ResourceGridDimensions) -> Result<Self, LayerError> {
        Ok(Self {
            storage: GridStorage::new(nof_slots, nof_sectors, dims)?,
        })
    }
}

impl ResourceGridPool for GenericResourceGridPool {
    fn get_resource_grid(&self, context: &ResourceGridContext) -> SharedResourceGrid {
        let index = self.storage.index(context);
        self.storage.issue(index, context)
    }

    fn nof_grids(&self) -> usize {
        self.storage.grids.len()
    }
}

/// Pool that zeroes grids asynchronously once they expire
pub struct AsynchronousResourceGridPool {
    storage: GridStorage,
    expire_timeout_slots: u32,
    /// Expiry slot of every grid, `None` when not armed
    expire_slots: Mutex<Vec<Option<SlotPoint>>>,
    executor: Arc<dyn TaskExecutor>,
}

impl AsynchronousResourceGridPool {
    /// Create the pool.
    ///
    /// `expire_timeout_slots` must be smaller than `nof_slots` so that a
    /// grid always expires before it is selected again.
    pub fn new(
        nof_slots: usize,
        nof_sectors: usize,
        dims: ResourceGridDimensions,
        expire_timeout_slots: u32,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self, LayerError> {
        if expire_timeout_slots == 0 || expire_timeout_slots as usize >= nof_slots {
            return Err(LayerError::InvalidConfiguration(format!(
                "Resource grid expire timeout ({} slots) must be in 1..{}",
                expire_timeout_slots, nof_slots
            )));
        }

        let storage = GridStorage::new(nof_slots, nof_sectors, dims)?;
        let expire_slots = Mutex::new(vec![None; storage.grids.len()]);

        Ok(Self {
            storage,
            expire_timeout_slots,
            expire_slots,
            executor,
        })
    }

    /// Dispatch zeroing of every grid whose expiry slot has been reached
    fn expire(&self, expire_slots: &mut [Option<SlotPoint>], now: SlotPoint) {
        for (index, expire_at) in expire_slots.iter_mut().enumerate() {
            let Some(at) = *expire_at else {
                continue;
            };
            if at > now {
                continue;
            }

            let grid = &self.storage.grids[index];
            if grid.borrows.load(Ordering::Acquire) != 0 {
                trace!("Resource grid {} expired at {} but is still in use, postponing", index, at);
                continue;
            }

            grid.pending_zero.store(true, Ordering::Release);
            let grid = grid.clone();
            let accepted = self.executor.execute(Box::new(move || {
                drop(grid.lock());
            }));
            assert!(
                accepted,
                "failed to dispatch zeroing of resource grid {}: grid expiry executor is undersized",
                index
            );

            trace!("Resource grid {} expired at {}, zeroing dispatched", index, at);
            *expire_at = None;
        }
    }
}

impl ResourceGridPool for AsynchronousResourceGridPool {
    fn get_resource_grid(&self, context: &ResourceGridContext) -> SharedResourceGrid {
        let mut expire_slots = self.expire_slots.lock();
        self.expire(&mut expire_slots, context.slot);

        let index = self.storage.index(context);
        let grid = self.storage.issue(index, context);
        expire_slots[index] = Some(context.slot + self.expire_timeout_slots);
        grid
    }

    fn nof_grids(&self) -> usize {
        self.storage.grids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::ManualExecutor;
    use num_complex::Complex32;

    fn dims() -> ResourceGridDimensions {
        ResourceGridDimensions::with_prb(2, 25)
    }

    fn context(count: u32) -> ResourceGridContext {
        ResourceGridContext {
            slot: SlotPoint::from_system_slot(0, count),
            sector: 0,
        }
    }

    fn fill(grid: &SharedResourceGrid) {
        let mut guard = grid.lock();
        for port in 0..guard.nof_ports() {
            guard.put(port, 0, 0, Complex32::new(1.0, 0.0)).unwrap();
        }
    }

    #[test]
    fn test_grid_recurs_every_pool_size_slots() {
        let pool = GenericResourceGridPool::new(16, 1, dims()).unwrap();

        for slot in [0u32, 5, 15, 10_239] {
            let first = pool.get_resource_grid(&context(slot));
            let first_id = first.id();
            first.lock().put(0, 1, 1, Complex32::new(3.0, 0.0)).unwrap();
            drop(first);

            let again = pool.get_resource_grid(&context(slot + 16));
            assert_eq!(again.id(), first_id);
            // Same instance: the generic pool keeps previous contents.
            assert_eq!(again.lock().get(0, 1, 1), Some(Complex32::new(3.0, 0.0)));
            again.lock().set_all_zero();
        }
    }

    #[test]
    fn test_grid_cycle_holds_across_sfn_wrap() {
        let pool = GenericResourceGridPool::new(16, 1, dims()).unwrap();
        let before_wrap = SlotPoint::from_system_slot(0, 10_236);

        let first_id = pool.get_resource_grid(&context(10_236)).id();
        let after_wrap = ResourceGridContext {
            slot: before_wrap + 16,
            sector: 0,
        };
        assert_eq!(after_wrap.slot.system_slot(), 12);
        assert_eq!(pool.get_resource_grid(&after_wrap).id(), first_id);
    }

    #[test]
    #[should_panic(expected = "does not divide the SFN period")]
    fn test_pool_size_must_divide_sfn_period() {
        let pool = GenericResourceGridPool::new(12, 1, dims()).unwrap();
        let _ = pool.get_resource_grid(&context(10_236));
    }

    #[test]
    fn test_async_zeroing_across_sfn_wrap() {
        let executor = Arc::new(ManualExecutor::new());
        let pool = AsynchronousResourceGridPool::new(16, 1, dims(), 10, executor.clone()).unwrap();

        let start = SlotPoint::from_system_slot(0, 10_236);
        let written = pool.get_resource_grid(&ResourceGridContext { slot: start, sector: 0 });
        written.lock().put(0, 0, 0, Complex32::new(5.0, 0.0)).unwrap();
        let written_id = written.id();
        drop(written);

        for step in 1..16 {
            drop(pool.get_resource_grid(&ResourceGridContext {
                slot: start + step,
                sector: 0,
            }));
            executor.run_pending();
        }

        let reused = pool.get_resource_grid(&ResourceGridContext {
            slot: start + 16,
            sector: 0,
        });
        assert_eq!(reused.id(), written_id);
        assert_eq!(reused.lock().get(0, 0, 0), Some(Complex32::new(0.0, 0.0)));
    }

    #[test]
    fn test_consecutive_slots_use_distinct_grids() {
        let pool = GenericResourceGridPool::new(4, 2, dims()).unwrap();
        assert_eq!(pool.nof_grids(), 8);

        let mut ids = Vec::new();
        let mut held = Vec::new();
        for slot in 0..4 {
            for sector in 0..2 {
                let grid = pool.get_resource_grid(&ResourceGridContext {
                    slot: SlotPoint::from_system_slot(0, slot),
                    sector,
                });
                ids.push(grid.id());
                held.push(grid);
            }
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[test]
    #[should_panic(expected = "is still in use")]
    fn test_reuse_of_borrowed_grid_is_fatal() {
        let pool = GenericResourceGridPool::new(4, 1, dims()).unwrap();
        let _held = pool.get_resource_grid(&context(1));
        let _again = pool.get_resource_grid(&context(5));
    }

    #[test]
    #[should_panic(expected = "sector 1 out of range")]
    fn test_sector_out_of_range_is_fatal() {
        let pool = GenericResourceGridPool::new(4, 1, dims()).unwrap();
        let _ = pool.get_resource_grid(&ResourceGridContext {
            slot: SlotPoint::from_system_slot(0, 0),
            sector: 1,
        });
    }

    #[test]
    fn test_clone_keeps_grid_borrowed() {
        let pool = GenericResourceGridPool::new(2, 1, dims()).unwrap();
        let grid = pool.get_resource_grid(&context(0));
        let clone = grid.clone();
        assert!(grid.ptr_eq(&clone));
        drop(grid);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            drop(pool.get_resource_grid(&context(2)));
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_async_timeout() {
        let executor = Arc::new(ManualExecutor::new());
        assert!(AsynchronousResourceGridPool::new(4, 1, dims(), 4, executor.clone()).is_err());
        assert!(AsynchronousResourceGridPool::new(4, 1, dims(), 0, executor).is_err());
    }

    #[test]
    fn test_expired_grid_is_zeroed_asynchronously() {
        let executor = Arc::new(ManualExecutor::new());
        let pool = AsynchronousResourceGridPool::new(4, 1, dims(), 2, executor.clone()).unwrap();

        let grid = pool.get_resource_grid(&context(0));
        fill(&grid);
        let inner = grid.inner.clone();
        drop(grid);

        drop(pool.get_resource_grid(&context(1)));
        assert_eq!(executor.nof_pending(), 0);

        // Slot 2 reaches the expiry of grid 0.
        drop(pool.get_resource_grid(&context(2)));
        assert_eq!(executor.nof_pending(), 1);
        assert!(!inner.grid.lock().is_all_zero());

        assert_eq!(executor.run_pending(), 1);
        assert!(inner.grid.lock().is_all_zero());

        drop(pool.get_resource_grid(&context(3)));
        let reused = pool.get_resource_grid(&context(4));
        assert_eq!(reused.id(), 0);
        let guard = reused.lock();
        assert!(guard.is_all_zero());
        for port in 0..guard.nof_ports() {
            assert!(guard.is_empty(port));
        }
    }

    #[test]
    fn test_reissued_grid_is_zero_before_expiry_task_runs() {
        let executor = Arc::new(ManualExecutor::new());
        let pool = AsynchronousResourceGridPool::new(4, 1, dims(), 2, executor.clone()).unwrap();

        for slot in 0..4 {
            let grid = pool.get_resource_grid(&context(slot));
            fill(&grid);
        }

        // Zeroing tasks are queued but have not run yet.
        let reused = pool.get_resource_grid(&context(4));
        assert!(executor.nof_pending() > 0);
        assert!(reused.lock().is_all_zero());

        executor.run_pending();
        assert!(reused.lock().is_all_zero());
    }

    #[test]
    fn test_expiry_postponed_while_borrowed() {
        let executor = Arc::new(ManualExecutor::new());
        let pool = AsynchronousResourceGridPool::new(4, 1, dims(), 1, executor.clone()).unwrap();

        let held = pool.get_resource_grid(&context(0));
        fill(&held);

        drop(pool.get_resource_grid(&context(1)));
        assert_eq!(executor.nof_pending(), 0);
        executor.run_pending();
        assert!(!held.lock().is_all_zero());

        drop(held);
        drop(pool.get_resource_grid(&context(2)));
        // Grid 0 now expires, grid 1 as well.
        assert_eq!(executor.run_pending(), 2);
        let reused = pool.get_resource_grid(&context(4));
        assert!(reused.lock().is_all_zero());
    }

    #[test]
    #[should_panic(expected = "grid expiry executor is undersized")]
    fn test_zeroing_dispatch_failure_is_fatal() {
        let executor = Arc::new(ManualExecutor::new());
        executor.set_accepting(false);
        let pool = AsynchronousResourceGridPool::new(4, 1, dims(), 1, executor).unwrap();

        drop(pool.get_resource_grid(&context(0)));
        drop(pool.get_resource_grid(&context(1)));
    }
}
