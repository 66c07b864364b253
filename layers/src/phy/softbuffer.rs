//! HARQ Softbuffer Pools
//!
//! Bounded pools of HARQ buffers keyed by RNTI and HARQ process. The receive
//! side accumulates LLRs across retransmissions together with the CRC state
//! of every codeblock; the transmit side keeps the circular buffer used for
//! rate matching.
//!
//! Codeblock storage is allocated once. Boxed codeblocks move between the
//! pool's free list and the buffers that reserve them, so steady-state
//! operation never allocates.
//!
//! Buffers are evicted after `expire_timeout_slots` slots without being
//! reserved (time-to-live), or when released by their owner.

use crate::LayerError;
use common::types::{Rnti, SlotPoint};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Soft bit representation used by the receive chain
pub type LogLikelihoodRatio = i8;

/// Maximum number of codeblocks of a single transport block (TS 38.212 Section 5.2.2)
pub const MAX_NOF_CODEBLOCKS_PER_BUFFER: usize = 152;

/// Key under which a HARQ buffer is reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftbufferIdentifier {
    pub rnti: Rnti,
    pub harq_ack_id: u8,
}

impl fmt::Display for SoftbufferIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rnti={} h_id={}", self.rnti, self.harq_ack_id)
    }
}

/// Softbuffer pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftbufferPoolConfig {
    /// Maximum number of buffers reserved at the same time
    pub max_softbuffers: usize,
    /// Codeblocks shared by all buffers
    pub max_nof_codeblocks: usize,
    /// Size of every codeblock in soft bits
    pub max_codeblock_size: usize,
    /// Idle slots after which a buffer is evicted
    pub expire_timeout_slots: u32,
    /// Soft bits live outside the pool (e.g. in an accelerator); only CRC state is kept
    pub external_soft_bits: bool,
}

/// Softbuffer reservation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SoftbufferError {
    #[error("No softbuffer available for {id} ({in_use} in use)")]
    PoolExhausted { id: SoftbufferIdentifier, in_use: usize },

    #[error("Insufficient codeblocks for {id}: requested {requested}, available {available}")]
    CodeblocksExhausted {
        id: SoftbufferIdentifier,
        requested: usize,
        available: usize,
    },

    #[error("Codeblock size {size} exceeds the maximum {max}")]
    InvalidCodeblockSize { size: usize, max: usize },

    #[error("Invalid number of codeblocks {0}")]
    InvalidNofCodeblocks(usize),

    #[error("Softbuffer {0} expired")]
    Expired(SoftbufferIdentifier),
}

struct SoftbufferState<T> {
    id: Option<SoftbufferIdentifier>,
    /// Bumped every time the buffer is freed, invalidating older handles
    generation: u64,
    codeblocks: Vec<Box<[T]>>,
    crc: Vec<bool>,
    codeblock_size: usize,
    idle_slots: u32,
}

struct SoftbufferEntry<T> {
    state: Mutex<SoftbufferState<T>>,
    /// Set while a guard is alive
    in_use: AtomicBool,
}

struct PoolIndex<T> {
    reserved: HashMap<SoftbufferIdentifier, usize>,
    free_entries: Vec<usize>,
    free_codeblocks: Vec<Box<[T]>>,
    last_slot: Option<SlotPoint>,
}

struct PoolShared<T> {
    config: SoftbufferPoolConfig,
    entries: Vec<SoftbufferEntry<T>>,
    index: Mutex<PoolIndex<T>>,
}

fn free_state<T: Copy + Default>(
    free_entries: &mut Vec<usize>,
    free_codeblocks: &mut Vec<Box<[T]>>,
    entry_index: usize,
    state: &mut SoftbufferState<T>,
) {
    for mut codeblock in state.codeblocks.drain(..) {
        codeblock.fill(T::default());
        free_codeblocks.push(codeblock);
    }
    state.crc.clear();
    state.codeblock_size = 0;
    state.idle_slots = 0;
    state.id = None;
    state.generation += 1;
    free_entries.push(entry_index);
}

/// Bounded pool of HARQ buffers
pub struct SoftbufferPool<T> {
    shared: Arc<PoolShared<T>>,
}

/// Receive softbuffers holding LLRs
pub type RxSoftbufferPool = SoftbufferPool<LogLikelihoodRatio>;
pub type RxSoftbufferHandle = SoftbufferHandle<LogLikelihoodRatio>;
pub type RxSoftbufferGuard<'a> = SoftbufferGuard<'a, LogLikelihoodRatio>;

/// Transmit buffers holding rate-matching bits
pub type TxBufferPool = SoftbufferPool<u8>;
pub type TxBufferHandle = SoftbufferHandle<u8>;
pub type TxBufferGuard<'a> = SoftbufferGuard<'a, u8>;

impl<T: Copy + Default + Send + 'static> SoftbufferPool<T> {
    /// Create the pool and pre-allocate all storage
    pub fn new(config: SoftbufferPoolConfig) -> Result<Self, LayerError> {
        if config.max_softbuffers == 0 || config.max_nof_codeblocks == 0 || config.max_codeblock_size == 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "Softbuffer pool sizes must be non-zero: {:?}",
                config
            )));
        }
        if config.expire_timeout_slots == 0 {
            return Err(LayerError::InvalidConfiguration(
                "Softbuffer expire timeout must be at least one slot".to_string(),
            ));
        }

        let per_buffer = config.max_nof_codeblocks.min(MAX_NOF_CODEBLOCKS_PER_BUFFER);
        let entries = (0..config.max_softbuffers)
            .map(|_| SoftbufferEntry {
                state: Mutex::new(SoftbufferState {
                    id: None,
                    generation: 0,
                    codeblocks: Vec::with_capacity(if config.external_soft_bits { 0 } else { per_buffer }),
                    crc: Vec::with_capacity(per_buffer),
                    codeblock_size: 0,
                    idle_slots: 0,
                }),
                in_use: AtomicBool::new(false),
            })
            .collect();

        let free_codeblocks = if config.external_soft_bits {
            Vec::new()
        } else {
            (0..config.max_nof_codeblocks)
                .map(|_| vec![T::default(); config.max_codeblock_size].into_boxed_slice())
                .collect()
        };

        debug!(
            "Softbuffer pool created: {} buffers, {} codeblocks of {} soft bits{}",
            config.max_softbuffers,
            config.max_nof_codeblocks,
            config.max_codeblock_size,
            if config.external_soft_bits { " (external storage)" } else { "" }
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                entries,
                index: Mutex::new(PoolIndex {
                    reserved: HashMap::with_capacity(config.max_softbuffers),
                    free_entries: (0..config.max_softbuffers).rev().collect(),
                    free_codeblocks,
                    last_slot: None,
                }),
            }),
        })
    }

    pub fn config(&self) -> &SoftbufferPoolConfig {
        &self.shared.config
    }

    /// Number of buffers currently reserved
    pub fn nof_reserved(&self) -> usize {
        self.shared.index.lock().reserved.len()
    }

    /// Number of codeblocks not assigned to any buffer
    pub fn nof_free_codeblocks(&self) -> usize {
        self.shared.index.lock().free_codeblocks.len()
    }

    /// Reserve the buffer for `id`.
    ///
    /// Reserving an identifier that already holds a buffer returns that same
    /// buffer, keeping its soft bits and CRC state, as long as the codeblock
    /// layout is unchanged. A different layout resets the buffer.
    pub fn try_reserve(
        &self,
        id: SoftbufferIdentifier,
        nof_codeblocks: usize,
        codeblock_size: usize,
    ) -> Result<SoftbufferHandle<T>, SoftbufferError> {
        let config = &self.shared.config;
        if codeblock_size == 0 || codeblock_size > config.max_codeblock_size {
            return Err(SoftbufferError::InvalidCodeblockSize {
                size: codeblock_size,
                max: config.max_codeblock_size,
            });
        }
        if nof_codeblocks == 0 || nof_codeblocks > MAX_NOF_CODEBLOCKS_PER_BUFFER.min(config.max_nof_codeblocks) {
            return Err(SoftbufferError::InvalidNofCodeblocks(nof_codeblocks));
        }

        let mut guard = self.shared.index.lock();
        let index = &mut *guard;

        if let Some(&entry_index) = index.reserved.get(&id) {
            let entry = &self.shared.entries[entry_index];
            assert!(
                !entry.in_use.load(Ordering::Acquire),
                "softbuffer {} reserved again while still being processed",
                id
            );
            let Some(mut state) = entry.state.try_lock() else {
                panic!("softbuffer {} reserved again while still being processed", id);
            };

            state.idle_slots = 0;
            if state.crc.len() != nof_codeblocks || state.codeblock_size != codeblock_size {
                trace!(
                    "Softbuffer {} layout changed: {}x{} -> {}x{}",
                    id,
                    state.crc.len(),
                    state.codeblock_size,
                    nof_codeblocks,
                    codeblock_size
                );
                self.resize(&mut index.free_codeblocks, &mut state, id, nof_codeblocks, codeblock_size)?;
            }

            return Ok(SoftbufferHandle {
                shared: self.shared.clone(),
                entry: entry_index,
                id,
                generation: state.generation,
            });
        }

        let Some(entry_index) = index.free_entries.pop() else {
            return Err(SoftbufferError::PoolExhausted {
                id,
                in_use: index.reserved.len(),
            });
        };

        let entry = &self.shared.entries[entry_index];
        let mut state = entry.state.lock();
        if let Err(err) = self.resize(&mut index.free_codeblocks, &mut state, id, nof_codeblocks, codeblock_size) {
            index.free_entries.push(entry_index);
            return Err(err);
        }
        state.id = Some(id);
        state.idle_slots = 0;
        index.reserved.insert(id, entry_index);

        trace!("Softbuffer {} reserved: buffer={} codeblocks={}", id, entry_index, nof_codeblocks);

        Ok(SoftbufferHandle {
            shared: self.shared.clone(),
            entry: entry_index,
            id,
            generation: state.generation,
        })
    }

    /// Reserve the buffer for `id`; running out of buffers or codeblocks is a
    /// sizing error and aborts.
    pub fn reserve(&self, id: SoftbufferIdentifier, nof_codeblocks: usize, codeblock_size: usize) -> SoftbufferHandle<T> {
        self.try_reserve(id, nof_codeblocks, codeblock_size)
            .unwrap_or_else(|err| panic!("softbuffer pool sizing error: {}", err))
    }

    /// Give the codeblock layout of a buffer a new shape and clear its state
    fn resize(
        &self,
        free_codeblocks: &mut Vec<Box<[T]>>,
        state: &mut SoftbufferState<T>,
        id: SoftbufferIdentifier,
        nof_codeblocks: usize,
        codeblock_size: usize,
    ) -> Result<(), SoftbufferError> {
        if !self.shared.config.external_soft_bits {
            let current = state.codeblocks.len();
            if nof_codeblocks > current {
                let needed = nof_codeblocks - current;
                if free_codeblocks.len() < needed {
                    return Err(SoftbufferError::CodeblocksExhausted {
                        id,
                        requested: nof_codeblocks,
                        available: current + free_codeblocks.len(),
                    });
                }
                let start = free_codeblocks.len() - needed;
                state.codeblocks.extend(free_codeblocks.drain(start..));
            } else {
                for mut codeblock in state.codeblocks.drain(nof_codeblocks..) {
                    codeblock.fill(T::default());
                    free_codeblocks.push(codeblock);
                }
            }
            for codeblock in state.codeblocks.iter_mut() {
                codeblock.fill(T::default());
            }
        }

        state.crc.clear();
        state.crc.resize(nof_codeblocks, false);
        state.codeblock_size = codeblock_size;
        Ok(())
    }

    /// Age all reserved buffers and evict those idle for the expire timeout.
    ///
    /// Called once per slot. Buffers locked by a task count as touched.
    pub fn run_slot(&self, slot: SlotPoint) {
        let timeout = self.shared.config.expire_timeout_slots;
        let mut guard = self.shared.index.lock();
        let index = &mut *guard;

        let elapsed = match index.last_slot {
            Some(last) => (slot - last).max(0) as u32,
            None => 1,
        };
        if elapsed == 0 {
            return;
        }
        index.last_slot = Some(slot);

        let entries = &self.shared.entries;
        let PoolIndex {
            reserved,
            free_entries,
            free_codeblocks,
            ..
        } = index;

        reserved.retain(|id, entry_index| {
            let entry = &entries[*entry_index];
            if entry.in_use.load(Ordering::Acquire) {
                return true;
            }
            let Some(mut state) = entry.state.try_lock() else {
                return true;
            };

            state.idle_slots = state.idle_slots.saturating_add(elapsed);
            if state.idle_slots < timeout {
                return true;
            }

            debug!("Softbuffer {} expired at slot {}", id, slot);
            free_state(free_entries, free_codeblocks, *entry_index, &mut state);
            false
        });
    }

    /// Release a buffer before it expires
    pub fn release(&self, handle: SoftbufferHandle<T>) {
        assert!(
            Arc::ptr_eq(&handle.shared, &self.shared),
            "softbuffer {} released to a foreign pool",
            handle.id
        );

        let mut guard = self.shared.index.lock();
        let index = &mut *guard;
        let entry = &self.shared.entries[handle.entry];
        assert!(
            !entry.in_use.load(Ordering::Acquire),
            "softbuffer {} released while being processed",
            handle.id
        );

        let mut state = entry.state.lock();
        if state.generation != handle.generation {
            trace!("Softbuffer {} already expired before release", handle.id);
            return;
        }

        index.reserved.remove(&handle.id);
        free_state(&mut index.free_entries, &mut index.free_codeblocks, handle.entry, &mut state);
        trace!("Softbuffer {} released", handle.id);
    }
}

/// Reservation of one HARQ buffer.
///
/// Dropping the handle keeps the reservation; the buffer stays available to
/// retransmissions until it expires or is released.
pub struct SoftbufferHandle<T> {
    shared: Arc<PoolShared<T>>,
    entry: usize,
    id: SoftbufferIdentifier,
    generation: u64,
}

impl<T> SoftbufferHandle<T> {
    pub fn id(&self) -> SoftbufferIdentifier {
        self.id
    }

    /// Position of the buffer in the pool, used to address external storage
    pub fn buffer_index(&self) -> usize {
        self.entry
    }

    /// Take exclusive access to the buffer contents.
    ///
    /// Two concurrent guards on the same buffer are a protocol error and abort.
    pub fn lock(&self) -> Result<SoftbufferGuard<'_, T>, SoftbufferError> {
        let entry = &self.shared.entries[self.entry];
        assert!(
            !entry.in_use.swap(true, Ordering::AcqRel),
            "softbuffer {} is already being processed",
            self.id
        );

        let state = entry.state.lock();
        if state.generation != self.generation {
            drop(state);
            entry.in_use.store(false, Ordering::Release);
            return Err(SoftbufferError::Expired(self.id));
        }

        Ok(SoftbufferGuard {
            id: self.id,
            buffer_index: self.entry,
            in_use: &entry.in_use,
            state,
        })
    }
}

impl<T> fmt::Debug for SoftbufferHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftbufferHandle")
            .field("id", &self.id)
            .field("buffer", &self.entry)
            .finish()
    }
}

/// Exclusive access to a reserved buffer
pub struct SoftbufferGuard<'a, T> {
    id: SoftbufferIdentifier,
    buffer_index: usize,
    in_use: &'a AtomicBool,
    state: MutexGuard<'a, SoftbufferState<T>>,
}

impl<T> SoftbufferGuard<'_, T> {
    pub fn id(&self) -> SoftbufferIdentifier {
        self.id
    }

    pub fn buffer_index(&self) -> usize {
        self.buffer_index
    }

    pub fn nof_codeblocks(&self) -> usize {
        self.state.crc.len()
    }

    pub fn codeblock_size(&self) -> usize {
        self.state.codeblock_size
    }

    /// Soft bits of one codeblock; `None` with external storage
    pub fn codeblock(&self, index: usize) -> Option<&[T]> {
        let size = self.state.codeblock_size;
        self.state.codeblocks.get(index).map(|cb| &cb[..size])
    }

    pub fn codeblock_mut(&mut self, index: usize) -> Option<&mut [T]> {
        let size = self.state.codeblock_size;
        self.state.codeblocks.get_mut(index).map(|cb| &mut cb[..size])
    }

    pub fn codeblocks_crc(&self) -> &[bool] {
        &self.state.crc
    }

    pub fn codeblocks_crc_mut(&mut self) -> &mut [bool] {
        &mut self.state.crc
    }

    pub fn set_codeblock_crc(&mut self, index: usize, crc_ok: bool) {
        let nof_codeblocks = self.state.crc.len();
        assert!(
            index < nof_codeblocks,
            "codeblock {} out of range for softbuffer {} ({} codeblocks)",
            index,
            self.id,
            nof_codeblocks
        );
        self.state.crc[index] = crc_ok;
    }

    pub fn reset_codeblocks_crc(&mut self) {
        self.state.crc.fill(false);
    }

    pub fn all_codeblocks_crc_ok(&self) -> bool {
        self.state.crc.iter().all(|&ok| ok)
    }
}

impl<T: Copy + Default> SoftbufferGuard<'_, T> {
    /// Clears soft bits and CRC flags for a new transport block
    pub fn reset(&mut self) {
        self.state.crc.fill(false);
        for cb in self.state.codeblocks.iter_mut() {
            cb.fill(T::default());
        }
    }
}

impl<T> Drop for SoftbufferGuard<'_, T> {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::Release);
    }
}
