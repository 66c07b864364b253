//! Downlink Slot Processor
//!
//! Aggregates the per-PDU tasks that write into one resource grid for one
//! slot and hands the grid to the transmit gateway exactly once, when every
//! submitted PDU has completed and the control plane has signalled that no
//! more PDUs will follow. Both conditions can become true in either order.

use super::dl_channels::{PdcchPdu, PdcchProcessor, PdschPdu, PdschProcessor, SsbPdu, SsbProcessor};
use super::resource_grid::ResourceGrid;
use super::rg_pool::{ResourceGridContext, SharedResourceGrid};
use super::softbuffer::TxBufferHandle;
use crate::LayerError;
use interfaces::TaskExecutor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Receiver of completed downlink grids
pub trait TxGateway: Send + Sync {
    /// Called once per slot and sector. The grid returns to its pool when
    /// the handle is dropped.
    fn send(&self, context: &ResourceGridContext, grid: SharedResourceGrid);
}

/// Channel kernels used by a downlink processor
#[derive(Clone)]
pub struct DownlinkKernels {
    pub pdcch: Arc<dyn PdcchProcessor>,
    pub pdsch: Arc<dyn PdschProcessor>,
    pub ssb: Arc<dyn SsbProcessor>,
}

struct SlotState {
    num_pdus: usize,
    is_send_allowed: bool,
    context: Option<ResourceGridContext>,
    current_grid: Option<SharedResourceGrid>,
}

impl SlotState {
    /// Take the grid out when the slot is complete
    fn take_if_ready(&mut self) -> Option<(ResourceGridContext, SharedResourceGrid)> {
        if self.num_pdus != 0 || !self.is_send_allowed {
            return None;
        }
        let grid = self.current_grid.take()?;
        let context = self.context?;
        Some((context, grid))
    }
}

struct Inner {
    id: usize,
    kernels: DownlinkKernels,
    executor: Arc<dyn TaskExecutor>,
    gateway: Arc<dyn TxGateway>,
    state: Mutex<SlotState>,
    dropped_pdus: AtomicU64,
}

impl Inner {
    fn on_pdu_complete(&self) {
        let ready = {
            let mut state = self.state.lock();
            assert!(state.num_pdus > 0, "downlink processor {} completed more PDUs than submitted", self.id);
            state.num_pdus -= 1;
            state.take_if_ready()
        };
        self.send(ready);
    }

    fn send(&self, ready: Option<(ResourceGridContext, SharedResourceGrid)>) {
        if let Some((context, grid)) = ready {
            trace!("Downlink processor {}: sending grid {} for {}", self.id, grid.id(), context);
            self.gateway.send(&context, grid);
        }
    }
}

/// Slot processor for one sector.
///
/// Cloning yields another handle onto the same processor.
#[derive(Clone)]
pub struct DownlinkProcessor {
    inner: Arc<Inner>,
}

impl DownlinkProcessor {
    pub fn new(
        id: usize,
        kernels: DownlinkKernels,
        executor: Arc<dyn TaskExecutor>,
        gateway: Arc<dyn TxGateway>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                kernels,
                executor,
                gateway,
                state: Mutex::new(SlotState {
                    num_pdus: 0,
                    is_send_allowed: false,
                    context: None,
                    current_grid: None,
                }),
                dropped_pdus: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Number of PDUs dropped because the executor rejected them
    pub fn nof_dropped_pdus(&self) -> u64 {
        self.inner.dropped_pdus.load(Ordering::Relaxed)
    }

    /// Whether no slot is in progress
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.num_pdus == 0 && state.current_grid.is_none()
    }

    /// Start a new slot on `grid`.
    ///
    /// Reconfiguring while PDUs of the previous slot are still in flight is fatal.
    pub fn configure(&self, context: ResourceGridContext, grid: SharedResourceGrid) {
        let mut state = self.inner.state.lock();
        assert!(
            state.num_pdus == 0,
            "downlink processor {} configured for {} while {} PDUs are still in flight",
            self.inner.id,
            context,
            state.num_pdus
        );

        if let Some(stale) = state.current_grid.take() {
            warn!(
                "Downlink processor {}: grid {} for {} was never sent",
                self.inner.id,
                stale.id(),
                state.context.map(|c| c.to_string()).unwrap_or_default()
            );
        }

        trace!("Downlink processor {} configured for {}", self.inner.id, context);
        state.context = Some(context);
        state.current_grid = Some(grid);
        state.is_send_allowed = false;
    }

    /// Register one PDU and dispatch its kernel work
    fn submit<F>(&self, channel: &'static str, work: F)
    where
        F: FnOnce(&mut ResourceGrid) + Send + 'static,
    {
        let (context, grid) = {
            let mut state = self.inner.state.lock();
            assert!(
                !state.is_send_allowed,
                "downlink processor {} received a {} PDU after the grid was released",
                self.inner.id,
                channel
            );
            let (Some(context), Some(grid)) = (state.context, state.current_grid.clone()) else {
                panic!("downlink processor {} received a {} PDU while not configured", self.inner.id, channel);
            };
            state.num_pdus += 1;
            (context, grid)
        };

        let inner = self.inner.clone();
        let accepted = self.inner.executor.execute(Box::new(move || {
            {
                let mut guard = grid.lock();
                work(&mut guard);
            }
            drop(grid);
            inner.on_pdu_complete();
        }));

        if !accepted {
            warn!(
                "Downlink processor {}: executor rejected {} PDU for {}, dropping it",
                self.inner.id, channel, context
            );
            self.inner.dropped_pdus.fetch_add(1, Ordering::Relaxed);
            self.inner.on_pdu_complete();
        }
    }

    pub fn process_pdcch(&self, pdu: PdcchPdu) {
        trace!("Downlink processor {}: PDCCH rnti={} slot={}", self.inner.id, pdu.rnti, pdu.slot);
        let kernel = self.inner.kernels.pdcch.clone();
        self.submit("PDCCH", move |grid| kernel.process(grid, &pdu));
    }

    /// Submit a PDSCH; `tx_buffer` must be reserved under `pdu.buffer_id()`
    pub fn process_pdsch(&self, tx_buffer: TxBufferHandle, pdu: PdschPdu) {
        trace!(
            "Downlink processor {}: PDSCH rnti={} h_id={} slot={}",
            self.inner.id,
            pdu.rnti,
            pdu.harq_id,
            pdu.slot
        );
        let kernel = self.inner.kernels.pdsch.clone();
        self.submit("PDSCH", move |grid| {
            let locked = tx_buffer.lock();
            match locked {
                Ok(mut buffer) => kernel.process(grid, &mut buffer, &pdu),
                Err(err) => warn!("PDSCH rnti={} slot={} skipped: {}", pdu.rnti, pdu.slot, err),
            }
        });
    }

    pub fn process_ssb(&self, pdu: SsbPdu) {
        trace!("Downlink processor {}: SSB index={} slot={}", self.inner.id, pdu.ssb_index, pdu.slot);
        let kernel = self.inner.kernels.ssb.clone();
        self.submit("SSB", move |grid| kernel.process(grid, &pdu));
    }

    /// Signal that every PDU of the slot has been submitted.
    ///
    /// The grid goes out now if all PDUs have completed, otherwise when the
    /// last one completes. Calling this twice for a slot is fatal.
    pub fn send_resource_grid(&self) {
        let ready = {
            let mut state = self.inner.state.lock();
            let context = state
                .context
                .unwrap_or_else(|| panic!("downlink processor {} released before being configured", self.inner.id));
            assert!(
                !state.is_send_allowed,
                "downlink processor {}: grid for {} released twice",
                self.inner.id,
                context
            );
            state.is_send_allowed = true;
            state.take_if_ready()
        };
        self.inner.send(ready);
    }
}

/// Downlink processors of every sector, selected by slot
pub struct DownlinkProcessorPool {
    processors: Vec<Vec<DownlinkProcessor>>,
}

impl DownlinkProcessorPool {
    /// `processors[sector]` holds the processors of one sector
    pub fn new(processors: Vec<Vec<DownlinkProcessor>>) -> Result<Self, LayerError> {
        if processors.is_empty() || processors.iter().any(|sector| sector.is_empty()) {
            return Err(LayerError::InvalidConfiguration(
                "Every sector needs at least one downlink processor".to_string(),
            ));
        }
        debug!(
            "Downlink processor pool: {} sectors x {} processors",
            processors.len(),
            processors[0].len()
        );
        Ok(Self { processors })
    }

    pub fn nof_sectors(&self) -> usize {
        self.processors.len()
    }

    /// Processor serving `context`
    pub fn get_processor(&self, context: &ResourceGridContext) -> &DownlinkProcessor {
        let sector = self.processors.get(context.sector).unwrap_or_else(|| {
            panic!("sector {} out of range (nof_sectors={})", context.sector, self.processors.len())
        });
        &sector[context.slot.cycle_index(sector.len())]
    }

    /// Total PDUs dropped by all processors
    pub fn nof_dropped_pdus(&self) -> u64 {
        self.processors.iter().flatten().map(|p| p.nof_dropped_pdus()).sum()
    }
}
