//! Upper PHY
//!
//! Owns every pool of the slot core and wires the downlink processors and
//! the uplink dispatcher to them. All storage is allocated here, once.

use super::downlink::{DownlinkKernels, DownlinkProcessor, DownlinkProcessorPool, TxGateway};
use super::dl_channels::PdschPdu;
use super::prach_buffer::{PrachBufferDimensions, PrachBufferPool, SharedPrachBuffer};
use super::resource_grid::ResourceGridDimensions;
use super::rg_pool::{
    AsynchronousResourceGridPool, GenericResourceGridPool, ResourceGridContext, ResourceGridPool, SharedResourceGrid,
};
use super::softbuffer::{RxSoftbufferPool, SoftbufferPoolConfig, TxBufferHandle, TxBufferPool};
use super::uplink::{UplinkChannelDispatcher, UplinkExecutors, UplinkKernels};
use crate::LayerError;
use common::types::SlotPoint;
use interfaces::TaskExecutor;
use std::sync::Arc;
use tracing::info;

/// Sizing of the upper PHY, read once at start-up
#[derive(Debug, Clone)]
pub struct UpperPhyConfig {
    pub nof_sectors: usize,
    /// Numerology of every slot handled by this instance
    pub numerology: u8,
    pub dl_grid: ResourceGridDimensions,
    pub ul_grid: ResourceGridDimensions,
    /// Downlink grids per sector
    pub nof_dl_rg: usize,
    /// Uplink grids per sector
    pub nof_ul_rg: usize,
    /// Zero downlink grids asynchronously after this many slots; `None`
    /// leaves clearing to the channel kernels
    pub dl_rg_expire_timeout_slots: Option<u32>,
    /// Downlink processors per sector
    pub nof_dl_processors: usize,
    /// PRACH buffers per sector
    pub nof_prach_buffer: usize,
    pub prach: PrachBufferDimensions,
    pub rx_softbuffers: SoftbufferPoolConfig,
    pub tx_buffers: SoftbufferPoolConfig,
}

/// Collaborators of the upper PHY
#[derive(Clone)]
pub struct UpperPhyDependencies {
    pub dl_executor: Arc<dyn TaskExecutor>,
    /// Runs the asynchronous grid zeroing
    pub grid_zeroing_executor: Arc<dyn TaskExecutor>,
    pub ul_executors: UplinkExecutors,
    pub dl_kernels: DownlinkKernels,
    pub ul_kernels: UplinkKernels,
    pub gateway: Arc<dyn TxGateway>,
}

pub struct UpperPhy {
    config: UpperPhyConfig,
    dl_grids: Box<dyn ResourceGridPool>,
    ul_grids: GenericResourceGridPool,
    prach_buffers: Vec<PrachBufferPool>,
    dl_processors: DownlinkProcessorPool,
    tx_buffers: TxBufferPool,
    uplink: UplinkChannelDispatcher,
}

impl UpperPhy {
    pub fn new(config: UpperPhyConfig, deps: UpperPhyDependencies) -> Result<Self, LayerError> {
        if config.numerology > 4 {
            return Err(LayerError::InvalidConfiguration(format!(
                "Invalid numerology {}",
                config.numerology
            )));
        }
        if config.nof_dl_processors == 0 {
            return Err(LayerError::InvalidConfiguration(
                "At least one downlink processor per sector is required".to_string(),
            ));
        }
        for (name, size) in [
            ("nof_dl_rg", config.nof_dl_rg),
            ("nof_ul_rg", config.nof_ul_rg),
            ("nof_prach_buffer", config.nof_prach_buffer),
            ("nof_dl_processors", config.nof_dl_processors),
        ] {
            if !SlotPoint::is_valid_cycle(config.numerology, size) {
                return Err(LayerError::InvalidConfiguration(format!(
                    "{} ({}) must divide the SFN period of {} slots",
                    name,
                    size,
                    SlotPoint::system_frame_period(config.numerology)
                )));
            }
        }

        let dl_grids: Box<dyn ResourceGridPool> = match config.dl_rg_expire_timeout_slots {
            Some(timeout) => Box::new(AsynchronousResourceGridPool::new(
                config.nof_dl_rg,
                config.nof_sectors,
                config.dl_grid,
                timeout,
                deps.grid_zeroing_executor.clone(),
            )?),
            None => Box::new(GenericResourceGridPool::new(config.nof_dl_rg, config.nof_sectors, config.dl_grid)?),
        };
        let ul_grids = GenericResourceGridPool::new(config.nof_ul_rg, config.nof_sectors, config.ul_grid)?;

        let prach_buffers = (0..config.nof_sectors)
            .map(|_| PrachBufferPool::new(config.nof_prach_buffer, config.prach))
            .collect::<Result<Vec<_>, _>>()?;

        let processors = (0..config.nof_sectors)
            .map(|sector| {
                (0..config.nof_dl_processors)
                    .map(|index| {
                        DownlinkProcessor::new(
                            sector * config.nof_dl_processors + index,
                            deps.dl_kernels.clone(),
                            deps.dl_executor.clone(),
                            deps.gateway.clone(),
                        )
                    })
                    .collect()
            })
            .collect();
        let dl_processors = DownlinkProcessorPool::new(processors)?;

        let tx_buffers = TxBufferPool::new(config.tx_buffers)?;
        let rx_softbuffers = Arc::new(RxSoftbufferPool::new(config.rx_softbuffers)?);
        let uplink = UplinkChannelDispatcher::new(deps.ul_executors, deps.ul_kernels, rx_softbuffers);

        info!(
            "Upper PHY ready: {} sectors, {} DL grids{}, {} UL grids, {} PRACH buffers, {} DL processors per sector",
            config.nof_sectors,
            dl_grids.nof_grids(),
            if config.dl_rg_expire_timeout_slots.is_some() { " (async zeroing)" } else { "" },
            ul_grids.nof_grids(),
            config.nof_prach_buffer * config.nof_sectors,
            config.nof_dl_processors
        );

        Ok(Self {
            config,
            dl_grids,
            ul_grids,
            prach_buffers,
            dl_processors,
            tx_buffers,
            uplink,
        })
    }

    pub fn config(&self) -> &UpperPhyConfig {
        &self.config
    }

    fn check_context(&self, context: &ResourceGridContext) {
        assert!(
            context.slot.numerology() == self.config.numerology,
            "slot {} has numerology {}, expected {}",
            context.slot,
            context.slot.numerology(),
            self.config.numerology
        );
    }

    /// Advance the HARQ buffer pools to `slot`
    pub fn on_tti_boundary(&self, slot: SlotPoint) {
        self.uplink.rx_softbuffers().run_slot(slot);
        self.tx_buffers.run_slot(slot);
    }

    /// Take the downlink grid of `context` and arm its processor
    pub fn begin_downlink_slot(&self, context: &ResourceGridContext) -> &DownlinkProcessor {
        self.check_context(context);
        let grid = self.dl_grids.get_resource_grid(context);
        let processor = self.dl_processors.get_processor(context);
        processor.configure(*context, grid);
        processor
    }

    /// Reserve the transmit buffer of a PDSCH
    pub fn reserve_tx_buffer(&self, pdu: &PdschPdu) -> TxBufferHandle {
        let handle = self.tx_buffers.reserve(pdu.buffer_id(), pdu.nof_codeblocks, pdu.codeblock_size);
        if pdu.new_data {
            if let Ok(mut buffer) = handle.lock() {
                buffer.reset_codeblocks_crc();
            }
        }
        handle
    }

    /// Uplink grid the front-end fills for `context`
    pub fn ul_resource_grid(&self, context: &ResourceGridContext) -> SharedResourceGrid {
        self.check_context(context);
        self.ul_grids.get_resource_grid(context)
    }

    /// PRACH buffer for the window starting at `context.slot`
    pub fn prach_buffer(&self, context: &ResourceGridContext) -> SharedPrachBuffer {
        self.check_context(context);
        let pool = self.prach_buffers.get(context.sector).unwrap_or_else(|| {
            panic!("sector {} out of range (nof_sectors={})", context.sector, self.prach_buffers.len())
        });
        pool.get_prach_buffer(context.slot)
    }

    pub fn uplink(&self) -> &UplinkChannelDispatcher {
        &self.uplink
    }

    pub fn tx_buffers(&self) -> &TxBufferPool {
        &self.tx_buffers
    }

    /// Downlink PDUs dropped under executor backpressure
    pub fn nof_dropped_dl_pdus(&self) -> u64 {
        self.dl_processors.nof_dropped_pdus()
    }
}
