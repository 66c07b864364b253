//! Physical Layer (PHY) Slot Core
//!
//! Buffer pools and task dispatch of the 5G NR upper PHY: resource grids,
//! PRACH buffers and HARQ buffers are allocated once and recycled slot by
//! slot, while channel work is fanned out to task executors.

pub mod resource_grid;
pub mod rg_pool;
pub mod prach_buffer;
pub mod softbuffer;
pub mod dl_channels;
pub mod ul_channels;
pub mod downlink;
pub mod uplink;
pub mod upper_phy;

// Re-export commonly used types
pub use resource_grid::{ResourceGrid, ResourceGridDimensions, NRE, NSYMB_PER_SLOT_NORM};
pub use rg_pool::{
    AsynchronousResourceGridPool, GenericResourceGridPool, ResourceGridContext, ResourceGridPool, SharedResourceGrid,
};
pub use prach_buffer::{PrachBuffer, PrachBufferDimensions, PrachBufferPool, SharedPrachBuffer};
pub use softbuffer::{
    LogLikelihoodRatio, RxSoftbufferGuard, RxSoftbufferHandle, RxSoftbufferPool, SoftbufferError, SoftbufferIdentifier,
    SoftbufferPoolConfig, TxBufferGuard, TxBufferHandle, TxBufferPool,
};
pub use dl_channels::{PdcchPdu, PdcchProcessor, PdschPdu, PdschProcessor, SsbPdu, SsbProcessor};
pub use ul_channels::{
    PrachDetector, PrachPdu, PrachResult, PreambleDetection, PucchFormat, PucchPdu, PucchProcessor, PucchResult,
    PuschCodeword, PuschControlResult, PuschDataResult, PuschDecodeOutput, PuschPdu, PuschProcessor, SrsEstimator,
    SrsPdu, SrsResult, UciField, UciPayloadSizes, UciResults, UciStatus, UplinkResultNotifier,
};
pub use downlink::{DownlinkKernels, DownlinkProcessor, DownlinkProcessorPool, TxGateway};
pub use uplink::{ChannelTaskRequest, UplinkChannelDispatcher, UplinkDiscards, UplinkExecutors, UplinkKernels};
pub use upper_phy::{UpperPhy, UpperPhyConfig, UpperPhyDependencies};
