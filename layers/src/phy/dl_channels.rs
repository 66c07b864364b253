//! Downlink Channel PDUs and Processor Interfaces
//!
//! Descriptors produced by the scheduler for every downlink channel of a
//! slot, and the kernel contracts the slot processor dispatches them to.
//! Kernels are interchangeable: the slot processor only depends on these
//! traits.

use super::resource_grid::ResourceGrid;
use super::softbuffer::{SoftbufferIdentifier, TxBufferGuard};
use bytes::Bytes;
use common::types::{ModulationScheme, Pci, Rnti, SlotPoint};

/// PDCCH transmission (one DCI)
#[derive(Debug, Clone)]
pub struct PdcchPdu {
    pub slot: SlotPoint,
    pub rnti: Rnti,
    /// First OFDM symbol of the CORESET
    pub start_symbol: u8,
    /// CORESET duration in symbols (1-3)
    pub nof_symbols: u8,
    /// First resource block of the CCE allocation
    pub start_rb: u16,
    pub nof_rbs: u16,
    /// Aggregation level (1, 2, 4, 8 or 16)
    pub aggregation_level: u8,
    /// DCI payload, packed MSB first
    pub dci_payload: Bytes,
    pub port: usize,
}

/// PDSCH transmission (one transport block)
#[derive(Debug, Clone)]
pub struct PdschPdu {
    pub slot: SlotPoint,
    pub rnti: Rnti,
    /// HARQ process ID
    pub harq_id: u8,
    /// New data indicator toggled
    pub new_data: bool,
    /// Redundancy version
    pub rv: u8,
    pub modulation: ModulationScheme,
    pub start_symbol: u8,
    pub nof_symbols: u8,
    pub start_rb: u16,
    pub nof_rbs: u16,
    /// Transport block without CRC
    pub transport_block: Bytes,
    /// Segmentation of the transport block
    pub nof_codeblocks: usize,
    pub codeblock_size: usize,
    pub port: usize,
}

impl PdschPdu {
    /// Key of the transmit buffer holding this transport block
    pub fn buffer_id(&self) -> SoftbufferIdentifier {
        SoftbufferIdentifier {
            rnti: self.rnti,
            harq_ack_id: self.harq_id,
        }
    }
}

/// SS/PBCH block transmission
#[derive(Debug, Clone)]
pub struct SsbPdu {
    pub slot: SlotPoint,
    pub pci: Pci,
    /// SSB index within the burst
    pub ssb_index: u8,
    /// First symbol of the block within the slot
    pub start_symbol: u8,
    /// Offset of the first subcarrier of the block
    pub subcarrier_offset: u16,
    /// 24-bit MIB payload
    pub mib_payload: u32,
    pub port: usize,
}

/// PDCCH kernel: modulates and maps one DCI onto the grid
pub trait PdcchProcessor: Send + Sync {
    fn process(&self, grid: &mut ResourceGrid, pdu: &PdcchPdu);
}

/// PDSCH kernel: encodes one transport block through its transmit buffer and maps it onto the grid
pub trait PdschProcessor: Send + Sync {
    fn process(&self, grid: &mut ResourceGrid, tx_buffer: &mut TxBufferGuard<'_>, pdu: &PdschPdu);
}

/// SSB kernel: maps PSS, SSS and PBCH of one block onto the grid
pub trait SsbProcessor: Send + Sync {
    fn process(&self, grid: &mut ResourceGrid, pdu: &SsbPdu);
}
