//! Uplink Channel PDUs, Results and Processor Interfaces

use super::prach_buffer::PrachBuffer;
use super::resource_grid::ResourceGrid;
use super::softbuffer::{RxSoftbufferGuard, SoftbufferIdentifier};
use bytes::Bytes;
use common::types::{ModulationScheme, Rnti, SlotPoint};
use ndarray::Array2;
use num_complex::Complex32;

/// Requested UCI payload lengths in bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UciPayloadSizes {
    pub harq_ack: u16,
    pub sr: u16,
    pub csi_part1: u16,
    pub csi_part2: u16,
}

impl UciPayloadSizes {
    pub fn is_empty(&self) -> bool {
        self.harq_ack == 0 && self.sr == 0 && self.csi_part1 == 0 && self.csi_part2 == 0
    }
}

/// Decoding status of one UCI field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UciStatus {
    /// Decoded and passed its check
    Valid,
    /// Decoded but failed its check
    Invalid,
    /// Not decoded (e.g. discarded under overload)
    Unknown,
}

/// One decoded UCI field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UciField {
    pub status: UciStatus,
    pub bits: Vec<bool>,
}

impl UciField {
    /// Placeholder of `nof_bits` zero bits with unknown status
    pub fn unknown(nof_bits: u16) -> Self {
        Self {
            status: UciStatus::Unknown,
            bits: vec![false; nof_bits as usize],
        }
    }
}

/// UCI fields of one PUCCH or PUSCH; `None` for fields not requested
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UciResults {
    pub harq_ack: Option<UciField>,
    pub sr: Option<UciField>,
    pub csi_part1: Option<UciField>,
    pub csi_part2: Option<UciField>,
}

impl UciResults {
    /// Every requested field unknown with zeroed bits
    pub fn unknown(sizes: &UciPayloadSizes) -> Self {
        let field = |nof_bits: u16| (nof_bits > 0).then(|| UciField::unknown(nof_bits));
        Self {
            harq_ack: field(sizes.harq_ack),
            sr: field(sizes.sr),
            csi_part1: field(sizes.csi_part1),
            csi_part2: field(sizes.csi_part2),
        }
    }
}

/// PUCCH formats (3GPP TS 38.211 Section 6.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PucchFormat {
    Format0,
    Format1,
    Format2,
    Format3,
    Format4,
}

/// PUCCH reception
#[derive(Debug, Clone)]
pub struct PucchPdu {
    pub slot: SlotPoint,
    pub rnti: Rnti,
    pub format: PucchFormat,
    pub start_symbol: u8,
    pub nof_symbols: u8,
    pub start_rb: u16,
    pub nof_rbs: u16,
    pub uci: UciPayloadSizes,
    pub port: usize,
}

/// Transport block carried by a PUSCH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PuschCodeword {
    pub nof_codeblocks: usize,
    pub codeblock_size: usize,
    /// New data indicator toggled; the softbuffer must not be combined
    pub new_data: bool,
    /// Transport block size without CRC
    pub tbs_bytes: usize,
}

/// PUSCH reception
#[derive(Debug, Clone)]
pub struct PuschPdu {
    pub slot: SlotPoint,
    pub rnti: Rnti,
    pub harq_id: u8,
    pub rv: u8,
    pub modulation: ModulationScheme,
    pub start_symbol: u8,
    pub nof_symbols: u8,
    pub start_rb: u16,
    pub nof_rbs: u16,
    /// Absent for UCI-only transmissions
    pub codeword: Option<PuschCodeword>,
    /// UCI multiplexed on the PUSCH
    pub uci: UciPayloadSizes,
    pub port: usize,
}

impl PuschPdu {
    /// Key of the softbuffer combining this HARQ process
    pub fn softbuffer_id(&self) -> SoftbufferIdentifier {
        SoftbufferIdentifier {
            rnti: self.rnti,
            harq_ack_id: self.harq_id,
        }
    }
}

/// PRACH occasion to search
#[derive(Debug, Clone)]
pub struct PrachPdu {
    pub slot: SlotPoint,
    pub root_sequence_index: u16,
    pub start_preamble_index: u8,
    pub nof_preamble_indices: u8,
    pub port: usize,
}

/// SRS reception
#[derive(Debug, Clone)]
pub struct SrsPdu {
    pub slot: SlotPoint,
    pub rnti: Rnti,
    pub nof_tx_ports: usize,
    pub start_symbol: u8,
    pub nof_symbols: u8,
    pub start_rb: u16,
    pub nof_rbs: u16,
}

/// Detection result for a single preamble
#[derive(Debug, Clone, PartialEq)]
pub struct PreambleDetection {
    /// Detected preamble index (0-63)
    pub preamble_index: u8,
    /// Timing advance in microseconds
    pub timing_advance_us: f32,
    /// Detection metric (normalized)
    pub detection_metric: f32,
    /// Received power in dBm
    pub power_dbm: f32,
}

/// Transport block outcome of one PUSCH
#[derive(Debug, Clone)]
pub struct PuschDataResult {
    pub rnti: Rnti,
    pub slot: SlotPoint,
    pub sector: usize,
    pub harq_id: u8,
    pub tb_crc_ok: bool,
    /// Decoded transport block; empty unless the CRC passed
    pub payload: Bytes,
    /// Set when the PDU was not processed
    pub discarded: bool,
}

/// UCI outcome of one PUSCH
#[derive(Debug, Clone)]
pub struct PuschControlResult {
    pub rnti: Rnti,
    pub slot: SlotPoint,
    pub sector: usize,
    pub harq_id: u8,
    pub uci: UciResults,
    pub discarded: bool,
}

#[derive(Debug, Clone)]
pub struct PucchResult {
    pub rnti: Rnti,
    pub slot: SlotPoint,
    pub sector: usize,
    pub format: PucchFormat,
    pub uci: UciResults,
    pub discarded: bool,
}

#[derive(Debug, Clone)]
pub struct PrachResult {
    pub slot: SlotPoint,
    pub sector: usize,
    pub preambles: Vec<PreambleDetection>,
    pub discarded: bool,
}

#[derive(Debug, Clone)]
pub struct SrsResult {
    pub rnti: Rnti,
    pub slot: SlotPoint,
    pub sector: usize,
    /// Channel estimate, receive ports x transmit ports
    pub channel_matrix: Array2<Complex32>,
    pub discarded: bool,
}

/// Consumer of uplink results.
///
/// Every request produces exactly one call per requested payload kind,
/// whether it was processed or discarded.
pub trait UplinkResultNotifier: Send + Sync {
    fn on_new_pusch_results_data(&self, result: PuschDataResult);
    fn on_new_pusch_results_control(&self, result: PuschControlResult);
    fn on_new_pucch_results(&self, result: PucchResult);
    fn on_new_prach_results(&self, result: PrachResult);
    fn on_new_srs_results(&self, result: SrsResult);
}

/// Output of a PUSCH kernel
#[derive(Debug, Clone, Default)]
pub struct PuschDecodeOutput {
    pub tb_crc_ok: bool,
    pub payload: Bytes,
    pub uci: UciResults,
}

/// PUSCH kernel: equalizes, demodulates and decodes one PUSCH.
///
/// `softbuffer` is present when the PDU carries a codeword.
pub trait PuschProcessor: Send + Sync {
    fn process(
        &self,
        grid: &ResourceGrid,
        softbuffer: Option<&mut RxSoftbufferGuard<'_>>,
        pdu: &PuschPdu,
    ) -> PuschDecodeOutput;
}

/// PUCCH kernel
pub trait PucchProcessor: Send + Sync {
    fn process(&self, grid: &ResourceGrid, pdu: &PucchPdu) -> UciResults;
}

/// PRACH detector
pub trait PrachDetector: Send + Sync {
    fn detect(&self, buffer: &PrachBuffer, pdu: &PrachPdu) -> Vec<PreambleDetection>;
}

/// SRS channel estimator
pub trait SrsEstimator: Send + Sync {
    fn estimate(&self, grid: &ResourceGrid, pdu: &SrsPdu) -> Array2<Complex32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_uci_matches_requested_sizes() {
        let sizes = UciPayloadSizes {
            harq_ack: 2,
            sr: 0,
            csi_part1: 11,
            csi_part2: 0,
        };
        let uci = UciResults::unknown(&sizes);

        assert_eq!(uci.harq_ack, Some(UciField::unknown(2)));
        assert!(uci.sr.is_none());
        let csi = uci.csi_part1.unwrap();
        assert_eq!(csi.status, UciStatus::Unknown);
        assert_eq!(csi.bits, vec![false; 11]);
        assert!(uci.csi_part2.is_none());
        assert!(!sizes.is_empty());
        assert!(UciPayloadSizes::default().is_empty());
    }
}
