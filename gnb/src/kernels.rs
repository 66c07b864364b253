//! Reference Channel Kernels
//!
//! Lightweight kernels behind the upper PHY kernel traits. Downlink kernels
//! map their payloads with BPSK/QPSK onto contiguous allocations; uplink
//! kernels read back what the loopback front-end in [`crate::scheduler`]
//! writes. There is no channel coding: a transport block travels with its
//! CRC-24 so that HARQ combining and CRC outcomes are real.

use bytes::Bytes;
use common::utils::{attach_crc24, check_crc24, pack_bits, unpack_bits};
use layers::phy::{
    LogLikelihoodRatio, PdcchPdu, PdcchProcessor, PdschPdu, PdschProcessor, PrachBuffer, PrachDetector, PrachPdu,
    PreambleDetection, PucchPdu, PucchProcessor, PuschDecodeOutput, PuschPdu, PuschProcessor, ResourceGrid,
    RxSoftbufferGuard, SrsEstimator, SrsPdu, SsbPdu, SsbProcessor, TxBufferGuard, UciField, UciPayloadSizes,
    UciResults, UciStatus, NRE,
};
use layers::LayerError;
use ndarray::Array2;
use num_complex::Complex32;
use std::f32::consts::{FRAC_1_SQRT_2, PI};
use tracing::{trace, warn};

/// Bytes of the transport block CRC
pub const CRC_LEN: usize = 3;

/// PSS length and its subcarrier offset inside the SS/PBCH block
const PSS_LENGTH: usize = 127;
const PSS_OFFSET: usize = 56;
/// Subcarriers of the SS/PBCH block
const SSB_NOF_SUBC: usize = 240;

/// Cyclic shift between preambles of one root sequence (N_cs)
pub const PRACH_CYCLIC_SHIFT: usize = 13;
const PRACH_DETECTION_THRESHOLD: f32 = 0.5;

/// BPSK amplitude below which a UCI bit is considered unreliable
const UCI_RELIABILITY_THRESHOLD: f32 = 0.5;

/// LLR scaling of a unit-energy QPSK symbol component
const LLR_SCALE: f32 = 90.0;

/// Resource elements of a contiguous allocation as (symbol, subcarrier),
/// symbol by symbol
pub fn allocation(start_symbol: u8, nof_symbols: u8, start_rb: u16, nof_rbs: u16) -> impl Iterator<Item = (usize, usize)> {
    let subcarriers = start_rb as usize * NRE..(start_rb as usize + nof_rbs as usize) * NRE;
    let symbols = start_symbol as usize..start_symbol as usize + nof_symbols as usize;
    symbols.flat_map(move |symbol| subcarriers.clone().map(move |subc| (symbol, subc)))
}

/// Write `values` onto the resource elements yielded by `res`
pub fn map_symbols(
    grid: &mut ResourceGrid,
    port: usize,
    res: impl Iterator<Item = (usize, usize)>,
    values: &[Complex32],
) -> Result<usize, LayerError> {
    let mut count = 0;
    for ((symbol, subc), &value) in res.zip(values) {
        grid.put(port, symbol, subc, value)?;
        count += 1;
    }
    Ok(count)
}

/// QPSK, two bits per symbol; an odd trailing bit is padded with zero
pub fn modulate_qpsk(bits: &[bool]) -> Vec<Complex32> {
    let level = |bit: bool| if bit { -FRAC_1_SQRT_2 } else { FRAC_1_SQRT_2 };
    bits.chunks(2)
        .map(|pair| Complex32::new(level(pair[0]), level(pair.get(1).copied().unwrap_or(false))))
        .collect()
}

/// Soft demodulation; positive LLRs favour bit zero
pub fn demodulate_qpsk(symbols: &[Complex32]) -> Vec<LogLikelihoodRatio> {
    let llr = |x: f32| (x * LLR_SCALE).round().clamp(-127.0, 127.0) as LogLikelihoodRatio;
    symbols.iter().flat_map(|s| [llr(s.re), llr(s.im)]).collect()
}

/// BPSK on the real axis
pub fn modulate_bpsk(bits: &[bool]) -> Vec<Complex32> {
    bits.iter().map(|&bit| Complex32::new(if bit { -1.0 } else { 1.0 }, 0.0)).collect()
}

/// Symbols of one PUSCH: UCI bits first (BPSK), then the transport block
/// with its CRC (QPSK)
pub fn pusch_symbols(uci_bits: &[bool], transport_block: Option<&[u8]>) -> Vec<Complex32> {
    let mut symbols = modulate_bpsk(uci_bits);
    if let Some(tb) = transport_block {
        symbols.extend(modulate_qpsk(&unpack_bits(&attach_crc24(tb))));
    }
    symbols
}

/// Total UCI bits requested
pub fn nof_uci_bits(sizes: &UciPayloadSizes) -> usize {
    (sizes.harq_ack + sizes.sr + sizes.csi_part1 + sizes.csi_part2) as usize
}

/// Zadoff-Chu root sequence x_u(n) = exp(-j pi u n (n + 1) / N_zc)
pub fn zadoff_chu(root_sequence_index: u16, length: usize) -> Vec<Complex32> {
    let n_zc = length as u64;
    let u = 1 + root_sequence_index as u64 % (n_zc - 1);
    // n (n + 1) is even: reduce the phase index modulo N_zc before going to floating point
    (0..n_zc)
        .map(|n| {
            let k = (u * (n * (n + 1) / 2)) % n_zc;
            Complex32::from_polar(1.0, -2.0 * PI * k as f32 / n_zc as f32)
        })
        .collect()
}

/// Preamble `index` of a root sequence: the root cyclically shifted by `index * N_cs`
pub fn preamble_sequence(root_sequence_index: u16, preamble_index: u8, length: usize) -> Vec<Complex32> {
    let root = zadoff_chu(root_sequence_index, length);
    let shift = preamble_index as usize * PRACH_CYCLIC_SHIFT;
    (0..length).map(|n| root[(n + shift) % length]).collect()
}

/// PSS m-sequence (TS 38.211 Section 7.4.2.2)
fn pss_sequence(n_id_2: u16) -> Vec<Complex32> {
    let mut x = vec![0u8; PSS_LENGTH];
    x[..7].copy_from_slice(&[0, 1, 1, 0, 1, 1, 1]);
    for i in 0..PSS_LENGTH - 7 {
        x[i + 7] = (x[i + 4] + x[i]) % 2;
    }
    (0..PSS_LENGTH)
        .map(|n| {
            let m = (n + 43 * n_id_2 as usize) % PSS_LENGTH;
            Complex32::new(1.0 - 2.0 * x[m] as f32, 0.0)
        })
        .collect()
}

/// BPSK UCI fields read off the front of `res`
fn decode_uci(
    grid: &ResourceGrid,
    port: usize,
    res: &mut impl Iterator<Item = (usize, usize)>,
    sizes: &UciPayloadSizes,
) -> UciResults {
    let mut field = |nof_bits: u16| -> Option<UciField> {
        if nof_bits == 0 {
            return None;
        }
        let values: Vec<Complex32> = res
            .by_ref()
            .take(nof_bits as usize)
            .map(|(symbol, subc)| grid.get(port, symbol, subc).unwrap_or_default())
            .collect();
        let reliable =
            values.len() == nof_bits as usize && values.iter().all(|v| v.re.abs() >= UCI_RELIABILITY_THRESHOLD);
        let mut bits: Vec<bool> = values.iter().map(|v| v.re < 0.0).collect();
        bits.resize(nof_bits as usize, false);
        Some(UciField {
            status: if reliable { UciStatus::Valid } else { UciStatus::Invalid },
            bits,
        })
    };

    UciResults {
        harq_ack: field(sizes.harq_ack),
        sr: field(sizes.sr),
        csi_part1: field(sizes.csi_part1),
        csi_part2: field(sizes.csi_part2),
    }
}

/// QPSK-mapped DCI with CRC over the CORESET
#[derive(Debug, Default)]
pub struct ReferencePdcch;

impl PdcchProcessor for ReferencePdcch {
    fn process(&self, grid: &mut ResourceGrid, pdu: &PdcchPdu) {
        let symbols = modulate_qpsk(&unpack_bits(&attach_crc24(&pdu.dci_payload)));
        let res = allocation(pdu.start_symbol, pdu.nof_symbols, pdu.start_rb, pdu.nof_rbs);
        match map_symbols(grid, pdu.port, res, &symbols) {
            Ok(mapped) => trace!("PDCCH rnti={} slot={}: mapped {} REs", pdu.rnti, pdu.slot, mapped),
            Err(err) => warn!("PDCCH rnti={} slot={}: {}", pdu.rnti, pdu.slot, err),
        }
    }
}

/// Transport block with CRC, kept in the transmit buffer across
/// retransmissions and read out from a redundancy-version offset
#[derive(Debug, Default)]
pub struct ReferencePdsch;

impl ReferencePdsch {
    /// Fill the transmit buffer unless every codeblock is already encoded
    fn encode(tx_buffer: &mut TxBufferGuard<'_>, bits: &[bool]) {
        if tx_buffer.all_codeblocks_crc_ok() {
            return;
        }
        let cb_size = tx_buffer.codeblock_size();
        for cb in 0..tx_buffer.nof_codeblocks() {
            let chunk = bits.chunks(cb_size).nth(cb).unwrap_or(&[]);
            if let Some(storage) = tx_buffer.codeblock_mut(cb) {
                storage.fill(0);
                for (dst, &bit) in storage.iter_mut().zip(chunk) {
                    *dst = bit as u8;
                }
            }
            tx_buffer.set_codeblock_crc(cb, true);
        }
    }

    /// Encoded bits from the buffer, or `bits` when soft bits are stored externally
    fn read_out(tx_buffer: &TxBufferGuard<'_>, bits: &[bool]) -> Vec<bool> {
        let cb_size = tx_buffer.codeblock_size();
        let mut out = Vec::with_capacity(bits.len());
        for cb in 0..tx_buffer.nof_codeblocks() {
            let Some(storage) = tx_buffer.codeblock(cb) else {
                return bits.to_vec();
            };
            let remaining = bits.len().saturating_sub(cb * cb_size).min(cb_size);
            out.extend(storage[..remaining].iter().map(|&b| b != 0));
        }
        out
    }
}

impl PdschProcessor for ReferencePdsch {
    fn process(&self, grid: &mut ResourceGrid, tx_buffer: &mut TxBufferGuard<'_>, pdu: &PdschPdu) {
        let bits = unpack_bits(&attach_crc24(&pdu.transport_block));
        let retransmission = tx_buffer.all_codeblocks_crc_ok();
        Self::encode(tx_buffer, &bits);

        let mut encoded = Self::read_out(tx_buffer, &bits);
        if !encoded.is_empty() {
            // Starting position of each redundancy version, a quarter of the buffer apart
            let k0 = (pdu.rv as usize % 4) * encoded.len() / 4;
            encoded.rotate_left(k0);
        }

        let symbols = modulate_qpsk(&encoded);
        let res = allocation(pdu.start_symbol, pdu.nof_symbols, pdu.start_rb, pdu.nof_rbs);
        match map_symbols(grid, pdu.port, res, &symbols) {
            Ok(mapped) => {
                if mapped < symbols.len() {
                    warn!(
                        "PDSCH rnti={} h_id={} slot={}: allocation holds {} of {} symbols",
                        pdu.rnti,
                        pdu.harq_id,
                        pdu.slot,
                        mapped,
                        symbols.len()
                    );
                }
                trace!(
                    "PDSCH rnti={} h_id={} rv={} slot={}: mapped {} REs (retx={})",
                    pdu.rnti,
                    pdu.harq_id,
                    pdu.rv,
                    pdu.slot,
                    mapped,
                    retransmission
                );
            }
            Err(err) => warn!("PDSCH rnti={} h_id={} slot={}: {}", pdu.rnti, pdu.harq_id, pdu.slot, err),
        }
    }
}

/// PSS and QPSK-mapped MIB with CRC
#[derive(Debug, Default)]
pub struct ReferenceSsb;

impl SsbProcessor for ReferenceSsb {
    fn process(&self, grid: &mut ResourceGrid, pdu: &SsbPdu) {
        let offset = pdu.subcarrier_offset as usize;
        let pss = pss_sequence(pdu.pci.0 % 3);
        if let Err(err) = grid.put_symbols(pdu.port, pdu.start_symbol as usize, offset + PSS_OFFSET, &pss) {
            warn!("SSB {} slot={}: {}", pdu.ssb_index, pdu.slot, err);
            return;
        }

        let mib = pdu.mib_payload.to_be_bytes();
        let pbch: Vec<Complex32> = modulate_qpsk(&unpack_bits(&attach_crc24(&mib[1..])))
            .into_iter()
            .cycle()
            .take(SSB_NOF_SUBC)
            .collect();
        if let Err(err) = grid.put_symbols(pdu.port, pdu.start_symbol as usize + 1, offset, &pbch) {
            warn!("SSB {} slot={}: {}", pdu.ssb_index, pdu.slot, err);
            return;
        }

        trace!("SSB {} pci={} slot={}: mapped", pdu.ssb_index, pdu.pci.0, pdu.slot);
    }
}

/// UCI read as BPSK over the PUCCH allocation
#[derive(Debug, Default)]
pub struct ReferencePucch;

impl PucchProcessor for ReferencePucch {
    fn process(&self, grid: &ResourceGrid, pdu: &PucchPdu) -> UciResults {
        let mut res = allocation(pdu.start_symbol, pdu.nof_symbols, pdu.start_rb, pdu.nof_rbs);
        decode_uci(grid, pdu.port, &mut res, &pdu.uci)
    }
}

/// UCI followed by a QPSK transport block; soft bits are combined in the
/// softbuffer unless new data is signalled
#[derive(Debug, Default)]
pub struct ReferencePusch;

impl ReferencePusch {
    fn combine(softbuffer: &mut RxSoftbufferGuard<'_>, llrs: &mut [LogLikelihoodRatio], new_data: bool) {
        let cb_size = softbuffer.codeblock_size();
        for (cb, chunk) in llrs.chunks_mut(cb_size).enumerate() {
            let Some(stored) = softbuffer.codeblock_mut(cb) else {
                return;
            };
            for (acc, llr) in stored.iter_mut().zip(chunk.iter_mut()) {
                *acc = if new_data { *llr } else { acc.saturating_add(*llr) };
                *llr = *acc;
            }
        }
    }
}

impl PuschProcessor for ReferencePusch {
    fn process(
        &self,
        grid: &ResourceGrid,
        softbuffer: Option<&mut RxSoftbufferGuard<'_>>,
        pdu: &PuschPdu,
    ) -> PuschDecodeOutput {
        let mut res = allocation(pdu.start_symbol, pdu.nof_symbols, pdu.start_rb, pdu.nof_rbs);
        let uci = decode_uci(grid, pdu.port, &mut res, &pdu.uci);

        let (Some(codeword), Some(softbuffer)) = (pdu.codeword, softbuffer) else {
            return PuschDecodeOutput {
                uci,
                ..Default::default()
            };
        };

        let nof_bits = (codeword.tbs_bytes + CRC_LEN) * 8;
        let received: Vec<Complex32> = res
            .take(nof_bits.div_ceil(2))
            .map(|(symbol, subc)| grid.get(pdu.port, symbol, subc).unwrap_or_default())
            .collect();
        let mut llrs = demodulate_qpsk(&received);
        llrs.truncate(nof_bits);
        Self::combine(softbuffer, &mut llrs, codeword.new_data);

        let bits: Vec<bool> = llrs.iter().map(|&llr| llr < 0).collect();
        let decoded = pack_bits(&bits);
        let payload = match check_crc24(&decoded) {
            Some(tb) if llrs.len() == nof_bits => Bytes::copy_from_slice(tb),
            _ => {
                trace!("PUSCH rnti={} h_id={} slot={}: CRC KO", pdu.rnti, pdu.harq_id, pdu.slot);
                return PuschDecodeOutput {
                    tb_crc_ok: false,
                    payload: Bytes::new(),
                    uci,
                };
            }
        };

        for cb in 0..softbuffer.nof_codeblocks() {
            softbuffer.set_codeblock_crc(cb, true);
        }
        PuschDecodeOutput {
            tb_crc_ok: true,
            payload,
            uci,
        }
    }
}

/// Correlates the first preamble symbol against every candidate preamble
#[derive(Debug, Default)]
pub struct ReferencePrachDetector;

impl PrachDetector for ReferencePrachDetector {
    fn detect(&self, buffer: &PrachBuffer, pdu: &PrachPdu) -> Vec<PreambleDetection> {
        let samples = buffer.symbol(pdu.port, 0, 0, 0);
        let length = samples.len();
        let energy: f32 = samples.iter().map(|s| s.norm_sqr()).sum();
        if length < 2 || energy == 0.0 {
            return Vec::new();
        }

        let root = zadoff_chu(pdu.root_sequence_index, length);
        let norm = energy.sqrt() * (length as f32).sqrt();
        let power_dbm = 10.0 * (energy / length as f32).log10() + 30.0;
        let first = pdu.start_preamble_index as usize;
        let last = (first + pdu.nof_preamble_indices as usize).min(64);

        (first..last)
            .filter_map(|index| {
                let shift = index * PRACH_CYCLIC_SHIFT;
                let correlation: Complex32 = samples
                    .iter()
                    .enumerate()
                    .map(|(n, s)| s * root[(n + shift) % length].conj())
                    .sum();
                let metric = correlation.norm() / norm;
                (metric > PRACH_DETECTION_THRESHOLD).then(|| PreambleDetection {
                    preamble_index: index as u8,
                    timing_advance_us: 0.0,
                    detection_metric: metric,
                    power_dbm,
                })
            })
            .collect()
    }
}

/// Averages the sounding symbol of each transmit port over the allocation
#[derive(Debug, Default)]
pub struct ReferenceSrsEstimator;

impl SrsEstimator for ReferenceSrsEstimator {
    fn estimate(&self, grid: &ResourceGrid, pdu: &SrsPdu) -> Array2<Complex32> {
        let subcarriers = pdu.start_rb as usize * NRE..(pdu.start_rb as usize + pdu.nof_rbs as usize) * NRE;
        let nof_symbols = pdu.nof_symbols.max(1) as usize;
        let nof_subc = subcarriers.len().max(1) as f32;

        Array2::from_shape_fn((grid.nof_ports(), pdu.nof_tx_ports), |(rx, tx)| {
            let symbol = pdu.start_symbol as usize + tx % nof_symbols;
            let sum: Complex32 = subcarriers.clone().filter_map(|subc| grid.get(rx, symbol, subc)).sum();
            sum / nof_subc
        })
    }
}
