//! Synthetic Slot Planner and Uplink Loopback
//!
//! Drives the upper PHY with a fixed traffic pattern for a single test UE:
//! one PDCCH + PDSCH per downlink slot, a PUCCH every uplink slot, a PUSCH
//! every other slot, periodic SSB, PRACH and SRS occasions. HARQ
//! retransmissions are planned deterministically so that both transmit
//! buffer reuse and receive soft combining are exercised.
//!
//! The loopback half writes what the planned uplink PDUs describe into the
//! uplink grid and PRACH buffer, standing in for the radio front-end.

use crate::kernels::{allocation, map_symbols, modulate_bpsk, nof_uci_bits, preamble_sequence, pusch_symbols, CRC_LEN};
use bytes::Bytes;
use common::types::{ModulationScheme, Pci, Rnti, SlotPoint};
use layers::phy::{
    PdcchPdu, PdschPdu, PrachBuffer, PrachPdu, PucchFormat, PucchPdu, PuschCodeword, PuschPdu, ResourceGrid,
    SrsPdu, SsbPdu, UciPayloadSizes, NRE, NSYMB_PER_SLOT_NORM,
};
use layers::LayerError;
use num_complex::Complex32;
use tracing::trace;

/// RNTI of the emulated UE
pub const TEST_RNTI: Rnti = Rnti(0x4601);

const NOF_HARQ_PROCESSES: u32 = 8;
/// Redundancy version sequence of retransmissions
const RV_SEQUENCE: [u8; 4] = [0, 2, 3, 1];

/// SSB period in frames
const SSB_PERIOD_FRAMES: u32 = 2;
/// SRS period in slots and offset within the period
const SRS_PERIOD_SLOTS: u32 = 10;
const SRS_OFFSET_SLOTS: u32 = 5;
const PRACH_ROOT_SEQUENCE_INDEX: u16 = 1;

/// Every n-th new downlink transport block is retransmitted once
const DL_RETX_EVERY: u32 = 4;
/// Every n-th new uplink transport block arrives corrupted
const UL_CORRUPT_EVERY: u32 = 5;
/// Amplitude of a corrupted (inverted) uplink transmission
const CORRUPTED_AMPLITUDE: f32 = 0.3;

const PDCCH_NOF_RBS: u16 = 24;
const PDCCH_AGGREGATION_LEVEL: u8 = 4;
const DCI_SIZE_BYTES: usize = 5;
const DL_TBS_BYTES: usize = 256;
const UL_TBS_BYTES: usize = 128;
/// LDPC base graph 1 maximum codeblock size
const LDPC_MAX_CODEBLOCK_SIZE: usize = 8448;

/// Cell parameters the planner needs
#[derive(Debug, Clone, Copy)]
pub struct PlannerConfig {
    pub pci: Pci,
    pub nof_prb: u16,
    /// Soft bits per codeblock the HARQ pools can hold
    pub max_codeblock_size: usize,
}

/// Downlink PDUs of one slot
#[derive(Debug, Clone, Default)]
pub struct DownlinkSlotPlan {
    pub ssb: Option<SsbPdu>,
    pub pdcch: Vec<PdcchPdu>,
    pub pdsch: Vec<PdschPdu>,
}

#[derive(Debug, Clone)]
pub struct PlannedPucch {
    pub pdu: PucchPdu,
    /// UCI bits the emulated UE sends
    pub uci_bits: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct PlannedPusch {
    pub pdu: PuschPdu,
    pub uci_bits: Vec<bool>,
    pub transport_block: Bytes,
    /// The transmission reaches the receiver damaged beyond decoding
    pub corrupted: bool,
}

#[derive(Debug, Clone)]
pub struct PlannedPrach {
    pub pdu: PrachPdu,
    pub preamble_index: u8,
}

/// Uplink PDUs of one slot
#[derive(Debug, Clone, Default)]
pub struct UplinkSlotPlan {
    pub pucch: Vec<PlannedPucch>,
    pub pusch: Vec<PlannedPusch>,
    pub prach: Option<PlannedPrach>,
    pub srs: Option<SrsPdu>,
}

#[derive(Debug, Clone, Default)]
struct HarqProcess {
    transport_block: Bytes,
    /// Index into [`RV_SEQUENCE`] of the next transmission
    nof_tx: usize,
    pending_retx: bool,
}

/// Deterministic traffic generator for one UE
pub struct SlotPlanner {
    config: PlannerConfig,
    dl_harq: Vec<HarqProcess>,
    ul_harq: Vec<HarqProcess>,
    dl_new_tbs: u32,
    ul_new_tbs: u32,
}

impl SlotPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            dl_harq: vec![HarqProcess::default(); NOF_HARQ_PROCESSES as usize],
            ul_harq: vec![HarqProcess::default(); NOF_HARQ_PROCESSES as usize],
            dl_new_tbs: 0,
            ul_new_tbs: 0,
        }
    }

    /// Largest codeblock the LDPC encoder and the HARQ pools support
    fn codeblock_size(&self) -> usize {
        self.config.max_codeblock_size.min(LDPC_MAX_CODEBLOCK_SIZE)
    }

    /// Transport block size in bytes that fits `nof_re` QPSK resource elements
    fn fit_tbs(wanted_bytes: usize, nof_re: usize) -> usize {
        let capacity_bytes = nof_re * 2 / 8;
        wanted_bytes.min(capacity_bytes.saturating_sub(CRC_LEN)).max(1)
    }

    fn is_ssb_slot(&self, slot: SlotPoint) -> bool {
        slot.slot_index() == 0 && slot.sfn() % SSB_PERIOD_FRAMES == 0
    }

    fn is_prach_slot(&self, slot: SlotPoint) -> bool {
        slot.sfn() % 2 == 1 && slot.slot_index() == slot.nof_slots_per_frame() - 1
    }

    fn is_srs_slot(&self, slot: SlotPoint) -> bool {
        slot.system_slot() % SRS_PERIOD_SLOTS == SRS_OFFSET_SLOTS
    }

    /// PUSCH on odd slots
    fn is_pusch_slot(&self, slot: SlotPoint) -> bool {
        slot.system_slot() % 2 == 1
    }

    pub fn plan_downlink(&mut self, slot: SlotPoint) -> DownlinkSlotPlan {
        let nof_prb = self.config.nof_prb;
        let ssb = self.is_ssb_slot(slot).then(|| SsbPdu {
            slot,
            pci: self.config.pci,
            ssb_index: 0,
            start_symbol: 2,
            subcarrier_offset: 0,
            mib_payload: ((slot.sfn() >> 4) & 0x3f) << 17,
            port: 0,
        });

        let harq_id = slot.system_slot() % NOF_HARQ_PROCESSES;
        let (transport_block, new_data, rv) = Self::next_transmission(
            &mut self.dl_harq[harq_id as usize],
            &mut self.dl_new_tbs,
            DL_RETX_EVERY,
            DL_TBS_BYTES,
        );

        // Keep clear of the SS/PBCH block
        let start_symbol: u8 = if ssb.is_some() { 4 } else { 2 };
        let nof_symbols = NSYMB_PER_SLOT_NORM as u8 - start_symbol;
        let nof_re = nof_symbols as usize * nof_prb as usize * NRE;
        let tbs = Self::fit_tbs(transport_block.len(), nof_re);
        let transport_block = transport_block.slice(..tbs);
        let nof_bits = (tbs + CRC_LEN) * 8;
        let codeblock_size = self.codeblock_size();

        let dci = Bytes::from(
            (0..DCI_SIZE_BYTES)
                .map(|i| (harq_id as u8) << 4 | (new_data as u8) << 3 | rv | i as u8)
                .collect::<Vec<u8>>(),
        );
        let pdcch = PdcchPdu {
            slot,
            rnti: TEST_RNTI,
            start_symbol: 0,
            nof_symbols: 1,
            start_rb: 0,
            nof_rbs: PDCCH_NOF_RBS.min(nof_prb),
            aggregation_level: PDCCH_AGGREGATION_LEVEL,
            dci_payload: dci,
            port: 0,
        };
        let pdsch = PdschPdu {
            slot,
            rnti: TEST_RNTI,
            harq_id: harq_id as u8,
            new_data,
            rv,
            modulation: ModulationScheme::Qpsk,
            start_symbol,
            nof_symbols,
            start_rb: 0,
            nof_rbs: nof_prb,
            transport_block,
            nof_codeblocks: nof_bits.div_ceil(codeblock_size),
            codeblock_size,
            port: 0,
        };

        trace!(
            "DL plan slot={}: ssb={} h_id={} ndi={} rv={} tbs={}",
            slot,
            ssb.is_some(),
            pdsch.harq_id,
            new_data,
            rv,
            tbs
        );

        DownlinkSlotPlan {
            ssb,
            pdcch: vec![pdcch],
            pdsch: vec![pdsch],
        }
    }

    pub fn plan_uplink(&mut self, slot: SlotPoint) -> UplinkSlotPlan {
        let nof_prb = self.config.nof_prb;
        let last_rb = nof_prb - 1;
        let mut plan = UplinkSlotPlan::default();

        // PUCCH on the last resource block, PUSCH and SRS below it
        let ack = slot.system_slot() % 3 != 0;
        let sr = slot.system_slot() % 40 == 0;
        plan.pucch.push(PlannedPucch {
            pdu: PucchPdu {
                slot,
                rnti: TEST_RNTI,
                format: PucchFormat::Format1,
                start_symbol: 0,
                nof_symbols: NSYMB_PER_SLOT_NORM as u8,
                start_rb: last_rb,
                nof_rbs: 1,
                uci: UciPayloadSizes {
                    harq_ack: 1,
                    sr: 1,
                    ..Default::default()
                },
                port: 0,
            },
            uci_bits: vec![ack, sr],
        });

        let srs = self.is_srs_slot(slot);
        let nof_pusch_symbols = (if srs { NSYMB_PER_SLOT_NORM - 2 } else { NSYMB_PER_SLOT_NORM }) as u8;
        let pusch_rbs = last_rb.max(1);

        if self.is_pusch_slot(slot) {
            let harq_id = (slot.system_slot() / 2) % NOF_HARQ_PROCESSES;
            let process = &mut self.ul_harq[harq_id as usize];
            let retransmission = process.pending_retx;
            let (transport_block, new_data, rv) =
                Self::next_transmission(process, &mut self.ul_new_tbs, UL_CORRUPT_EVERY, UL_TBS_BYTES);
            // The first transmission of a block planned for retransmission is the corrupted one
            let corrupted = !retransmission && self.ul_harq[harq_id as usize].pending_retx;

            let uci = UciPayloadSizes {
                harq_ack: 2,
                ..Default::default()
            };
            let nof_re = nof_pusch_symbols as usize * pusch_rbs as usize * NRE - nof_uci_bits(&uci);
            let tbs = Self::fit_tbs(transport_block.len(), nof_re);
            let transport_block = transport_block.slice(..tbs);
            let codeblock_size = self.codeblock_size();

            plan.pusch.push(PlannedPusch {
                pdu: PuschPdu {
                    slot,
                    rnti: TEST_RNTI,
                    harq_id: harq_id as u8,
                    rv,
                    modulation: ModulationScheme::Qpsk,
                    start_symbol: 0,
                    nof_symbols: nof_pusch_symbols,
                    start_rb: 0,
                    nof_rbs: pusch_rbs,
                    codeword: Some(PuschCodeword {
                        nof_codeblocks: ((tbs + CRC_LEN) * 8).div_ceil(codeblock_size),
                        codeblock_size,
                        new_data,
                        tbs_bytes: tbs,
                    }),
                    uci,
                    port: 0,
                },
                uci_bits: vec![ack, !ack],
                transport_block,
                corrupted,
            });
        }

        if self.is_prach_slot(slot) {
            plan.prach = Some(PlannedPrach {
                pdu: PrachPdu {
                    slot,
                    root_sequence_index: PRACH_ROOT_SEQUENCE_INDEX,
                    start_preamble_index: 0,
                    nof_preamble_indices: 64,
                    port: 0,
                },
                preamble_index: (slot.sfn() / 2 % 64) as u8,
            });
        }

        if srs {
            plan.srs = Some(SrsPdu {
                slot,
                rnti: TEST_RNTI,
                nof_tx_ports: 1,
                start_symbol: NSYMB_PER_SLOT_NORM as u8 - 2,
                nof_symbols: 2,
                start_rb: 0,
                nof_rbs: pusch_rbs,
            });
        }

        plan
    }

    /// Advance one HARQ process: returns (transport block, new data, rv)
    fn next_transmission(
        process: &mut HarqProcess,
        new_tbs: &mut u32,
        retx_every: u32,
        tbs_bytes: usize,
    ) -> (Bytes, bool, u8) {
        if process.pending_retx {
            process.pending_retx = false;
            let rv = RV_SEQUENCE[process.nof_tx % RV_SEQUENCE.len()];
            process.nof_tx += 1;
            return (process.transport_block.clone(), false, rv);
        }

        let counter = *new_tbs;
        *new_tbs = new_tbs.wrapping_add(1);
        process.transport_block = (0..tbs_bytes)
            .map(|i| (counter as usize).wrapping_mul(31).wrapping_add(i) as u8)
            .collect();
        process.nof_tx = 1;
        process.pending_retx = counter % retx_every == retx_every - 1;
        (process.transport_block.clone(), true, RV_SEQUENCE[0])
    }
}

/// Write the uplink transmissions of a plan into a (reused) uplink grid
pub fn write_uplink_grid(grid: &mut ResourceGrid, plan: &UplinkSlotPlan) -> Result<(), LayerError> {
    grid.set_all_zero();

    for pucch in &plan.pucch {
        let pdu = &pucch.pdu;
        let res = allocation(pdu.start_symbol, pdu.nof_symbols, pdu.start_rb, pdu.nof_rbs);
        map_symbols(grid, pdu.port, res, &modulate_bpsk(&pucch.uci_bits))?;
    }

    for pusch in &plan.pusch {
        let pdu = &pusch.pdu;
        let tb = pdu.codeword.map(|_| &pusch.transport_block[..]);
        let mut symbols = pusch_symbols(&pusch.uci_bits, tb);
        if pusch.corrupted {
            for symbol in symbols.iter_mut().skip(pusch.uci_bits.len()) {
                *symbol = -*symbol * CORRUPTED_AMPLITUDE;
            }
        }
        let res = allocation(pdu.start_symbol, pdu.nof_symbols, pdu.start_rb, pdu.nof_rbs);
        map_symbols(grid, pdu.port, res, &symbols)?;
    }

    if let Some(srs) = &plan.srs {
        for rx in 0..grid.nof_ports() {
            for tx in 0..srs.nof_tx_ports {
                let channel = Complex32::from_polar(1.0, 0.25 * (rx + 2 * tx) as f32);
                let symbol = srs.start_symbol as usize + tx % srs.nof_symbols.max(1) as usize;
                let values = vec![channel; srs.nof_rbs as usize * NRE];
                grid.put_symbols(rx, symbol, srs.start_rb as usize * NRE, &values)?;
            }
        }
    }

    Ok(())
}

/// Write the preamble of a PRACH occasion into every port of the buffer
pub fn write_prach_buffer(buffer: &mut PrachBuffer, prach: &PlannedPrach) {
    let dims = buffer.dimensions();
    let sequence = preamble_sequence(prach.pdu.root_sequence_index, prach.preamble_index, dims.sequence_length);
    for port in 0..dims.nof_ports {
        buffer.symbol_mut(port, 0, 0, 0).copy_from_slice(&sequence);
    }
}
