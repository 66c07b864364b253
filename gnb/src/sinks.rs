//! Transmit Gateway and Uplink Result Sinks
//!
//! Stand-ins for the radio front-end and the MAC: they count what reaches
//! them so the main loop can report throughput.

use layers::phy::{
    PrachResult, PucchResult, PuschControlResult, PuschDataResult, ResourceGridContext, SharedResourceGrid,
    SrsResult, TxGateway, UciResults, UciStatus, UplinkResultNotifier,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Downlink gateway statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub grids_sent: u64,
    /// Grids carrying at least one non-zero resource element
    pub grids_with_data: u64,
}

/// Accepts every finished downlink grid and releases it straight away
#[derive(Debug, Default)]
pub struct CountingGateway {
    grids_sent: AtomicU64,
    grids_with_data: AtomicU64,
}

impl CountingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            grids_sent: self.grids_sent.load(Ordering::Relaxed),
            grids_with_data: self.grids_with_data.load(Ordering::Relaxed),
        }
    }
}

impl TxGateway for CountingGateway {
    fn send(&self, context: &ResourceGridContext, grid: SharedResourceGrid) {
        let has_data = !grid.lock().is_all_zero();
        self.grids_sent.fetch_add(1, Ordering::Relaxed);
        if has_data {
            self.grids_with_data.fetch_add(1, Ordering::Relaxed);
        }
        trace!("DL grid {} sent for {} (data={})", grid.id(), context, has_data);
    }
}

/// Uplink result statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UplinkStats {
    pub pusch_crc_ok: u64,
    pub pusch_crc_ko: u64,
    pub pusch_discarded: u64,
    pub uci_valid: u64,
    pub uci_not_valid: u64,
    pub pucch: u64,
    pub prach_occasions: u64,
    pub prach_preambles: u64,
    pub srs: u64,
    /// Results of any channel flagged as discarded
    pub discarded: u64,
}

/// Counts and logs every uplink result
#[derive(Debug, Default)]
pub struct LoggingNotifier {
    pusch_crc_ok: AtomicU64,
    pusch_crc_ko: AtomicU64,
    pusch_discarded: AtomicU64,
    uci_valid: AtomicU64,
    uci_not_valid: AtomicU64,
    pucch: AtomicU64,
    prach_occasions: AtomicU64,
    prach_preambles: AtomicU64,
    srs: AtomicU64,
    discarded: AtomicU64,
}

impl LoggingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> UplinkStats {
        UplinkStats {
            pusch_crc_ok: self.pusch_crc_ok.load(Ordering::Relaxed),
            pusch_crc_ko: self.pusch_crc_ko.load(Ordering::Relaxed),
            pusch_discarded: self.pusch_discarded.load(Ordering::Relaxed),
            uci_valid: self.uci_valid.load(Ordering::Relaxed),
            uci_not_valid: self.uci_not_valid.load(Ordering::Relaxed),
            pucch: self.pucch.load(Ordering::Relaxed),
            prach_occasions: self.prach_occasions.load(Ordering::Relaxed),
            prach_preambles: self.prach_preambles.load(Ordering::Relaxed),
            srs: self.srs.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn count_uci(&self, uci: &UciResults) {
        for field in [&uci.harq_ack, &uci.sr, &uci.csi_part1, &uci.csi_part2].into_iter().flatten() {
            if field.status == UciStatus::Valid {
                self.uci_valid.fetch_add(1, Ordering::Relaxed);
            } else {
                self.uci_not_valid.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn count_discard(&self, discarded: bool) {
        if discarded {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl UplinkResultNotifier for LoggingNotifier {
    fn on_new_pusch_results_data(&self, result: PuschDataResult) {
        let counter = if result.discarded {
            &self.pusch_discarded
        } else if result.tb_crc_ok {
            &self.pusch_crc_ok
        } else {
            &self.pusch_crc_ko
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.count_discard(result.discarded);

        debug!(
            "PUSCH rnti={} h_id={} slot={} sector={}: crc={} tbs={} discarded={}",
            result.rnti,
            result.harq_id,
            result.slot,
            result.sector,
            if result.tb_crc_ok { "OK" } else { "KO" },
            result.payload.len(),
            result.discarded
        );
    }

    fn on_new_pusch_results_control(&self, result: PuschControlResult) {
        self.count_uci(&result.uci);
        self.count_discard(result.discarded);
        debug!(
            "PUSCH UCI rnti={} h_id={} slot={}: {:?} discarded={}",
            result.rnti, result.harq_id, result.slot, result.uci.harq_ack, result.discarded
        );
    }

    fn on_new_pucch_results(&self, result: PucchResult) {
        self.pucch.fetch_add(1, Ordering::Relaxed);
        self.count_uci(&result.uci);
        self.count_discard(result.discarded);
        debug!(
            "PUCCH {:?} rnti={} slot={}: {:?} discarded={}",
            result.format, result.rnti, result.slot, result.uci.harq_ack, result.discarded
        );
    }

    fn on_new_prach_results(&self, result: PrachResult) {
        self.prach_occasions.fetch_add(1, Ordering::Relaxed);
        self.prach_preambles
            .fetch_add(result.preambles.len() as u64, Ordering::Relaxed);
        self.count_discard(result.discarded);
        for preamble in &result.preambles {
            debug!(
                "PRACH slot={} sector={}: preamble={} metric={:.2} power={:.1}dBm",
                result.slot, result.sector, preamble.preamble_index, preamble.detection_metric, preamble.power_dbm
            );
        }
    }

    fn on_new_srs_results(&self, result: SrsResult) {
        self.srs.fetch_add(1, Ordering::Relaxed);
        self.count_discard(result.discarded);
        debug!(
            "SRS rnti={} slot={}: channel {:?} discarded={}",
            result.rnti,
            result.slot,
            result.channel_matrix.dim(),
            result.discarded
        );
    }
}
