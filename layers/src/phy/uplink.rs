//! Uplink Channel Task Dispatcher
//!
//! Routes every uplink channel request to the executor dedicated to its
//! channel type. When an executor rejects a task the request is not retried:
//! a discarded result carrying the request metadata is reported through the
//! same notifier, so each request yields exactly one outcome per requested
//! payload kind.

use super::prach_buffer::SharedPrachBuffer;
use super::rg_pool::{ResourceGridContext, SharedResourceGrid};
use super::softbuffer::RxSoftbufferPool;
use super::ul_channels::{
    PrachDetector, PrachPdu, PrachResult, PucchPdu, PucchProcessor, PucchResult, PuschControlResult, PuschDataResult,
    PuschPdu, PuschProcessor, SrsEstimator, SrsPdu, SrsResult, UciPayloadSizes, UciResults, UplinkResultNotifier,
};
use bytes::Bytes;
use common::types::{Rnti, SlotPoint};
use interfaces::TaskExecutor;
use ndarray::Array2;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// One executor per uplink channel type
#[derive(Clone)]
pub struct UplinkExecutors {
    pub pucch: Arc<dyn TaskExecutor>,
    pub pusch: Arc<dyn TaskExecutor>,
    pub prach: Arc<dyn TaskExecutor>,
    pub srs: Arc<dyn TaskExecutor>,
}

/// Uplink channel kernels
#[derive(Clone)]
pub struct UplinkKernels {
    pub pucch: Arc<dyn PucchProcessor>,
    pub pusch: Arc<dyn PuschProcessor>,
    pub prach: Arc<dyn PrachDetector>,
    pub srs: Arc<dyn SrsEstimator>,
}

/// Metadata of an uplink request, kept aside so a discarded result can be
/// synthesized after the task itself has been dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTaskRequest {
    pub rnti: Rnti,
    pub slot: SlotPoint,
    pub sector: usize,
    pub harq_id: u8,
    /// Transport block length in bits, when a transport block was scheduled
    pub data_bits: Option<usize>,
    pub uci: UciPayloadSizes,
}

impl ChannelTaskRequest {
    pub fn from_pusch(pdu: &PuschPdu, sector: usize) -> Self {
        Self {
            rnti: pdu.rnti,
            slot: pdu.slot,
            sector,
            harq_id: pdu.harq_id,
            data_bits: pdu.codeword.map(|cw| cw.tbs_bytes * 8),
            uci: pdu.uci,
        }
    }

    pub fn from_pucch(pdu: &PucchPdu, sector: usize) -> Self {
        Self {
            rnti: pdu.rnti,
            slot: pdu.slot,
            sector,
            harq_id: 0,
            data_bits: None,
            uci: pdu.uci,
        }
    }

    pub fn from_srs(pdu: &SrsPdu, sector: usize) -> Self {
        Self {
            rnti: pdu.rnti,
            slot: pdu.slot,
            sector,
            harq_id: 0,
            data_bits: None,
            uci: UciPayloadSizes::default(),
        }
    }

    fn data_result(&self, tb_crc_ok: bool, payload: Bytes, discarded: bool) -> PuschDataResult {
        PuschDataResult {
            rnti: self.rnti,
            slot: self.slot,
            sector: self.sector,
            harq_id: self.harq_id,
            tb_crc_ok,
            payload,
            discarded,
        }
    }

    fn control_result(&self, uci: UciResults, discarded: bool) -> PuschControlResult {
        PuschControlResult {
            rnti: self.rnti,
            slot: self.slot,
            sector: self.sector,
            harq_id: self.harq_id,
            uci,
            discarded,
        }
    }

    /// Placeholder transport block result: CRC failed, no payload
    pub fn discarded_data(&self) -> PuschDataResult {
        self.data_result(false, Bytes::new(), true)
    }

    /// Placeholder UCI result: every requested field unknown
    pub fn discarded_control(&self) -> PuschControlResult {
        self.control_result(UciResults::unknown(&self.uci), true)
    }

    /// Report a PUSCH that was not processed
    pub fn notify_discarded_pusch(&self, notifier: &dyn UplinkResultNotifier) {
        if self.data_bits.is_some() {
            notifier.on_new_pusch_results_data(self.discarded_data());
        }
        if !self.uci.is_empty() {
            notifier.on_new_pusch_results_control(self.discarded_control());
        }
    }
}

#[derive(Default)]
struct DiscardCounters {
    pucch: AtomicU64,
    pusch: AtomicU64,
    prach: AtomicU64,
    srs: AtomicU64,
}

/// Snapshot of the requests discarded per channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UplinkDiscards {
    pub pucch: u64,
    pub pusch: u64,
    pub prach: u64,
    pub srs: u64,
}

impl UplinkDiscards {
    pub fn total(&self) -> u64 {
        self.pucch + self.pusch + self.prach + self.srs
    }
}

/// Uplink channel task dispatcher
pub struct UplinkChannelDispatcher {
    executors: UplinkExecutors,
    kernels: UplinkKernels,
    rx_softbuffers: Arc<RxSoftbufferPool>,
    discards: DiscardCounters,
}

impl UplinkChannelDispatcher {
    pub fn new(executors: UplinkExecutors, kernels: UplinkKernels, rx_softbuffers: Arc<RxSoftbufferPool>) -> Self {
        Self {
            executors,
            kernels,
            rx_softbuffers,
            discards: DiscardCounters::default(),
        }
    }

    pub fn rx_softbuffers(&self) -> &Arc<RxSoftbufferPool> {
        &self.rx_softbuffers
    }

    pub fn discards(&self) -> UplinkDiscards {
        UplinkDiscards {
            pucch: self.discards.pucch.load(Ordering::Relaxed),
            pusch: self.discards.pusch.load(Ordering::Relaxed),
            prach: self.discards.prach.load(Ordering::Relaxed),
            srs: self.discards.srs.load(Ordering::Relaxed),
        }
    }

    /// Decode a PUSCH.
    ///
    /// The softbuffer is reserved here, on the calling thread; the decode
    /// task locks it. A transport block that passes its CRC releases the
    /// softbuffer.
    pub fn process_pusch(
        &self,
        notifier: Arc<dyn UplinkResultNotifier>,
        grid: SharedResourceGrid,
        context: ResourceGridContext,
        pdu: PuschPdu,
    ) {
        let request = ChannelTaskRequest::from_pusch(&pdu, context.sector);
        let softbuffer = pdu.codeword.map(|cw| {
            let handle = self.rx_softbuffers.reserve(pdu.softbuffer_id(), cw.nof_codeblocks, cw.codeblock_size);
            // A new transport block must not combine with a previous one, even if this task never runs.
            if cw.new_data {
                if let Ok(mut buffer) = handle.lock() {
                    buffer.reset();
                }
            }
            handle
        });

        trace!(
            "PUSCH rnti={} h_id={} slot={}: dispatching (data={}, uci={})",
            request.rnti,
            request.harq_id,
            request.slot,
            softbuffer.is_some(),
            !request.uci.is_empty()
        );

        let kernel = self.kernels.pusch.clone();
        let pool = self.rx_softbuffers.clone();
        let task_notifier = notifier.clone();
        let accepted = self.executors.pusch.execute(Box::new(move || {
            let output = {
                let grid = grid.lock();
                match &softbuffer {
                    None => Some(kernel.process(&grid, None, &pdu)),
                    Some(handle) => match handle.lock() {
                        Ok(mut buffer) => Some(kernel.process(&grid, Some(&mut buffer), &pdu)),
                        Err(err) => {
                            warn!("PUSCH rnti={} h_id={} slot={}: {}", request.rnti, request.harq_id, request.slot, err);
                            None
                        }
                    },
                }
            };
            drop(grid);

            let Some(output) = output else {
                request.notify_discarded_pusch(&*task_notifier);
                return;
            };

            if let Some(handle) = softbuffer {
                if output.tb_crc_ok {
                    pool.release(handle);
                }
                let payload = if output.tb_crc_ok { output.payload } else { Bytes::new() };
                task_notifier.on_new_pusch_results_data(request.data_result(output.tb_crc_ok, payload, false));
            }
            if !request.uci.is_empty() {
                task_notifier.on_new_pusch_results_control(request.control_result(output.uci, false));
            }
        }));

        if !accepted {
            warn!(
                "PUSCH rnti={} h_id={} slot={}: executor queue full, discarding",
                request.rnti, request.harq_id, request.slot
            );
            self.discards.pusch.fetch_add(1, Ordering::Relaxed);
            request.notify_discarded_pusch(&*notifier);
        }
    }

    pub fn process_pucch(
        &self,
        notifier: Arc<dyn UplinkResultNotifier>,
        grid: SharedResourceGrid,
        context: ResourceGridContext,
        pdu: PucchPdu,
    ) {
        let request = ChannelTaskRequest::from_pucch(&pdu, context.sector);
        let format = pdu.format;
        trace!("PUCCH rnti={} slot={} {:?}: dispatching", request.rnti, request.slot, format);

        let kernel = self.kernels.pucch.clone();
        let task_notifier = notifier.clone();
        let accepted = self.executors.pucch.execute(Box::new(move || {
            let uci = kernel.process(&grid.lock(), &pdu);
            drop(grid);
            task_notifier.on_new_pucch_results(PucchResult {
                rnti: request.rnti,
                slot: request.slot,
                sector: request.sector,
                format,
                uci,
                discarded: false,
            });
        }));

        if !accepted {
            warn!("PUCCH rnti={} slot={}: executor queue full, discarding", request.rnti, request.slot);
            self.discards.pucch.fetch_add(1, Ordering::Relaxed);
            notifier.on_new_pucch_results(PucchResult {
                rnti: request.rnti,
                slot: request.slot,
                sector: request.sector,
                format,
                uci: UciResults::unknown(&request.uci),
                discarded: true,
            });
        }
    }

    pub fn process_prach(
        &self,
        notifier: Arc<dyn UplinkResultNotifier>,
        buffer: SharedPrachBuffer,
        context: ResourceGridContext,
        pdu: PrachPdu,
    ) {
        let slot = pdu.slot;
        let sector = context.sector;
        trace!("PRACH slot={} sector={}: dispatching", slot, sector);

        let detector = self.kernels.prach.clone();
        let task_notifier = notifier.clone();
        let accepted = self.executors.prach.execute(Box::new(move || {
            let preambles = detector.detect(&buffer.lock(), &pdu);
            drop(buffer);
            task_notifier.on_new_prach_results(PrachResult {
                slot,
                sector,
                preambles,
                discarded: false,
            });
        }));

        if !accepted {
            warn!("PRACH slot={} sector={}: executor queue full, discarding", slot, sector);
            self.discards.prach.fetch_add(1, Ordering::Relaxed);
            notifier.on_new_prach_results(PrachResult {
                slot,
                sector,
                preambles: Vec::new(),
                discarded: true,
            });
        }
    }

    pub fn process_srs(
        &self,
        notifier: Arc<dyn UplinkResultNotifier>,
        grid: SharedResourceGrid,
        context: ResourceGridContext,
        pdu: SrsPdu,
    ) {
        let request = ChannelTaskRequest::from_srs(&pdu, context.sector);
        trace!("SRS rnti={} slot={}: dispatching", request.rnti, request.slot);

        let estimator = self.kernels.srs.clone();
        let task_notifier = notifier.clone();
        let accepted = self.executors.srs.execute(Box::new(move || {
            let channel_matrix = estimator.estimate(&grid.lock(), &pdu);
            drop(grid);
            task_notifier.on_new_srs_results(SrsResult {
                rnti: request.rnti,
                slot: request.slot,
                sector: request.sector,
                channel_matrix,
                discarded: false,
            });
        }));

        if !accepted {
            warn!("SRS rnti={} slot={}: executor queue full, discarding", request.rnti, request.slot);
            self.discards.srs.fetch_add(1, Ordering::Relaxed);
            notifier.on_new_srs_results(SrsResult {
                rnti: request.rnti,
                slot: request.slot,
                sector: request.sector,
                channel_matrix: Array2::zeros((0, 0)),
                discarded: true,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::prach_buffer::{PrachBuffer, PrachBufferDimensions, PrachBufferPool};
    use crate::phy::resource_grid::{ResourceGrid, ResourceGridDimensions};
    use crate::phy::rg_pool::{GenericResourceGridPool, ResourceGridPool};
    use crate::phy::softbuffer::{RxSoftbufferGuard, SoftbufferPoolConfig};
    use crate::phy::ul_channels::{
        PreambleDetection, PucchFormat, PuschCodeword, PuschDecodeOutput, UciField, UciStatus,
    };
    use common::types::ModulationScheme;
    use interfaces::{InlineExecutor, ManualExecutor};
    use num_complex::Complex32;
    use parking_lot::Mutex;

    #[derive(Debug)]
    enum Event {
        PuschData(PuschDataResult),
        PuschControl(PuschControlResult),
        Pucch(PucchResult),
        Prach(PrachResult),
        Srs(SrsResult),
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingNotifier {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl UplinkResultNotifier for RecordingNotifier {
        fn on_new_pusch_results_data(&self, result: PuschDataResult) {
            self.events.lock().push(Event::PuschData(result));
        }
        fn on_new_pusch_results_control(&self, result: PuschControlResult) {
            self.events.lock().push(Event::PuschControl(result));
        }
        fn on_new_pucch_results(&self, result: PucchResult) {
            self.events.lock().push(Event::Pucch(result));
        }
        fn on_new_prach_results(&self, result: PrachResult) {
            self.events.lock().push(Event::Prach(result));
        }
        fn on_new_srs_results(&self, result: SrsResult) {
            self.events.lock().push(Event::Srs(result));
        }
    }

    /// Passes the transport block once every codeblock has passed, one
    /// codeblock per transmission
    struct StubKernels;

    impl PuschProcessor for StubKernels {
        fn process(
            &self,
            _grid: &ResourceGrid,
            softbuffer: Option<&mut RxSoftbufferGuard<'_>>,
            pdu: &PuschPdu,
        ) -> PuschDecodeOutput {
            let mut output = PuschDecodeOutput {
                uci: UciResults {
                    harq_ack: (pdu.uci.harq_ack > 0).then(|| UciField {
                        status: UciStatus::Valid,
                        bits: vec![true; pdu.uci.harq_ack as usize],
                    }),
                    ..Default::default()
                },
                ..Default::default()
            };
            if let Some(buffer) = softbuffer {
                if let Some(next) = buffer.codeblocks_crc().iter().position(|ok| !ok) {
                    buffer.set_codeblock_crc(next, true);
                }
                output.tb_crc_ok = buffer.all_codeblocks_crc_ok();
                if output.tb_crc_ok {
                    output.payload = Bytes::from_static(b"tb");
                }
            }
            output
        }
    }

    impl PucchProcessor for StubKernels {
        fn process(&self, _grid: &ResourceGrid, pdu: &PucchPdu) -> UciResults {
            UciResults {
                sr: (pdu.uci.sr > 0).then(|| UciField {
                    status: UciStatus::Valid,
                    bits: vec![true],
                }),
                ..Default::default()
            }
        }
    }

    impl PrachDetector for StubKernels {
        fn detect(&self, _buffer: &PrachBuffer, pdu: &PrachPdu) -> Vec<PreambleDetection> {
            vec![PreambleDetection {
                preamble_index: pdu.start_preamble_index,
                timing_advance_us: 0.5,
                detection_metric: 10.0,
                power_dbm: -80.0,
            }]
        }
    }

    impl SrsEstimator for StubKernels {
        fn estimate(&self, grid: &ResourceGrid, pdu: &SrsPdu) -> Array2<Complex32> {
            Array2::from_elem((grid.nof_ports(), pdu.nof_tx_ports), Complex32::new(1.0, 0.0))
        }
    }

    struct Fixture {
        dispatcher: UplinkChannelDispatcher,
        notifier: Arc<RecordingNotifier>,
        grids: GenericResourceGridPool,
        prach: PrachBufferPool,
    }

    fn fixture(executor: Arc<dyn TaskExecutor>) -> Fixture {
        let kernels = Arc::new(StubKernels);
        let rx_softbuffers = Arc::new(
            RxSoftbufferPool::new(SoftbufferPoolConfig {
                max_softbuffers: 4,
                max_nof_codeblocks: 16,
                max_codeblock_size: 256,
                expire_timeout_slots: 10,
                external_soft_bits: false,
            })
            .unwrap(),
        );
        Fixture {
            dispatcher: UplinkChannelDispatcher::new(
                UplinkExecutors {
                    pucch: executor.clone(),
                    pusch: executor.clone(),
                    prach: executor.clone(),
                    srs: executor,
                },
                UplinkKernels {
                    pucch: kernels.clone(),
                    pusch: kernels.clone(),
                    prach: kernels.clone(),
                    srs: kernels,
                },
                rx_softbuffers,
            ),
            notifier: Arc::new(RecordingNotifier::default()),
            grids: GenericResourceGridPool::new(4, 1, ResourceGridDimensions::with_prb(2, 25)).unwrap(),
            prach: PrachBufferPool::new(2, PrachBufferDimensions::long(1)).unwrap(),
        }
    }

    fn context(count: u32) -> ResourceGridContext {
        ResourceGridContext {
            slot: SlotPoint::from_system_slot(1, count),
            sector: 0,
        }
    }

    fn pusch(slot: SlotPoint, codeword: Option<PuschCodeword>, uci: UciPayloadSizes) -> PuschPdu {
        PuschPdu {
            slot,
            rnti: Rnti(0x4601),
            harq_id: 5,
            rv: 0,
            modulation: ModulationScheme::Qam16,
            start_symbol: 0,
            nof_symbols: 14,
            start_rb: 0,
            nof_rbs: 25,
            codeword,
            uci,
            port: 0,
        }
    }

    fn codeword(new_data: bool) -> PuschCodeword {
        PuschCodeword {
            nof_codeblocks: 2,
            codeblock_size: 256,
            new_data,
            tbs_bytes: 40,
        }
    }

    fn harq_ack(bits: u16) -> UciPayloadSizes {
        UciPayloadSizes {
            harq_ack: bits,
            ..Default::default()
        }
    }

    fn pucch(slot: SlotPoint) -> PucchPdu {
        PucchPdu {
            slot,
            rnti: Rnti(0x4602),
            format: PucchFormat::Format1,
            start_symbol: 0,
            nof_symbols: 14,
            start_rb: 24,
            nof_rbs: 1,
            uci: UciPayloadSizes {
                harq_ack: 1,
                sr: 1,
                ..Default::default()
            },
            port: 0,
        }
    }

    fn srs(slot: SlotPoint) -> SrsPdu {
        SrsPdu {
            slot,
            rnti: Rnti(0x4603),
            nof_tx_ports: 1,
            start_symbol: 13,
            nof_symbols: 1,
            start_rb: 0,
            nof_rbs: 24,
        }
    }

    fn prach(slot: SlotPoint) -> PrachPdu {
        PrachPdu {
            slot,
            root_sequence_index: 1,
            start_preamble_index: 7,
            nof_preamble_indices: 64,
            port: 0,
        }
    }

    fn submit_all(f: &Fixture, ctx: ResourceGridContext) {
        let grid = f.grids.get_resource_grid(&ctx);
        let notifier: Arc<dyn UplinkResultNotifier> = f.notifier.clone();
        f.dispatcher
            .process_pusch(notifier.clone(), grid.clone(), ctx, pusch(ctx.slot, Some(codeword(true)), harq_ack(2)));
        f.dispatcher.process_pucch(notifier.clone(), grid.clone(), ctx, pucch(ctx.slot));
        f.dispatcher.process_srs(notifier.clone(), grid, ctx, srs(ctx.slot));
        f.dispatcher
            .process_prach(notifier, f.prach.get_prach_buffer(ctx.slot), ctx, prach(ctx.slot));
    }

    #[test]
    fn test_processed_results_are_reported() {
        let f = fixture(Arc::new(InlineExecutor));
        let ctx = context(3);
        submit_all(&f, ctx);

        let events = f.notifier.take();
        assert_eq!(events.len(), 5);
        for event in &events {
            match event {
                Event::PuschData(r) => {
                    assert!(!r.discarded);
                    assert!(!r.tb_crc_ok);
                    assert!(r.payload.is_empty());
                }
                Event::PuschControl(r) => {
                    assert!(!r.discarded);
                    assert_eq!(r.uci.harq_ack.as_ref().unwrap().status, UciStatus::Valid);
                }
                Event::Pucch(r) => {
                    assert!(!r.discarded);
                    assert_eq!(r.uci.sr.as_ref().unwrap().bits, vec![true]);
                }
                Event::Prach(r) => {
                    assert!(!r.discarded);
                    assert_eq!(r.preambles[0].preamble_index, 7);
                }
                Event::Srs(r) => {
                    assert!(!r.discarded);
                    assert_eq!(r.channel_matrix.dim(), (2, 1));
                }
            }
        }
        assert_eq!(f.dispatcher.discards(), UplinkDiscards::default());
    }

    #[test]
    fn test_no_silent_drop_under_saturation() {
        let executor = Arc::new(ManualExecutor::new());
        executor.set_accepting(false);
        let f = fixture(executor.clone());
        let ctx = context(9);
        submit_all(&f, ctx);

        let events = f.notifier.take();
        assert_eq!(events.len(), 5);
        for event in &events {
            match event {
                Event::PuschData(r) => {
                    assert!(r.discarded);
                    assert!(!r.tb_crc_ok);
                    assert!(r.payload.is_empty());
                    assert_eq!((r.rnti, r.slot, r.harq_id), (Rnti(0x4601), ctx.slot, 5));
                }
                Event::PuschControl(r) => {
                    assert!(r.discarded);
                    assert_eq!((r.rnti, r.slot, r.harq_id), (Rnti(0x4601), ctx.slot, 5));
                    assert_eq!(r.uci.harq_ack, Some(UciField::unknown(2)));
                    assert!(r.uci.csi_part1.is_none());
                }
                Event::Pucch(r) => {
                    assert!(r.discarded);
                    assert_eq!((r.rnti, r.slot), (Rnti(0x4602), ctx.slot));
                    assert_eq!(r.format, PucchFormat::Format1);
                    assert_eq!(r.uci.harq_ack, Some(UciField::unknown(1)));
                    assert_eq!(r.uci.sr, Some(UciField::unknown(1)));
                }
                Event::Prach(r) => {
                    assert!(r.discarded);
                    assert_eq!(r.slot, ctx.slot);
                    assert!(r.preambles.is_empty());
                }
                Event::Srs(r) => {
                    assert!(r.discarded);
                    assert_eq!((r.rnti, r.slot), (Rnti(0x4603), ctx.slot));
                    assert_eq!(r.channel_matrix.len(), 0);
                }
            }
        }

        assert_eq!(
            f.dispatcher.discards(),
            UplinkDiscards {
                pucch: 1,
                pusch: 1,
                prach: 1,
                srs: 1
            }
        );
        assert_eq!(executor.nof_pending(), 0);
    }

    #[test]
    fn test_partial_saturation_keeps_one_outcome_per_request() {
        let executor = Arc::new(ManualExecutor::new());
        let f = fixture(executor.clone());
        let notifier: Arc<dyn UplinkResultNotifier> = f.notifier.clone();

        for count in 0..4u32 {
            let ctx = context(count);
            executor.set_accepting(count % 2 == 0);
            let grid = f.grids.get_resource_grid(&ctx);
            f.dispatcher.process_pusch(
                notifier.clone(),
                grid,
                ctx,
                pusch(ctx.slot, Some(codeword(true)), UciPayloadSizes::default()),
            );
            executor.run_pending();
        }

        let events = f.notifier.take();
        assert_eq!(events.len(), 4);
        let discarded: Vec<bool> = events
            .iter()
            .map(|e| match e {
                Event::PuschData(r) => r.discarded,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(discarded, vec![false, true, false, true]);
    }

    #[test]
    fn test_uci_only_pusch_reports_control_only() {
        let f = fixture(Arc::new(InlineExecutor));
        let ctx = context(1);
        f.dispatcher.process_pusch(
            f.notifier.clone(),
            f.grids.get_resource_grid(&ctx),
            ctx,
            pusch(ctx.slot, None, harq_ack(1)),
        );

        let events = f.notifier.take();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::PuschControl(_)));
        assert_eq!(f.dispatcher.rx_softbuffers().nof_reserved(), 0);
    }

    #[test]
    fn test_harq_combining_across_retransmissions() {
        let f = fixture(Arc::new(InlineExecutor));
        let notifier: Arc<dyn UplinkResultNotifier> = f.notifier.clone();

        // First transmission decodes one of two codeblocks.
        let ctx = context(0);
        f.dispatcher.process_pusch(
            notifier.clone(),
            f.grids.get_resource_grid(&ctx),
            ctx,
            pusch(ctx.slot, Some(codeword(true)), UciPayloadSizes::default()),
        );
        f.dispatcher.rx_softbuffers().run_slot(ctx.slot);
        assert_eq!(f.dispatcher.rx_softbuffers().nof_reserved(), 1);

        // Retransmission completes the transport block and frees the buffer.
        let ctx = context(2);
        f.dispatcher.process_pusch(
            notifier,
            f.grids.get_resource_grid(&ctx),
            ctx,
            pusch(ctx.slot, Some(codeword(false)), UciPayloadSizes::default()),
        );

        let events = f.notifier.take();
        let crc: Vec<bool> = events
            .iter()
            .map(|e| match e {
                Event::PuschData(r) => r.tb_crc_ok,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(crc, vec![false, true]);
        match &events[1] {
            Event::PuschData(r) => assert_eq!(r.payload, Bytes::from_static(b"tb")),
            _ => unreachable!(),
        }
        assert_eq!(f.dispatcher.rx_softbuffers().nof_reserved(), 0);
    }

    #[test]
    fn test_new_data_resets_combining() {
        let f = fixture(Arc::new(InlineExecutor));
        let notifier: Arc<dyn UplinkResultNotifier> = f.notifier.clone();

        for count in 0..3u32 {
            let ctx = context(count);
            f.dispatcher.process_pusch(
                notifier.clone(),
                f.grids.get_resource_grid(&ctx),
                ctx,
                pusch(ctx.slot, Some(codeword(true)), UciPayloadSizes::default()),
            );
        }

        let events = f.notifier.take();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(e, Event::PuschData(r) if !r.tb_crc_ok)));
    }

    #[test]
    fn test_rejected_new_data_does_not_combine_with_previous_block() {
        let executor = Arc::new(ManualExecutor::new());
        let f = fixture(executor.clone());
        let notifier: Arc<dyn UplinkResultNotifier> = f.notifier.clone();
        let submit = |count: u32, new_data: bool| {
            let ctx = context(count);
            f.dispatcher.process_pusch(
                notifier.clone(),
                f.grids.get_resource_grid(&ctx),
                ctx,
                pusch(ctx.slot, Some(codeword(new_data)), UciPayloadSizes::default()),
            );
        };

        // First block decodes one of two codeblocks.
        submit(0, true);
        assert_eq!(executor.run_pending(), 1);

        // Second block is dropped by a saturated executor.
        executor.set_accepting(false);
        submit(1, true);
        executor.set_accepting(true);

        // Its retransmission starts from an empty buffer instead of the first block's state.
        submit(2, false);
        assert_eq!(executor.run_pending(), 1);

        let events = f.notifier.take();
        let outcomes: Vec<(bool, bool)> = events
            .iter()
            .map(|e| match e {
                Event::PuschData(r) => (r.discarded, r.tb_crc_ok),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(outcomes, vec![(false, false), (true, false), (false, false)]);
        assert_eq!(f.dispatcher.discards().pusch, 1);
        assert_eq!(f.dispatcher.rx_softbuffers().nof_reserved(), 1);
    }
}
