//! Albor Space 5G Upper PHY Slot Core
//!
//! Runs the upper PHY against a synthetic single-UE traffic pattern: a slot
//! clock drives the downlink processors and the uplink dispatcher with the
//! reference kernels, and a loopback stands in for the radio front-end.

mod config;
mod kernels;
mod scheduler;
mod sinks;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::types::SlotPoint;
use common::utils::time::slot_duration_us;
use config::AppConfig;
use interfaces::{TaskExecutor, TokioExecutor, WorkerPool};
use kernels::{
    ReferencePdcch, ReferencePdsch, ReferencePrachDetector, ReferencePucch, ReferencePusch, ReferenceSrsEstimator,
    ReferenceSsb,
};
use layers::phy::{
    DownlinkKernels, ResourceGridContext, UpperPhy, UpperPhyDependencies, UplinkExecutors, UplinkKernels,
    UplinkResultNotifier,
};
use scheduler::{write_prach_buffer, write_uplink_grid, DownlinkSlotPlan, PlannerConfig, SlotPlanner, UplinkSlotPlan};
use sinks::{CountingGateway, LoggingNotifier};

/// Albor Space 5G Upper PHY
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to YAML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Log filter (trace, debug, info, warn, error or EnvFilter directives);
    /// overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Stop after this many slots
    #[arg(short, long)]
    nof_slots: Option<u64>,
}

/// Executors owned by the application; stopped on shutdown
struct Executors {
    dl: Arc<WorkerPool>,
    pucch: Arc<WorkerPool>,
    pusch: Arc<WorkerPool>,
    prach: Arc<WorkerPool>,
    srs: Arc<WorkerPool>,
    grid_zeroing: Arc<TokioExecutor>,
}

impl Executors {
    fn new(config: &AppConfig) -> Result<Self> {
        let exec = &config.executors;
        Ok(Self {
            dl: Arc::new(WorkerPool::new("dl", exec.dl_workers, exec.dl_queue_size)?),
            pucch: Arc::new(WorkerPool::new("pucch", 1, exec.pucch_queue_size)?),
            pusch: Arc::new(WorkerPool::new("pusch", exec.pusch_workers, exec.pusch_queue_size)?),
            prach: Arc::new(WorkerPool::new("prach", 1, exec.prach_queue_size)?),
            srs: Arc::new(WorkerPool::new("srs", 1, exec.srs_queue_size)?),
            grid_zeroing: Arc::new(TokioExecutor::new(
                tokio::runtime::Handle::current(),
                exec.grid_zeroing_queue_size,
            )),
        })
    }

    fn uplink(&self) -> UplinkExecutors {
        UplinkExecutors {
            pucch: self.pucch.clone(),
            pusch: self.pusch.clone(),
            prach: self.prach.clone(),
            srs: self.srs.clone(),
        }
    }

    fn stop(&self) {
        for pool in [&self.dl, &self.pucch, &self.pusch, &self.prach, &self.srs] {
            pool.stop();
        }
    }
}

/// Feeds one slot of planned traffic per sector into the upper PHY
struct SlotRunner {
    phy: Arc<UpperPhy>,
    planner: SlotPlanner,
    notifier: Arc<dyn UplinkResultNotifier>,
}

impl SlotRunner {
    fn run_slot(&mut self, slot: SlotPoint) {
        self.phy.on_tti_boundary(slot);

        let dl_plan = self.planner.plan_downlink(slot);
        let ul_plan = self.planner.plan_uplink(slot);

        for sector in 0..self.phy.config().nof_sectors {
            let context = ResourceGridContext { slot, sector };
            self.run_downlink(&context, &dl_plan);
            self.run_uplink(&context, &ul_plan);
        }
    }

    fn run_downlink(&self, context: &ResourceGridContext, plan: &DownlinkSlotPlan) {
        let processor = self.phy.begin_downlink_slot(context);

        if let Some(ssb) = &plan.ssb {
            processor.process_ssb(ssb.clone());
        }
        for pdcch in &plan.pdcch {
            processor.process_pdcch(pdcch.clone());
        }
        for pdsch in &plan.pdsch {
            let tx_buffer = self.phy.reserve_tx_buffer(pdsch);
            processor.process_pdsch(tx_buffer, pdsch.clone());
        }

        processor.send_resource_grid();
    }

    fn run_uplink(&self, context: &ResourceGridContext, plan: &UplinkSlotPlan) {
        let uplink = self.phy.uplink();

        let grid = self.phy.ul_resource_grid(context);
        let written = write_uplink_grid(&mut grid.lock(), plan);
        if let Err(err) = written {
            warn!("UL front-end {}: {}", context, err);
        }

        for pucch in &plan.pucch {
            uplink.process_pucch(self.notifier.clone(), grid.clone(), *context, pucch.pdu.clone());
        }
        for pusch in &plan.pusch {
            uplink.process_pusch(self.notifier.clone(), grid.clone(), *context, pusch.pdu.clone());
        }
        if let Some(srs) = &plan.srs {
            uplink.process_srs(self.notifier.clone(), grid.clone(), *context, srs.clone());
        }
        drop(grid);

        if let Some(prach) = &plan.prach {
            let buffer = self.phy.prach_buffer(context);
            write_prach_buffer(&mut buffer.lock(), prach);
            uplink.process_prach(self.notifier.clone(), buffer, *context, prach.pdu.clone());
        }
    }
}

fn report_stats(phy: &UpperPhy, gateway: &CountingGateway, notifier: &LoggingNotifier) {
    let dl = gateway.stats();
    let ul = notifier.stats();
    let discards = phy.uplink().discards();

    info!("Upper PHY Statistics:");
    info!(
        "  DL grids sent: {} ({} with data), PDUs dropped: {}",
        dl.grids_sent,
        dl.grids_with_data,
        phy.nof_dropped_dl_pdus()
    );
    info!(
        "  PUSCH: {} OK, {} KO, {} discarded; UCI: {} valid, {} not valid",
        ul.pusch_crc_ok, ul.pusch_crc_ko, ul.pusch_discarded, ul.uci_valid, ul.uci_not_valid
    );
    info!(
        "  PUCCH: {}, PRACH: {} occasions / {} preambles, SRS: {}",
        ul.pucch, ul.prach_occasions, ul.prach_preambles, ul.srs
    );
    info!(
        "  UL discards: pucch={} pusch={} prach={} srs={}, HARQ buffers: rx={} tx={}",
        discards.pucch,
        discards.pusch,
        discards.prach,
        discards.srs,
        phy.uplink().rx_softbuffers().nof_reserved(),
        phy.tx_buffers().nof_reserved()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::from_yaml_file(path)?,
        None => {
            let config = AppConfig::default();
            config.validate()?;
            config
        }
    };

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(args.log_level.clone().unwrap_or_else(|| config.log.filter_directives()))
    });

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor Space 5G Upper PHY");
    info!("Configuration file: {}", args.config.as_deref().unwrap_or("<defaults>"));

    let scs = config.scs()?;
    let nof_prb = config.nof_prb()?;
    let phy_config = config.upper_phy_config()?;

    info!("Cell configuration:");
    info!("  PCI: {}", config.cell.pci);
    info!("  Bandwidth: {} MHz ({} PRB)", config.cell.channel_bandwidth_mhz, nof_prb);
    info!("  Subcarrier spacing: {} kHz", scs.khz());
    info!("  Sectors: {}", config.cell.nof_sectors);
    debug!("Upper PHY configuration: {:?}", phy_config);

    let executors = Executors::new(&config)?;
    let gateway = Arc::new(CountingGateway::new());
    let notifier = Arc::new(LoggingNotifier::new());

    let zeroing: Arc<dyn TaskExecutor> = executors.grid_zeroing.clone();
    let deps = UpperPhyDependencies {
        dl_executor: executors.dl.clone(),
        grid_zeroing_executor: zeroing,
        ul_executors: executors.uplink(),
        dl_kernels: DownlinkKernels {
            pdcch: Arc::new(ReferencePdcch),
            pdsch: Arc::new(ReferencePdsch),
            ssb: Arc::new(ReferenceSsb),
        },
        ul_kernels: UplinkKernels {
            pucch: Arc::new(ReferencePucch),
            pusch: Arc::new(ReferencePusch),
            prach: Arc::new(ReferencePrachDetector),
            srs: Arc::new(ReferenceSrsEstimator),
        },
        gateway: gateway.clone(),
    };
    let phy = Arc::new(UpperPhy::new(phy_config, deps)?);

    let mut runner = SlotRunner {
        phy: phy.clone(),
        planner: SlotPlanner::new(PlannerConfig {
            pci: config.pci()?,
            nof_prb,
            max_codeblock_size: config
                .upper_phy
                .rx_softbuffers
                .max_codeblock_size
                .min(config.upper_phy.tx_buffers.max_codeblock_size),
        }),
        notifier: notifier.clone(),
    };

    let running = Arc::new(RwLock::new(true));

    // Start statistics reporting
    let stats_handle = {
        let phy = phy.clone();
        let gateway = gateway.clone();
        let notifier = notifier.clone();
        let running = running.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.tick().await;

            while *running.read().await {
                interval.tick().await;
                report_stats(&phy, &gateway, &notifier);
            }
        })
    };

    let slot_duration = Duration::from_micros(slot_duration_us(scs) as u64);
    let mut slot_clock = tokio::time::interval(slot_duration);
    slot_clock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut slot = SlotPoint::from_system_slot(scs.numerology(), 0);
    let mut nof_slots: u64 = 0;

    info!("Slot clock running: {} us per slot", slot_duration.as_micros());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
            _ = slot_clock.tick() => {
                runner.run_slot(slot);
                slot = slot + 1;
                nof_slots += 1;
                if args.nof_slots.is_some_and(|limit| nof_slots >= limit) {
                    info!("Processed {} slots", nof_slots);
                    break;
                }
            }
        }
    }

    // Shutdown
    info!("Shutting down upper PHY");
    *running.write().await = false;
    stats_handle.abort();

    // Let in-flight tasks drain before the workers are joined
    tokio::time::sleep(slot_duration * 4).await;
    executors.stop();

    report_stats(&phy, &gateway, &notifier);
    info!("Upper PHY shutdown complete");
    Ok(())
}
