//! YAML Configuration Structures
//!
//! Every field has a default so that a partial file (or no file at all)
//! yields a runnable single-sector cell.

use anyhow::{anyhow, bail, Result};
use common::types::{Bandwidth, Pci, SlotPoint, SubcarrierSpacing};
use layers::phy::{PrachBufferDimensions, ResourceGridDimensions, SoftbufferPoolConfig, UpperPhyConfig};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Cell configuration
    #[serde(default)]
    pub cell: CellConfig,
    /// Upper PHY pool sizing
    #[serde(default)]
    pub upper_phy: UpperPhySection,
    /// Worker threads and queues
    #[serde(default)]
    pub executors: ExecutorsConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Cell configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellConfig {
    /// Physical Cell ID
    #[serde(default = "default_pci")]
    pub pci: u16,
    /// Channel bandwidth in MHz
    #[serde(rename = "channel_bandwidth_MHz", default = "default_bandwidth")]
    pub channel_bandwidth_mhz: u32,
    /// Common subcarrier spacing in kHz
    #[serde(default = "default_scs")]
    pub common_scs: u32,
    /// Number of transmit antenna ports
    #[serde(default = "default_one")]
    pub nof_antennas_dl: usize,
    /// Number of receive antenna ports
    #[serde(default = "default_one")]
    pub nof_antennas_ul: usize,
    /// Number of sectors served by this instance
    #[serde(default = "default_one")]
    pub nof_sectors: usize,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            pci: default_pci(),
            channel_bandwidth_mhz: default_bandwidth(),
            common_scs: default_scs(),
            nof_antennas_dl: 1,
            nof_antennas_ul: 1,
            nof_sectors: 1,
        }
    }
}

fn default_pci() -> u16 {
    1
}

fn default_bandwidth() -> u32 {
    20
}

fn default_scs() -> u32 {
    30
}

fn default_one() -> usize {
    1
}

/// Upper PHY configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpperPhySection {
    /// Downlink resource grids per sector
    #[serde(default = "default_nof_rg")]
    pub nof_dl_rg: usize,
    /// Uplink resource grids per sector
    #[serde(default = "default_nof_rg")]
    pub nof_ul_rg: usize,
    /// PRACH buffers per sector
    #[serde(default = "default_nof_prach_buffer")]
    pub nof_prach_buffer: usize,
    /// Asynchronous zeroing of downlink grids; omit to disable
    #[serde(default = "default_dl_rg_expire_timeout")]
    pub dl_rg_expire_timeout_slots: Option<u32>,
    /// Downlink processors per sector
    #[serde(default = "default_nof_dl_processors")]
    pub nof_dl_processors: usize,
    /// PUSCH softbuffers
    #[serde(default)]
    pub rx_softbuffers: SoftbufferConfig,
    /// PDSCH transmit buffers
    #[serde(default)]
    pub tx_buffers: SoftbufferConfig,
}

impl Default for UpperPhySection {
    fn default() -> Self {
        Self {
            nof_dl_rg: default_nof_rg(),
            nof_ul_rg: default_nof_rg(),
            nof_prach_buffer: default_nof_prach_buffer(),
            dl_rg_expire_timeout_slots: default_dl_rg_expire_timeout(),
            nof_dl_processors: default_nof_dl_processors(),
            rx_softbuffers: SoftbufferConfig::default(),
            tx_buffers: SoftbufferConfig::default(),
        }
    }
}

fn default_nof_rg() -> usize {
    16
}

fn default_nof_prach_buffer() -> usize {
    4
}

fn default_dl_rg_expire_timeout() -> Option<u32> {
    Some(8)
}

fn default_nof_dl_processors() -> usize {
    4
}

/// HARQ buffer pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SoftbufferConfig {
    #[serde(default = "default_max_softbuffers")]
    pub max_softbuffers: usize,
    /// Codeblocks shared by all buffers
    #[serde(default = "default_max_nof_codeblocks")]
    pub max_nof_codeblocks: usize,
    /// Soft bits per codeblock
    #[serde(default = "default_max_codeblock_size")]
    pub max_codeblock_size: usize,
    #[serde(default = "default_softbuffer_expire_timeout")]
    pub expire_timeout_slots: u32,
    #[serde(default)]
    pub external_soft_bits: bool,
}

impl Default for SoftbufferConfig {
    fn default() -> Self {
        Self {
            max_softbuffers: default_max_softbuffers(),
            max_nof_codeblocks: default_max_nof_codeblocks(),
            max_codeblock_size: default_max_codeblock_size(),
            expire_timeout_slots: default_softbuffer_expire_timeout(),
            external_soft_bits: false,
        }
    }
}

impl From<&SoftbufferConfig> for SoftbufferPoolConfig {
    fn from(config: &SoftbufferConfig) -> Self {
        SoftbufferPoolConfig {
            max_softbuffers: config.max_softbuffers,
            max_nof_codeblocks: config.max_nof_codeblocks,
            max_codeblock_size: config.max_codeblock_size,
            expire_timeout_slots: config.expire_timeout_slots,
            external_soft_bits: config.external_soft_bits,
        }
    }
}

fn default_max_softbuffers() -> usize {
    64
}

fn default_max_nof_codeblocks() -> usize {
    512
}

fn default_max_codeblock_size() -> usize {
    // LDPC base graph 1, lifting size 384
    66 * 384
}

fn default_softbuffer_expire_timeout() -> u32 {
    100
}

/// Executor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorsConfig {
    #[serde(default = "default_dl_workers")]
    pub dl_workers: usize,
    #[serde(default = "default_queue_size")]
    pub dl_queue_size: usize,
    #[serde(default = "default_pusch_workers")]
    pub pusch_workers: usize,
    #[serde(default = "default_queue_size")]
    pub pusch_queue_size: usize,
    #[serde(default = "default_queue_size")]
    pub pucch_queue_size: usize,
    #[serde(default = "default_small_queue_size")]
    pub prach_queue_size: usize,
    #[serde(default = "default_small_queue_size")]
    pub srs_queue_size: usize,
    /// In-flight grid zeroing tasks on the tokio blocking pool
    #[serde(default = "default_small_queue_size")]
    pub grid_zeroing_queue_size: usize,
}

impl Default for ExecutorsConfig {
    fn default() -> Self {
        Self {
            dl_workers: default_dl_workers(),
            dl_queue_size: default_queue_size(),
            pusch_workers: default_pusch_workers(),
            pusch_queue_size: default_queue_size(),
            pucch_queue_size: default_queue_size(),
            prach_queue_size: default_small_queue_size(),
            srs_queue_size: default_small_queue_size(),
            grid_zeroing_queue_size: default_small_queue_size(),
        }
    }
}

fn default_dl_workers() -> usize {
    2
}

fn default_pusch_workers() -> usize {
    2
}

fn default_queue_size() -> usize {
    256
}

fn default_small_queue_size() -> usize {
    32
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// All layers log level
    #[serde(default = "default_log_level")]
    pub all_level: String,
    /// PHY layer log level
    #[serde(default = "default_log_level")]
    pub phy_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            all_level: default_log_level(),
            phy_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LogConfig {
    /// Filter directives for `tracing_subscriber::EnvFilter`
    pub fn filter_directives(&self) -> String {
        format!("{},layers::phy={}", self.all_level, self.phy_level)
    }
}

impl AppConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read configuration file {}: {}", path, e))?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn pci(&self) -> Result<Pci> {
        Pci::new(self.cell.pci).ok_or_else(|| anyhow!("Invalid PCI: {}", self.cell.pci))
    }

    pub fn scs(&self) -> Result<SubcarrierSpacing> {
        num_traits::FromPrimitive::from_u32(self.cell.common_scs)
            .ok_or_else(|| anyhow!("Invalid subcarrier spacing: {} kHz", self.cell.common_scs))
    }

    pub fn bandwidth(&self) -> Result<Bandwidth> {
        Bandwidth::from_mhz(self.cell.channel_bandwidth_mhz)
            .ok_or_else(|| anyhow!("Invalid bandwidth: {} MHz", self.cell.channel_bandwidth_mhz))
    }

    /// Number of resource blocks of the carrier
    pub fn nof_prb(&self) -> Result<u16> {
        let (bandwidth, scs) = (self.bandwidth()?, self.scs()?);
        bandwidth.nof_prb(scs).ok_or_else(|| {
            anyhow!(
                "{} MHz is not defined for {} kHz subcarrier spacing",
                self.cell.channel_bandwidth_mhz,
                self.cell.common_scs
            )
        })
    }

    /// Check every value before anything is allocated
    pub fn validate(&self) -> Result<()> {
        self.pci()?;
        self.nof_prb()?;

        if self.cell.nof_sectors == 0 || self.cell.nof_antennas_dl == 0 || self.cell.nof_antennas_ul == 0 {
            bail!("Sectors and antenna ports must be at least one");
        }

        let phy = &self.upper_phy;
        if phy.nof_dl_rg == 0 || phy.nof_ul_rg == 0 || phy.nof_prach_buffer == 0 || phy.nof_dl_processors == 0 {
            bail!("Upper PHY pool sizes must be at least one: {:?}", phy);
        }
        let numerology = self.scs()?.numerology();
        for (name, size) in [
            ("nof_dl_rg", phy.nof_dl_rg),
            ("nof_ul_rg", phy.nof_ul_rg),
            ("nof_prach_buffer", phy.nof_prach_buffer),
            ("nof_dl_processors", phy.nof_dl_processors),
        ] {
            if !SlotPoint::is_valid_cycle(numerology, size) {
                bail!(
                    "{} ({}) must divide the SFN period of {} slots",
                    name,
                    size,
                    SlotPoint::system_frame_period(numerology)
                );
            }
        }
        if let Some(timeout) = phy.dl_rg_expire_timeout_slots {
            if timeout == 0 || timeout as usize >= phy.nof_dl_rg {
                bail!(
                    "dl_rg_expire_timeout_slots ({}) must be between 1 and nof_dl_rg - 1 ({})",
                    timeout,
                    phy.nof_dl_rg - 1
                );
            }
        }
        if phy.nof_dl_processors > phy.nof_dl_rg {
            bail!(
                "nof_dl_processors ({}) cannot exceed nof_dl_rg ({})",
                phy.nof_dl_processors,
                phy.nof_dl_rg
            );
        }
        for (name, pool) in [("rx_softbuffers", &phy.rx_softbuffers), ("tx_buffers", &phy.tx_buffers)] {
            if pool.max_softbuffers == 0 || pool.max_nof_codeblocks == 0 || pool.max_codeblock_size == 0 {
                bail!("{} sizes must be non-zero", name);
            }
            if pool.expire_timeout_slots == 0 {
                bail!("{}.expire_timeout_slots must be at least one slot", name);
            }
        }

        let exec = &self.executors;
        let queues = [
            exec.dl_queue_size,
            exec.pusch_queue_size,
            exec.pucch_queue_size,
            exec.prach_queue_size,
            exec.srs_queue_size,
            exec.grid_zeroing_queue_size,
        ];
        if exec.dl_workers == 0 || exec.pusch_workers == 0 || queues.contains(&0) {
            bail!("Executor workers and queue sizes must be at least one: {:?}", exec);
        }

        Ok(())
    }

    /// Upper PHY sizing derived from this configuration
    pub fn upper_phy_config(&self) -> Result<UpperPhyConfig> {
        let nof_prb = self.nof_prb()? as usize;
        Ok(UpperPhyConfig {
            nof_sectors: self.cell.nof_sectors,
            numerology: self.scs()?.numerology(),
            dl_grid: ResourceGridDimensions::with_prb(self.cell.nof_antennas_dl, nof_prb),
            ul_grid: ResourceGridDimensions::with_prb(self.cell.nof_antennas_ul, nof_prb),
            nof_dl_rg: self.upper_phy.nof_dl_rg,
            nof_ul_rg: self.upper_phy.nof_ul_rg,
            dl_rg_expire_timeout_slots: self.upper_phy.dl_rg_expire_timeout_slots,
            nof_dl_processors: self.upper_phy.nof_dl_processors,
            nof_prach_buffer: self.upper_phy.nof_prach_buffer,
            prach: PrachBufferDimensions::long(self.cell.nof_antennas_ul),
            rx_softbuffers: (&self.upper_phy.rx_softbuffers).into(),
            tx_buffers: (&self.upper_phy.tx_buffers).into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = AppConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.cell.pci, 1);
        assert_eq!(config.scs().unwrap(), SubcarrierSpacing::Scs30);
        assert_eq!(config.nof_prb().unwrap(), 51);
        assert_eq!(config.upper_phy.dl_rg_expire_timeout_slots, Some(8));

        let phy = config.upper_phy_config().unwrap();
        assert_eq!(phy.numerology, 1);
        assert_eq!(phy.dl_grid.nof_subc, 51 * 12);
        assert_eq!(phy.rx_softbuffers.max_codeblock_size, 25344);
    }

    #[test]
    fn test_parse_sections() {
        let yaml = r#"
cell:
  pci: 500
  channel_bandwidth_MHz: 10
  common_scs: 15
  nof_sectors: 2
upper_phy:
  nof_dl_rg: 8
  dl_rg_expire_timeout_slots: ~
  rx_softbuffers:
    max_softbuffers: 16
executors:
  dl_workers: 4
log:
  phy_level: debug
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cell.pci, 500);
        assert_eq!(config.nof_prb().unwrap(), 52);
        assert_eq!(config.cell.nof_sectors, 2);
        assert_eq!(config.upper_phy.nof_dl_rg, 8);
        assert_eq!(config.upper_phy.dl_rg_expire_timeout_slots, None);
        assert_eq!(config.upper_phy.rx_softbuffers.max_softbuffers, 16);
        assert_eq!(config.upper_phy.rx_softbuffers.max_nof_codeblocks, 512);
        assert_eq!(config.executors.dl_workers, 4);
        assert_eq!(config.log.filter_directives(), "info,layers::phy=debug");
    }

    #[test]
    fn test_sample_file_matches_defaults() {
        let config = AppConfig::from_yaml_str(include_str!("../../gnb_upper_phy.yml")).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(
            serde_yaml::to_string(&config).unwrap(),
            serde_yaml::to_string(&defaults).unwrap()
        );
    }

    #[test]
    fn test_validation_errors() {
        assert!(AppConfig::from_yaml_str("cell: { pci: 1008 }").is_err());
        assert!(AppConfig::from_yaml_str("cell: { channel_bandwidth_MHz: 7 }").is_err());
        // 100 MHz is not defined for 15 kHz.
        assert!(AppConfig::from_yaml_str("cell: { channel_bandwidth_MHz: 100, common_scs: 15 }").is_err());
        assert!(AppConfig::from_yaml_str("upper_phy: { nof_dl_rg: 8, dl_rg_expire_timeout_slots: 8 }").is_err());
        assert!(AppConfig::from_yaml_str("upper_phy: { tx_buffers: { expire_timeout_slots: 0 } }").is_err());
        assert!(AppConfig::from_yaml_str("executors: { prach_queue_size: 0 }").is_err());
        // Pools must keep their cycle across the SFN wrap.
        assert!(AppConfig::from_yaml_str("upper_phy: { nof_dl_rg: 12, dl_rg_expire_timeout_slots: 8 }").is_err());
        assert!(AppConfig::from_yaml_str("upper_phy: { nof_ul_rg: 24 }").is_err());
        assert!(AppConfig::from_yaml_str("upper_phy: { nof_prach_buffer: 3 }").is_err());
        assert!(AppConfig::from_yaml_str("upper_phy: { nof_dl_processors: 6 }").is_err());
        assert!(AppConfig::from_yaml_str("upper_phy: { nof_dl_rg: 20, nof_ul_rg: 40, nof_prach_buffer: 5 }").is_ok());
    }
}
