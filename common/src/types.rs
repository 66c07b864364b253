//! Common Types for the 5G Upper PHY
//!
//! Defines fundamental types shared by the slot processing core

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Physical Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pci(pub u16);

impl Pci {
    /// Maximum valid PCI value (0-1007)
    pub const MAX: u16 = 1007;

    /// Create a new PCI with validation
    pub fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Numerology index (mu) as defined in TS 38.211 Table 4.2-1
    pub fn numerology(&self) -> u8 {
        match self {
            SubcarrierSpacing::Scs15 => 0,
            SubcarrierSpacing::Scs30 => 1,
            SubcarrierSpacing::Scs60 => 2,
            SubcarrierSpacing::Scs120 => 3,
            SubcarrierSpacing::Scs240 => 4,
        }
    }

    /// Subcarrier spacing for a numerology index
    pub fn from_numerology(numerology: u8) -> Option<Self> {
        match numerology {
            0 => Some(SubcarrierSpacing::Scs15),
            1 => Some(SubcarrierSpacing::Scs30),
            2 => Some(SubcarrierSpacing::Scs60),
            3 => Some(SubcarrierSpacing::Scs120),
            4 => Some(SubcarrierSpacing::Scs240),
            _ => None,
        }
    }

    /// Value in kHz
    pub fn khz(&self) -> u32 {
        *self as u32
    }
}

/// Bandwidth values in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    /// 5 MHz
    Bw5,
    /// 10 MHz
    Bw10,
    /// 15 MHz
    Bw15,
    /// 20 MHz
    Bw20,
    /// 25 MHz
    Bw25,
    /// 30 MHz
    Bw30,
    /// 40 MHz
    Bw40,
    /// 50 MHz
    Bw50,
    /// 60 MHz
    Bw60,
    /// 80 MHz
    Bw80,
    /// 100 MHz
    Bw100,
}

impl Bandwidth {
    /// Parse a channel bandwidth given in MHz
    pub fn from_mhz(mhz: u32) -> Option<Self> {
        match mhz {
            5 => Some(Bandwidth::Bw5),
            10 => Some(Bandwidth::Bw10),
            15 => Some(Bandwidth::Bw15),
            20 => Some(Bandwidth::Bw20),
            25 => Some(Bandwidth::Bw25),
            30 => Some(Bandwidth::Bw30),
            40 => Some(Bandwidth::Bw40),
            50 => Some(Bandwidth::Bw50),
            60 => Some(Bandwidth::Bw60),
            80 => Some(Bandwidth::Bw80),
            100 => Some(Bandwidth::Bw100),
            _ => None,
        }
    }

    /// Get bandwidth in Hz
    pub fn as_hz(&self) -> u32 {
        match self {
            Bandwidth::Bw5 => 5_000_000,
            Bandwidth::Bw10 => 10_000_000,
            Bandwidth::Bw15 => 15_000_000,
            Bandwidth::Bw20 => 20_000_000,
            Bandwidth::Bw25 => 25_000_000,
            Bandwidth::Bw30 => 30_000_000,
            Bandwidth::Bw40 => 40_000_000,
            Bandwidth::Bw50 => 50_000_000,
            Bandwidth::Bw60 => 60_000_000,
            Bandwidth::Bw80 => 80_000_000,
            Bandwidth::Bw100 => 100_000_000,
        }
    }

    /// Maximum transmission bandwidth in resource blocks.
    ///
    /// Based on 3GPP TS 38.104 Table 5.3.2-1. Returns `None` for
    /// combinations the table does not define.
    pub fn nof_prb(&self, scs: SubcarrierSpacing) -> Option<u16> {
        let nof_prb = match (self, scs) {
            (Bandwidth::Bw5, SubcarrierSpacing::Scs15) => 25,
            (Bandwidth::Bw5, SubcarrierSpacing::Scs30) => 11,
            (Bandwidth::Bw10, SubcarrierSpacing::Scs15) => 52,
            (Bandwidth::Bw10, SubcarrierSpacing::Scs30) => 24,
            (Bandwidth::Bw10, SubcarrierSpacing::Scs60) => 11,
            (Bandwidth::Bw15, SubcarrierSpacing::Scs15) => 79,
            (Bandwidth::Bw15, SubcarrierSpacing::Scs30) => 38,
            (Bandwidth::Bw15, SubcarrierSpacing::Scs60) => 18,
            (Bandwidth::Bw20, SubcarrierSpacing::Scs15) => 106,
            (Bandwidth::Bw20, SubcarrierSpacing::Scs30) => 51,
            (Bandwidth::Bw20, SubcarrierSpacing::Scs60) => 24,
            (Bandwidth::Bw25, SubcarrierSpacing::Scs15) => 133,
            (Bandwidth::Bw25, SubcarrierSpacing::Scs30) => 65,
            (Bandwidth::Bw25, SubcarrierSpacing::Scs60) => 31,
            (Bandwidth::Bw30, SubcarrierSpacing::Scs15) => 160,
            (Bandwidth::Bw30, SubcarrierSpacing::Scs30) => 78,
            (Bandwidth::Bw30, SubcarrierSpacing::Scs60) => 38,
            (Bandwidth::Bw40, SubcarrierSpacing::Scs15) => 216,
            (Bandwidth::Bw40, SubcarrierSpacing::Scs30) => 106,
            (Bandwidth::Bw40, SubcarrierSpacing::Scs60) => 51,
            (Bandwidth::Bw50, SubcarrierSpacing::Scs15) => 270,
            (Bandwidth::Bw50, SubcarrierSpacing::Scs30) => 133,
            (Bandwidth::Bw50, SubcarrierSpacing::Scs60) => 65,
            (Bandwidth::Bw50, SubcarrierSpacing::Scs120) => 31,
            (Bandwidth::Bw60, SubcarrierSpacing::Scs30) => 162,
            (Bandwidth::Bw60, SubcarrierSpacing::Scs60) => 79,
            (Bandwidth::Bw60, SubcarrierSpacing::Scs120) => 38,
            (Bandwidth::Bw80, SubcarrierSpacing::Scs30) => 217,
            (Bandwidth::Bw80, SubcarrierSpacing::Scs60) => 107,
            (Bandwidth::Bw80, SubcarrierSpacing::Scs120) => 51,
            (Bandwidth::Bw100, SubcarrierSpacing::Scs30) => 273,
            (Bandwidth::Bw100, SubcarrierSpacing::Scs60) => 135,
            (Bandwidth::Bw100, SubcarrierSpacing::Scs120) => 65,
            _ => return None,
        };

        Some(nof_prb)
    }
}

/// Modulation schemes of the shared channels (3GPP TS 38.211 Section 5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum ModulationScheme {
    Qpsk = 2,
    Qam16 = 4,
    Qam64 = 6,
    Qam256 = 8,
}

impl ModulationScheme {
    /// Number of bits carried by one modulation symbol
    pub fn bits_per_symbol(&self) -> usize {
        *self as usize
    }
}

/// Number of system frames before the SFN wraps around
pub const NOF_SFNS: u32 = 1024;

/// Number of slots in a 1 ms subframe for numerology 0
const NOF_SUBFRAMES_PER_FRAME: u32 = 10;

/// Slot point: a numerology-aware slot counter over the SFN period.
///
/// The counter wraps after [`NOF_SFNS`] frames. Ordering and subtraction
/// take the wrap-around into account, so any two slot points less than
/// half the period apart compare as expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotPoint {
    numerology: u8,
    count: u32,
}

impl SlotPoint {
    /// Create a slot point from a system frame number and a slot index within the frame
    pub fn new(numerology: u8, sfn: u32, slot: u32) -> Self {
        let slots_per_frame = Self::slots_per_frame_for(numerology);
        assert!(sfn < NOF_SFNS, "invalid SFN {}", sfn);
        assert!(
            slot < slots_per_frame,
            "invalid slot index {} for numerology {}",
            slot,
            numerology
        );

        Self {
            numerology,
            count: sfn * slots_per_frame + slot,
        }
    }

    /// Create a slot point from a system slot count; values beyond the period wrap
    pub fn from_system_slot(numerology: u8, system_slot: u32) -> Self {
        Self {
            numerology,
            count: system_slot % Self::system_frame_period(numerology),
        }
    }

    /// Number of slots in a full SFN period for `numerology`
    pub fn system_frame_period(numerology: u8) -> u32 {
        Self::slots_per_frame_for(numerology) * NOF_SFNS
    }

    /// Whether a cyclic pool of `size` entries keeps its period across the SFN wrap
    pub fn is_valid_cycle(numerology: u8, size: usize) -> bool {
        size != 0 && Self::system_frame_period(numerology) as usize % size == 0
    }

    fn slots_per_frame_for(numerology: u8) -> u32 {
        assert!(numerology <= 4, "invalid numerology {}", numerology);
        NOF_SUBFRAMES_PER_FRAME << numerology
    }

    /// Numerology index (mu)
    pub fn numerology(&self) -> u8 {
        self.numerology
    }

    /// Subcarrier spacing of this slot point
    pub fn scs(&self) -> SubcarrierSpacing {
        // Numerology is validated at construction.
        SubcarrierSpacing::from_numerology(self.numerology).unwrap_or(SubcarrierSpacing::Scs15)
    }

    /// Number of slots in a 10 ms frame
    pub fn nof_slots_per_frame(&self) -> u32 {
        Self::slots_per_frame_for(self.numerology)
    }

    /// Number of slots in a full SFN period
    pub fn nof_slots_per_system_frame(&self) -> u32 {
        Self::system_frame_period(self.numerology)
    }

    /// System frame number
    pub fn sfn(&self) -> u32 {
        self.count / self.nof_slots_per_frame()
    }

    /// Slot index within the frame
    pub fn slot_index(&self) -> u32 {
        self.count % self.nof_slots_per_frame()
    }

    /// Slot count since SFN 0, slot 0
    pub fn system_slot(&self) -> u32 {
        self.count
    }

    /// Entry of a cyclic pool of `size` entries serving this slot.
    ///
    /// `size` must divide the SFN period, otherwise the slot following the
    /// wrap would not select the entry following the one of the last slot.
    pub fn cycle_index(&self, size: usize) -> usize {
        assert!(
            Self::is_valid_cycle(self.numerology, size),
            "cyclic pool of {} entries does not divide the SFN period of {} slots",
            size,
            self.nof_slots_per_system_frame()
        );
        self.count as usize % size
    }
}

impl Add<u32> for SlotPoint {
    type Output = SlotPoint;

    fn add(self, slots: u32) -> SlotPoint {
        let period = self.nof_slots_per_system_frame();
        SlotPoint {
            numerology: self.numerology,
            count: (self.count + slots % period) % period,
        }
    }
}

impl Sub for SlotPoint {
    type Output = i32;

    /// Shortest signed distance in slots from `other` to `self`
    fn sub(self, other: SlotPoint) -> i32 {
        assert_eq!(
            self.numerology, other.numerology,
            "cannot compare slot points of different numerologies"
        );
        let period = self.nof_slots_per_system_frame() as i64;
        let mut diff = (self.count as i64 - other.count as i64).rem_euclid(period);
        if diff >= period / 2 {
            diff -= period;
        }
        diff as i32
    }
}

impl PartialOrd for SlotPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.numerology != other.numerology {
            return None;
        }
        Some((*self - *other).cmp(&0))
    }
}

impl fmt::Display for SlotPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sfn(), self.slot_index())
    }
}
