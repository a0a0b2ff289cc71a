pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod exfil;
pub mod monitoring;
pub mod peak;
pub mod pipeline;
pub mod record;
pub mod region;
pub mod shutdown;
pub mod sim;
pub mod telemetry;
pub mod tfmap;
pub mod trigger;

pub use config::Config;
pub use error::{Error, Result};

/// Bytes per ADC sample in the capture region
pub const SAMPLE_SIZE: usize = 2;
/// Number of phase channels the front end can capture
pub const MAX_CHANNELS: usize = 3;
/// Hardware peak window bounds are aligned to this many samples
pub const WINDOW_ALIGN: usize = 8;

/// One of the monitored conductors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Red,
    White,
    Blue,
}

impl Phase {
    /// Evaluation order, which is also the channel order in a bank
    pub const ALL: [Phase; MAX_CHANNELS] = [Phase::Red, Phase::White, Phase::Blue];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<Phase> {
        Self::ALL.get(idx).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Red => "red",
            Phase::White => "white",
            Phase::Blue => "blue",
        }
    }

    /// The first `channel_count` phases
    pub fn active(channel_count: usize) -> &'static [Phase] {
        &Self::ALL[..channel_count.min(MAX_CHANNELS)]
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How raw 16-bit samples are interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdcPolarity {
    Signed,
    Unsigned,
}

impl AdcPolarity {
    /// Raw value corresponding to 0 V
    pub fn sample_offset(self) -> i32 {
        match self {
            AdcPolarity::Signed => 0,
            AdcPolarity::Unsigned => 1 << 15,
        }
    }

    /// Interpret the low 16 bits of a register or sample word
    pub fn decode(self, word: u32) -> i32 {
        match self {
            AdcPolarity::Signed => word as u16 as i16 as i32,
            AdcPolarity::Unsigned => word as u16 as i32,
        }
    }
}
