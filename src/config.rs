//! Acquisition configuration
//!
//! A [`Config`] is built once at startup by layering the built-in defaults,
//! an optional TOML file, `PDD_`-prefixed environment variables (sections
//! separated by `__`, e.g. `PDD_TRIGGER__PD_EVENT_TRIGGER_VOLTAGE=0.3`) and
//! finally explicit command line overrides. [`Config::validate`] finalizes
//! it; after that it is shared read-only as `Arc<Config>`.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AdcPolarity, Error, Result, MAX_CHANNELS, SAMPLE_SIZE, WINDOW_ALIGN};

pub const ENV_PREFIX: &str = "PDD_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub acquisition: AcquisitionConfig,
    pub peak: PeakConfig,
    pub trigger: TriggerConfig,
    pub log: LogConfig,
    pub snapshot: SnapshotConfig,
    pub upload: UploadConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Character device exposing the FPGA registers and capture memory
    pub path: PathBuf,
    /// Use the built-in simulated front end instead of `path`
    pub simulate: bool,
    /// Size of the mmap-able capture region in bytes
    pub region_size: usize,
    /// Bus address of the start of the capture region, as seen by the DMA engine
    pub dma_base_address: u64,
    /// Readiness wait before diagnostics are logged and the wait re-issued
    pub ready_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/pd_fpga0"),
            simulate: false,
            region_size: 0x0200_0000,
            dma_base_address: 0x1000_0000,
            ready_timeout_ms: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Captures are started by the PPS pulse
    Auto,
    /// Captures are started by a software trigger
    Manual,
}

impl CaptureMode {
    pub fn register_value(self) -> u32 {
        match self {
            CaptureMode::Auto => 0,
            CaptureMode::Manual => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// ADC sample rate in Hz
    pub sample_frequency: f64,
    /// Samples per phase per capture
    pub capture_count: usize,
    /// Samples between the trigger and the start of the capture
    pub delay_count: u32,
    pub bank_count: usize,
    pub channel_count: usize,
    pub capture_mode: CaptureMode,
    /// Pause before each software trigger in manual mode
    pub manual_trigger_delay_ms: u64,
    pub adc_polarity: AdcPolarity,
    /// DC compensation programmed into the front end
    pub adc_offset: i32,
    /// Volts per ADC count
    pub voltage_factor: f64,
    /// Per-phase sample index offset applied to peak time offsets
    pub channel_index_offset: [i64; MAX_CHANNELS],
    /// Pre-fill armed banks and check for DMA under/overrun
    pub sentinel_check: bool,
    pub sentinel: u16,
    /// Capture period of the simulated front end
    pub simulated_period_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_frequency: 100e6,
            capture_count: 1_000_000,
            delay_count: 0,
            bank_count: 2,
            channel_count: MAX_CHANNELS,
            capture_mode: CaptureMode::Auto,
            manual_trigger_delay_ms: 50,
            adc_polarity: AdcPolarity::Signed,
            adc_offset: 0,
            voltage_factor: 2.0 / 65536.0,
            channel_index_offset: [0; MAX_CHANNELS],
            sentinel_check: false,
            sentinel: 0xdead,
            simulated_period_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakConfig {
    /// Use the FPGA max/min registers
    pub fpga: bool,
    /// Scan the capture buffer; with `fpga` also set the two are cross-validated
    pub scan: bool,
    /// Log the dominant peak squared
    pub squared: bool,
    pub start_count: usize,
    /// Equal to `start_count` means "to the end of the capture"
    pub stop_count: usize,
    /// Width of the time-frequency window around a peak
    pub fft_size: usize,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            fpga: true,
            scan: false,
            squared: true,
            start_count: 0,
            stop_count: 0,
            fft_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub pd_event_trigger_voltage: f64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            pd_event_trigger_voltage: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/log"),
            prefix: "measurements".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Also save every other phase of a triggering capture for audit
    pub all_phases: bool,
    pub queue_capacity: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("data/samples"),
            all_phases: false,
            queue_capacity: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// External program that receives each payload on stdin; uploads are off without it
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub queue_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Serial device streaming NMEA sentences
    pub gps_device: Option<PathBuf>,
    /// IIO device directory of the environmental sensor
    pub env_device: Option<PathBuf>,
    /// `power_supply` class directory of the battery
    pub power_supply: Option<PathBuf>,
    pub env_interval_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            gps_device: None,
            env_device: None,
            power_supply: None,
            env_interval_ms: 1000,
            join_timeout_ms: 2000,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then the environment
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load the layered configuration. It still has to be [validated](Config::validate).
    pub fn load(path: Option<&Path>) -> Result<Config> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
        }
        Ok(Self::figment(path).extract()?)
    }

    /// Check invariants and normalize derived values. Consumes the draft so the
    /// only way to get a usable config is through here.
    pub fn validate(mut self) -> Result<Config> {
        let acq = &self.acquisition;
        if !(1..=MAX_CHANNELS).contains(&acq.channel_count) {
            return Err(Error::Config(format!(
                "channel_count must be between 1 and {MAX_CHANNELS}, got {}",
                acq.channel_count
            )));
        }
        // DMA must always have a bank other than the one being read
        if acq.bank_count < 2 {
            return Err(Error::Config(format!(
                "bank_count must be at least 2, got {}",
                acq.bank_count
            )));
        }
        if acq.capture_count == 0 {
            return Err(Error::Config("capture_count must be positive".to_owned()));
        }
        if !(acq.sample_frequency.is_finite() && acq.sample_frequency > 0.0) {
            return Err(Error::Config(format!(
                "sample_frequency must be positive, got {}",
                acq.sample_frequency
            )));
        }
        if !acq.voltage_factor.is_finite() {
            return Err(Error::Config("voltage_factor must be finite".to_owned()));
        }
        let required = self.bank_bytes() * acq.bank_count;
        if required > self.device.region_size {
            return Err(Error::RegionTooSmall {
                required,
                available: self.device.region_size,
            });
        }
        if self.device.ready_timeout_ms == 0 {
            return Err(Error::Config("ready_timeout_ms must be positive".to_owned()));
        }

        let capture_count = acq.capture_count;
        let peak = &mut self.peak;
        if !peak.fpga && !peak.scan {
            return Err(Error::Config(
                "at least one of peak.fpga and peak.scan must be enabled".to_owned(),
            ));
        }
        if peak.fft_size == 0 {
            return Err(Error::Config("fft_size must be positive".to_owned()));
        }
        if peak.fft_size > capture_count {
            info!(
                fft_size = peak.fft_size,
                capture_count, "Lowering fft_size to the capture length"
            );
            peak.fft_size = capture_count;
        }
        peak.start_count = align_down(peak.start_count);
        // Past the end is fine, the scan and the FPGA stop at the slice end
        peak.stop_count = align_down(peak.stop_count);
        if peak.start_count >= capture_count {
            return Err(Error::Config(format!(
                "peak window start {} is past the end of the capture ({capture_count})",
                peak.start_count
            )));
        }
        if peak.stop_count != peak.start_count && peak.stop_count < peak.start_count {
            return Err(Error::Config(format!(
                "peak window stop {} is before start {}",
                peak.stop_count, peak.start_count
            )));
        }

        if !self.trigger.pd_event_trigger_voltage.is_finite() {
            return Err(Error::Config(
                "pd_event_trigger_voltage must be finite".to_owned(),
            ));
        }
        if self.upload.queue_capacity == 0 || self.snapshot.queue_capacity == 0 {
            return Err(Error::Config("queue capacities must be positive".to_owned()));
        }
        if self.log.prefix.is_empty() {
            return Err(Error::Config("log prefix must not be empty".to_owned()));
        }
        Ok(self)
    }

    pub fn sample_offset(&self) -> i32 {
        self.acquisition.adc_polarity.sample_offset()
    }

    /// Bytes taken by one bank (all phases)
    pub fn bank_bytes(&self) -> usize {
        self.acquisition.channel_count * self.acquisition.capture_count * SAMPLE_SIZE
    }

    /// Aligned `[start, stop)` peak window; `stop == start` means to the end
    pub fn peak_window(&self) -> (usize, usize) {
        (self.peak.start_count, self.peak.stop_count)
    }

    /// Bit mask of the captured phases as understood by the FPGA
    pub fn phase_mode(&self) -> u32 {
        (1u32 << self.acquisition.channel_count) - 1
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.device.ready_timeout_ms)
    }

    pub fn manual_trigger_delay(&self) -> Duration {
        Duration::from_millis(self.acquisition.manual_trigger_delay_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry.join_timeout_ms)
    }

    pub fn upload_enabled(&self) -> bool {
        self.upload.program.is_some()
    }
}

fn align_down(count: usize) -> usize {
    count - count % WINDOW_ALIGN
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(s: &str) -> Result<Config> {
        let cfg: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(s))
            .extract()?;
        cfg.validate()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default().validate().unwrap();
        assert_eq!(cfg.acquisition.bank_count, 2);
        assert_eq!(cfg.phase_mode(), 0b111);
        assert_eq!(cfg.sample_offset(), 0);
    }

    #[test]
    fn file_overrides_defaults() {
        let cfg = from_toml(
            r#"
[acquisition]
capture_count = 4096
adc_polarity = "unsigned"
capture_mode = "manual"

[trigger]
pd_event_trigger_voltage = 0.25
"#,
        )
        .unwrap();
        assert_eq!(cfg.acquisition.capture_count, 4096);
        assert_eq!(cfg.acquisition.capture_mode, CaptureMode::Manual);
        assert_eq!(cfg.sample_offset(), 32768);
        assert_eq!(cfg.trigger.pd_event_trigger_voltage, 0.25);
        // untouched sections keep their defaults
        assert_eq!(cfg.peak.fft_size, 1024);
        assert_eq!(cfg.log.prefix, "measurements");
    }

    #[test]
    fn fft_size_is_lowered_to_capture_count() {
        let cfg = from_toml("[acquisition]\ncapture_count = 256\n").unwrap();
        assert_eq!(cfg.peak.fft_size, 256);
    }

    #[test]
    fn peak_window_is_rounded_to_alignment() {
        let cfg = from_toml(
            "[acquisition]\ncapture_count = 100\n[peak]\nstart_count = 13\nstop_count = 95\nfft_size = 16\n",
        )
        .unwrap();
        assert_eq!(cfg.peak_window(), (8, 88));
    }

    #[test]
    fn peak_window_past_the_end_keeps_the_tail() {
        let cfg = from_toml(
            "[acquisition]\ncapture_count = 100\n[peak]\nstart_count = 8\nstop_count = 203\nfft_size = 16\n",
        )
        .unwrap();
        assert_eq!(cfg.peak_window(), (8, 200));
    }

    #[test]
    fn single_bank_is_rejected() {
        for banks in [0, 1] {
            let err = from_toml(&format!("[acquisition]\nbank_count = {banks}\n")).unwrap_err();
            assert!(matches!(err, Error::Config(ref msg) if msg.contains("bank_count")), "{err}");
        }
        assert!(from_toml("[acquisition]\nbank_count = 2\n").is_ok());
    }

    #[test]
    fn region_too_small_is_rejected() {
        let err = from_toml("[device]\nregion_size = 1024\n").unwrap_err();
        assert!(matches!(err, Error::RegionTooSmall { available: 1024, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn needs_a_peak_strategy() {
        let err = from_toml("[peak]\nfpga = false\nscan = false\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/pdd.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
