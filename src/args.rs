//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;
use pd_detector::{config::CaptureMode, Config};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file, layered over the built-in defaults
    #[clap(short, long)]
    pub config: Option<PathBuf>,
    /// Character device of the capture FPGA
    #[clap(short, long)]
    pub device: Option<PathBuf>,
    /// Run against the simulated front end instead of the FPGA
    #[clap(short, long)]
    pub simulate: bool,
    /// Trigger captures in software instead of on the PPS pulse
    #[clap(short, long)]
    pub manual: bool,
    /// Directory for the daily measurement logs
    #[clap(long)]
    pub log_dir: Option<PathBuf>,
    /// Directory for PD event snapshots
    #[clap(long)]
    pub sample_dir: Option<PathBuf>,
    /// PD event trigger threshold in volts
    #[clap(short, long)]
    pub trigger_voltage: Option<f64>,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    /// Command line flags win over every other config layer
    pub fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.device.path = device.clone();
        }
        if self.simulate {
            config.device.simulate = true;
        }
        if self.manual {
            config.acquisition.capture_mode = CaptureMode::Manual;
        }
        if let Some(dir) = &self.log_dir {
            config.log.dir = dir.clone();
        }
        if let Some(dir) = &self.sample_dir {
            config.snapshot.dir = dir.clone();
        }
        if let Some(volts) = self.trigger_voltage {
            config.trigger.pd_event_trigger_voltage = volts;
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}
