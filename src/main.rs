use anyhow::Context;
use clap::Parser;
use pd_detector::{
    device::{CaptureDevice, FpgaDevice},
    exfil::{run_uploader, upload_channel, CommandTransport},
    monitoring::Counters,
    pipeline::Pipeline,
    shutdown::{Shutdown, ShutdownToken},
    sim::{SimulatedDevice, Synthetic},
    telemetry::{self, join_bounded, TelemetryReaders},
    trigger::{run_snapshot_saver, snapshot_channel},
    Config,
};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{error, info};

mod args;

fn open_device(config: &Config) -> anyhow::Result<Box<dyn CaptureDevice>> {
    if config.device.simulate {
        info!("Using the simulated front end");
        let seed = chrono::Utc::now().timestamp_micros() as u64;
        Ok(Box::new(SimulatedDevice::synthetic(
            Duration::from_millis(config.acquisition.simulated_period_ms),
            Synthetic::default(),
            seed,
        )))
    } else {
        let device = FpgaDevice::open(&config.device.path)
            .with_context(|| format!("opening {}", config.device.path.display()))?;
        Ok(Box::new(device))
    }
}

/// Build the pipeline on top of the already running helper threads and run
/// it until shutdown
fn acquire(
    config: &Arc<Config>,
    helpers: &mut Helpers,
    telemetry: TelemetryReaders,
    shutdown: &ShutdownToken,
    slot: &mut Option<Pipeline<Box<dyn CaptureDevice>>>,
) -> anyhow::Result<()> {
    let upload = if let Some(mut transport) = CommandTransport::from_config(config) {
        let (queue, receiver) =
            upload_channel(config.upload.queue_capacity, helpers.counters.clone());
        let token = shutdown.clone();
        let counters = helpers.counters.clone();
        helpers.uploader = Some(
            thread::Builder::new()
                .name("uploader".into())
                .spawn(move || run_uploader(receiver, &mut transport, &token, &counters))?,
        );
        Some(queue)
    } else {
        None
    };

    let snapshots = if config.snapshot.enabled {
        let (queue, consumer) = snapshot_channel(
            config.snapshot.queue_capacity,
            config.snapshot.all_phases,
            helpers.counters.clone(),
        );
        let dir = config.snapshot.dir.clone();
        let token = shutdown.clone();
        let counters = helpers.counters.clone();
        helpers.saver = Some(
            thread::Builder::new()
                .name("snapshots".into())
                .spawn(move || run_snapshot_saver(consumer, &dir, &token, &counters))?,
        );
        Some(queue)
    } else {
        None
    };

    let device = open_device(config)?;
    let pipeline = slot.insert(
        Pipeline::new(
            config.clone(),
            device,
            upload,
            snapshots,
            telemetry,
            helpers.counters.clone(),
        )
        .context("setting up acquisition")?,
    );
    pipeline.start().context("arming the first capture")?;
    pipeline.run(shutdown).context("acquisition failed")
}

struct Helpers {
    counters: Arc<Counters>,
    telemetry: Vec<JoinHandle<()>>,
    uploader: Option<JoinHandle<()>>,
    saver: Option<JoinHandle<()>>,
}

impl Helpers {
    /// Telemetry pollers may sit in a blocking read, so they only get a
    /// bounded wait. The uploader and saver always finish once signalled.
    fn teardown(self, join_timeout: Duration) {
        for handle in self.telemetry {
            join_bounded(handle, join_timeout);
        }
        if let Some(handle) = self.uploader {
            if handle.join().is_err() {
                error!("Upload consumer panicked");
            }
        }
        if let Some(handle) = self.saver {
            if handle.join().is_err() {
                error!("Snapshot saver panicked");
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = args::Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(args.verbose.log_level_filter()))
        .init();

    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    let config = Arc::new(config.validate().context("invalid configuration")?);

    let shutdown = Shutdown::new();
    let handler = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Stopping on signal");
        handler.trigger();
    })?;

    let token = shutdown.token();
    let (readers, telemetry) =
        telemetry::spawn(&config, &token).context("starting telemetry pollers")?;
    let mut helpers = Helpers {
        counters: Arc::new(Counters::default()),
        telemetry,
        uploader: None,
        saver: None,
    };

    let counters = helpers.counters.clone();
    let mut pipeline = None;
    let result = acquire(&config, &mut helpers, readers, &token, &mut pipeline);
    if let Err(e) = &result {
        error!("{e:#}");
    }

    shutdown.trigger();
    helpers.teardown(config.join_timeout());
    // The mapping goes last, after every reader of it has stopped
    if let Some(mut pipeline) = pipeline {
        if let Err(e) = pipeline.stop() {
            error!(%e, "Failed to stop the capture");
        }
    }
    counters.report();
    if result.is_err() {
        std::process::exit(1);
    }
    info!("Shut down cleanly");
    Ok(())
}
