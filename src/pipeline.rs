//! The acquisition loop
//!
//! One cycle per completed capture, in an order the hardware dictates: the
//! max/min registers and status are read first because the next capture
//! overwrites them, then the bank is flipped and the device re-armed, and
//! only then is the completed bank processed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    capture::{CaptureBuffer, SentinelReport, Synchronizer},
    device::{format_version, CaptureDevice, CaptureParams},
    exfil::{LogWriter, UploadQueue},
    monitoring::{bump, Counters},
    peak::{PeakDetector, PeakSet},
    record::{assemble, CycleFeatures, PhaseFeatures, Schema},
    shutdown::ShutdownToken,
    telemetry::TelemetryReaders,
    tfmap::TfMapper,
    trigger::{evaluate, SnapshotQueue},
    AdcPolarity, Config, Phase, Result,
};

/// What happened in one cycle, mostly for tests and debugging
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub bank: usize,
    pub timestamp: DateTime<Utc>,
    pub peaks: PeakSet,
    pub features: CycleFeatures,
    pub trigger: Option<Phase>,
    pub sentinel: SentinelReport,
}

/// Capture start arguments for `config`, targeting `address`
pub fn capture_params(config: &Config, address: u64) -> CaptureParams {
    let acq = &config.acquisition;
    let (start, stop) = config.peak_window();
    CaptureParams {
        address,
        capture_count: acq.capture_count as u32,
        delay_count: acq.delay_count,
        mode: acq.capture_mode.register_value(),
        signed: u32::from(acq.adc_polarity == AdcPolarity::Signed),
        peak_window_start: start as u32,
        peak_window_stop: u32::try_from(stop).unwrap_or(u32::MAX),
        adc_offset: acq.adc_offset,
        phase_mode: config.phase_mode(),
    }
}

pub struct Pipeline<D: CaptureDevice> {
    config: Arc<Config>,
    device: D,
    buffer: CaptureBuffer,
    sync: Synchronizer,
    detector: PeakDetector,
    mapper: TfMapper,
    schema: Schema,
    log: LogWriter,
    snapshots: Option<SnapshotQueue>,
    telemetry: TelemetryReaders,
    counters: Arc<Counters>,
}

impl<D: CaptureDevice> Pipeline<D> {
    /// Map the capture region and set up every per-cycle stage. Fails on
    /// anything that makes acquisition impossible.
    pub fn new(
        config: Arc<Config>,
        mut device: D,
        upload: Option<UploadQueue>,
        snapshots: Option<SnapshotQueue>,
        telemetry: TelemetryReaders,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let region = device.map_region(config.device.region_size, config.device.dma_base_address)?;
        let buffer = CaptureBuffer::new(region, &config)?;
        let schema = Schema::from_config(&config)?;
        let log = LogWriter::from_config(&config, &schema, upload, counters.clone())?;
        Ok(Self {
            sync: Synchronizer::from_config(&config, counters.clone()),
            detector: PeakDetector::from_config(&config, counters.clone()),
            mapper: TfMapper::new(),
            config,
            device,
            buffer,
            schema,
            log,
            snapshots,
            telemetry,
            counters,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Arm the first capture
    pub fn start(&mut self) -> Result<()> {
        let version = self.device.fpga_version_get()?;
        let params = capture_params(&self.config, 0);
        info!(
            version = %format_version(version),
            capture_count = params.capture_count,
            banks = self.buffer.layout().bank_count,
            mode = ?self.config.acquisition.capture_mode,
            "Starting acquisition"
        );
        self.buffer.arm(&mut self.device, params)
    }

    /// Process the capture that just became ready
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        let timestamp = Utc::now();
        // Not double buffered, must happen before the re-arm. The bank flips
        // whether or not these reads succeed.
        let registers = self.device.maxmin_get();
        let status = self.device.status_get();
        let (bank, _) = self.buffer.advance(&mut self.device)?;
        self.device.semaphore_set(0)?;

        let registers = registers.map_err(|e| {
            bump(&self.counters.register_read_errors);
            e
        })?;
        let adc_clock_count_per_pps = match status {
            Ok(status) => Some(status.adc_clock_count_per_pps),
            Err(e) => {
                let errors = bump(&self.counters.register_read_errors);
                warn!(%e, errors, "Could not read device status");
                None
            }
        };

        let sentinel = self.buffer.check_sentinels(bank)?;
        if !sentinel.is_clean() {
            let errors = bump(&self.counters.sentinel_errors);
            error!(
                bank,
                underruns = ?sentinel.underruns,
                overrun = sentinel.overrun,
                errors,
                "DMA sentinel violation"
            );
        }

        let peaks = self.detector.detect(&self.buffer, bank, &registers)?;
        let mut features = CycleFeatures {
            adc_clock_count_per_pps,
            ..Default::default()
        };
        for &phase in Phase::active(self.buffer.layout().channel_count) {
            let Some(phase_peaks) = peaks[phase.index()] else {
                continue;
            };
            let slice = self.buffer.phase_slice(bank, phase)?;
            let tf = self.mapper.map_peak(
                phase,
                &slice,
                phase_peaks.dominant().index,
                self.config.peak.fft_size,
                self.detector.scaling(),
            )?;
            features.phases[phase.index()] = Some(PhaseFeatures {
                peaks: phase_peaks,
                tf,
            });
        }

        let record = assemble(&self.schema, &features, &self.telemetry.snapshot(), timestamp);
        self.log.write(&record)?;

        let trigger = evaluate(&peaks, self.config.trigger.pd_event_trigger_voltage);
        if let Some(phase) = trigger {
            let events = bump(&self.counters.events_triggered);
            let voltage = peaks[phase.index()].map(|p| p.max.voltage);
            info!(%phase, ?voltage, events, "PD event");
            if let Some(queue) = self.snapshots.as_mut() {
                queue.request(&self.buffer, bank, phase, timestamp)?;
            }
        }

        let cycle = bump(&self.counters.cycles);
        debug!(cycle, bank, "cycle done");
        Ok(CycleReport {
            bank,
            timestamp,
            peaks,
            features,
            trigger,
            sentinel,
        })
    }

    /// Run cycles until shutdown. Only errors that make further acquisition
    /// pointless are returned; everything else is logged and the loop goes on.
    pub fn run(&mut self, shutdown: &ShutdownToken) -> Result<()> {
        while self.sync.wait_until_ready(&mut self.device, shutdown)? {
            if let Err(e) = self.run_cycle() {
                if e.is_fatal() {
                    return Err(e);
                }
                error!(%e, "Cycle failed");
            }
        }
        info!("Acquisition loop stopped");
        Ok(())
    }

    /// Stop the device. The capture region is released when the pipeline is dropped.
    pub fn stop(&mut self) -> Result<()> {
        self.device.capture_stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceStatus, MaxMinRegister},
        exfil::upload_channel,
        region::CaptureRegion,
        record::{Field, MeasurementRecord, Value},
        shutdown::Shutdown,
        sim::SimulatedDevice,
        trigger::snapshot_channel,
        MAX_CHANNELS,
    };
    use std::{
        fs,
        path::Path,
        thread,
        time::{Duration, Instant},
    };

    /// Simulated front end whose register reads can be made to fail
    struct FlakyRegisters {
        inner: SimulatedDevice,
        fail_maxmin: bool,
        fail_status: bool,
    }

    fn glitch(op: &'static str) -> crate::Error {
        crate::Error::Device {
            op,
            source: std::io::Error::new(std::io::ErrorKind::Other, "glitch"),
        }
    }

    impl CaptureDevice for FlakyRegisters {
        fn capture_start(&mut self, params: &CaptureParams) -> Result<()> {
            self.inner.capture_start(params)
        }

        fn capture_stop(&mut self) -> Result<()> {
            self.inner.capture_stop()
        }

        fn capture_set_address(&mut self, address: u64) -> Result<()> {
            self.inner.capture_set_address(address)
        }

        fn semaphore_get(&self) -> Result<u32> {
            self.inner.semaphore_get()
        }

        fn semaphore_set(&mut self, value: u32) -> Result<()> {
            self.inner.semaphore_set(value)
        }

        fn maxmin_get(&self) -> Result<[MaxMinRegister; MAX_CHANNELS]> {
            if self.fail_maxmin {
                return Err(glitch("maxmin_get"));
            }
            self.inner.maxmin_get()
        }

        fn trigger(&mut self) -> Result<()> {
            self.inner.trigger()
        }

        fn status_get(&self) -> Result<DeviceStatus> {
            if self.fail_status {
                return Err(glitch("status_get"));
            }
            self.inner.status_get()
        }

        fn fpga_version_get(&self) -> Result<u32> {
            self.inner.fpga_version_get()
        }

        fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
            self.inner.wait_ready(timeout)
        }

        fn map_region(&mut self, len: usize, phys_base: u64) -> Result<CaptureRegion> {
            self.inner.map_region(len, phys_base)
        }
    }

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.device.region_size = 4096;
        config.device.dma_base_address = 0x1000_0000;
        config.device.ready_timeout_ms = 20;
        config.acquisition.capture_count = 8;
        config.acquisition.channel_count = 2;
        config.acquisition.voltage_factor = 0.1;
        config.acquisition.sentinel_check = true;
        config.peak.scan = true;
        config.trigger.pd_event_trigger_voltage = 0.5;
        config.log.dir = dir.join("log");
        config.snapshot.dir = dir.join("samples");
        config.validate().unwrap()
    }

    #[test]
    fn capture_params_follow_config() {
        let mut config = Config::default();
        config.acquisition.adc_polarity = AdcPolarity::Unsigned;
        config.acquisition.channel_count = 2;
        config.peak.start_count = 16;
        config.peak.stop_count = 64;
        let config = config.validate().unwrap();
        let params = capture_params(&config, 0x42);
        assert_eq!(params.address, 0x42);
        assert_eq!(params.signed, 0);
        assert_eq!(params.phase_mode, 0b11);
        assert_eq!((params.peak_window_start, params.peak_window_stop), (16, 64));
    }

    #[test]
    fn end_to_end_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config(dir.path()));
        let counters = Arc::new(Counters::default());
        let (upload, upload_rx) = upload_channel(4, counters.clone());
        let (snapshots, mut snapshot_rx) = snapshot_channel(2, false, counters.clone());
        let mut pipeline = Pipeline::new(
            config.clone(),
            SimulatedDevice::new(Duration::ZERO),
            Some(upload),
            Some(snapshots),
            TelemetryReaders::default(),
            counters.clone(),
        )
        .unwrap();
        pipeline.start().unwrap();
        assert_eq!(pipeline.device().armed_address(), Some(0x1000_0000));

        pipeline
            .device_mut()
            .push_frame(vec![vec![0, 1, 2, 9, 2, 1, 0, -5], vec![0; 8]]);
        let shutdown = Shutdown::new();
        let sync = Synchronizer::from_config(&config, counters.clone());
        assert!(sync
            .wait_until_ready(pipeline.device_mut(), &shutdown.token())
            .unwrap());
        let report = pipeline.run_cycle().unwrap();

        assert_eq!(report.bank, 0);
        assert_eq!(pipeline.device().armed_address(), Some(0x1000_0000 + 32));
        assert_eq!(pipeline.device().semaphore_get().unwrap(), 0);
        assert!(report.sentinel.is_clean(), "{:?}", report.sentinel);

        let red = report.peaks[0].unwrap();
        assert_eq!((red.max.index, red.max.raw_value), (3, 9));
        assert_eq!((red.min.index, red.min.raw_value), (7, -5));
        let white = report.peaks[1].unwrap();
        assert_eq!((white.max.index, white.min.index), (0, 0));
        assert!(report.peaks[2].is_none());
        assert!(report.features.phases[1].unwrap().tf.is_null());
        assert!(report.features.phases[0].unwrap().tf.t2 > 0.0);
        assert_eq!(counters.snapshot().peak_value_mismatches, 0);
        assert_eq!(counters.snapshot().peak_index_mismatches, 0);

        // 9 * 0.1 V is above the 0.5 V threshold
        assert_eq!(report.trigger, Some(Phase::Red));
        let request = snapshot_rx.pop().unwrap();
        assert_eq!(request.samples.len(), 16);
        assert_eq!(request.timestamp, report.timestamp);

        let item = upload_rx.try_recv().unwrap();
        let text = String::from_utf8(item.payload.clone()).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("timestamp,unix_time,adc_clock_count_per_pps,red_max_volt"));
        let row = lines.next().unwrap();
        let parsed =
            MeasurementRecord::parse_row(pipeline.schema(), format!("{row}\n").as_bytes()).unwrap();
        assert_eq!(
            parsed.get(pipeline.schema(), Field::MaxVolt(Phase::Red)),
            Some(&Value::Float(9.0 * 0.1))
        );
        assert_eq!(
            parsed.get(pipeline.schema(), Field::AdcClockCountPerPps),
            Some(&Value::Int(100_000_000))
        );
        let logged = fs::read_dir(&config.log.dir).unwrap().count();
        assert_eq!(logged, 1);
        assert_eq!(counters.snapshot().cycles, 1);
    }

    #[test]
    fn register_read_failure_still_flips_the_bank() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config(dir.path()));
        let counters = Arc::new(Counters::default());
        let device = FlakyRegisters {
            inner: SimulatedDevice::new(Duration::ZERO),
            fail_maxmin: true,
            fail_status: false,
        };
        let mut pipeline = Pipeline::new(
            config.clone(),
            device,
            None,
            None,
            TelemetryReaders::default(),
            counters.clone(),
        )
        .unwrap();
        pipeline.start().unwrap();
        let shutdown = Shutdown::new();
        let sync = Synchronizer::from_config(&config, counters.clone());
        let frame = || vec![vec![0, 1, 2, 9, 2, 1, 0, -5], vec![0; 8]];

        // The cycle fails, but DMA has already moved on to the other bank
        pipeline.device_mut().inner.push_frame(frame());
        assert!(sync.wait_until_ready(pipeline.device_mut(), &shutdown.token()).unwrap());
        let err = pipeline.run_cycle().unwrap_err();
        assert!(matches!(err, crate::Error::Device { op: "maxmin_get", .. }));
        assert!(!err.is_fatal());
        assert_eq!(pipeline.device().inner.armed_address(), Some(0x1000_0000 + 32));
        assert_eq!(pipeline.device().semaphore_get().unwrap(), 0);

        // A missing status only blanks the clock count
        pipeline.device_mut().fail_maxmin = false;
        pipeline.device_mut().fail_status = true;
        pipeline.device_mut().inner.push_frame(frame());
        assert!(sync.wait_until_ready(pipeline.device_mut(), &shutdown.token()).unwrap());
        let report = pipeline.run_cycle().unwrap();
        assert_eq!(report.bank, 1);
        assert_eq!(pipeline.device().inner.armed_address(), Some(0x1000_0000));
        assert!(report.sentinel.is_clean(), "{:?}", report.sentinel);
        assert_eq!(report.features.adc_clock_count_per_pps, None);
        let red = report.peaks[0].unwrap();
        assert_eq!((red.max.index, red.max.raw_value), (3, 9));

        let snap = counters.snapshot();
        assert_eq!(snap.register_read_errors, 2);
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.records_logged, 1);
    }

    #[test]
    fn run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config(dir.path()));
        let counters = Arc::new(Counters::default());
        let mut device = SimulatedDevice::new(Duration::ZERO);
        for _ in 0..3 {
            device.push_frame(vec![vec![1; 8], vec![-1; 8]]);
        }
        let mut pipeline = Pipeline::new(
            config,
            device,
            None,
            None,
            TelemetryReaders::default(),
            counters.clone(),
        )
        .unwrap();
        pipeline.start().unwrap();

        let shutdown = Shutdown::new();
        let stopper = {
            let shutdown = shutdown.clone();
            let counters = counters.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(2);
                while counters.snapshot().cycles < 3 && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(5));
                }
                shutdown.trigger();
            })
        };
        pipeline.run(&shutdown.token()).unwrap();
        stopper.join().unwrap();
        pipeline.stop().unwrap();
        let snap = counters.snapshot();
        assert_eq!(snap.cycles, 3);
        assert_eq!(snap.records_logged, 3);
        assert!(snap.ready_timeouts >= 1);
        assert!(!pipeline.device().status_get().unwrap().running());
    }
}
