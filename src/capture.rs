//! This module contains all the capture logic

// The FPGA streams each capture into one bank of the mapped region while we
// read the bank it filled last time. After every readiness event we flip to
// the other bank and re-arm the DMA engine with it, so the engine and the
// main thread never touch the same bank.

use std::{sync::Arc, thread, time::Duration};

use tracing::{debug, error, trace, warn};

use crate::{
    config::{CaptureMode, Config},
    device::{CaptureDevice, CaptureParams},
    monitoring::{bump, Counters},
    region::{CaptureRegion, PhaseBuffer},
    shutdown::ShutdownToken,
    AdcPolarity, Error, Phase, Result, SAMPLE_SIZE,
};

/// How banks and phase slices are laid out in the region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BankLayout {
    pub bank_count: usize,
    pub channel_count: usize,
    pub capture_count: usize,
}

impl BankLayout {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bank_count: config.acquisition.bank_count,
            channel_count: config.acquisition.channel_count,
            capture_count: config.acquisition.capture_count,
        }
    }

    pub fn slice_bytes(&self) -> usize {
        self.capture_count * SAMPLE_SIZE
    }

    pub fn bank_bytes(&self) -> usize {
        self.channel_count * self.slice_bytes()
    }

    pub fn total_bytes(&self) -> usize {
        self.bank_count * self.bank_bytes()
    }

    /// Byte offset of a phase slice inside the region
    pub fn slice_offset(&self, bank: usize, phase: usize) -> Result<usize> {
        if bank >= self.bank_count || phase >= self.channel_count {
            return Err(Error::NoSuchSlice { bank, phase });
        }
        Ok(bank * self.bank_bytes() + phase * self.slice_bytes())
    }
}

/// Result of checking a completed bank for DMA under/overrun
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SentinelReport {
    /// Phases whose last sample still holds the pre-fill value
    pub underruns: Vec<Phase>,
    /// The guard area past the last bank was written to
    pub overrun: bool,
}

impl SentinelReport {
    pub fn is_clean(&self) -> bool {
        self.underruns.is_empty() && !self.overrun
    }
}

/// Ping-pong bank manager over the capture region
pub struct CaptureBuffer {
    region: CaptureRegion,
    layout: BankLayout,
    polarity: AdcPolarity,
    sentinel: Option<u16>,
    current: usize,
}

impl CaptureBuffer {
    pub fn new(region: CaptureRegion, config: &Config) -> Result<Self> {
        let sentinel = config
            .acquisition
            .sentinel_check
            .then_some(config.acquisition.sentinel);
        Self::with_layout(
            region,
            BankLayout::from_config(config),
            config.acquisition.adc_polarity,
            sentinel,
        )
    }

    pub fn with_layout(
        region: CaptureRegion,
        layout: BankLayout,
        polarity: AdcPolarity,
        sentinel: Option<u16>,
    ) -> Result<Self> {
        if layout.bank_count < 2 {
            return Err(Error::Config(format!(
                "ping-pong capture needs at least 2 banks, got {}",
                layout.bank_count
            )));
        }
        if layout.total_bytes() > region.len() {
            return Err(Error::RegionTooSmall {
                required: layout.total_bytes(),
                available: region.len(),
            });
        }
        let buffer = Self {
            region,
            layout,
            polarity,
            sentinel,
            current: 0,
        };
        if let (Some(word), Some(guard)) = (sentinel, buffer.guard_offset()) {
            buffer.region.fill(guard, 1, word)?;
        }
        Ok(buffer)
    }

    pub fn layout(&self) -> &BankLayout {
        &self.layout
    }

    /// The bank the DMA engine is currently filling
    pub fn current_bank(&self) -> usize {
        self.current
    }

    pub fn bank_address(&self, bank: usize) -> u64 {
        self.region.phys_base() + (bank * self.layout.bank_bytes()) as u64
    }

    /// Issue the initial capture start into the current bank
    pub fn arm<D: CaptureDevice + ?Sized>(
        &mut self,
        device: &mut D,
        mut params: CaptureParams,
    ) -> Result<()> {
        self.prefill(self.current)?;
        params.address = self.bank_address(self.current);
        device.capture_start(&params)
    }

    /// Flip to the next bank and re-arm the device with it. Must be called
    /// exactly once per readiness event. Returns `(completed, now_armed)`.
    pub fn advance<D: CaptureDevice + ?Sized>(&mut self, device: &mut D) -> Result<(usize, usize)> {
        let previous = self.current;
        let next = (previous + 1) % self.layout.bank_count;
        self.prefill(next)?;
        device.capture_set_address(self.bank_address(next))?;
        self.current = next;
        trace!(previous, next, "bank advance");
        Ok((previous, next))
    }

    pub fn phase_slice(&self, bank: usize, phase: Phase) -> Result<PhaseBuffer<'_>> {
        let offset = self.layout.slice_offset(bank, phase.index())?;
        self.region
            .phase_buffer(offset, self.layout.capture_count, self.polarity)
    }

    fn guard_offset(&self) -> Option<usize> {
        let end = self.layout.total_bytes();
        (end + SAMPLE_SIZE <= self.region.len()).then_some(end)
    }

    fn prefill(&self, bank: usize) -> Result<()> {
        if let Some(word) = self.sentinel {
            let offset = self.layout.slice_offset(bank, 0)?;
            self.region.fill(
                offset,
                self.layout.channel_count * self.layout.capture_count,
                word,
            )?;
        }
        Ok(())
    }

    /// Look for pre-fill values where live data should be, and live data
    /// where the pre-fill should have survived. Only meaningful with a
    /// sentinel configured; otherwise always clean.
    pub fn check_sentinels(&self, bank: usize) -> Result<SentinelReport> {
        let mut report = SentinelReport::default();
        let Some(word) = self.sentinel else {
            return Ok(report);
        };
        for &phase in Phase::active(self.layout.channel_count) {
            let slice = self.phase_slice(bank, phase)?;
            if slice.word(slice.len().saturating_sub(1)) == Some(word) {
                report.underruns.push(phase);
            }
        }
        if bank + 1 == self.layout.bank_count {
            if let Some(guard) = self.guard_offset() {
                let tail = self.region.phase_buffer(guard, 1, AdcPolarity::Unsigned)?;
                report.overrun = tail.word(0) != Some(word);
            }
        }
        Ok(report)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Timeout,
}

/// Waits for the hardware to signal a finished capture
pub struct Synchronizer {
    mode: CaptureMode,
    timeout: Duration,
    trigger_delay: Duration,
    counters: Arc<Counters>,
}

impl Synchronizer {
    pub fn new(
        mode: CaptureMode,
        timeout: Duration,
        trigger_delay: Duration,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            mode,
            timeout,
            trigger_delay,
            counters,
        }
    }

    pub fn from_config(config: &Config, counters: Arc<Counters>) -> Self {
        Self::new(
            config.acquisition.capture_mode,
            config.ready_timeout(),
            config.manual_trigger_delay(),
            counters,
        )
    }

    /// One readiness wait. In manual mode this first fires the software
    /// trigger. A timeout is logged with the device state, never an error.
    pub fn wait_for_data<D: CaptureDevice + ?Sized>(
        &self,
        device: &mut D,
        timeout: Duration,
    ) -> Result<WaitOutcome> {
        if self.mode == CaptureMode::Manual {
            thread::sleep(self.trigger_delay);
            device.trigger()?;
        }
        self.wait_once(device, timeout)
    }

    fn wait_once<D: CaptureDevice + ?Sized>(
        &self,
        device: &mut D,
        timeout: Duration,
    ) -> Result<WaitOutcome> {
        if device.wait_ready(timeout)? {
            return Ok(WaitOutcome::Ready);
        }
        let timeouts = bump(&self.counters.ready_timeouts);
        match (device.status_get(), device.semaphore_get()) {
            (Ok(status), Ok(semaphore)) => warn!(
                timeouts,
                status = format_args!("{:#x}", status.flags),
                pps_locked = status.pps_locked(),
                semaphore,
                "Timed out waiting for capture"
            ),
            (status, semaphore) => error!(
                timeouts,
                ?status,
                ?semaphore,
                "Timed out waiting for capture and could not read diagnostics"
            ),
        }
        Ok(WaitOutcome::Timeout)
    }

    /// Wait until a capture is ready, re-issuing the wait after every
    /// timeout. Returns `false` if shutdown was requested first.
    pub fn wait_until_ready<D: CaptureDevice + ?Sized>(
        &self,
        device: &mut D,
        shutdown: &ShutdownToken,
    ) -> Result<bool> {
        if shutdown.is_triggered() {
            return Ok(false);
        }
        let mut outcome = self.wait_for_data(device, self.timeout)?;
        while outcome == WaitOutcome::Timeout {
            if shutdown.is_triggered() {
                debug!("Shutdown while waiting for capture");
                return Ok(false);
            }
            outcome = self.wait_once(device, self.timeout)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shutdown::Shutdown, sim::SimulatedDevice};

    const BASE: u64 = 0x1000_0000;

    fn layout(bank_count: usize) -> BankLayout {
        BankLayout {
            bank_count,
            channel_count: 3,
            capture_count: 16,
        }
    }

    fn params() -> CaptureParams {
        CaptureParams {
            capture_count: 16,
            phase_mode: 0b111,
            ..Default::default()
        }
    }

    fn setup(bank_count: usize, sentinel: Option<u16>) -> (SimulatedDevice, CaptureBuffer) {
        let mut dev = SimulatedDevice::new(Duration::ZERO);
        let region = dev.map_region(4096, BASE).unwrap();
        let buf = CaptureBuffer::with_layout(region, layout(bank_count), AdcPolarity::Signed, sentinel)
            .unwrap();
        (dev, buf)
    }

    #[test]
    fn advance_cycles_round_robin() {
        for bank_count in 2..=4 {
            let (mut dev, mut buf) = setup(bank_count, None);
            let mut seen = Vec::new();
            for _ in 0..bank_count * 3 {
                let (prev, next) = buf.advance(&mut dev).unwrap();
                assert_eq!(next, (prev + 1) % bank_count);
                assert_eq!(buf.current_bank(), next);
                assert_eq!(dev.armed_address(), Some(buf.bank_address(next)));
                seen.push(prev);
            }
            for cycle in seen.chunks(bank_count) {
                let expected: Vec<usize> = (0..bank_count).collect();
                assert_eq!(cycle, expected.as_slice());
            }
        }
    }

    #[test]
    fn slices_are_disjoint_and_addressed() {
        let (_dev, buf) = setup(2, None);
        let red0 = buf.phase_slice(0, Phase::Red).unwrap();
        let blue1 = buf.phase_slice(1, Phase::Blue).unwrap();
        assert_eq!(red0.len(), 16);
        assert_eq!(red0.address(), BASE);
        assert_eq!(blue1.address(), BASE + 96 + 64);
        assert!(matches!(buf.phase_slice(2, Phase::Red), Err(Error::NoSuchSlice { .. })));
    }

    #[test]
    fn single_bank_layout_is_rejected() {
        let mut dev = SimulatedDevice::new(Duration::ZERO);
        for bank_count in [0, 1] {
            let region = dev.map_region(4096, BASE).unwrap();
            let err = CaptureBuffer::with_layout(region, layout(bank_count), AdcPolarity::Signed, Some(0xdead))
                .err()
                .unwrap();
            assert!(matches!(err, Error::Config(_)));
        }
    }

    #[test]
    fn oversized_layout_is_fatal() {
        let mut dev = SimulatedDevice::new(Duration::ZERO);
        let region = dev.map_region(128, BASE).unwrap();
        let err = CaptureBuffer::with_layout(region, layout(2), AdcPolarity::Signed, None)
            .err()
            .unwrap();
        assert!(matches!(err, Error::RegionTooSmall { required: 192, available: 128 }));
    }

    #[test]
    fn sentinel_reports_underrun_and_overrun() {
        let (mut dev, mut buf) = setup(2, Some(0xdead));
        buf.arm(&mut dev, params()).unwrap();
        // nothing captured into bank 0 yet
        let report = buf.check_sentinels(0).unwrap();
        assert_eq!(report.underruns, vec![Phase::Red, Phase::White, Phase::Blue]);

        dev.push_frame(vec![vec![1; 16], vec![2; 16], vec![3; 16]]);
        assert!(dev.wait_ready(Duration::from_millis(10)).unwrap());
        assert!(buf.check_sentinels(0).unwrap().is_clean());

        // a runaway capture into the last bank tramples the guard word
        buf.advance(&mut dev).unwrap();
        dev.push_frame(vec![vec![1; 16], vec![2; 16], vec![3; 16]]);
        dev.set_overrun(true);
        assert!(dev.wait_ready(Duration::from_millis(10)).unwrap());
        let report = buf.check_sentinels(1).unwrap();
        assert!(report.underruns.is_empty());
        assert!(report.overrun);
    }

    #[test]
    fn timeout_is_retried_until_ready() {
        let counters = Arc::new(Counters::default());
        let sync = Synchronizer::new(
            CaptureMode::Auto,
            Duration::from_millis(5),
            Duration::ZERO,
            counters.clone(),
        );
        let (mut dev, mut buf) = setup(2, None);
        buf.arm(&mut dev, params()).unwrap();

        assert_eq!(
            sync.wait_for_data(&mut dev, Duration::from_millis(5)).unwrap(),
            WaitOutcome::Timeout
        );
        assert_eq!(counters.snapshot().ready_timeouts, 1);

        dev.push_frame_after(2, vec![vec![0; 16]; 3]);
        let shutdown = Shutdown::new();
        assert!(sync.wait_until_ready(&mut dev, &shutdown.token()).unwrap());
        assert!(counters.snapshot().ready_timeouts >= 3);
    }

    #[test]
    fn shutdown_interrupts_the_wait() {
        let sync = Synchronizer::new(
            CaptureMode::Auto,
            Duration::from_millis(5),
            Duration::ZERO,
            Arc::new(Counters::default()),
        );
        let (mut dev, _buf) = setup(2, None);
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            shutdown.trigger();
        });
        assert!(!sync.wait_until_ready(&mut dev, &token).unwrap());
        stopper.join().unwrap();
    }

    #[test]
    fn manual_mode_triggers_once_per_wait() {
        let sync = Synchronizer::new(
            CaptureMode::Manual,
            Duration::from_millis(5),
            Duration::ZERO,
            Arc::new(Counters::default()),
        );
        let (mut dev, mut buf) = setup(2, None);
        let params = CaptureParams {
            mode: CaptureMode::Manual.register_value(),
            ..params()
        };
        buf.arm(&mut dev, params).unwrap();
        dev.push_frame(vec![vec![0; 16]; 3]);
        assert!(sync.wait_until_ready(&mut dev, &Shutdown::new().token()).unwrap());
        assert_eq!(dev.trigger_count(), 1);
    }
}
