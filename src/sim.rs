//! A software stand-in for the capture FPGA
//!
//! Behaves like the real front end as far as the core can tell: captures go
//! to whatever bank address was armed last, the max/min registers cover the
//! configured peak window, manual mode waits for a trigger and the semaphore
//! is raised on every completed capture. Frames are either scripted (tests)
//! or synthesized: a line-frequency sine per phase with noise and the odd
//! damped partial-discharge burst.

use std::{
    collections::VecDeque,
    f64::consts::PI,
    thread,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace};

use crate::{
    device::{CaptureDevice, CaptureParams, DeviceStatus, MaxMinRegister},
    region::CaptureRegion,
    AdcPolarity, Error, Result, MAX_CHANNELS, SAMPLE_SIZE, WINDOW_ALIGN,
};

const SIM_VERSION: u32 = 0x0001_0000;
const SIM_CLOCK_PER_PPS: u32 = 100_000_000;

struct Scripted {
    /// Readiness waits that time out before this frame lands
    timeouts_before: usize,
    frame: Vec<Vec<i16>>,
}

/// Parameters of the synthesized waveform, in ADC counts
#[derive(Clone, Debug)]
pub struct Synthetic {
    pub line_amplitude: f64,
    pub noise: i32,
    /// Chance per capture that one phase carries a discharge burst
    pub pd_probability: f64,
    pub pd_amplitude: f64,
    /// Line cycles per capture, used to scale the sine
    pub cycles_per_capture: f64,
}

impl Default for Synthetic {
    fn default() -> Self {
        Self {
            line_amplitude: 2000.0,
            noise: 40,
            pd_probability: 0.05,
            pd_amplitude: 24000.0,
            cycles_per_capture: 0.5,
        }
    }
}

pub struct SimulatedDevice {
    region: Option<CaptureRegion>,
    params: Option<CaptureParams>,
    address: Option<u64>,
    semaphore: u32,
    registers: [MaxMinRegister; MAX_CHANNELS],
    status: DeviceStatus,
    period: Duration,
    next_capture: Instant,
    script: VecDeque<Scripted>,
    synth: Option<(Synthetic, StdRng)>,
    pending_trigger: bool,
    triggers: u64,
    captures: u64,
    overrun: bool,
}

impl SimulatedDevice {
    /// A device that only produces scripted frames. `period` paces PPS captures.
    pub fn new(period: Duration) -> Self {
        Self {
            region: None,
            params: None,
            address: None,
            semaphore: 0,
            registers: Default::default(),
            status: DeviceStatus::default(),
            period,
            next_capture: Instant::now(),
            script: VecDeque::new(),
            synth: None,
            pending_trigger: false,
            triggers: 0,
            captures: 0,
            overrun: false,
        }
    }

    /// A device that synthesizes a capture every `period`
    pub fn synthetic(period: Duration, synth: Synthetic, seed: u64) -> Self {
        let mut dev = Self::new(period);
        dev.synth = Some((synth, StdRng::seed_from_u64(seed)));
        dev
    }

    /// Queue a frame (one sample vector per phase) for the next capture
    pub fn push_frame(&mut self, frame: Vec<Vec<i16>>) {
        self.push_frame_after(0, frame);
    }

    pub fn push_frame_after(&mut self, timeouts_before: usize, frame: Vec<Vec<i16>>) {
        self.script.push_back(Scripted {
            timeouts_before,
            frame,
        });
    }

    /// Make the next captures run one sample past the end of their bank
    pub fn set_overrun(&mut self, overrun: bool) {
        self.overrun = overrun;
    }

    pub fn armed_address(&self) -> Option<u64> {
        self.address
    }

    pub fn trigger_count(&self) -> u64 {
        self.triggers
    }

    pub fn capture_count(&self) -> u64 {
        self.captures
    }

    fn idle(&self, timeout: Duration) -> Result<bool> {
        thread::sleep(timeout);
        Ok(false)
    }

    fn next_frame(&mut self, params: &CaptureParams) -> Option<Vec<Vec<i16>>> {
        if let Some(front) = self.script.front_mut() {
            if front.timeouts_before > 0 {
                front.timeouts_before -= 1;
                return None;
            }
            return self.script.pop_front().map(|s| s.frame);
        }
        let (synth, rng) = self.synth.as_mut()?;
        Some(synthesize(synth, rng, params, self.captures))
    }

    fn capture(&mut self, params: &CaptureParams, frame: Vec<Vec<i16>>) -> Result<()> {
        let region = self
            .region
            .as_ref()
            .ok_or_else(|| Error::Config("simulated capture before map_region".to_owned()))?;
        let address = self.address.unwrap_or(params.address);
        let bank_offset = address
            .checked_sub(region.phys_base())
            .ok_or_else(|| Error::Config(format!("capture address {address:#x} below region")))?
            as usize;
        let count = params.capture_count as usize;
        let polarity = if params.signed != 0 {
            AdcPolarity::Signed
        } else {
            AdcPolarity::Unsigned
        };

        let mut channels = 0;
        for (phase, samples) in frame.iter().enumerate().take(MAX_CHANNELS) {
            if params.phase_mode & (1 << phase) == 0 {
                continue;
            }
            channels = phase + 1;
            let mut words: Vec<u16> = samples.iter().map(|&s| s as u16).collect();
            words.resize(count, 0);
            let offset = bank_offset + phase * count * SAMPLE_SIZE;
            region.write_samples(offset, &words)?;
            self.registers[phase] =
                maxmin(&words, polarity, params, region.phys_base() + offset as u64);
        }
        if self.overrun {
            let past_end = bank_offset + channels * count * SAMPLE_SIZE;
            region.write_samples(past_end, &[0x7fff])?;
        }

        self.captures += 1;
        self.semaphore = 1;
        self.pending_trigger = false;
        self.status = DeviceStatus {
            flags: DeviceStatus::RUNNING | DeviceStatus::PPS_LOCKED,
            adc_clock_count_per_pps: SIM_CLOCK_PER_PPS,
        };
        trace!(address = format_args!("{address:#x}"), capture = self.captures, "simulated capture");
        Ok(())
    }
}

/// What the FPGA's max/min logic reports for one channel
fn maxmin(words: &[u16], polarity: AdcPolarity, params: &CaptureParams, base: u64) -> MaxMinRegister {
    let start = params.peak_window_start as usize / WINDOW_ALIGN * WINDOW_ALIGN;
    let stop = params.peak_window_stop as usize / WINDOW_ALIGN * WINDOW_ALIGN;
    let stop = if stop == start { words.len() } else { stop.min(words.len()) };
    if start >= stop {
        return MaxMinRegister::default();
    }
    let (mut max_i, mut min_i) = (start, start);
    for i in start..stop {
        let v = polarity.decode(words[i] as u32);
        if v > polarity.decode(words[max_i] as u32) {
            max_i = i;
        }
        if v < polarity.decode(words[min_i] as u32) {
            min_i = i;
        }
    }
    let addr = |i: usize| (base + (i * SAMPLE_SIZE) as u64) as u32;
    let word = |i: usize| words.get(i).copied().unwrap_or(0) as u32;
    MaxMinRegister {
        max_addr: addr(max_i),
        max_data: word(max_i),
        min_addr: addr(min_i),
        min_data: word(min_i),
    }
}

fn synthesize(synth: &Synthetic, rng: &mut StdRng, params: &CaptureParams, n: u64) -> Vec<Vec<i16>> {
    let count = params.capture_count as usize;
    let (offset, lo, hi) = if params.signed != 0 {
        (0.0, -32768.0, 32767.0)
    } else {
        (32768.0, 0.0, 65535.0)
    };
    let pd_phase = (rng.gen::<f64>() < synth.pd_probability).then(|| rng.gen_range(0..MAX_CHANNELS));
    (0..MAX_CHANNELS)
        .map(|phase| {
            let shift = phase as f64 * 2.0 * PI / 3.0 + n as f64 * 0.01;
            let mut samples: Vec<f64> = (0..count)
                .map(|i| {
                    let x = 2.0 * PI * synth.cycles_per_capture * i as f64 / count as f64;
                    synth.line_amplitude * (x + shift).sin()
                        + rng.gen_range(-synth.noise..=synth.noise) as f64
                })
                .collect();
            if pd_phase == Some(phase) && count > 0 {
                let at = rng.gen_range(0..count);
                for (k, s) in samples[at..].iter_mut().take(256).enumerate() {
                    let t = k as f64;
                    *s += synth.pd_amplitude * (-t / 24.0).exp() * (t * 0.7).cos();
                }
            }
            samples
                .into_iter()
                .map(|s| (s + offset).round().clamp(lo, hi) as i32 as u16 as i16)
                .collect()
        })
        .collect()
}

impl CaptureDevice for SimulatedDevice {
    fn capture_start(&mut self, params: &CaptureParams) -> Result<()> {
        debug!(?params, "simulated capture start");
        self.params = Some(*params);
        self.address = Some(params.address);
        self.next_capture = Instant::now() + self.period;
        Ok(())
    }

    fn capture_stop(&mut self) -> Result<()> {
        self.params = None;
        self.status.flags &= !DeviceStatus::RUNNING;
        Ok(())
    }

    fn capture_set_address(&mut self, address: u64) -> Result<()> {
        self.address = Some(address);
        Ok(())
    }

    fn semaphore_get(&self) -> Result<u32> {
        Ok(self.semaphore)
    }

    fn semaphore_set(&mut self, value: u32) -> Result<()> {
        self.semaphore = value;
        Ok(())
    }

    fn maxmin_get(&self) -> Result<[MaxMinRegister; MAX_CHANNELS]> {
        Ok(self.registers)
    }

    fn trigger(&mut self) -> Result<()> {
        self.triggers += 1;
        self.pending_trigger = true;
        Ok(())
    }

    fn status_get(&self) -> Result<DeviceStatus> {
        Ok(self.status)
    }

    fn fpga_version_get(&self) -> Result<u32> {
        Ok(SIM_VERSION)
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<bool> {
        let Some(params) = self.params else {
            return self.idle(timeout);
        };
        let manual = params.mode != 0;
        if manual && !self.pending_trigger {
            return self.idle(timeout);
        }
        if !manual {
            let now = Instant::now();
            if self.next_capture > now + timeout {
                return self.idle(timeout);
            }
            thread::sleep(self.next_capture.saturating_duration_since(now));
        }
        match self.next_frame(&params) {
            Some(frame) => {
                self.capture(&params, frame)?;
                self.next_capture += self.period;
                Ok(true)
            }
            None => self.idle(timeout),
        }
    }

    fn map_region(&mut self, len: usize, phys_base: u64) -> Result<CaptureRegion> {
        let region = CaptureRegion::anonymous(len, phys_base)?;
        self.region = Some(region.clone());
        Ok(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(address: u64) -> CaptureParams {
        CaptureParams {
            address,
            capture_count: 8,
            signed: 1,
            phase_mode: 0b11,
            ..Default::default()
        }
    }

    #[test]
    fn scripted_frame_lands_in_armed_bank_with_registers() {
        let mut dev = SimulatedDevice::new(Duration::ZERO);
        let region = dev.map_region(256, 0x2000).unwrap();
        dev.capture_start(&params(0x2000)).unwrap();
        dev.capture_set_address(0x2000 + 32).unwrap();
        dev.push_frame(vec![vec![0, 1, 2, 9, 2, 1, 0, -5], vec![0; 8]]);

        assert!(dev.wait_ready(Duration::from_millis(5)).unwrap());
        let buf = region.phase_buffer(32, 8, AdcPolarity::Signed).unwrap();
        assert_eq!(buf.get(3), Some(9));
        let regs = dev.maxmin_get().unwrap();
        assert_eq!(regs[0].max_addr, 0x2000 + 32 + 6);
        assert_eq!(regs[0].max_data, 9);
        assert_eq!(regs[0].min_data as u16 as i16, -5);
        assert_eq!(regs[1].max_addr, 0x2000 + 48);
        assert_eq!(dev.semaphore_get().unwrap(), 1);
        assert_eq!(dev.status_get().unwrap().adc_clock_count_per_pps, SIM_CLOCK_PER_PPS);
    }

    #[test]
    fn nothing_ready_without_a_frame() {
        let mut dev = SimulatedDevice::new(Duration::ZERO);
        dev.map_region(256, 0).unwrap();
        assert!(!dev.wait_ready(Duration::from_millis(1)).unwrap());
        dev.capture_start(&params(0)).unwrap();
        assert!(!dev.wait_ready(Duration::from_millis(1)).unwrap());
        assert_eq!(dev.capture_count(), 0);
    }

    #[test]
    fn synthetic_frames_are_paced() {
        let mut dev = SimulatedDevice::synthetic(Duration::from_millis(20), Synthetic::default(), 7);
        dev.map_region(4096, 0).unwrap();
        dev.capture_start(&params(0)).unwrap();
        assert!(!dev.wait_ready(Duration::from_millis(1)).unwrap());
        assert!(dev.wait_ready(Duration::from_millis(100)).unwrap());
        assert_eq!(dev.capture_count(), 1);
    }
}
