//! Per-phase max/min detection
//!
//! Two sources of truth: the FPGA's max/min registers, which are computed on
//! the fly while the bank is written, and a scan over the completed bank.
//! Either can be used alone; with both enabled the registers are the primary
//! result and the scan checks them.

use std::sync::Arc;

use tracing::{error, trace, warn};

use crate::{
    capture::CaptureBuffer,
    config::Config,
    device::MaxMinRegister,
    monitoring::{bump, Counters},
    region::PhaseBuffer,
    Error, Phase, Result, MAX_CHANNELS, SAMPLE_SIZE, WINDOW_ALIGN,
};

/// One extremum of a phase slice
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Peak {
    /// Sample index inside the phase slice
    pub index: usize,
    pub raw_value: i32,
    /// Seconds from the start of the capture
    pub time_offset: f64,
    pub voltage: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PhasePeaks {
    pub max: Peak,
    pub min: Peak,
}

impl PhasePeaks {
    /// The extremum with the larger magnitude; max wins ties
    pub fn dominant(&self) -> &Peak {
        if self.min.voltage.abs() > self.max.voltage.abs() {
            &self.min
        } else {
            &self.max
        }
    }
}

/// Peaks of every captured phase of one bank, indexed by [`Phase::index`]
pub type PeakSet = [Option<PhasePeaks>; MAX_CHANNELS];

/// Raw index/value pairs, before conversion to physical units
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Extrema {
    pub max_index: usize,
    pub max_value: i32,
    pub min_index: usize,
    pub min_value: i32,
}

/// Outcome of comparing register and scan results
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Agreement {
    Match,
    /// Same values at different indices, which duplicate extremes explain
    IndexMismatch,
    ValueMismatch,
}

/// Clamp a `[start, stop)` window to the hardware alignment and the slice
fn aligned_window(window: (usize, usize), len: usize) -> (usize, usize) {
    let start = window.0 / WINDOW_ALIGN * WINDOW_ALIGN;
    let stop = window.1 / WINDOW_ALIGN * WINDOW_ALIGN;
    let stop = if stop == start { len } else { stop.min(len) };
    (start, stop)
}

/// Linear max/min search over `window` of `slice`. The first occurrence wins
/// ties. `None` when the window is empty.
pub fn scan(slice: &PhaseBuffer<'_>, window: (usize, usize)) -> Option<Extrema> {
    let (start, stop) = aligned_window(window, slice.len());
    if start >= stop {
        return None;
    }
    let view = slice.window(start..stop);
    let mut iter = view.iter().enumerate();
    let (_, first) = iter.next()?;
    let mut ext = Extrema {
        max_index: start,
        max_value: first,
        min_index: start,
        min_value: first,
    };
    for (i, v) in iter {
        if v > ext.max_value {
            ext.max_value = v;
            ext.max_index = start + i;
        }
        if v < ext.min_value {
            ext.min_value = v;
            ext.min_index = start + i;
        }
    }
    Some(ext)
}

fn register_index(addr: u32, slice: &PhaseBuffer<'_>) -> Result<usize> {
    // The registers only carry the low 32 bits of the bus address
    let base = slice.address() & u64::from(u32::MAX);
    let err = || Error::RegisterAddress {
        addr: u64::from(addr),
        base,
        len: slice.len(),
    };
    let offset = u64::from(addr).checked_sub(base).ok_or_else(err)? as usize;
    if offset % SAMPLE_SIZE != 0 || offset / SAMPLE_SIZE >= slice.len() {
        return Err(err());
    }
    Ok(offset / SAMPLE_SIZE)
}

/// Translate one channel's register snapshot into slice indices and raw values
pub fn from_registers(register: &MaxMinRegister, slice: &PhaseBuffer<'_>) -> Result<Extrema> {
    let polarity = slice.polarity();
    Ok(Extrema {
        max_index: register_index(register.max_addr, slice)?,
        max_value: polarity.decode(register.max_data),
        min_index: register_index(register.min_addr, slice)?,
        min_value: polarity.decode(register.min_data),
    })
}

/// Conversion from raw index/value to time and voltage
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scaling {
    pub sample_frequency: f64,
    pub sample_offset: i32,
    pub voltage_factor: f64,
    pub channel_index_offset: [i64; MAX_CHANNELS],
}

impl Scaling {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_frequency: config.acquisition.sample_frequency,
            sample_offset: config.sample_offset(),
            voltage_factor: config.acquisition.voltage_factor,
            channel_index_offset: config.acquisition.channel_index_offset,
        }
    }

    pub fn voltage(&self, raw: i32) -> f64 {
        f64::from(raw - self.sample_offset) * self.voltage_factor
    }

    pub fn time_offset(&self, phase: Phase, index: usize) -> f64 {
        (index as i64 + self.channel_index_offset[phase.index()]) as f64 / self.sample_frequency
    }

    pub fn peak(&self, phase: Phase, index: usize, raw_value: i32) -> Peak {
        Peak {
            index,
            raw_value,
            time_offset: self.time_offset(phase, index),
            voltage: self.voltage(raw_value),
        }
    }

    pub fn peaks(&self, phase: Phase, ext: &Extrema) -> PhasePeaks {
        PhasePeaks {
            max: self.peak(phase, ext.max_index, ext.max_value),
            min: self.peak(phase, ext.min_index, ext.min_value),
        }
    }
}

pub struct PeakDetector {
    fpga: bool,
    scan: bool,
    window: (usize, usize),
    scaling: Scaling,
    counters: Arc<Counters>,
}

impl PeakDetector {
    pub fn new(
        fpga: bool,
        scan: bool,
        window: (usize, usize),
        scaling: Scaling,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            fpga,
            scan,
            window,
            scaling,
            counters,
        }
    }

    pub fn from_config(config: &Config, counters: Arc<Counters>) -> Self {
        Self::new(
            config.peak.fpga,
            config.peak.scan,
            config.peak_window(),
            Scaling::from_config(config),
            counters,
        )
    }

    pub fn scaling(&self) -> &Scaling {
        &self.scaling
    }

    /// Compare both strategies, logging and counting any disagreement
    pub fn cross_validate(&self, phase: Phase, hw: &Extrema, sw: &Extrema) -> Agreement {
        if hw.max_value != sw.max_value || hw.min_value != sw.min_value {
            bump(&self.counters.peak_value_mismatches);
            error!(
                %phase,
                fpga_max = hw.max_value,
                scan_max = sw.max_value,
                fpga_min = hw.min_value,
                scan_min = sw.min_value,
                "Peak value mismatch between FPGA registers and buffer scan"
            );
            Agreement::ValueMismatch
        } else if hw.max_index != sw.max_index || hw.min_index != sw.min_index {
            bump(&self.counters.peak_index_mismatches);
            warn!(
                %phase,
                fpga_max_index = hw.max_index,
                scan_max_index = sw.max_index,
                fpga_min_index = hw.min_index,
                scan_min_index = sw.min_index,
                "Peak index mismatch between FPGA registers and buffer scan"
            );
            Agreement::IndexMismatch
        } else {
            Agreement::Match
        }
    }

    /// Peaks of a single phase slice. `register` is required when the FPGA
    /// strategy is on.
    pub fn detect_phase(
        &self,
        phase: Phase,
        slice: &PhaseBuffer<'_>,
        register: Option<&MaxMinRegister>,
    ) -> Result<PhasePeaks> {
        let hw = match (self.fpga, register) {
            (true, Some(reg)) => Some(from_registers(reg, slice)?),
            _ => None,
        };
        let sw = if self.scan || hw.is_none() {
            scan(slice, self.window)
        } else {
            None
        };
        let ext = match (hw, sw) {
            (Some(hw), Some(sw)) => {
                self.cross_validate(phase, &hw, &sw);
                hw
            }
            (Some(ext), None) | (None, Some(ext)) => ext,
            // Empty window, nothing to find
            (None, None) => Extrema::default(),
        };
        trace!(%phase, ?ext, "peaks");
        Ok(self.scaling.peaks(phase, &ext))
    }

    /// Peaks of every captured phase of a completed bank
    pub fn detect(
        &self,
        buffer: &CaptureBuffer,
        bank: usize,
        registers: &[MaxMinRegister; MAX_CHANNELS],
    ) -> Result<PeakSet> {
        let mut peaks = PeakSet::default();
        for &phase in Phase::active(buffer.layout().channel_count) {
            let slice = buffer.phase_slice(bank, phase)?;
            peaks[phase.index()] =
                Some(self.detect_phase(phase, &slice, Some(&registers[phase.index()]))?);
        }
        Ok(peaks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AdcPolarity;

    const BASE: u64 = 0x1000_0040;

    fn scaling() -> Scaling {
        Scaling {
            sample_frequency: 100e6,
            sample_offset: 0,
            voltage_factor: 1.0,
            channel_index_offset: [0; MAX_CHANNELS],
        }
    }

    fn detector(fpga: bool, scan: bool, counters: &Arc<Counters>) -> PeakDetector {
        PeakDetector::new(fpga, scan, (0, 0), scaling(), counters.clone())
    }

    fn register(max: (usize, i16), min: (usize, i16)) -> MaxMinRegister {
        MaxMinRegister {
            max_addr: (BASE + (max.0 * SAMPLE_SIZE) as u64) as u32,
            max_data: max.1 as u16 as u32,
            min_addr: (BASE + (min.0 * SAMPLE_SIZE) as u64) as u32,
            min_data: min.1 as u16 as u32,
        }
    }

    #[test]
    fn test_scan_example() {
        let samples = [0i16, 1, 2, 9, 2, 1, 0, -5];
        let ext = scan(&PhaseBuffer::signed(&samples, BASE), (0, 0)).unwrap();
        assert_eq!(
            ext,
            Extrema {
                max_index: 3,
                max_value: 9,
                min_index: 7,
                min_value: -5
            }
        );

        let zeros = [0i16; 8];
        let ext = scan(&PhaseBuffer::signed(&zeros, BASE), (0, 0)).unwrap();
        assert_eq!(ext, Extrema::default());
    }

    #[test]
    fn test_scan_stays_in_window() {
        let samples: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { i } else { -i }).collect();
        let buf = PhaseBuffer::signed(&samples, BASE);
        for (start, stop) in [(3, 29), (8, 16), (13, 63), (40, 70)] {
            let (lo, hi) = (start / 8 * 8, (stop / 8 * 8).min(64));
            let ext = scan(&buf, (start, stop)).unwrap();
            assert!((lo..hi).contains(&ext.max_index), "{start}..{stop}: {ext:?}");
            assert!((lo..hi).contains(&ext.min_index), "{start}..{stop}: {ext:?}");
        }
        // start == stop after rounding runs to the end
        let ext = scan(&buf, (17, 20)).unwrap();
        assert_eq!(ext.max_index, 62);
        assert_eq!(ext.min_index, 63);
        assert!(scan(&buf, (64, 72)).is_none());
    }

    #[test]
    fn test_window_past_the_end_reaches_the_last_sample() {
        let mut samples = vec![0i16; 100];
        samples[99] = 40;
        samples[97] = -40;
        let ext = scan(&PhaseBuffer::signed(&samples, BASE), (8, 200)).unwrap();
        assert_eq!((ext.max_index, ext.max_value), (99, 40));
        assert_eq!((ext.min_index, ext.min_value), (97, -40));
    }

    #[test]
    fn test_registers_agree_with_scan() {
        let mut samples = vec![3i16; 32];
        samples[11] = 812;
        samples[25] = -401;
        let buf = PhaseBuffer::signed(&samples, BASE);
        let hw = from_registers(&register((11, 812), (25, -401)), &buf).unwrap();
        let sw = scan(&buf, (0, 0)).unwrap();
        assert_eq!(hw, sw);

        let counters = Arc::new(Counters::default());
        let det = detector(true, true, &counters);
        assert_eq!(det.cross_validate(Phase::Red, &hw, &sw), Agreement::Match);
        let peaks = det
            .detect_phase(Phase::Red, &buf, Some(&register((11, 812), (25, -401))))
            .unwrap();
        assert_eq!(peaks.max.index, 11);
        assert_eq!(peaks.min.raw_value, -401);
        assert_eq!(counters.snapshot().peak_value_mismatches, 0);
    }

    #[test]
    fn test_cross_validation_counts() {
        let counters = Arc::new(Counters::default());
        let det = detector(true, true, &counters);
        let sw = Extrema {
            max_index: 3,
            max_value: 9,
            min_index: 7,
            min_value: -5,
        };
        let moved = Extrema {
            max_index: 4,
            ..sw
        };
        let wrong = Extrema {
            max_value: 10,
            ..sw
        };
        assert_eq!(det.cross_validate(Phase::White, &moved, &sw), Agreement::IndexMismatch);
        assert_eq!(det.cross_validate(Phase::White, &wrong, &sw), Agreement::ValueMismatch);
        let snap = counters.snapshot();
        assert_eq!(snap.peak_index_mismatches, 1);
        assert_eq!(snap.peak_value_mismatches, 1);
    }

    #[test]
    fn test_register_outside_slice() {
        let samples = [0i16; 8];
        let buf = PhaseBuffer::signed(&samples, BASE);
        let reg = register((8, 1), (0, 0));
        assert!(matches!(
            from_registers(&reg, &buf),
            Err(Error::RegisterAddress { .. })
        ));
    }

    #[test]
    fn test_unsigned_scaling() {
        let scaling = Scaling {
            sample_offset: AdcPolarity::Unsigned.sample_offset(),
            voltage_factor: 2.0 / 65536.0,
            channel_index_offset: [0, 0, 10],
            ..scaling()
        };
        let samples = [32768u16, 32768, 49152, 16384];
        let buf = PhaseBuffer::unsigned(&samples, BASE);
        let det = PeakDetector::new(false, true, (0, 0), scaling, Arc::new(Counters::default()));
        let peaks = det.detect_phase(Phase::Blue, &buf, None).unwrap();
        assert_eq!(peaks.max.index, 2);
        assert!((peaks.max.voltage - 0.5).abs() < 1e-12);
        assert!((peaks.min.voltage + 0.5).abs() < 1e-12);
        assert!((peaks.max.time_offset - 12.0 / 100e6).abs() < 1e-18);
        // Equal magnitudes, max wins
        assert_eq!(peaks.dominant().index, 2);
    }
}
