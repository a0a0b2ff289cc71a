//! Time-frequency mapping of a pulse
//!
//! For a window around a peak we compute the power weighted time centroid
//! `t0`, the effective time length `T² = Σ(t−t0)²s² / Σs²` and the effective
//! bandwidth `W² = Σf²|S(f)|² / Σ|S(f)|²` from the one-sided spectrum.
//!
//! Everything is accumulated in `f64`. Captures are at most a few million
//! samples, well within what a plain `f64` sum handles without compensation.
//! Any moment that comes out non-finite (including the 0/0 of a flat signal)
//! is reported as zero.

use std::{ops::Range, sync::Arc};

use realfft::{RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

use crate::{peak::Scaling, region::PhaseBuffer, Error, Phase, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TfMap {
    pub t0: f64,
    /// Effective time length
    pub t: f64,
    pub t2: f64,
    /// Effective bandwidth, `W` in the literature
    pub f: f64,
    pub f2: f64,
}

impl TfMap {
    pub const NULL: TfMap = TfMap {
        t0: 0.0,
        t: 0.0,
        t2: 0.0,
        f: 0.0,
        f2: 0.0,
    };

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

/// `[beg, end)` of width `fft_size` centered on `peak`, shifted to stay inside
/// `0..len`. Only narrower than `fft_size` when the slice itself is.
pub fn window(peak: usize, len: usize, fft_size: usize) -> Range<usize> {
    if fft_size >= len {
        return 0..len;
    }
    let beg = peak.saturating_sub(fft_size / 2).min(len - fft_size);
    beg..beg + fft_size
}

/// Reusable mapper. FFT plans are cached per length and the work buffers are
/// kept between calls, so steady state mapping does not allocate.
pub struct TfMapper {
    planner: RealFftPlanner<f64>,
    plan: Option<Arc<dyn RealToComplex<f64>>>,
    input: Vec<f64>,
    spectrum: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
    time: Vec<f64>,
    signal: Vec<f64>,
}

impl Default for TfMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl TfMapper {
    pub fn new() -> Self {
        Self {
            planner: RealFftPlanner::new(),
            plan: None,
            input: Vec::new(),
            spectrum: Vec::new(),
            scratch: Vec::new(),
            time: Vec::new(),
            signal: Vec::new(),
        }
    }

    fn plan(&mut self, len: usize) -> Arc<dyn RealToComplex<f64>> {
        match &self.plan {
            Some(plan) if plan.len() == len => plan.clone(),
            _ => {
                let plan = self.planner.plan_fft_forward(len);
                self.input = plan.make_input_vec();
                self.spectrum = plan.make_output_vec();
                self.scratch = plan.make_scratch_vec();
                self.plan = Some(plan.clone());
                plan
            }
        }
    }

    /// Map `signal` sampled at times `time`. The FFT length defaults to the
    /// signal length; the signal is zero padded or truncated to it.
    pub fn calculate(
        &mut self,
        time: &[f64],
        signal: &[f64],
        fs: f64,
        fft_len: Option<usize>,
    ) -> Result<TfMap> {
        if time.len() != signal.len() {
            return Err(Error::LengthMismatch {
                time: time.len(),
                signal: signal.len(),
            });
        }
        if signal.is_empty() {
            return Ok(TfMap::NULL);
        }

        let t_start = time[0];
        let mut energy = 0.0;
        let mut weighted = 0.0;
        for (&t, &s) in time.iter().zip(signal) {
            let p = s * s;
            energy += p;
            weighted += (t - t_start) * p;
        }
        let t0 = finite_or_zero(weighted / energy);
        let spread: f64 = time
            .iter()
            .zip(signal)
            .map(|(&t, &s)| {
                let dt = t - t_start - t0;
                dt * dt * s * s
            })
            .sum();
        let t2 = finite_or_zero(spread / energy);

        let f2 = self.bandwidth(signal, fs, fft_len.unwrap_or(signal.len()))?;

        Ok(TfMap {
            t0,
            t: t2.sqrt(),
            t2,
            f: f2.sqrt(),
            f2,
        })
    }

    /// `W²` over the one-sided spectrum, Nyquist bin excluded
    fn bandwidth(&mut self, signal: &[f64], fs: f64, len: usize) -> Result<f64> {
        if len == 0 {
            return Ok(0.0);
        }
        let plan = self.plan(len);
        let n = signal.len().min(len);
        self.input[..n].copy_from_slice(&signal[..n]);
        self.input[n..].iter_mut().for_each(|x| *x = 0.0);
        plan.process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .map_err(|e| Error::Fft(e.to_string()))?;

        let df = fs / len as f64;
        let bins = self.spectrum.len() - 1;
        let (mut power, mut moment) = (0.0, 0.0);
        for (k, c) in self.spectrum[..bins].iter().enumerate() {
            let y2 = c.norm_sqr();
            let f = k as f64 * df;
            power += y2;
            moment += f * f * y2;
        }
        Ok(finite_or_zero(moment / power))
    }

    /// Map the `fft_size` samples of `slice` around `peak_index`, in volts
    pub fn map_peak(
        &mut self,
        phase: Phase,
        slice: &PhaseBuffer<'_>,
        peak_index: usize,
        fft_size: usize,
        scaling: &Scaling,
    ) -> Result<TfMap> {
        let range = window(peak_index, slice.len(), fft_size);
        let view = slice.window(range.clone());
        let mut time = std::mem::take(&mut self.time);
        let mut signal = std::mem::take(&mut self.signal);
        time.clear();
        signal.clear();
        time.extend(range.map(|i| scaling.time_offset(phase, i)));
        signal.extend(view.iter().map(|raw| scaling.voltage(raw)));
        let map = self.calculate(&time, &signal, scaling.sample_frequency, None);
        self.time = time;
        self.signal = signal;
        map
    }
}

/// One-shot convenience over [`TfMapper::calculate`]
pub fn tf_map_calculate(
    time: &[f64],
    signal: &[f64],
    fs: f64,
    fft_len: Option<usize>,
) -> Result<TfMap> {
    TfMapper::new().calculate(time, signal, fs, fft_len)
}
