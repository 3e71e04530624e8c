//! Per-cycle spectrum analysis: DC removal, Hann window, FFT, band energies

use super::bands::{band_ranges, BandRange, NUM_BANDS};
use super::capture::{CaptureError, Spectrum};
use super::config::CaptureConfig;
use super::driver::frame_to_sample;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// DC blocker pole: y[n] = x[n] - x[n-1] + a * y[n-1]
const DC_BLOCK_ALPHA: f32 = 0.995;

/// Empirical scale mapping typical music levels of a band average to 0-1
const BAND_GAIN: f32 = 4.0;

/// Zero-filled vector, reporting allocation failure instead of aborting
pub(crate) fn try_alloc<T: Clone>(len: usize, fill: T) -> Result<Vec<T>, CaptureError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| CaptureError::AllocationFailed(format!("{} elements: {}", len, e)))?;
    buf.resize(len, fill);
    Ok(buf)
}

/// First-order DC blocking filter. State carries across cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct DcBlocker {
    prev_x: f32,
    prev_y: f32,
}

impl DcBlocker {
    pub fn process(&mut self, x: f32) -> f32 {
        let y = x - self.prev_x + DC_BLOCK_ALPHA * self.prev_y;
        self.prev_x = x;
        self.prev_y = y;
        y
    }
}

/// Envelope following with separate attack and release factors
pub fn smooth_band(current: f32, raw: f32, rise: f32, fall: f32) -> f32 {
    if raw > current {
        current + (raw - current) * rise
    } else {
        current + (raw - current) * fall
    }
}

/// Spectrum analyzer for one capture cycle's worth of mono frames
pub struct FrameAnalyzer {
    transform_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,

    band_ranges: [BandRange; NUM_BANDS],
    smoothed_bands: [f32; NUM_BANDS],
    rise: f32,
    fall: f32,

    dc: DcBlocker,
}

impl FrameAnalyzer {
    /// Allocate buffers and plan the transform. `config` must already be validated.
    pub fn new(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let n = config.transform_size;

        let mut window = try_alloc(n, 0.0f32)?;
        for (i, w) in window.iter_mut().enumerate() {
            *w = 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32).cos());
        }
        let buffer = try_alloc(n, Complex::new(0.0f32, 0.0))?;
        let magnitudes = try_alloc(n / 2, 0.0f32)?;

        let fft = FftPlanner::<f32>::new().plan_fft_forward(n);
        let scratch = try_alloc(fft.get_inplace_scratch_len(), Complex::new(0.0f32, 0.0))
            .map_err(|e| CaptureError::TransformInitFailed(e.to_string()))?;

        Ok(Self {
            transform_size: n,
            fft,
            window,
            buffer,
            scratch,
            magnitudes,
            band_ranges: band_ranges(config.sample_rate, n),
            smoothed_bands: [0.0; NUM_BANDS],
            rise: config.smooth_rise,
            fall: config.smooth_fall,
            dc: DcBlocker::default(),
        })
    }

    pub fn transform_size(&self) -> usize {
        self.transform_size
    }

    pub fn band_ranges(&self) -> &[BandRange; NUM_BANDS] {
        &self.band_ranges
    }

    /// Heap bytes held by the working buffers
    pub fn buffer_bytes(&self) -> usize {
        use std::mem::size_of;
        self.window.capacity() * size_of::<f32>()
            + self.magnitudes.capacity() * size_of::<f32>()
            + (self.buffer.capacity() + self.scratch.capacity()) * size_of::<Complex<f32>>()
    }

    /// Analyze one block of mono I2S frames.
    ///
    /// Fills band energies, RMS and the timestamp; beat fields are left for
    /// the beat tracker.
    pub fn analyze(&mut self, frames: &[i32], timestamp_ms: u64) -> Spectrum {
        if frames.len() < self.transform_size {
            return Spectrum {
                timestamp_ms,
                ..Default::default()
            };
        }

        // DC removal, RMS and windowing in one pass
        let mut sum_sq = 0.0f32;
        for ((slot, &frame), &w) in self
            .buffer
            .iter_mut()
            .zip(frames.iter())
            .zip(self.window.iter())
        {
            let y = self.dc.process(frame_to_sample(frame));
            sum_sq += y * y;
            *slot = Complex::new(y * w, 0.0);
        }
        let rms = (sum_sq / self.transform_size as f32).sqrt().min(1.0);

        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        for (mag, c) in self.magnitudes.iter_mut().zip(self.buffer.iter()) {
            *mag = c.norm();
        }

        let mut band_energy = [0.0f32; NUM_BANDS];
        for (i, range) in self.band_ranges.iter().enumerate() {
            let end = range.end.min(self.magnitudes.len());
            let raw = if range.start < end {
                let sum: f32 = self.magnitudes[range.start..end].iter().sum();
                (sum / (end - range.start) as f32 * BAND_GAIN).min(1.0)
            } else {
                0.0
            };

            self.smoothed_bands[i] = smooth_band(self.smoothed_bands[i], raw, self.rise, self.fall);
            band_energy[i] = self.smoothed_bands[i];
        }

        Spectrum {
            band_energy,
            rms_energy: rms,
            timestamp_ms,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::driver::sample_to_frame;

    fn assert_approx(actual: f32, expected: f32, tolerance: f32) {
        assert!(
            (actual - expected).abs() <= tolerance,
            "expected {expected} +/- {tolerance}, got {actual}"
        );
    }

    fn tone(freq: f32, amplitude: f32, offset: usize, len: usize) -> Vec<i32> {
        (offset..offset + len)
            .map(|i| {
                let t = i as f32 / 44100.0;
                sample_to_frame(amplitude * (2.0 * std::f32::consts::PI * freq * t).sin())
            })
            .collect()
    }

    fn bin_freq(bin: usize) -> f32 {
        bin as f32 * 44100.0 / 1024.0
    }

    fn peak_band(spectrum: &Spectrum) -> usize {
        spectrum
            .band_energy
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap()
    }

    #[test]
    fn analyze_returns_empty_spectrum_for_insufficient_frames() {
        let mut analyzer = FrameAnalyzer::new(&CaptureConfig::default()).unwrap();
        let short = vec![0i32; analyzer.transform_size() - 1];

        let result = analyzer.analyze(&short, 42);

        assert_eq!(result.band_energy, [0.0; NUM_BANDS]);
        assert_eq!(result.rms_energy, 0.0);
        assert_eq!(result.timestamp_ms, 42);
    }

    #[test]
    fn analyze_silence_produces_no_energy() {
        let mut analyzer = FrameAnalyzer::new(&CaptureConfig::default()).unwrap();
        let silence = vec![0i32; 1024];

        let result = analyzer.analyze(&silence, 10);

        assert_eq!(result.band_energy, [0.0; NUM_BANDS]);
        assert_eq!(result.rms_energy, 0.0);
        assert!(!result.beat_detected);
        assert_eq!(result.next_beat_ms, None);
    }

    /// Unsmoothed analysis of the second block of a steady tone
    fn steady_tone(freq: f32, amplitude: f32) -> Spectrum {
        let mut analyzer = FrameAnalyzer::new(&CaptureConfig {
            smooth_rise: 1.0,
            smooth_fall: 1.0,
            ..Default::default()
        })
        .unwrap();
        analyzer.analyze(&tone(freq, amplitude, 0, 1024), 0);
        analyzer.analyze(&tone(freq, amplitude, 1024, 1024), 23)
    }

    #[test]
    fn bass_tone_lands_in_lowest_bands() {
        let result = steady_tone(bin_freq(1), 0.5);

        assert!(result.band_energy[0] > 0.9, "band 0 = {}", result.band_energy[0]);
        assert!(result.band_energy[1] > 0.9, "band 1 = {}", result.band_energy[1]);
        for band in 4..NUM_BANDS {
            assert!(
                result.band_energy[band] < 0.05,
                "band {band} = {}",
                result.band_energy[band]
            );
        }
    }

    #[test]
    fn first_block_is_smoothed_toward_raw() {
        let mut analyzer = FrameAnalyzer::new(&CaptureConfig::default()).unwrap();
        let result = analyzer.analyze(&tone(bin_freq(1), 0.5, 0, 1024), 0);

        // Raw band 0 saturates; one rise step at 0.3 lands at 0.3
        assert_approx(result.band_energy[0], 0.3, 1e-4);
    }

    #[test]
    fn mid_tone_lands_in_its_band() {
        // Bin 45 (~1938 Hz) sits inside the 1378-2756 Hz band
        let result = steady_tone(bin_freq(45), 0.05);

        assert_eq!(peak_band(&result), 5);
        for band in [0, 1, 2, 7] {
            assert!(result.band_energy[band] < result.band_energy[5] * 0.1);
        }
    }

    #[test]
    fn rms_tracks_sine_amplitude() {
        let mut analyzer = FrameAnalyzer::new(&CaptureConfig::default()).unwrap();
        // Second block so the DC blocker has settled
        analyzer.analyze(&tone(1000.0, 0.5, 0, 1024), 0);
        let result = analyzer.analyze(&tone(1000.0, 0.5, 1024, 1024), 23);

        assert_approx(result.rms_energy, 0.5 / 2f32.sqrt(), 0.02);
    }

    #[test]
    fn rms_is_clamped_to_full_scale() {
        let mut analyzer = FrameAnalyzer::new(&CaptureConfig::default()).unwrap();
        let frames: Vec<i32> = (0..1024)
            .map(|i| sample_to_frame(if i % 2 == 0 { 1.0 } else { -1.0 }))
            .collect();

        analyzer.analyze(&frames, 0);
        let result = analyzer.analyze(&frames, 23);

        assert!(result.rms_energy <= 1.0);
        assert!(result.rms_energy > 0.95, "rms = {}", result.rms_energy);
    }

    #[test]
    fn dc_offset_is_removed() {
        let mut analyzer = FrameAnalyzer::new(&CaptureConfig::default()).unwrap();
        let offset = vec![sample_to_frame(0.5); 1024];

        let mut result = Spectrum::default();
        for cycle in 0..4 {
            result = analyzer.analyze(&offset, cycle * 23);
        }

        assert!(result.rms_energy < 0.01, "rms = {}", result.rms_energy);
    }

    #[test]
    fn dc_blocker_passes_steps_then_decays() {
        let mut dc = DcBlocker::default();
        assert_approx(dc.process(1.0), 1.0, 1e-6);
        assert_approx(dc.process(1.0), 0.995, 1e-6);
        let mut y = 0.0;
        for _ in 0..5000 {
            y = dc.process(1.0);
        }
        assert!(y.abs() < 1e-3);
    }

    #[test]
    fn smoothing_attacks_faster_than_it_decays() {
        let (rise, fall) = (0.3, 0.05);

        let mut value = 0.0;
        let mut attack_cycles = 0;
        while value < 0.9 {
            value = smooth_band(value, 1.0, rise, fall);
            attack_cycles += 1;
        }

        let mut decay_cycles = 0;
        let mut value = 1.0;
        while value > 0.1 {
            value = smooth_band(value, 0.0, rise, fall);
            decay_cycles += 1;
        }

        assert!(
            attack_cycles < decay_cycles,
            "attack {attack_cycles} cycles vs decay {decay_cycles} cycles"
        );
        assert_eq!(attack_cycles, 7);
        assert_eq!(decay_cycles, 45);
    }

    #[test]
    fn smoothing_holds_on_equal_input() {
        assert_eq!(smooth_band(0.4, 0.4, 0.3, 0.05), 0.4);
    }

    #[test]
    fn band_ranges_follow_config() {
        let analyzer = FrameAnalyzer::new(&CaptureConfig {
            sample_rate: 48000,
            transform_size: 2048,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(analyzer.band_ranges(), &band_ranges(48000, 2048));
        assert!(analyzer.buffer_bytes() >= 2048 * (4 + 8) + 1024 * 4);
    }
}
