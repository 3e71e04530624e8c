//! Octave band layout over FFT bins

/// Number of analysis bands (sub-bass to air)
pub const NUM_BANDS: usize = 8;

/// Band edges in Hz, octave-spaced from ~43 Hz to ~11025 Hz.
/// Band `i` spans `BAND_EDGES_HZ[i]..BAND_EDGES_HZ[i + 1]`.
pub const BAND_EDGES_HZ: [f32; NUM_BANDS + 1] = [
    43.0, 86.0, 172.0, 345.0, 689.0, 1378.0, 2756.0, 5512.0, 11025.0,
];

/// Half-open `[start, end)` range of FFT bins belonging to one band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandRange {
    pub start: usize,
    pub end: usize,
}

impl BandRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Lowest sample rate that keeps the top band edge below Nyquist
pub fn min_sample_rate() -> u32 {
    (2.0 * BAND_EDGES_HZ[NUM_BANDS]) as u32
}

/// Map the band edges onto bins for a given sample rate and transform size.
///
/// Start bins round down and end bins round up so every band keeps at least
/// one bin even when bins are wider than the band (sub-bass at 44.1 kHz /
/// 1024). Bin 0 (DC) is never included. The bottom band starts at bin 1 and
/// the top band runs to Nyquist, so the ranges cover `1..transform_size / 2`
/// at any valid rate.
///
/// Callers validate the inputs first: `sample_rate >= min_sample_rate()` and
/// a power-of-two `transform_size`.
pub fn band_ranges(sample_rate: u32, transform_size: usize) -> [BandRange; NUM_BANDS] {
    let bin_width = sample_rate as f32 / transform_size as f32;
    let max_bin = transform_size / 2;

    let mut ranges = [BandRange::default(); NUM_BANDS];
    for (i, range) in ranges.iter_mut().enumerate() {
        let start = if i == 0 {
            1
        } else {
            ((BAND_EDGES_HZ[i] / bin_width).floor() as usize).max(1)
        };
        let mut end = ((BAND_EDGES_HZ[i + 1] / bin_width).ceil() as usize).min(max_bin);
        if i == NUM_BANDS - 1 {
            end = max_bin;
        }
        if end <= start {
            end = start + 1;
        }
        *range = BandRange { start, end };
    }
    ranges
}
