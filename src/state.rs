//! Render-side audio state

use crate::audio::{AudioEngine, Spectrum, NUM_BANDS};
use serde::Serialize;

/// Age after which a published spectrum no longer drives effects
pub const STALE_AFTER_MS: u64 = 500;

/// Anything that can be peeked for the latest spectrum
pub trait SpectrumSource {
    fn get_latest(&self) -> Option<Spectrum>;
}

impl SpectrumSource for AudioEngine {
    fn get_latest(&self) -> Option<Spectrum> {
        AudioEngine::get_latest(self)
    }
}

/// Audio state visible to effects, refreshed once per render frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConsumerAudioState {
    /// Normalised RMS energy (0-1)
    pub energy: f32,

    /// True only on the first merge of a spectrum that carries a beat
    pub beat_detected: bool,

    pub bpm: f32,

    /// Per-band energy (0-1)
    pub band_energy: [f32; NUM_BANDS],

    /// Position within the beat [0, 1)
    pub beat_phase: f32,

    pub next_beat_ms: Option<u64>,

    /// Capture timestamp of the last merged spectrum
    pub spectrum_ms: Option<u64>,
}

impl ConsumerAudioState {
    /// Copy `latest` in if it is fresh at `now_ms`, otherwise go silent.
    ///
    /// Render frames usually outpace capture cycles, so the same spectrum is
    /// merged several times; its beat flag is only passed on the first time.
    /// Returns whether fresh data was applied.
    pub fn merge(&mut self, latest: Option<Spectrum>, now_ms: u64) -> bool {
        match latest {
            Some(spectrum) if now_ms.saturating_sub(spectrum.timestamp_ms) <= STALE_AFTER_MS => {
                let seen = self.spectrum_ms == Some(spectrum.timestamp_ms);
                self.energy = spectrum.rms_energy;
                self.beat_detected = spectrum.beat_detected && !seen;
                self.bpm = spectrum.bpm;
                self.band_energy = spectrum.band_energy;
                self.beat_phase = spectrum.beat_phase;
                self.next_beat_ms = spectrum.next_beat_ms;
                self.spectrum_ms = Some(spectrum.timestamp_ms);
                true
            }
            Some(spectrum) => {
                if self.bpm > 0.0 || self.energy > 0.0 {
                    log::debug!(
                        "Audio data stale ({} ms old), silencing",
                        now_ms.saturating_sub(spectrum.timestamp_ms)
                    );
                }
                self.clear();
                false
            }
            None => {
                self.clear();
                false
            }
        }
    }

    /// Peek `source` and merge the result
    pub fn update(&mut self, source: &impl SpectrumSource, now_ms: u64) -> bool {
        self.merge(source.get_latest(), now_ms)
    }

    /// Silent state: no energy, no beat, no tempo
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_spectrum(timestamp_ms: u64) -> Spectrum {
        Spectrum {
            band_energy: [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8],
            rms_energy: 0.42,
            beat_detected: true,
            bpm: 128.0,
            beat_phase: 0.25,
            next_beat_ms: Some(timestamp_ms + 350),
            timestamp_ms,
        }
    }

    struct Fixed(Option<Spectrum>);

    impl SpectrumSource for Fixed {
        fn get_latest(&self) -> Option<Spectrum> {
            self.0
        }
    }

    #[test]
    fn fresh_spectrum_is_copied_verbatim() {
        let spectrum = loud_spectrum(10_000);
        let mut state = ConsumerAudioState::default();

        assert!(state.merge(Some(spectrum), 10_499));

        assert_eq!(state.energy, 0.42);
        assert!(state.beat_detected);
        assert_eq!(state.bpm, 128.0);
        assert_eq!(state.band_energy, spectrum.band_energy);
        assert_eq!(state.beat_phase, 0.25);
        assert_eq!(state.next_beat_ms, Some(10_350));
        assert_eq!(state.spectrum_ms, Some(10_000));
    }

    #[test]
    fn beat_is_reported_once_per_spectrum() {
        let mut state = ConsumerAudioState::default();
        let beat = loud_spectrum(1_000);

        assert!(state.merge(Some(beat), 1_010));
        assert!(state.beat_detected);

        // Next render frame, capture has not published again
        assert!(state.merge(Some(beat), 1_050));
        assert!(!state.beat_detected);
        assert_eq!(state.bpm, 128.0);
        assert_eq!(state.energy, 0.42);

        assert!(state.merge(Some(loud_spectrum(1_500)), 1_510));
        assert!(state.beat_detected);
        assert_eq!(state.spectrum_ms, Some(1_500));
    }

    #[test]
    fn staleness_boundary_is_500ms() {
        let mut state = ConsumerAudioState::default();
        assert!(state.merge(Some(loud_spectrum(10_000)), 10_500));

        assert!(!state.merge(Some(loud_spectrum(10_000)), 10_501));
        assert_eq!(state, ConsumerAudioState::default());
    }

    #[test]
    fn stale_data_zeroes_previous_fresh_state() {
        let mut state = ConsumerAudioState::default();
        state.merge(Some(loud_spectrum(0)), 100);
        assert!(state.bpm > 0.0);

        state.merge(Some(loud_spectrum(0)), 501);

        assert_eq!(state.energy, 0.0);
        assert!(!state.beat_detected);
        assert_eq!(state.bpm, 0.0);
        assert_eq!(state.beat_phase, 0.0);
        assert_eq!(state.next_beat_ms, None);
        assert_eq!(state.band_energy, [0.0; NUM_BANDS]);
    }

    #[test]
    fn missing_data_is_silence() {
        let mut state = ConsumerAudioState::default();
        state.merge(Some(loud_spectrum(0)), 0);

        assert!(!state.update(&Fixed(None), 10));
        assert_eq!(state, ConsumerAudioState::default());
    }

    #[test]
    fn timestamp_ahead_of_now_counts_as_fresh() {
        let mut state = ConsumerAudioState::default();
        assert!(state.update(&Fixed(Some(loud_spectrum(2_000))), 1_990));
        assert_eq!(state.bpm, 128.0);
    }

    #[test]
    fn idle_engine_reads_as_silence() {
        let engine = AudioEngine::new(std::sync::Arc::new(
            crate::audio::driver::SyntheticDriver::silence(),
        ));
        let mut state = ConsumerAudioState {
            energy: 1.0,
            ..Default::default()
        };

        assert!(!state.update(&engine, 0));
        assert_eq!(state.energy, 0.0);
    }
}
