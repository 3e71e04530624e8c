//! Bass-energy beat detection and tempo tracking

use super::capture::Spectrum;
use super::config::CaptureConfig;

/// Cycles of bass energy kept for the running mean
pub const HISTORY_LEN: usize = 32;

/// Bass energy below this never counts as a beat
pub const BEAT_FLOOR: f32 = 0.05;

/// Accepted inter-beat interval, inclusive (240 down to 30 BPM)
pub const MIN_INTERVAL_MS: u64 = 250;
pub const MAX_INTERVAL_MS: u64 = 2000;

/// Below this the tempo estimate is treated as unset
const MIN_PREDICT_BPM: f32 = 1.0;

/// Beat tracker state, owned by the capture worker
#[derive(Debug, Clone)]
pub struct BeatTracker {
    history: [f32; HISTORY_LEN],
    history_index: usize,
    last_beat_ms: Option<u64>,
    bpm: f32,

    threshold: f32,
    cooldown_ms: u64,
    bpm_alpha: f32,
}

impl BeatTracker {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            history: [0.0; HISTORY_LEN],
            history_index: 0,
            last_beat_ms: None,
            bpm: 0.0,
            threshold: config.beat_threshold,
            cooldown_ms: config.beat_cooldown_ms,
            bpm_alpha: config.bpm_alpha,
        }
    }

    /// Smoothed tempo estimate, 0.0 until two beats have been seen
    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    pub fn last_beat_ms(&self) -> Option<u64> {
        self.last_beat_ms
    }

    /// Fill the beat fields of `spectrum` from its band energies and timestamp
    pub fn update(&mut self, spectrum: &mut Spectrum) {
        let bass = (spectrum.band_energy[0] + spectrum.band_energy[1]) * 0.5;
        let now = spectrum.timestamp_ms;

        spectrum.beat_detected = self.detect(bass, now);
        spectrum.bpm = self.bpm;

        let (phase, next) = self.predict(now);
        spectrum.beat_phase = phase;
        spectrum.next_beat_ms = next;
    }

    /// Push one bass sample and report whether it is a beat
    fn detect(&mut self, bass: f32, now_ms: u64) -> bool {
        self.history[self.history_index] = bass;
        self.history_index = (self.history_index + 1) % HISTORY_LEN;
        let mean = self.history.iter().sum::<f32>() / HISTORY_LEN as f32;

        let cooled_down = match self.last_beat_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.cooldown_ms,
            None => true,
        };
        if !(bass > mean * self.threshold && bass > BEAT_FLOOR && cooled_down) {
            return false;
        }

        if let Some(last) = self.last_beat_ms {
            let interval = now_ms.saturating_sub(last);
            if (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval) {
                let instant = 60_000.0 / interval as f32;
                self.bpm = if self.bpm < MIN_PREDICT_BPM {
                    instant
                } else {
                    self.bpm * (1.0 - self.bpm_alpha) + instant * self.bpm_alpha
                };
            } else {
                log::debug!("Ignoring inter-beat interval of {} ms", interval);
            }
        }
        self.last_beat_ms = Some(now_ms);
        true
    }

    /// Beat phase in [0, 1) and the next predicted beat, strictly after `now_ms`
    pub fn predict(&self, now_ms: u64) -> (f32, Option<u64>) {
        let last = match self.last_beat_ms {
            Some(last) if self.bpm > MIN_PREDICT_BPM => last,
            _ => return (0.0, None),
        };

        let period = 60_000.0 / self.bpm as f64;
        let elapsed = now_ms.saturating_sub(last) as f64;
        let periods = (elapsed / period).floor();

        let phase = ((elapsed - periods * period) / period) as f32;
        let next = last + ((periods + 1.0) * period).ceil() as u64;

        (phase.clamp(0.0, 1.0 - f32::EPSILON), Some(next))
    }
}
