//! Capture configuration and begin-time validation

use super::bands::{min_sample_rate, NUM_BANDS};
use super::capture::CaptureError;
use serde::{Deserialize, Serialize};

/// Smallest transform the band layout supports
pub const MIN_TRANSFORM_SIZE: usize = 64;

/// Largest transform accepted (bounds the working buffers)
pub const MAX_TRANSFORM_SIZE: usize = 16384;

/// Highest GPIO number on the target part
const MAX_GPIO: u8 = 39;

/// How the I2S peripheral frames incoming audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// I2S MEMS microphone (ICS-43434, INMP441, ...): mono, left slot only, no master clock
    #[default]
    Microphone,

    /// External I2S ADC (PCM1808): interleaved stereo framing, needs a master clock
    ExternalAdc,
}

impl CaptureMode {
    /// Channels per frame delivered by the hardware in this mode
    pub fn channels(self) -> usize {
        match self {
            CaptureMode::Microphone => 1,
            CaptureMode::ExternalAdc => 2,
        }
    }
}

/// I2S pin assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct I2sPins {
    /// Bit clock (BCLK)
    pub clock: u8,

    /// Word select (LRCLK)
    pub word_select: u8,

    /// Serial data in
    pub data: u8,

    /// Master clock, required in external-ADC mode
    pub master_clock: Option<u8>,
}

impl Default for I2sPins {
    fn default() -> Self {
        Self {
            clock: 26,
            word_select: 25,
            data: 33,
            master_clock: Some(0),
        }
    }
}

/// Where the background capture context runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionContext {
    pub core: u8,
    pub priority: u8,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            core: 1,
            priority: 4,
        }
    }
}

/// Audio capture configuration. Immutable once the engine is started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Microphone or external ADC framing
    pub mode: CaptureMode,

    /// I2S pins
    pub pins: I2sPins,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// FFT size, power of two
    pub transform_size: usize,

    /// Number of DMA ring buffers
    pub dma_buffer_count: usize,

    /// Frames per DMA buffer
    pub dma_buffer_length: usize,

    /// Core and priority of the capture context
    pub execution: ExecutionContext,

    /// Bass energy / running average ratio that counts as a beat
    pub beat_threshold: f32,

    /// Minimum time between beats
    pub beat_cooldown_ms: u64,

    /// BPM exponential smoothing factor (0-1]
    pub bpm_alpha: f32,

    /// Band attack smoothing factor (0-1]
    pub smooth_rise: f32,

    /// Band decay smoothing factor (0-1]
    pub smooth_fall: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Microphone,
            pins: I2sPins::default(),
            sample_rate: 44100,
            transform_size: 1024,
            dma_buffer_count: 4,
            dma_buffer_length: 512,
            execution: ExecutionContext::default(),
            beat_threshold: 1.5,
            beat_cooldown_ms: 200,
            bpm_alpha: 0.15,
            smooth_rise: 0.3,
            smooth_fall: 0.05,
        }
    }
}

impl CaptureConfig {
    /// Defaults for the given framing mode
    pub fn for_mode(mode: CaptureMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Run every check `AudioEngine::begin` performs before touching hardware
    pub fn validate(&self) -> Result<(), CaptureError> {
        self.validate_pins()?;
        self.validate_rates()?;
        self.validate_tuning()
    }

    fn validate_pins(&self) -> Result<(), CaptureError> {
        let pins = &self.pins;

        check_pin("clock", pins.clock, true)?;
        check_pin("word_select", pins.word_select, true)?;
        check_pin("data", pins.data, false)?;

        let mclk = match (self.mode, pins.master_clock) {
            (CaptureMode::ExternalAdc, None) => {
                return Err(CaptureError::InvalidPin(
                    "external ADC mode requires a master clock pin".to_string(),
                ))
            }
            (CaptureMode::ExternalAdc, Some(pin)) => {
                check_pin("master_clock", pin, true)?;
                Some(pin)
            }
            // Microphones take no master clock; the pin is left untouched
            (CaptureMode::Microphone, _) => None,
        };

        let mut used = vec![pins.clock, pins.word_select, pins.data];
        used.extend(mclk);
        for (i, pin) in used.iter().enumerate() {
            if used[i + 1..].contains(pin) {
                return Err(CaptureError::InvalidPin(format!(
                    "GPIO {} is assigned to more than one I2S signal",
                    pin
                )));
            }
        }
        Ok(())
    }

    fn validate_rates(&self) -> Result<(), CaptureError> {
        let size = self.transform_size;
        if size < MIN_TRANSFORM_SIZE || size > MAX_TRANSFORM_SIZE || !size.is_power_of_two() {
            return Err(CaptureError::InvalidConfig(format!(
                "transform size {} must be a power of two in {}..={}",
                size, MIN_TRANSFORM_SIZE, MAX_TRANSFORM_SIZE
            )));
        }
        if self.sample_rate < min_sample_rate() {
            return Err(CaptureError::InvalidConfig(format!(
                "sample rate {} Hz is below {} Hz needed for {} bands",
                self.sample_rate,
                min_sample_rate(),
                NUM_BANDS
            )));
        }
        if !(2..=128).contains(&self.dma_buffer_count) {
            return Err(CaptureError::InvalidConfig(format!(
                "DMA buffer count {} outside 2..=128",
                self.dma_buffer_count
            )));
        }
        if !(8..=1024).contains(&self.dma_buffer_length) {
            return Err(CaptureError::InvalidConfig(format!(
                "DMA buffer length {} outside 8..=1024",
                self.dma_buffer_length
            )));
        }
        Ok(())
    }

    fn validate_tuning(&self) -> Result<(), CaptureError> {
        let factors = [
            ("bpm_alpha", self.bpm_alpha),
            ("smooth_rise", self.smooth_rise),
            ("smooth_fall", self.smooth_fall),
        ];
        for (name, value) in factors {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CaptureError::InvalidConfig(format!(
                    "{} = {} must be in (0, 1]",
                    name, value
                )));
            }
        }
        if !(self.beat_threshold.is_finite() && self.beat_threshold > 0.0) {
            return Err(CaptureError::InvalidConfig(format!(
                "beat threshold {} must be positive",
                self.beat_threshold
            )));
        }
        Ok(())
    }
}

/// ESP32 GPIO rules for I2S signals
fn check_pin(signal: &str, pin: u8, drives_output: bool) -> Result<(), CaptureError> {
    if pin > MAX_GPIO {
        return Err(CaptureError::InvalidPin(format!(
            "{}: GPIO {} does not exist",
            signal, pin
        )));
    }
    if (6..=11).contains(&pin) {
        return Err(CaptureError::InvalidPin(format!(
            "{}: GPIO {} is wired to SPI flash",
            signal, pin
        )));
    }
    // As I2S master the clocks are outputs
    if drives_output && (34..=39).contains(&pin) {
        return Err(CaptureError::InvalidPin(format!(
            "{}: GPIO {} is input-only",
            signal, pin
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invalid_config(config: &CaptureConfig) {
        match config.validate() {
            Err(CaptureError::InvalidConfig(_)) => {}
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    fn assert_invalid_pin(config: &CaptureConfig) {
        match config.validate() {
            Err(CaptureError::InvalidPin(_)) => {}
            other => panic!("expected InvalidPin, got {other:?}"),
        }
    }

    #[test]
    fn defaults_match_firmware_values() {
        let cfg = CaptureConfig::default();

        assert_eq!(cfg.mode, CaptureMode::Microphone);
        assert_eq!(cfg.sample_rate, 44100);
        assert_eq!(cfg.transform_size, 1024);
        assert_eq!(cfg.dma_buffer_count, 4);
        assert_eq!(cfg.dma_buffer_length, 512);
        assert_eq!(cfg.execution, ExecutionContext { core: 1, priority: 4 });
        assert_eq!(cfg.beat_threshold, 1.5);
        assert_eq!(cfg.beat_cooldown_ms, 200);
        assert_eq!(cfg.bpm_alpha, 0.15);
        assert_eq!(cfg.smooth_rise, 0.3);
        assert_eq!(cfg.smooth_fall, 0.05);
        assert!(cfg.validate().is_ok());
        assert!(CaptureConfig::for_mode(CaptureMode::ExternalAdc).validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_and_tiny_transforms() {
        for size in [100, 1000, 32, 0, 32768] {
            let cfg = CaptureConfig {
                transform_size: size,
                ..Default::default()
            };
            assert_invalid_config(&cfg);
        }
    }

    #[test]
    fn rejects_rates_below_nyquist_for_top_band() {
        let cfg = CaptureConfig {
            sample_rate: 16000,
            ..Default::default()
        };
        assert_invalid_config(&cfg);

        let cfg = CaptureConfig {
            sample_rate: 22050,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_tuning() {
        let cfg = CaptureConfig {
            smooth_fall: 0.0,
            ..Default::default()
        };
        assert_invalid_config(&cfg);

        let cfg = CaptureConfig {
            bpm_alpha: 1.5,
            ..Default::default()
        };
        assert_invalid_config(&cfg);

        let cfg = CaptureConfig {
            beat_threshold: f32::NAN,
            ..Default::default()
        };
        assert_invalid_config(&cfg);
    }

    #[test]
    fn external_adc_requires_master_clock() {
        let mut cfg = CaptureConfig::for_mode(CaptureMode::ExternalAdc);
        cfg.pins.master_clock = None;
        assert_invalid_pin(&cfg);

        // Microphone mode ignores the master clock entirely
        let mut cfg = CaptureConfig::default();
        cfg.pins.master_clock = None;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_flash_input_only_and_duplicate_pins() {
        let mut cfg = CaptureConfig::default();
        cfg.pins.data = 7;
        assert_invalid_pin(&cfg);

        let mut cfg = CaptureConfig::default();
        cfg.pins.clock = 35;
        assert_invalid_pin(&cfg);

        // Data in may sit on an input-only pin
        let mut cfg = CaptureConfig::default();
        cfg.pins.data = 35;
        assert!(cfg.validate().is_ok());

        let mut cfg = CaptureConfig::default();
        cfg.pins.word_select = cfg.pins.clock;
        assert_invalid_pin(&cfg);

        let mut cfg = CaptureConfig::default();
        cfg.pins.clock = 40;
        assert_invalid_pin(&cfg);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let json = r#"{ "mode": "external_adc", "sample_rate": 48000, "pins": { "data": 32 } }"#;
        let cfg: CaptureConfig = serde_json::from_str(json).unwrap();

        assert_eq!(cfg.mode, CaptureMode::ExternalAdc);
        assert_eq!(cfg.sample_rate, 48000);
        assert_eq!(cfg.pins.data, 32);
        assert_eq!(cfg.pins.clock, 26);
        assert_eq!(cfg.transform_size, 1024);
        assert!(cfg.validate().is_ok());
    }
}
