//! Hardware sample source boundary
//!
//! The capture engine never sees a concrete peripheral. It installs a
//! [`CaptureDriver`], reads fixed-size frame blocks from it on the worker
//! thread, and calls [`CaptureDriver::stop`] from the foreground when the
//! worker has to be pried out of a blocking read.

pub mod host;
pub mod synthetic;

use super::config::{CaptureConfig, I2sPins};
use std::time::Duration;
use thiserror::Error;

pub use host::CpalDriver;
pub use synthetic::SyntheticDriver;

/// Full-scale amplitude of a 24-bit sample
const FULL_SCALE: f32 = 8_388_608.0;

/// Driver errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Read timed out")]
    Timeout,

    #[error("Driver stopped")]
    Stopped,

    #[error("Driver not installed")]
    NotInstalled,

    #[error("Driver already installed")]
    AlreadyInstalled,

    #[error("Device error: {0}")]
    Device(String),

    #[error("Pin error: {0}")]
    Pin(String),
}

/// Peripheral settings derived from a [`CaptureConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct DriverParams {
    pub sample_rate: u32,

    /// Channels per frame (1 = left slot only, 2 = interleaved L/R)
    pub channels: usize,

    pub bits_per_sample: u8,
    pub dma_buffer_count: usize,
    pub dma_buffer_length: usize,

    /// Master clock frequency when the peripheral must drive one
    pub master_clock_hz: Option<u32>,

    /// Advisory placement of the reading context
    pub core: u8,
    pub priority: u8,
}

impl DriverParams {
    pub fn from_config(config: &CaptureConfig) -> Self {
        let channels = config.mode.channels();
        Self {
            sample_rate: config.sample_rate,
            channels,
            bits_per_sample: 32,
            dma_buffer_count: config.dma_buffer_count,
            dma_buffer_length: config.dma_buffer_length,
            // PCM1808 wants 256 x fs
            master_clock_hz: (channels == 2).then(|| 256 * config.sample_rate),
            core: config.execution.core,
            priority: config.execution.priority,
        }
    }

    /// Frames buffered by the DMA ring before the oldest are overwritten
    pub fn ring_capacity(&self) -> usize {
        self.dma_buffer_count * self.dma_buffer_length * self.channels
    }
}

/// A source of 32-bit I2S frames.
///
/// Methods take `&self` so the engine can hold one handle while the worker
/// reads through another; implementations synchronise internally.
pub trait CaptureDriver: Send + Sync + 'static {
    /// Configure and start the peripheral
    fn install(&self, params: &DriverParams) -> Result<(), DriverError>;

    /// Route the peripheral to its pins
    fn set_pins(&self, pins: &I2sPins) -> Result<(), DriverError>;

    /// Fill `buf` with interleaved frames, blocking at most `timeout`.
    ///
    /// Returns the number of words written; fewer than `buf.len()` is a
    /// short read. Returns [`DriverError::Stopped`] once [`stop`](Self::stop)
    /// has been called.
    fn read(&self, buf: &mut [i32], timeout: Duration) -> Result<usize, DriverError>;

    /// Halt the peripheral and wake any blocked reader
    fn stop(&self);

    /// Release the peripheral. Safe to call when not installed.
    fn uninstall(&self);
}

/// Encode a normalised sample as a left-justified 24-bit I2S word
pub fn sample_to_frame(sample: f32) -> i32 {
    let scaled = (sample.clamp(-1.0, 1.0) * FULL_SCALE) as i32;
    scaled.clamp(-(FULL_SCALE as i32), FULL_SCALE as i32 - 1) << 8
}

/// Decode a left-justified 24-bit I2S word to a normalised sample
pub fn frame_to_sample(frame: i32) -> f32 {
    (frame >> 8) as f32 / FULL_SCALE
}
