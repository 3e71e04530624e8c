//! Audio capture and analysis module

pub mod bands;
pub mod beat;
mod capture;
pub mod config;
pub mod driver;
pub mod fft;
pub mod slot;
mod sources;

pub use bands::{band_ranges, BandRange, NUM_BANDS};
pub use beat::BeatTracker;
pub use capture::{AudioEngine, CaptureError, EngineState, EngineStats, Spectrum};
pub use config::{CaptureConfig, CaptureMode, ExecutionContext, I2sPins};
pub use driver::{CaptureDriver, CpalDriver, DriverError, SyntheticDriver};
pub use fft::FrameAnalyzer;
pub use sources::{list_input_devices, InputDevice, SourceError};
