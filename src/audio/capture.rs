//! Audio capture engine using a dedicated thread

use super::bands::NUM_BANDS;
use super::beat::BeatTracker;
use super::config::CaptureConfig;
use super::driver::{CaptureDriver, DriverError, DriverParams};
use super::fft::{try_alloc, FrameAnalyzer};
use super::slot::{latest_slot, SlotReader, SlotWriter};
use crate::clock::{Clock, SystemClock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Longest a single hardware read may block
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Pause after a skipped cycle before reading again
const SKIP_BACKOFF: Duration = Duration::from_millis(10);

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(50);

/// Audio capture errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Invalid pin: {0}")]
    InvalidPin(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Buffer allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Driver install failed: {0}")]
    DriverInstallFailed(String),

    #[error("Driver pin config failed: {0}")]
    DriverPinConfigFailed(String),

    #[error("Transform init failed: {0}")]
    TransformInitFailed(String),

    #[error("Capture task launch failed: {0}")]
    TaskLaunchFailed(String),

    #[error("Capture already running")]
    AlreadyRunning,
}

/// Analysis result of one capture cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Spectrum {
    /// Smoothed energy per band (0-1), lowest band first
    pub band_energy: [f32; NUM_BANDS],

    /// RMS of the DC-filtered block (0-1)
    pub rms_energy: f32,

    /// True only for the cycle the beat was recognised in
    pub beat_detected: bool,

    /// Smoothed tempo estimate, 0.0 while unknown
    pub bpm: f32,

    /// Position within the current beat period [0, 1)
    pub beat_phase: f32,

    /// Predicted timestamp of the next beat
    pub next_beat_ms: Option<u64>,

    /// Clock time the block finished capturing
    pub timestamp_ms: u64,
}

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Background context diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub cycles_published: u64,
    pub cycles_skipped: u64,
    pub beats_detected: u64,

    /// Heap bytes of working buffers owned by the capture thread
    pub buffer_bytes: usize,
}

#[derive(Default)]
struct WorkerCounters {
    published: AtomicU64,
    skipped: AtomicU64,
    beats: AtomicU64,
}

/// Everything the capture thread owns exclusively
struct CaptureRuntime {
    channels: usize,
    raw: Vec<i32>,
    mono: Vec<i32>,
    analyzer: FrameAnalyzer,
    tracker: BeatTracker,
}

impl CaptureRuntime {
    fn new(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let channels = config.mode.channels();
        let n = config.transform_size;
        Ok(Self {
            channels,
            raw: try_alloc(n * channels, 0i32)?,
            mono: if channels > 1 { try_alloc(n, 0i32)? } else { Vec::new() },
            analyzer: FrameAnalyzer::new(config)?,
            tracker: BeatTracker::new(config),
        })
    }

    fn buffer_bytes(&self) -> usize {
        (self.raw.capacity() + self.mono.capacity()) * std::mem::size_of::<i32>()
            + self.analyzer.buffer_bytes()
    }

    /// Analyze the block sitting in `raw`
    fn process(&mut self, timestamp_ms: u64) -> Spectrum {
        let frames: &[i32] = if self.channels > 1 {
            // Keep the left slot, drop the rest
            for (dst, frame) in self.mono.iter_mut().zip(self.raw.chunks_exact(self.channels)) {
                *dst = frame[0];
            }
            &self.mono
        } else {
            &self.raw
        };

        let mut spectrum = self.analyzer.analyze(frames, timestamp_ms);
        self.tracker.update(&mut spectrum);
        spectrum
    }
}

/// Shared handles passed to the capture thread
struct WorkerContext {
    driver: Arc<dyn CaptureDriver>,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
    publish: SlotWriter<Spectrum>,
    counters: Arc<WorkerCounters>,
    exit_tx: mpsc::Sender<()>,
}

/// Engine-side handle to a running capture thread
struct Worker {
    stop: Arc<AtomicBool>,
    exit_rx: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
    latest: SlotReader<Spectrum>,
    counters: Arc<WorkerCounters>,
    buffer_bytes: usize,
}

/// Uninstalls the driver unless disarmed
struct InstallGuard<'a> {
    driver: &'a dyn CaptureDriver,
    armed: bool,
}

impl InstallGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.driver.uninstall();
        }
    }
}

/// Audio capture engine
///
/// Owns the hardware driver and the capture thread. The thread reads a block,
/// analyzes it and overwrites a single-slot channel; [`get_latest`](Self::get_latest)
/// peeks that slot from any other thread without blocking on the capture side.
pub struct AudioEngine {
    driver: Arc<dyn CaptureDriver>,
    clock: Arc<dyn Clock>,
    state: EngineState,
    worker: Option<Worker>,
    ack_timeout: Duration,
    stop_grace: Duration,
}

impl AudioEngine {
    pub fn new(driver: Arc<dyn CaptureDriver>) -> Self {
        Self {
            driver,
            clock: Arc::new(SystemClock),
            state: EngineState::Idle,
            worker: None,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Timestamp published spectra with `clock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long `end()` waits for the thread, then for the stopped driver to release it
    pub fn with_shutdown_timeouts(mut self, ack: Duration, grace: Duration) -> Self {
        self.ack_timeout = ack;
        self.stop_grace = grace;
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }

    /// Start capturing. On error nothing is left installed and the engine stays idle.
    pub fn begin(&mut self, config: CaptureConfig) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        if let Err(e) = config.validate() {
            log::error!("Capture config rejected: {}", e);
            return Err(e);
        }

        self.state = EngineState::Starting;
        match self.start(&config) {
            Ok(worker) => {
                log::info!(
                    "Audio capture started: {:?}, {} Hz, {}-point transform, core {} priority {}",
                    config.mode,
                    config.sample_rate,
                    config.transform_size,
                    config.execution.core,
                    config.execution.priority
                );
                self.worker = Some(worker);
                self.state = EngineState::Running;
                Ok(())
            }
            Err(e) => {
                log::error!("Audio capture failed to start: {}", e);
                self.state = EngineState::Idle;
                Err(e)
            }
        }
    }

    fn start(&self, config: &CaptureConfig) -> Result<Worker, CaptureError> {
        let runtime = CaptureRuntime::new(config)?;
        let buffer_bytes = runtime.buffer_bytes();

        self.driver
            .install(&DriverParams::from_config(config))
            .map_err(|e| CaptureError::DriverInstallFailed(e.to_string()))?;
        let guard = InstallGuard {
            driver: &*self.driver,
            armed: true,
        };

        self.driver
            .set_pins(&config.pins)
            .map_err(|e| CaptureError::DriverPinConfigFailed(e.to_string()))?;

        let (publish, latest) = latest_slot();
        let stop = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(WorkerCounters::default());
        let (exit_tx, exit_rx) = mpsc::channel();

        let context = WorkerContext {
            driver: self.driver.clone(),
            clock: self.clock.clone(),
            stop: stop.clone(),
            publish,
            counters: counters.clone(),
            exit_tx,
        };

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture_thread(runtime, context))
            .map_err(|e| CaptureError::TaskLaunchFailed(e.to_string()))?;

        guard.disarm();
        Ok(Worker {
            stop,
            exit_rx,
            handle,
            latest,
            counters,
            buffer_bytes,
        })
    }

    /// Stop capturing and release the driver. Safe to call in any state.
    pub fn end(&mut self) {
        let Some(worker) = self.worker.take() else {
            self.state = EngineState::Idle;
            return;
        };
        self.state = EngineState::Stopping;
        worker.stop.store(true, Ordering::Release);

        match worker.exit_rx.recv_timeout(self.ack_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => join_worker(worker.handle),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Capture thread did not exit within {:?}, stopping driver",
                    self.ack_timeout
                );
                self.driver.stop();

                match worker.exit_rx.recv_timeout(self.stop_grace) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => join_worker(worker.handle),
                    Err(RecvTimeoutError::Timeout) => {
                        log::error!("Capture thread unresponsive after driver stop, detaching it");
                        drop(worker.handle);
                    }
                }
            }
        }

        self.driver.uninstall();
        self.state = EngineState::Idle;
        log::info!("Audio capture stopped");
    }

    /// Most recent spectrum, left in place for the next call
    pub fn get_latest(&self) -> Option<Spectrum> {
        self.worker.as_ref().and_then(|w| w.latest.peek())
    }

    pub fn stats(&self) -> Option<EngineStats> {
        self.worker.as_ref().map(|w| EngineStats {
            cycles_published: w.counters.published.load(Ordering::Relaxed),
            cycles_skipped: w.counters.skipped.load(Ordering::Relaxed),
            beats_detected: w.counters.beats.load(Ordering::Relaxed),
            buffer_bytes: w.buffer_bytes,
        })
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.end();
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if let Err(panic) = handle.join() {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        log::error!("Capture thread error: {}", message);
    }
}

/// Capture loop: read, analyze, publish until told to stop
fn run_capture_thread(mut runtime: CaptureRuntime, context: WorkerContext) {
    log::info!("Capture thread running");
    let counters = &context.counters;

    while !context.stop.load(Ordering::Acquire) {
        let expected = runtime.raw.len();
        match context.driver.read(&mut runtime.raw, READ_TIMEOUT) {
            Ok(n) if n == expected => {}
            Ok(n) => {
                log::debug!("Short read ({} of {} words), skipping cycle", n, expected);
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                thread::sleep(SKIP_BACKOFF);
                continue;
            }
            Err(DriverError::Timeout) | Err(DriverError::Stopped) => {
                log::debug!("No samples this cycle, skipping");
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                thread::sleep(SKIP_BACKOFF);
                continue;
            }
            Err(e) => {
                log::warn!("Capture read failed: {}", e);
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                thread::sleep(SKIP_BACKOFF);
                continue;
            }
        }

        let spectrum = runtime.process(context.clock.now_ms());
        if spectrum.beat_detected {
            counters.beats.fetch_add(1, Ordering::Relaxed);
        }
        context.publish.publish(spectrum);
        counters.published.fetch_add(1, Ordering::Relaxed);
    }

    log::info!("Capture thread exiting");
    let _ = context.exit_tx.send(());
}
