//! Scripted sample source
//!
//! Generates I2S frames from a closure instead of hardware. Used by the demo
//! (`--synthetic`) and by engine tests, which also need to inject the
//! failures real peripherals produce: install and pin errors, short reads,
//! reads that only return once the peripheral is stopped, and reads that
//! never return at all.

use super::{sample_to_frame, CaptureDriver, DriverError, DriverParams};
use crate::audio::config::I2sPins;
use crate::clock::{Clock, ManualClock};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mono signal as a function of frame index
pub type Generator = Box<dyn FnMut(u64) -> f32 + Send>;

/// How `read` behaves once installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadBehavior {
    /// Produce frames immediately
    #[default]
    Normal,

    /// Block until `stop()`, like a read parked on a dead bus
    BlockUntilStopped,

    /// Block until `release()`, ignoring `stop()`
    Wedged,
}

struct SynthState {
    params: Option<DriverParams>,
    stopped: bool,
    released: bool,
    parked_readers: usize,
    frame_index: u64,
    clock_base_ms: u64,
    short_reads_remaining: usize,
    generator: Generator,
    rng: StdRng,
}

/// Capture driver backed by a signal generator
pub struct SyntheticDriver {
    state: Mutex<SynthState>,
    wake: Condvar,
    clock: Option<Arc<ManualClock>>,
    noise: f32,
    realtime: bool,
    behavior: ReadBehavior,
    install_error: Option<String>,
    pin_error: Option<String>,
    installs: AtomicUsize,
    uninstalls: AtomicUsize,
    stops: AtomicUsize,
}

impl SyntheticDriver {
    pub fn new(generator: impl FnMut(u64) -> f32 + Send + 'static) -> Self {
        Self {
            state: Mutex::new(SynthState {
                params: None,
                stopped: false,
                released: false,
                parked_readers: 0,
                frame_index: 0,
                clock_base_ms: 0,
                short_reads_remaining: 0,
                generator: Box::new(generator),
                rng: StdRng::seed_from_u64(0x1ed5),
            }),
            wake: Condvar::new(),
            clock: None,
            noise: 0.0,
            realtime: false,
            behavior: ReadBehavior::Normal,
            install_error: None,
            pin_error: None,
            installs: AtomicUsize::new(0),
            uninstalls: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn silence() -> Self {
        Self::new(|_| 0.0)
    }

    /// 60 Hz kick bursts (40 ms each) at `bpm`
    pub fn click_track(bpm: f32, sample_rate: u32) -> Self {
        let rate = sample_rate as f32;
        let period = ((60.0 / bpm.max(1.0)) * rate) as u64;
        let burst = (0.04 * rate) as u64;
        Self::new(move |i| {
            let pos = i % period.max(1);
            if pos < burst {
                let t = pos as f32 / rate;
                0.8 * (2.0 * std::f32::consts::PI * 60.0 * t).sin()
            } else {
                0.0
            }
        })
    }

    /// Advance `clock` by the captured duration on every read
    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Add uniform noise of the given peak amplitude
    pub fn with_noise(mut self, amplitude: f32) -> Self {
        self.noise = amplitude.abs();
        self
    }

    /// Pace reads to wall-clock time
    pub fn realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    pub fn with_read_behavior(mut self, behavior: ReadBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn fail_install(mut self, message: &str) -> Self {
        self.install_error = Some(message.to_string());
        self
    }

    pub fn fail_pins(mut self, message: &str) -> Self {
        self.pin_error = Some(message.to_string());
        self
    }

    /// Return half-filled buffers for the next `count` reads
    pub fn with_short_reads(self, count: usize) -> Self {
        self.state.lock().short_reads_remaining = count;
        self
    }

    /// Let a [`ReadBehavior::Wedged`] read return
    pub fn release(&self) {
        self.state.lock().released = true;
        self.wake.notify_all();
    }

    /// Wait up to `timeout` for a reader to block in a
    /// [`ReadBehavior::BlockUntilStopped`] or [`ReadBehavior::Wedged`] read
    pub fn wait_for_parked_reader(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        self.wake
            .wait_while_for(&mut state, |s| s.parked_readers == 0, timeout);
        state.parked_readers > 0
    }

    pub fn is_installed(&self) -> bool {
        self.state.lock().params.is_some()
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::Acquire)
    }

    pub fn uninstall_count(&self) -> usize {
        self.uninstalls.load(Ordering::Acquire)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::Acquire)
    }
}

impl CaptureDriver for SyntheticDriver {
    fn install(&self, params: &DriverParams) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.params.is_some() {
            return Err(DriverError::AlreadyInstalled);
        }
        if let Some(message) = &self.install_error {
            return Err(DriverError::Device(message.clone()));
        }

        self.installs.fetch_add(1, Ordering::AcqRel);
        state.params = Some(params.clone());
        state.stopped = false;
        state.frame_index = 0;
        state.clock_base_ms = self.clock.as_ref().map(|c| c.now_ms()).unwrap_or(0);
        Ok(())
    }

    fn set_pins(&self, pins: &I2sPins) -> Result<(), DriverError> {
        if self.state.lock().params.is_none() {
            return Err(DriverError::NotInstalled);
        }
        match &self.pin_error {
            Some(message) => Err(DriverError::Pin(format!("{} ({:?})", message, pins))),
            None => Ok(()),
        }
    }

    fn read(&self, buf: &mut [i32], _timeout: Duration) -> Result<usize, DriverError> {
        let mut state = self.state.lock();
        let params = state.params.clone().ok_or(DriverError::NotInstalled)?;
        if state.stopped {
            return Err(DriverError::Stopped);
        }

        match self.behavior {
            ReadBehavior::Normal => {}
            ReadBehavior::BlockUntilStopped => {
                state.parked_readers += 1;
                self.wake.notify_all();
                self.wake.wait_while(&mut state, |s| !s.stopped);
                state.parked_readers -= 1;
                return Err(DriverError::Stopped);
            }
            ReadBehavior::Wedged => {
                state.parked_readers += 1;
                self.wake.notify_all();
                self.wake.wait_while(&mut state, |s| !s.released);
                state.parked_readers -= 1;
                return Err(DriverError::Stopped);
            }
        }

        let st = &mut *state;
        let channels = params.channels.max(1);
        let len = if st.short_reads_remaining > 0 {
            st.short_reads_remaining -= 1;
            buf.len() / 2
        } else {
            buf.len()
        };
        let frames = len / channels;

        for frame in buf[..frames * channels].chunks_mut(channels) {
            let mut sample = (st.generator)(st.frame_index);
            if self.noise > 0.0 {
                sample += st.rng.random_range(-self.noise..self.noise);
            }
            frame[0] = sample_to_frame(sample);
            // Right slot carries unrelated loud noise; analysis must ignore it
            for slot in frame.iter_mut().skip(1) {
                *slot = sample_to_frame(st.rng.random_range(-0.8..0.8));
            }
            st.frame_index += 1;
        }

        let captured_ms = st.frame_index * 1000 / params.sample_rate as u64;
        if let Some(clock) = &self.clock {
            clock.set(st.clock_base_ms + captured_ms);
        }
        drop(state);

        if self.realtime {
            let secs = frames as f64 / params.sample_rate as f64;
            std::thread::sleep(Duration::from_secs_f64(secs));
        }

        Ok(frames * channels)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::AcqRel);
        self.state.lock().stopped = true;
        self.wake.notify_all();
    }

    fn uninstall(&self) {
        let mut state = self.state.lock();
        if state.params.take().is_some() {
            self.uninstalls.fetch_add(1, Ordering::AcqRel);
        }
        state.stopped = false;
    }
}
