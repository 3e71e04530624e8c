//! Host input driver built on cpal
//!
//! Emulates the I2S peripheral on a desktop: a dedicated thread owns the
//! `cpal::Stream` (which is not `Send` on every platform), the stream
//! callback encodes samples as 24-bit I2S words into a bounded ring that
//! plays the role of the DMA buffers, and `read` drains that ring with a
//! deadline the way a blocking I2S read does.

use super::{sample_to_frame, CaptureDriver, DriverError, DriverParams};
use crate::audio::config::I2sPins;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Commands sent to the stream thread
enum StreamCommand {
    Stop,
}

struct StreamThread {
    command_tx: mpsc::Sender<StreamCommand>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct RingState {
    frames: VecDeque<i32>,
    capacity: usize,
    installed: bool,
    stopped: bool,
    overruns: u64,
}

impl RingState {
    fn push(&mut self, frame: i32) {
        // A full DMA ring overwrites its oldest buffer
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
            self.overruns += 1;
        }
        self.frames.push_back(frame);
    }
}

/// Frames handed from the stream callback to the capture worker
#[derive(Default)]
struct FrameRing {
    state: Mutex<RingState>,
    ready: Condvar,
}

/// Capture driver reading a host input device through cpal
pub struct CpalDriver {
    /// Input device name, `None` for the host default
    device_name: Option<String>,
    ring: Arc<FrameRing>,
    stream: Mutex<Option<StreamThread>>,
}

impl CpalDriver {
    /// Driver for the default input device
    pub fn new() -> Self {
        Self::with_device(None)
    }

    /// Driver for a named input device
    pub fn with_device(device_name: Option<String>) -> Self {
        Self {
            device_name,
            ring: Arc::new(FrameRing::default()),
            stream: Mutex::new(None),
        }
    }

    /// Frames dropped because the worker fell behind the device
    pub fn overruns(&self) -> u64 {
        self.ring.state.lock().overruns
    }
}

impl Default for CpalDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDriver for CpalDriver {
    fn install(&self, params: &DriverParams) -> Result<(), DriverError> {
        let mut stream = self.stream.lock();
        if stream.is_some() {
            return Err(DriverError::AlreadyInstalled);
        }

        {
            let mut ring = self.ring.state.lock();
            *ring = RingState {
                frames: VecDeque::with_capacity(params.ring_capacity()),
                capacity: params.ring_capacity(),
                ..Default::default()
            };
        }

        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let ring = self.ring.clone();
        let device_name = self.device_name.clone();
        let stream_params = params.clone();

        let handle = thread::Builder::new()
            .name("cpal-input".to_string())
            .spawn(move || {
                run_stream_thread(device_name, stream_params, ring, command_rx, ready_tx)
            })
            .map_err(|e| DriverError::Device(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.ring.state.lock().installed = true;
                *stream = Some(StreamThread { command_tx, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(DriverError::Device(
                    "stream thread exited during setup".to_string(),
                ))
            }
        }
    }

    fn set_pins(&self, pins: &I2sPins) -> Result<(), DriverError> {
        if self.stream.lock().is_none() {
            return Err(DriverError::NotInstalled);
        }
        log::debug!("Host input has no I2S pins, ignoring {:?}", pins);
        Ok(())
    }

    fn read(&self, buf: &mut [i32], timeout: Duration) -> Result<usize, DriverError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.ring.state.lock();
        if !state.installed {
            return Err(DriverError::NotInstalled);
        }

        let mut filled = 0;
        let mut timed_out = false;
        loop {
            if state.stopped {
                return Err(DriverError::Stopped);
            }

            let take = (buf.len() - filled).min(state.frames.len());
            for (dst, src) in buf[filled..filled + take]
                .iter_mut()
                .zip(state.frames.drain(..take))
            {
                *dst = src;
            }
            filled += take;

            if filled == buf.len() {
                return Ok(filled);
            }
            if timed_out {
                return if filled == 0 {
                    Err(DriverError::Timeout)
                } else {
                    Ok(filled)
                };
            }
            timed_out = self.ring.ready.wait_until(&mut state, deadline).timed_out();
        }
    }

    fn stop(&self) {
        self.ring.state.lock().stopped = true;
        self.ring.ready.notify_all();
    }

    fn uninstall(&self) {
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.command_tx.send(StreamCommand::Stop);
            let _ = stream.handle.join();
        }
        let mut ring = self.ring.state.lock();
        ring.frames.clear();
        ring.installed = false;
        drop(ring);
        self.ring.ready.notify_all();
    }
}

/// Owns the cpal stream for its whole lifetime
fn run_stream_thread(
    device_name: Option<String>,
    params: DriverParams,
    ring: Arc<FrameRing>,
    command_rx: mpsc::Receiver<StreamCommand>,
    ready_tx: mpsc::SyncSender<Result<(), DriverError>>,
) {
    let stream = match open_stream(device_name.as_deref(), &params, ring) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            log::error!("Input stream setup failed: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Park until told to stop or the driver is dropped
    match command_rx.recv() {
        Ok(StreamCommand::Stop) => log::info!("Input stream stopping"),
        Err(_) => log::info!("Input stream command channel disconnected"),
    }
    drop(stream);
}

fn open_stream(
    device_name: Option<&str>,
    params: &DriverParams,
    ring: Arc<FrameRing>,
) -> Result<cpal::Stream, DriverError> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| DriverError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DriverError::Device(format!("Input device not found: {}", name)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| DriverError::Device("No default input device".to_string()))?,
    };

    let supported = device
        .default_input_config()
        .map_err(|e| DriverError::Device(e.to_string()))?;
    let device_channels = supported.channels() as usize;

    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(params.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    log::info!(
        "Host input: {} Hz, {} device channel(s) -> {} I2S slot(s)",
        params.sample_rate,
        device_channels,
        params.channels
    );

    let out_channels = params.channels;
    let stream = match supported.sample_format() {
        SampleFormat::F32 => {
            build_stream::<f32>(&device, &config, ring, device_channels, out_channels)
        }
        SampleFormat::I16 => {
            build_stream::<i16>(&device, &config, ring, device_channels, out_channels)
        }
        SampleFormat::I32 => {
            build_stream::<i32>(&device, &config, ring, device_channels, out_channels)
        }
        SampleFormat::U16 => {
            build_stream::<u16>(&device, &config, ring, device_channels, out_channels)
        }
        other => {
            return Err(DriverError::Device(format!(
                "Unsupported sample format: {:?}",
                other
            )))
        }
    }
    .map_err(|e| DriverError::Device(e.to_string()))?;

    stream
        .play()
        .map_err(|e| DriverError::Device(e.to_string()))?;

    Ok(stream)
}

/// Build an input stream that frames device samples as I2S words
fn build_stream<T: cpal::Sample + cpal::SizedSample>(
    device: &Device,
    config: &StreamConfig,
    ring: Arc<FrameRing>,
    device_channels: usize,
    out_channels: usize,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    f32: cpal::FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mut state = ring.state.lock();
            for frame in data.chunks(device_channels.max(1)) {
                let left: f32 = cpal::Sample::from_sample(frame[0]);
                state.push(sample_to_frame(left));
                if out_channels == 2 {
                    let right: f32 = frame
                        .get(1)
                        .map(|s| cpal::Sample::from_sample(*s))
                        .unwrap_or(left);
                    state.push(sample_to_frame(right));
                }
            }
            drop(state);
            ring.ready.notify_one();
        },
        |err| {
            log::error!("Audio stream error: {}", err);
        },
        None,
    )
}
