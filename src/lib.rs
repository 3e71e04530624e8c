//! LED Panel Audio Library
//!
//! Audio-reactive analysis core for LED panel firmware: a capture engine that
//! turns I2S frames into band energies, beats and tempo on a background
//! thread, plus the render-side merge and beat-quantized scheduling used by
//! effects. `run()` drives a terminal demo of the whole pipeline.

pub mod audio;
pub mod clock;
pub mod scheduler;
pub mod state;

use audio::{AudioEngine, CaptureConfig, CaptureDriver, CpalDriver, SyntheticDriver};
use clock::Clock;
use scheduler::{BeatScheduler, Dispatch, DEFAULT_MAX_DELAY_MS};
use serde::Serialize;
use state::ConsumerAudioState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Render cadence of the demo loop (25 fps)
const FRAME_INTERVAL: Duration = Duration::from_millis(40);

const BAR_GLYPHS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Demo errors
#[derive(Error, Debug)]
pub enum DemoError {
    #[error("Invalid arguments: {0}")]
    Args(String),

    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Device enumeration failed: {0}")]
    Devices(#[from] audio::SourceError),
}

/// Visual mode cycled by triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectMode {
    #[default]
    Solid,
    Spectrum,
    Pulse,
    Ripple,
}

impl EffectMode {
    pub fn next(self) -> Self {
        match self {
            EffectMode::Solid => EffectMode::Spectrum,
            EffectMode::Spectrum => EffectMode::Pulse,
            EffectMode::Pulse => EffectMode::Ripple,
            EffectMode::Ripple => EffectMode::Solid,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EffectMode::Solid => "solid",
            EffectMode::Spectrum => "spectrum",
            EffectMode::Pulse => "pulse",
            EffectMode::Ripple => "ripple",
        }
    }
}

/// Command line options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemoOptions {
    /// Print JSON frames instead of bars
    pub json: bool,

    /// Use a synthetic click track at this tempo instead of a device
    pub synthetic_bpm: Option<f32>,

    /// Input device name
    pub device: Option<String>,

    /// Partial `CaptureConfig` JSON file
    pub config_path: Option<PathBuf>,

    pub list_devices: bool,
}

/// Parse arguments (without the program name)
pub fn parse_args(args: &[String]) -> Result<DemoOptions, DemoError> {
    let mut options = DemoOptions::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => options.json = true,
            "--list-devices" => options.list_devices = true,
            "--synthetic" => {
                let value = iter
                    .next()
                    .ok_or_else(|| DemoError::Args("--synthetic needs a BPM".to_string()))?;
                let bpm: f32 = value
                    .parse()
                    .map_err(|_| DemoError::Args(format!("bad BPM: {}", value)))?;
                if !(30.0..=240.0).contains(&bpm) {
                    return Err(DemoError::Args(format!("BPM out of range: {}", bpm)));
                }
                options.synthetic_bpm = Some(bpm);
            }
            "--device" => {
                let value = iter
                    .next()
                    .ok_or_else(|| DemoError::Args("--device needs a name".to_string()))?;
                options.device = Some(value.clone());
            }
            "--config" => {
                let value = iter
                    .next()
                    .ok_or_else(|| DemoError::Args("--config needs a path".to_string()))?;
                options.config_path = Some(PathBuf::from(value));
            }
            other => return Err(DemoError::Args(format!("unknown argument: {}", other))),
        }
    }

    Ok(options)
}

/// Load a capture config, falling back to defaults for missing fields
pub fn load_config(path: Option<&PathBuf>) -> Result<CaptureConfig, DemoError> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|source| DemoError::ConfigRead {
                path: path.clone(),
                source,
            })?;
            Ok(serde_json::from_str(&text)?)
        }
        None => Ok(CaptureConfig::default()),
    }
}

/// One line of bar-meter output
pub fn render_bars(state: &ConsumerAudioState, mode: EffectMode) -> String {
    let bars: String = state
        .band_energy
        .iter()
        .map(|&e| {
            let level = (e.clamp(0.0, 1.0) * 8.0).round() as usize;
            BAR_GLYPHS[level.min(8)]
        })
        .collect();

    format!(
        "[{:<8}] {} rms {:.2} bpm {:>5.1} phase {:.2} {}",
        mode.name(),
        bars,
        state.energy,
        state.bpm,
        state.beat_phase,
        if state.beat_detected { "*" } else { " " }
    )
}

/// JSON frame output
#[derive(Serialize)]
struct FrameReport<'a> {
    now_ms: u64,
    mode: EffectMode,
    audio: &'a ConsumerAudioState,
}

/// Entry point of the demo binary
pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = try_run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn try_run(args: &[String]) -> Result<(), DemoError> {
    let options = parse_args(args)?;

    if options.list_devices {
        for device in audio::list_input_devices()? {
            println!(
                "{}{} ({} Hz, {} ch)",
                if device.is_default { "* " } else { "  " },
                device.name,
                device.sample_rate.map_or("?".to_string(), |r| r.to_string()),
                device.channels.map_or("?".to_string(), |c| c.to_string()),
            );
        }
        return Ok(());
    }

    let config = load_config(options.config_path.as_ref())?;

    let driver: Arc<dyn CaptureDriver> = match options.synthetic_bpm {
        Some(bpm) => {
            log::info!("Using synthetic click track at {} BPM", bpm);
            Arc::new(
                SyntheticDriver::click_track(bpm, config.sample_rate)
                    .with_noise(0.02)
                    .realtime(true),
            )
        }
        None => Arc::new(CpalDriver::with_device(options.device.clone())),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;

    runtime.block_on(render_loop(driver, config, options.json));
    // The stdin reader may still be parked on a blocking read
    runtime.shutdown_timeout(Duration::from_millis(100));
    Ok(())
}

async fn render_loop(driver: Arc<dyn CaptureDriver>, config: CaptureConfig, json: bool) {
    let mut engine = AudioEngine::new(driver);
    if let Err(e) = engine.begin(config) {
        // Keep rendering; effects see the silent state
        log::error!("Audio capture unavailable: {}", e);
    }
    let clock = engine.clock();

    let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(8);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            if trigger_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let mut interval = tokio::time::interval(FRAME_INTERVAL);
    let mut audio = ConsumerAudioState::default();
    let mut scheduler = BeatScheduler::new();
    let mut mode = EffectMode::default();

    log::info!("Render loop started; press Enter to change mode");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Render loop received shutdown signal");
                break;
            }
            Some(()) = trigger_rx.recv() => {
                let now = clock.now_ms();
                match scheduler.trigger(mode.next(), &audio, now, DEFAULT_MAX_DELAY_MS) {
                    Dispatch::Now(next) => {
                        mode = next;
                        log::info!("Mode: {}", mode.name());
                    }
                    Dispatch::Deferred { deadline_ms } => {
                        log::debug!("Mode change held for beat (deadline {} ms)", deadline_ms);
                    }
                    Dispatch::Ignored => log::debug!("Mode change already pending"),
                }
            }
            _ = interval.tick() => {
                let now = clock.now_ms();
                audio.update(&engine, now);

                if let Some(next) = scheduler.tick(&audio, now) {
                    mode = next;
                    log::info!("Mode: {} (on beat)", mode.name());
                }

                if json {
                    let report = FrameReport { now_ms: now, mode, audio: &audio };
                    match serde_json::to_string(&report) {
                        Ok(line) => println!("{}", line),
                        Err(e) => log::error!("Failed to encode frame: {}", e),
                    }
                } else {
                    println!("{}", render_bars(&audio, mode));
                }
            }
        }
    }

    if let Some(stats) = engine.stats() {
        log::info!(
            "Capture stats: {} published, {} skipped, {} beats",
            stats.cycles_published,
            stats.cycles_skipped,
            stats.beats_detected
        );
    }
    engine.end();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_args_defaults_to_device_bars() {
        assert_eq!(parse_args(&[]).unwrap(), DemoOptions::default());
    }

    #[test]
    fn parse_args_reads_all_options() {
        let options = parse_args(&args(&[
            "--json",
            "--synthetic",
            "128",
            "--device",
            "USB Mic",
            "--config",
            "panel.json",
        ]))
        .unwrap();

        assert!(options.json);
        assert_eq!(options.synthetic_bpm, Some(128.0));
        assert_eq!(options.device.as_deref(), Some("USB Mic"));
        assert_eq!(options.config_path, Some(PathBuf::from("panel.json")));
    }

    #[test]
    fn parse_args_rejects_bad_input() {
        assert!(matches!(parse_args(&args(&["--synthetic"])), Err(DemoError::Args(_))));
        assert!(matches!(
            parse_args(&args(&["--synthetic", "fast"])),
            Err(DemoError::Args(_))
        ));
        assert!(matches!(
            parse_args(&args(&["--synthetic", "500"])),
            Err(DemoError::Args(_))
        ));
        assert!(matches!(parse_args(&args(&["--loud"])), Err(DemoError::Args(_))));
    }

    #[test]
    fn load_config_without_path_is_default() {
        assert_eq!(load_config(None).unwrap(), CaptureConfig::default());
    }

    #[test]
    fn load_config_reports_missing_file() {
        let path = PathBuf::from("/nonexistent/led-panel-audio.json");
        assert!(matches!(
            load_config(Some(&path)),
            Err(DemoError::ConfigRead { .. })
        ));
    }

    #[test]
    fn modes_cycle() {
        let mut mode = EffectMode::default();
        let mut seen = vec![mode];
        for _ in 0..3 {
            mode = mode.next();
            seen.push(mode);
        }
        assert_eq!(
            seen,
            vec![
                EffectMode::Solid,
                EffectMode::Spectrum,
                EffectMode::Pulse,
                EffectMode::Ripple
            ]
        );
        assert_eq!(mode.next(), EffectMode::Solid);
    }

    #[test]
    fn bars_scale_with_band_energy() {
        let state = ConsumerAudioState {
            band_energy: [0.0, 0.125, 0.25, 0.5, 0.75, 1.0, 2.0, -1.0],
            beat_detected: true,
            bpm: 120.0,
            ..Default::default()
        };

        let line = render_bars(&state, EffectMode::Pulse);

        assert!(line.starts_with("[pulse   ] "));
        assert!(line.contains(" ▁▂▄▆██ "));
        assert!(line.contains("bpm 120.0"));
        assert!(line.ends_with('*'));
    }

    #[test]
    fn frame_report_serializes_state() {
        let audio = ConsumerAudioState {
            bpm: 100.0,
            next_beat_ms: Some(1234),
            ..Default::default()
        };
        let report = FrameReport {
            now_ms: 1000,
            mode: EffectMode::Ripple,
            audio: &audio,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "ripple");
        assert_eq!(json["audio"]["bpm"], 100.0);
        assert_eq!(json["audio"]["next_beat_ms"], 1234);
        assert_eq!(json["audio"]["band_energy"].as_array().unwrap().len(), 8);
    }
}
