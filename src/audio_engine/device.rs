//! Hardware-Anbindung über cpal
//!
//! Ein eigener Thread besitzt Input- und Output-Stream (cpal Streams sind
//! nicht `Send`). Der Output-Callback treibt die Engine: pro `chunk_size`
//! Samples genau ein `process_period`. Ohne nutzbares Gerät übernimmt ein
//! stiller Takt mit derselben Periodendauer.

use super::engine::AudioEngine;
use super::error::AudioError;
use crate::config::AudioConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Aufnahme-Puffer in Perioden
const CAPTURE_PERIODS: usize = 10;

/// Wie oft der Geräte-Thread auf das Stop-Signal prüft
const STOP_POLL: Duration = Duration::from_millis(50);

// ============================================================================
// DEVICE HANDLE
// ============================================================================

/// Betriebsart des Geräte-Threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Echte Ein-/Ausgabe über cpal
    Hardware,
    /// Kein Gerät: Engine läuft mit stillem Takt
    Silent,
}

pub struct DeviceHandle {
    mode: DeviceMode,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    /// Beendet den Geräte-Thread und schließt die Streams
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(handle) = self.thread.take() else {
            return;
        };
        // Wird die Engine auf dem Geräte-Thread selbst freigegeben, nicht auf sich warten
        if handle.thread().id() == thread::current().id() {
            return;
        }
        handle.thread().unpark();
        if handle.join().is_err() {
            tracing::error!("Audio device thread panicked");
        }
    }
}

/// Startet den Geräte-Thread und wartet, bis feststeht, wie er läuft
pub fn spawn(engine: Weak<AudioEngine>, config: &AudioConfig) -> Result<DeviceHandle, AudioError> {
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<DeviceMode>(1);

    let thread_stop = Arc::clone(&stop);
    let config = config.clone();
    let thread = thread::Builder::new()
        .name("audio-device".into())
        .spawn(move || {
            if config.use_hardware {
                match open_streams(engine.clone(), &config) {
                    Ok(streams) => {
                        let _ = ready_tx.send(DeviceMode::Hardware);
                        while !thread_stop.load(Ordering::Acquire) {
                            thread::park_timeout(STOP_POLL);
                        }
                        drop(streams);
                        tracing::info!("Audio streams stopped");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("{}, running silent clock instead", e);
                    }
                }
            }
            let _ = ready_tx.send(DeviceMode::Silent);
            run_silent_clock(engine, &config, &thread_stop);
        })?;

    let mode = ready_rx
        .recv()
        .map_err(|_| AudioError::StreamBuild("audio device thread exited early".into()))?;

    Ok(DeviceHandle {
        mode,
        stop,
        thread: Some(thread),
    })
}

// ============================================================================
// SILENT CLOCK
// ============================================================================

fn run_silent_clock(engine: Weak<AudioEngine>, config: &AudioConfig, stop: &AtomicBool) {
    let chunk_size = config.chunk_size.max(1);
    let period = Duration::from_secs_f64(chunk_size as f64 / config.sample_rate.max(1) as f64);
    let input = vec![0i16; chunk_size];
    let mut output = vec![0i16; chunk_size];
    let mut next = Instant::now();

    tracing::info!("Silent clock running: {:?} per period", period);

    while !stop.load(Ordering::Acquire) {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.process_period(&input, &mut output);
        drop(engine);

        next += period;
        let now = Instant::now();
        if next > now {
            thread::park_timeout(next - now);
        } else {
            next = now;
        }
    }
}

// ============================================================================
// HARDWARE STREAMS
// ============================================================================

fn open_streams(
    engine: Weak<AudioEngine>,
    config: &AudioConfig,
) -> Result<(Stream, Stream), AudioError> {
    let host = cpal::default_host();

    let input_device = host
        .default_input_device()
        .ok_or_else(|| AudioError::HardwareUnavailable("no input device".into()))?;
    let output_device = host
        .default_output_device()
        .ok_or_else(|| AudioError::HardwareUnavailable("no output device".into()))?;

    let input_config = select_config(
        input_device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
            .collect(),
        config.sample_rate,
    )?;
    let output_config = select_config(
        output_device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
            .collect(),
        config.sample_rate,
    )?;

    tracing::info!(
        "Opening audio device: {} Hz, {} in / {} out channel(s)",
        config.sample_rate,
        input_config.channels,
        output_config.channels
    );

    let capture = Arc::new(Mutex::new(HeapRb::<i16>::new(
        config.chunk_size.max(1) * CAPTURE_PERIODS,
    )));

    let input_stream = build_input_stream(&input_device, &input_config, Arc::clone(&capture))?;
    let output_stream =
        build_output_stream(&output_device, &output_config, capture, engine, config.chunk_size)?;

    input_stream
        .play()
        .map_err(|e| AudioError::StreamPlay(e.to_string()))?;
    output_stream
        .play()
        .map_err(|e| AudioError::StreamPlay(e.to_string()))?;

    Ok((input_stream, output_stream))
}

fn build_input_stream(
    device: &Device,
    config: &StreamConfig,
    capture: Arc<Mutex<HeapRb<i16>>>,
) -> Result<Stream, AudioError> {
    let channels = (config.channels as usize).max(1);

    device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let Some(mut ring) = capture.try_lock() else {
                    return;
                };
                // Nur der erste Kanal wird verwendet
                for frame in data.chunks(channels) {
                    let _ = ring.try_push(f32_to_i16(frame[0]));
                }
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuild(e.to_string()))
}

fn build_output_stream(
    device: &Device,
    config: &StreamConfig,
    capture: Arc<Mutex<HeapRb<i16>>>,
    engine: Weak<AudioEngine>,
    chunk_size: usize,
) -> Result<Stream, AudioError> {
    let channels = (config.channels as usize).max(1);
    let chunk_size = chunk_size.max(1);
    let mut pending: VecDeque<i16> = VecDeque::with_capacity(chunk_size * 2);
    let mut input = vec![0i16; chunk_size];
    let mut mixed = vec![0i16; chunk_size];

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames_needed = data.len() / channels;

                while pending.len() < frames_needed {
                    input.fill(0);
                    if let Some(mut ring) = capture.try_lock() {
                        if ring.occupied_len() >= chunk_size {
                            for sample in input.iter_mut() {
                                *sample = ring.try_pop().unwrap_or(0);
                            }
                        }
                    }

                    match engine.upgrade() {
                        Some(engine) => engine.process_period(&input, &mut mixed),
                        None => mixed.fill(0),
                    }
                    pending.extend(mixed.iter().copied());
                }

                // Mono auf alle Kanäle verteilen
                for frame in data.chunks_mut(channels) {
                    let sample = i16_to_f32(pending.pop_front().unwrap_or(0));
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                tracing::error!("Audio playback error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuild(e.to_string()))
}

/// Wählt eine f32-Konfiguration mit der nativen Sample-Rate (möglichst wenige Kanäle)
fn select_config(
    configs: Vec<SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Result<StreamConfig, AudioError> {
    let target = cpal::SampleRate(sample_rate);

    configs
        .into_iter()
        .filter(|c| {
            c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= target
                && c.max_sample_rate() >= target
        })
        .min_by_key(|c| c.channels())
        .map(|c| c.with_sample_rate(target).config())
        .ok_or_else(|| {
            AudioError::UnsupportedConfig(format!("no f32 configuration at {} Hz", sample_rate))
        })
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}
