//! Aufnahme in eine WAV-Datei
//!
//! Der Recorder hängt als Consumer an der Engine. Der Callback reicht Frames
//! nur per `try_send` weiter, geschrieben wird auf einem eigenen Thread.

use super::buffer::AudioFrame;
use super::consumer::ConsumerId;
use super::engine::AudioEngine;
use super::error::AudioError;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Frames, die zwischen Audio-Thread und Schreib-Thread warten dürfen
const RECORDER_QUEUE: usize = 256;

const WRITER_POLL: Duration = Duration::from_millis(50);

type Writer = hound::WavWriter<BufWriter<File>>;

/// Ergebnis einer abgeschlossenen Aufnahme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub path: PathBuf,
    pub samples: u64,
    /// Frames, die wegen voller Warteschlange verloren gingen
    pub dropped_frames: u64,
}

/// Schreibt die Aufnahme der Engine als mono PCM16 mit nativer Rate
pub struct WavRecorder {
    engine: Arc<AudioEngine>,
    consumer: ConsumerId,
    path: PathBuf,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    writer: Option<thread::JoinHandle<Result<u64, hound::Error>>>,
}

impl WavRecorder {
    /// Legt die Datei an und beginnt sofort mit der Aufnahme
    pub fn start(engine: &Arc<AudioEngine>, path: impl Into<PathBuf>) -> Result<Self, AudioError> {
        let path = path.into();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: engine.sample_rate(),
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| AudioError::Recording(format!("{}: {}", path.display(), e)))?;

        let (tx, rx) = crossbeam_channel::bounded::<AudioFrame>(RECORDER_QUEUE);
        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("audio-recorder".into())
            .spawn(move || write_frames(rx, writer, &thread_stop))?;

        let callback_dropped = Arc::clone(&dropped);
        let consumer = engine.add_consumer(
            move |frame| {
                if tx.try_send(frame.to_vec()).is_err() {
                    callback_dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            None,
        );

        tracing::info!("Recording to {}", path.display());
        Ok(Self {
            engine: Arc::clone(engine),
            consumer: consumer.id(),
            path,
            stop,
            dropped,
            writer: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Beendet die Aufnahme und schließt die Datei ab
    pub fn finish(mut self) -> Result<Recording, AudioError> {
        let samples = self.stop_writer()?;
        let recording = Recording {
            path: self.path.clone(),
            samples,
            dropped_frames: self.dropped.load(Ordering::Relaxed),
        };

        if recording.dropped_frames > 0 {
            tracing::warn!(
                "Recording {} lost {} frame(s)",
                recording.path.display(),
                recording.dropped_frames
            );
        }
        tracing::info!(
            "Recording finished: {} ({} samples)",
            recording.path.display(),
            recording.samples
        );
        Ok(recording)
    }

    fn stop_writer(&mut self) -> Result<u64, AudioError> {
        self.engine.remove_consumer(self.consumer);
        self.stop.store(true, Ordering::Release);

        let Some(handle) = self.writer.take() else {
            return Ok(0);
        };
        handle
            .join()
            .map_err(|_| AudioError::Recording("recorder thread panicked".into()))?
            .map_err(|e| AudioError::Recording(format!("{}: {}", self.path.display(), e)))
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.stop_writer() {
                tracing::error!("Failed to close recording: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for WavRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavRecorder")
            .field("path", &self.path)
            .field("consumer", &self.consumer)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

fn write_frames(
    rx: Receiver<AudioFrame>,
    mut writer: Writer,
    stop: &AtomicBool,
) -> Result<u64, hound::Error> {
    let mut written = 0u64;

    while !stop.load(Ordering::Acquire) {
        match rx.recv_timeout(WRITER_POLL) {
            Ok(frame) => written += write_frame(&mut writer, &frame)?,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // Was noch in der Warteschlange liegt, gehört zur Aufnahme
    while let Ok(frame) = rx.try_recv() {
        written += write_frame(&mut writer, &frame)?;
    }

    writer.finalize()?;
    Ok(written)
}

fn write_frame(writer: &mut Writer, frame: &[i16]) -> Result<u64, hound::Error> {
    for sample in frame {
        writer.write_sample(*sample)?;
    }
    Ok(frame.len() as u64)
}
