//! Soundeffekte
//!
//! Effekte sind eine geschlossene Menge; jeder Effekt hat eine WAV-Datei im
//! Asset-Verzeichnis. Abgespielt wird immer über den Producer
//! `sound_effect`, ein neuer Effekt ersetzt also den laufenden.

use super::engine::AudioEngine;
use super::error::AudioError;
use crate::events::{Event, EventBus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Name des Producers für Soundeffekte
pub const SOUND_EFFECT_PRODUCER: &str = "sound_effect";

/// Spitzenpegel nach der Normalisierung (80 % von Vollaussteuerung)
const EFFECT_PEAK: f32 = i16::MAX as f32 * 0.8;

// ============================================================================
// SOUND EFFECTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundEffect {
    BringBring,
    Chirp1,
    Chirp2,
    Chirp3,
    Chirp4,
    Chirp5,
    Lightning,
    MagicalSpell,
    Mystery,
    Rain,
    Tada,
    Wee,
    Whoosh,
    Yawn,
}

impl SoundEffect {
    pub const ALL: [SoundEffect; 14] = [
        SoundEffect::BringBring,
        SoundEffect::Chirp1,
        SoundEffect::Chirp2,
        SoundEffect::Chirp3,
        SoundEffect::Chirp4,
        SoundEffect::Chirp5,
        SoundEffect::Lightning,
        SoundEffect::MagicalSpell,
        SoundEffect::Mystery,
        SoundEffect::Rain,
        SoundEffect::Tada,
        SoundEffect::Wee,
        SoundEffect::Whoosh,
        SoundEffect::Yawn,
    ];

    /// Bezeichnung, wie sie in Events und Konfiguration verwendet wird
    pub fn name(self) -> &'static str {
        match self {
            SoundEffect::BringBring => "BRING_BRING",
            SoundEffect::Chirp1 => "CHIRP1",
            SoundEffect::Chirp2 => "CHIRP2",
            SoundEffect::Chirp3 => "CHIRP3",
            SoundEffect::Chirp4 => "CHIRP4",
            SoundEffect::Chirp5 => "CHIRP5",
            SoundEffect::Lightning => "LIGHTNING",
            SoundEffect::MagicalSpell => "MAGICAL_SPELL",
            SoundEffect::Mystery => "MYSTERY",
            SoundEffect::Rain => "RAIN",
            SoundEffect::Tada => "TADA",
            SoundEffect::Wee => "WEE",
            SoundEffect::Whoosh => "WHOOSH",
            SoundEffect::Yawn => "YAWN",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.wav", self.name().to_ascii_lowercase())
    }
}

impl std::fmt::Display for SoundEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SoundEffect {
    type Err = AudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SoundEffect::ALL
            .into_iter()
            .find(|effect| effect.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AudioError::Asset(format!("unknown sound effect: {}", s)))
    }
}

// ============================================================================
// WAV LOADING
// ============================================================================

/// Liest eine WAV-Datei als mono PCM16 (bei mehreren Kanälen nur der erste)
pub fn read_wav(path: &Path, expected_rate: u32) -> Result<Vec<i16>, AudioError> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| AudioError::Asset(format!("{}: {}", path.display(), e)))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    tracing::debug!(
        "WAV file {}: {} channel(s), {} bit, {} Hz",
        path.display(),
        spec.channels,
        spec.bits_per_sample,
        spec.sample_rate
    );

    if spec.sample_rate != expected_rate {
        tracing::warn!(
            "{} has {} Hz, expected {} Hz; playing unconverted",
            path.display(),
            spec.sample_rate,
            expected_rate
        );
    }

    let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::Asset(e.to_string()))?,
        (hound::SampleFormat::Int, 8) => reader
            .samples::<i8>()
            .map(|s| s.map(|s| (s as i16) << 8))
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::Asset(e.to_string()))?,
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::Asset(e.to_string()))?,
        (format, bits) => {
            return Err(AudioError::Asset(format!(
                "unsupported WAV format: {:?} {} bit",
                format, bits
            )))
        }
    };

    Ok(interleaved.into_iter().step_by(channels).collect())
}

/// Skaliert auf einheitlichen Spitzenpegel, damit alle Effekte gleich laut sind
pub fn normalize_peak(samples: &mut [i16]) {
    let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    if peak == 0 {
        return;
    }
    let factor = EFFECT_PEAK / peak as f32;
    for sample in samples.iter_mut() {
        *sample = (*sample as f32 * factor)
            .round()
            .clamp(-(i16::MAX as f32), i16::MAX as f32) as i16;
    }
}

// ============================================================================
// EFFECT PLAYER
// ============================================================================

/// Spielt Soundeffekte über die Engine ab und reagiert auf Bus-Events
pub struct EffectPlayer {
    engine: Arc<AudioEngine>,
    assets_dir: PathBuf,
    loaded: Mutex<HashMap<SoundEffect, Arc<[i16]>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EffectPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectPlayer")
            .field("assets_dir", &self.assets_dir)
            .field("loaded", &self.loaded.lock().len())
            .field("attached", &self.worker.lock().is_some())
            .finish()
    }
}

impl EffectPlayer {
    pub fn new(engine: Arc<AudioEngine>, assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            assets_dir: assets_dir.into(),
            loaded: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
        }
    }

    /// Verarbeitet `PlaySound` und `StopSound` vom Bus.
    ///
    /// Ein einzelner Task liest den Event-Stream, sodass Befehle in
    /// Veröffentlichungsreihenfolge ausgeführt werden: ein `StopSound` direkt
    /// nach `PlaySound` trifft immer auf den bereits gestarteten Effekt.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let mut events = bus.stream();
        let player = Arc::clone(self);

        let worker = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::PlaySound { effect, looping }) => {
                        let task_player = Arc::clone(&player);
                        let result =
                            tokio::task::spawn_blocking(move || task_player.play(effect, looping))
                                .await;
                        match result {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::error!("Failed to play {}: {}", effect, e),
                            Err(e) => tracing::error!("Sound effect task failed: {}", e),
                        }
                    }
                    Ok(Event::StopSound { effect }) => player.stop(effect),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Sound effect worker lagged, {} event(s) skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Sound effect worker stopped");
        });

        if let Some(previous) = self.worker.lock().replace(worker) {
            previous.abort();
        }
    }

    /// Beendet den Event-Task und einen laufenden Effekt
    pub fn detach(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        self.engine.stop_producer(SOUND_EFFECT_PRODUCER);
    }

    /// Spielt einen Effekt ab und ersetzt einen laufenden
    pub fn play(&self, effect: SoundEffect, looping: bool) -> Result<usize, AudioError> {
        let samples = self.load(effect)?;

        self.engine.add_producer(
            SOUND_EFFECT_PRODUCER,
            None,
            self.engine.config().play_buffer_size,
            Some(1.0),
        );
        let frames = self
            .engine
            .play_audio(&samples, SOUND_EFFECT_PRODUCER, looping);

        tracing::info!("Playing {} ({} frames, loop: {})", effect, frames, looping);
        Ok(frames)
    }

    /// Stoppt den laufenden Effekt
    pub fn stop(&self, effect: SoundEffect) {
        if self.engine.stop_producer(SOUND_EFFECT_PRODUCER) {
            tracing::info!("Sound effect {} stopped", effect);
        }
    }

    fn load(&self, effect: SoundEffect) -> Result<Arc<[i16]>, AudioError> {
        if let Some(samples) = self.loaded.lock().get(&effect) {
            return Ok(Arc::clone(samples));
        }

        let path = self.assets_dir.join(effect.file_name());
        let mut samples = read_wav(&path, self.engine.sample_rate())?;
        normalize_peak(&mut samples);
        let samples: Arc<[i16]> = samples.into();
        self.loaded.lock().insert(effect, Arc::clone(&samples));
        Ok(samples)
    }
}
