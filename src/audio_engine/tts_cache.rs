//! Cache für synthetisierte Sprache
//!
//! Jede Datei enthält rohes PCM16 (little endian, mono, native Rate) ohne
//! Header. Der Dateiname ist der SHA-256 aus Text und Stimmparametern.

use super::engine::AudioEngine;
use super::error::AudioError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const EXTENSION: &str = "pcm";

/// Producer, über den Sprachausgabe abgespielt wird
pub const TTS_PRODUCER: &str = "tts";

/// Stimmparameter, die das Ergebnis der Synthese bestimmen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub voice_id: String,
    pub model_id: String,
    pub stability: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
    pub pitch: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice_id: String::new(),
            model_id: String::new(),
            stability: 0.5,
            style: 0.0,
            use_speaker_boost: true,
            pitch: 0.0,
        }
    }
}

pub struct TtsCache {
    dir: PathBuf,
}

impl TtsCache {
    /// Öffnet (und erstellt bei Bedarf) das Cache-Verzeichnis
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, AudioError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        tracing::debug!("TTS cache at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hex-kodierter SHA-256 über Text und alle Stimmparameter
    pub fn cache_key(text: &str, params: &VoiceParams) -> String {
        let source = format!(
            "{}|{}|{}|{:?}|{:?}|{}|{:?}",
            text,
            params.voice_id,
            params.model_id,
            params.stability,
            params.style,
            if params.use_speaker_boost { "True" } else { "False" },
            params.pitch
        );
        hex::encode(Sha256::digest(source.as_bytes()))
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, EXTENSION))
    }

    /// Lädt gecachte Samples, `None` wenn noch nicht vorhanden
    pub async fn load(&self, text: &str, params: &VoiceParams) -> Result<Option<Vec<i16>>, AudioError> {
        let path = self.path_for(&Self::cache_key(text, params));
        match fs::read(&path).await {
            Ok(bytes) => {
                tracing::debug!("TTS cache hit: {}", path.display());
                Ok(Some(pcm_from_bytes(&bytes)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Speichert Samples atomar (temporäre Datei, dann umbenennen)
    pub async fn store(
        &self,
        text: &str,
        params: &VoiceParams,
        samples: &[i16],
    ) -> Result<PathBuf, AudioError> {
        let path = self.path_for(&Self::cache_key(text, params));
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&pcm_to_bytes(samples)).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;
        tracing::debug!("Stored {} samples in {}", samples.len(), path.display());
        Ok(path)
    }

    /// Spielt gecachte Sprache über den TTS-Producer ab.
    ///
    /// Der Producer wird neu angelegt, eine laufende Ausgabe also ersetzt.
    /// `None`, wenn für Text und Stimme noch nichts im Cache liegt.
    pub async fn play_cached(
        &self,
        engine: &AudioEngine,
        text: &str,
        params: &VoiceParams,
    ) -> Result<Option<usize>, AudioError> {
        let Some(samples) = self.load(text, params).await? else {
            tracing::debug!("TTS cache miss ({} chars)", text.chars().count());
            return Ok(None);
        };

        // Platz für die komplette Äußerung
        let frames = samples.len().div_ceil(engine.chunk_size().max(1));
        engine.add_producer(
            TTS_PRODUCER,
            None,
            frames.max(engine.config().play_buffer_size),
            None,
        );
        let added = engine.play_audio(&samples, TTS_PRODUCER, false);

        tracing::info!("Playing cached speech ({} frames)", added);
        Ok(Some(added))
    }

    pub async fn contains(&self, text: &str, params: &VoiceParams) -> bool {
        fs::try_exists(self.path_for(&Self::cache_key(text, params)))
            .await
            .unwrap_or(false)
    }
}

pub fn pcm_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> VoiceParams {
        VoiceParams {
            voice_id: "voice-1".into(),
            model_id: "model-a".into(),
            ..VoiceParams::default()
        }
    }

    #[test]
    fn test_cache_key_depends_on_parameters() {
        let a = TtsCache::cache_key("hello", &params());
        assert_eq!(a.len(), 64);
        assert_eq!(a, TtsCache::cache_key("hello", &params()));

        let mut other = params();
        other.pitch = 1.5;
        assert_ne!(a, TtsCache::cache_key("hello", &other));
        assert_ne!(a, TtsCache::cache_key("hello!", &params()));
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TtsCache::open(dir.path().join("tts")).await.unwrap();

        assert_eq!(cache.load("hi", &params()).await.unwrap(), None);
        assert!(!cache.contains("hi", &params()).await);

        let samples = vec![0, 1, -1, i16::MAX, i16::MIN];
        let path = cache.store("hi", &params(), &samples).await.unwrap();
        assert_eq!(path.extension().unwrap(), "pcm");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);

        assert!(cache.contains("hi", &params()).await);
        assert_eq!(cache.load("hi", &params()).await.unwrap(), Some(samples));
    }

    #[tokio::test]
    async fn test_play_cached_fills_tts_producer() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TtsCache::open(dir.path()).await.unwrap();
        let engine = AudioEngine::new(crate::config::AudioConfig {
            chunk_size: 4,
            play_buffer_size: 2,
            use_hardware: false,
            ..crate::config::AudioConfig::default()
        });

        assert_eq!(
            cache.play_cached(&engine, "hello", &params()).await.unwrap(),
            None
        );
        assert!(engine.producer(TTS_PRODUCER).is_none());

        // Länger als der Standardpuffer: wird trotzdem komplett eingereiht
        let speech: Vec<i16> = (1..=18).collect();
        cache.store("hello", &params(), &speech).await.unwrap();
        assert_eq!(
            cache.play_cached(&engine, "hello", &params()).await.unwrap(),
            Some(5)
        );

        let producer = engine.producer(TTS_PRODUCER).unwrap();
        assert!(!producer.is_looping());
        assert_eq!(producer.next_frame(), Some(vec![1, 2, 3, 4]));

        // Erneutes Abspielen ersetzt den Rest der vorigen Ausgabe
        cache.play_cached(&engine, "hello", &params()).await.unwrap();
        assert_eq!(engine.producer(TTS_PRODUCER).unwrap().buffered_frames(), 5);
        assert!(!producer.is_active());
    }

    #[test]
    fn test_odd_trailing_byte_is_ignored() {
        assert_eq!(pcm_from_bytes(&[0x01, 0x00, 0xff]), vec![1]);
    }
}
