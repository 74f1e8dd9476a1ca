//! Companion Audio - Echtzeit-Audiokern eines sprachgesteuerten Begleitroboters
//!
//! Ein Audio-Kern mit:
//! - Mischpult aus benannten Producern und Consumern auf einem Audio-Thread
//! - Zustandsmaschine für Anrufe mit Join-Timeout
//! - Telefonie-Brücke (µ-law, 8 kHz <-> 16 kHz) über WebSocket und HTTP
//! - Event-Bus, Soundeffekten, Sprachausgabe-Cache und WAV-Aufnahme

pub mod audio_engine;
pub mod call;
pub mod config;
pub mod events;
pub mod signaling;
pub mod telephony;

use audio_engine::{
    AudioEngine, AudioError, DeviceMode, EffectPlayer, TtsCache, VoiceParams, WavRecorder,
};
use config::Config;
use events::EventBus;
use signaling::SignalingError;
use std::path::PathBuf;
use std::sync::Arc;
use telephony::{CallPlacer, TelephonyBridge, TelephonyError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Telephony error: {0}")]
    Telephony(#[from] TelephonyError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// RUNTIME
// ============================================================================

/// Alle laufenden Dienste des Audio-Kerns
pub struct Runtime {
    config: Config,
    bus: Arc<EventBus>,
    engine: Arc<AudioEngine>,
    effects: Arc<EffectPlayer>,
    tts_cache: TtsCache,
    telephony: Option<Arc<TelephonyBridge>>,
    servers: Vec<JoinHandle<()>>,
    device_mode: DeviceMode,
}

impl Runtime {
    /// Logging initialisieren; `RUST_LOG` ergänzt die Standard-Direktiven
    pub fn init_logging() {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in ["companion_audio=debug", "tungstenite=warn"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }

        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_err()
        {
            tracing::debug!("Logging already initialized");
        }
    }

    pub async fn start(config: Config) -> Result<Self, RuntimeError> {
        Self::start_with_placer(config, None).await
    }

    /// Wie `start`, mit einem Anbieter für ausgehende Anrufe
    pub async fn start_with_placer(
        config: Config,
        placer: Option<Arc<dyn CallPlacer>>,
    ) -> Result<Self, RuntimeError> {
        tracing::info!("Starting companion audio core...");

        let bus = Arc::new(EventBus::new(Handle::current()));
        let engine = Arc::new(AudioEngine::new(config.audio.clone()));

        let effects = Arc::new(EffectPlayer::new(
            Arc::clone(&engine),
            config.audio.assets_dir.clone(),
        ));
        effects.attach(&bus);

        let tts_cache = TtsCache::open(config.audio.tts_cache_dir.clone()).await?;
        tracing::info!("TTS cache at {}", tts_cache.dir().display());

        let device_mode = engine.start()?;
        tracing::info!("Audio engine running ({:?})", device_mode);

        let mut servers = Vec::new();
        let telephony = if config.telephony.enabled {
            let bridge = Arc::new(TelephonyBridge::new(
                Arc::clone(&engine),
                Arc::clone(&bus),
                &config,
                placer,
            )?);

            let http = signaling::bind(config.telephony.http_addr).await?;
            let media = signaling::bind(config.telephony.media_addr).await?;

            let http_bridge = Arc::clone(&bridge);
            servers.push(tokio::spawn(async move {
                if let Err(e) = signaling::serve_http(http, http_bridge).await {
                    tracing::error!("Telephony HTTP server stopped: {}", e);
                }
            }));
            let media_bridge = Arc::clone(&bridge);
            servers.push(tokio::spawn(async move {
                if let Err(e) = signaling::serve_media(media, media_bridge).await {
                    tracing::error!("Media stream server stopped: {}", e);
                }
            }));
            Some(bridge)
        } else {
            tracing::info!("Telephony disabled");
            None
        };

        Ok(Self {
            config,
            bus,
            engine,
            effects,
            tts_cache,
            telephony,
            servers,
            device_mode,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<AudioEngine> {
        &self.engine
    }

    pub fn effects(&self) -> &Arc<EffectPlayer> {
        &self.effects
    }

    pub fn tts_cache(&self) -> &TtsCache {
        &self.tts_cache
    }

    pub fn telephony(&self) -> Option<&Arc<TelephonyBridge>> {
        self.telephony.as_ref()
    }

    pub fn device_mode(&self) -> DeviceMode {
        self.device_mode
    }

    /// Spielt eine gecachte Äußerung ab; `false` bei Cache-Miss
    pub async fn speak_cached(&self, text: &str, params: &VoiceParams) -> Result<bool, RuntimeError> {
        let played = self
            .tts_cache
            .play_cached(&self.engine, text, params)
            .await?;
        Ok(played.is_some())
    }

    /// Nimmt das Mikrofon als WAV auf, bis der Recorder beendet wird
    pub fn start_recording(&self, path: impl Into<PathBuf>) -> Result<WavRecorder, RuntimeError> {
        Ok(WavRecorder::start(&self.engine, path)?)
    }

    /// Fährt in fester Reihenfolge herunter: Anruf, Server, Engine
    pub async fn shutdown(self) {
        tracing::info!("Shutting down companion audio core...");

        if let Some(bridge) = &self.telephony {
            bridge.lifecycle().shutdown().await;
        }
        for server in self.servers {
            server.abort();
        }
        self.effects.detach();
        self.engine.stop();

        tracing::info!("Shutdown complete");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("device_mode", &self.device_mode)
            .field("telephony", &self.telephony.is_some())
            .field("servers", &self.servers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;

    #[tokio::test]
    async fn test_start_and_shutdown_without_hardware() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            audio: AudioConfig {
                use_hardware: false,
                assets_dir: dir.path().join("assets"),
                tts_cache_dir: dir.path().join("tts"),
                ..AudioConfig::default()
            },
            ..Config::default()
        };
        config.telephony.http_addr = "127.0.0.1:0".parse().unwrap();
        config.telephony.media_addr = "127.0.0.1:0".parse().unwrap();

        let runtime = Runtime::start(config).await.unwrap();
        assert_eq!(runtime.device_mode(), DeviceMode::Silent);
        assert!(runtime.engine().is_running());
        assert!(runtime.tts_cache().dir().exists());

        let params = VoiceParams::default();
        assert!(!runtime.speak_cached("good morning", &params).await.unwrap());
        runtime
            .tts_cache()
            .store("good morning", &params, &[500; 640])
            .await
            .unwrap();
        assert!(runtime.speak_cached("good morning", &params).await.unwrap());
        assert!(runtime
            .engine()
            .producer(audio_engine::TTS_PRODUCER)
            .is_some());

        let recorder = runtime.start_recording(dir.path().join("mic.wav")).unwrap();
        let recording = recorder.finish().unwrap();
        assert!(recording.path.exists());

        let bridge = Arc::clone(runtime.telephony().unwrap());
        let engine = Arc::clone(runtime.engine());
        runtime.shutdown().await;
        assert!(!engine.is_running());
        assert_eq!(bridge.lifecycle().state(), call::CallState::Initialized);
    }
}
