//! Konfiguration
//!
//! Standardwerte, optional überschrieben durch eine JSON-Datei
//! (`COMPANION_CONFIG`) und danach durch `COMPANION_*` Umgebungsvariablen.
//! Eine `.env` Datei wird vorher geladen.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Native Sample-Rate in Hz
    pub sample_rate: u32,
    /// Samples pro Frame und pro Hardware-Periode
    pub chunk_size: usize,
    /// Standard-Puffergröße für `add_producer`
    pub producer_buffer_size: usize,
    /// Puffergröße für Producer, die `play_audio` selbst anlegt
    pub play_buffer_size: usize,
    pub requeue_capacity: usize,
    /// `false` erzwingt den stillen Takt ohne Hardware
    pub use_hardware: bool,
    pub assets_dir: PathBuf,
    pub tts_cache_dir: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_size: 640,
            producer_buffer_size: 100,
            play_buffer_size: 1000,
            requeue_capacity: 64,
            use_hardware: true,
            assets_dir: PathBuf::from("assets"),
            tts_cache_dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub join_timeout_ms: u64,
    pub leave_timeout_ms: u64,
    pub producer_buffer_size: usize,
    /// Frames, die zwischen Audio-Thread und Uplink gepuffert werden
    pub uplink_capacity: usize,
}

impl CallConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 10_000,
            leave_timeout_ms: 2_000,
            producer_buffer_size: 100,
            uplink_capacity: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    pub enabled: bool,
    pub http_addr: SocketAddr,
    pub media_addr: SocketAddr,
    /// Öffentliche WebSocket-URL, die im Call-Setup an die Gegenstelle geht
    pub media_url: String,
    /// Öffentliche Basis-URL des HTTP-Servers (Call-Setup und Status-Callbacks)
    pub public_url: String,
    /// Sample-Rate der Telefonleitung
    pub line_rate: u32,
    /// Klingeln ohne Antwort gilt danach als fehlgeschlagen
    pub join_timeout_ms: u64,
    pub producer_name: String,
}

impl TelephonyConfig {
    pub fn media_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.media_url).map_err(|e| ConfigError::InvalidValue {
            key: "telephony.media_url".into(),
            message: e.to_string(),
        })
    }

    pub fn twiml_url(&self) -> Result<Url, ConfigError> {
        self.public_endpoint("twiml")
    }

    pub fn status_url(&self) -> Result<Url, ConfigError> {
        self.public_endpoint("status")
    }

    fn public_endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        let invalid = |e: url::ParseError| ConfigError::InvalidValue {
            key: "telephony.public_url".into(),
            message: e.to_string(),
        };
        Url::parse(&self.public_url)
            .map_err(invalid)?
            .join(path)
            .map_err(invalid)
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            media_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            media_url: "ws://localhost:3000/".into(),
            public_url: "http://localhost:5000/".into(),
            line_rate: 8_000,
            join_timeout_ms: 60_000,
            producer_name: "twilio_call".into(),
        }
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub call: CallConfig,
    pub telephony: TelephonyConfig,
}

impl Config {
    /// Lädt `.env`, optional `COMPANION_CONFIG` und die Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }

        let mut config = match std::env::var("COMPANION_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Überschreibt Werte aus einer Variablen-Quelle (normalerweise die Umgebung)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let audio = &mut self.audio;
        override_value(&lookup, "COMPANION_SAMPLE_RATE", &mut audio.sample_rate)?;
        override_value(&lookup, "COMPANION_CHUNK_SIZE", &mut audio.chunk_size)?;
        override_value(&lookup, "COMPANION_USE_HARDWARE", &mut audio.use_hardware)?;
        override_value(&lookup, "COMPANION_ASSETS_DIR", &mut audio.assets_dir)?;
        override_value(&lookup, "COMPANION_TTS_CACHE_DIR", &mut audio.tts_cache_dir)?;

        let call = &mut self.call;
        override_value(&lookup, "COMPANION_JOIN_TIMEOUT_MS", &mut call.join_timeout_ms)?;
        override_value(&lookup, "COMPANION_LEAVE_TIMEOUT_MS", &mut call.leave_timeout_ms)?;

        let telephony = &mut self.telephony;
        override_value(&lookup, "COMPANION_TELEPHONY_ENABLED", &mut telephony.enabled)?;
        override_value(&lookup, "COMPANION_HTTP_ADDR", &mut telephony.http_addr)?;
        override_value(&lookup, "COMPANION_MEDIA_ADDR", &mut telephony.media_addr)?;
        override_value(&lookup, "COMPANION_MEDIA_URL", &mut telephony.media_url)?;
        override_value(&lookup, "COMPANION_PUBLIC_URL", &mut telephony.public_url)?;
        override_value(
            &lookup,
            "COMPANION_TELEPHONY_JOIN_TIMEOUT_MS",
            &mut telephony.join_timeout_ms,
        )?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.sample_rate == 0 || self.telephony.line_rate == 0 {
            return Err(ConfigError::Invalid("sample rates must be non-zero".into()));
        }
        if self.audio.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be non-zero".into()));
        }
        if self.audio.play_buffer_size == 0 || self.audio.producer_buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be non-zero".into()));
        }
        self.telephony.media_url()?;
        self.telephony.twiml_url()?;
        Ok(())
    }
}

fn override_value<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "companion", "companion-audio")
        .map(|dirs| dirs.cache_dir().join("tts"))
        .unwrap_or_else(|| PathBuf::from("cache/tts"))
}
