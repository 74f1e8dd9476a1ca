//! Audio Engine Module - Mischen, Aufnahme und Audio-Assets
//!
//! Dieses Modul verwaltet:
//! - Producer (Quellen) und Consumer (Senken) der Engine
//! - Die Hardware-Anbindung über cpal (mit stillem Fallback)
//! - Soundeffekte, gecachte Sprachausgabe und WAV-Aufnahme

mod buffer;
mod consumer;
mod device;
mod effects;
mod engine;
mod error;
mod producer;
mod recorder;
mod tts_cache;

pub use buffer::{split_into_frames, AudioBuffer, AudioFrame, ChunkResizer, Dequeue};
pub use consumer::{AudioConsumer, ConsumerCallback, ConsumerId};
pub use device::DeviceMode;
pub use effects::{normalize_peak, read_wav, EffectPlayer, SoundEffect, SOUND_EFFECT_PRODUCER};
pub use engine::AudioEngine;
pub use error::AudioError;
pub use producer::AudioProducer;
pub use recorder::{Recording, WavRecorder};
pub use tts_cache::{pcm_from_bytes, pcm_to_bytes, TtsCache, VoiceParams, TTS_PRODUCER};
