//! Frame-Puffer und Chunk-Resizer
//!
//! Der `AudioBuffer` ist eine begrenzte FIFO aus ganzen Frames. Die Lautstärke
//! wird erst beim Auslesen angewendet, damit Änderungen auch bereits gepufferte
//! Frames betreffen.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicU32, Ordering};

// ============================================================================
// TYPES
// ============================================================================

/// Ein Block aus mono PCM16 Samples mit nativer Sample-Rate
pub type AudioFrame = Vec<i16>;

/// Maximaler Verstärkungsfaktor (entspricht Lautstärke 1.0)
const UNITY_GAIN: i32 = i16::MAX as i32;

/// Ergebnis eines nicht blockierenden Lesezugriffs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeue {
    Frame(AudioFrame),
    /// Puffer ist leer
    Empty,
    /// Lock gerade belegt, der Puffer kann noch Frames enthalten
    Busy,
}

// ============================================================================
// AUDIO BUFFER
// ============================================================================

/// Begrenzte FIFO aus Frames mit Lautstärke beim Auslesen
pub struct AudioBuffer {
    frames: Mutex<HeapRb<AudioFrame>>,
    capacity: usize,
    /// f32-Bits der aktuellen Lautstärke
    volume: AtomicU32,
}

impl AudioBuffer {
    /// Erstellt einen neuen Puffer (mindestens ein Frame Kapazität)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(HeapRb::new(capacity)),
            capacity,
            volume: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    /// Hängt einen Frame an. Ist der Puffer voll, kommt der Frame zurück.
    pub fn put(&self, frame: AudioFrame) -> Result<(), AudioFrame> {
        self.frames.lock().try_push(frame)
    }

    /// Entnimmt den ältesten Frame, skaliert mit der aktuellen Lautstärke
    pub fn get(&self) -> Option<AudioFrame> {
        let frame = self.frames.lock().try_pop()?;
        Some(self.scale(frame))
    }

    /// Wie `get`, aber ohne zu blockieren. Contention ist nicht dasselbe wie leer.
    pub fn try_get(&self) -> Dequeue {
        let Some(mut frames) = self.frames.try_lock() else {
            return Dequeue::Busy;
        };
        match frames.try_pop() {
            Some(frame) => {
                drop(frames);
                Dequeue::Frame(self.scale(frame))
            }
            None => Dequeue::Empty,
        }
    }

    /// Verwirft alle gepufferten Frames
    pub fn clear(&self) {
        let mut frames = self.frames.lock();
        while frames.try_pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.frames.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Setzt die Lautstärke (auf 0.0 - 1.0 begrenzt)
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn scale(&self, mut frame: AudioFrame) -> AudioFrame {
        let gain = (self.volume() * UNITY_GAIN as f32) as i32;
        if gain >= UNITY_GAIN {
            return frame;
        }
        for sample in frame.iter_mut() {
            *sample = (*sample as i32 * gain / UNITY_GAIN) as i16;
        }
        frame
    }
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("volume", &self.volume())
            .finish()
    }
}

// ============================================================================
// CHUNKING
// ============================================================================

/// Teilt Samples in Frames fester Größe. Der letzte Frame wird mit Nullen aufgefüllt.
pub fn split_into_frames(samples: &[i16], chunk_size: usize) -> Vec<AudioFrame> {
    let chunk_size = chunk_size.max(1);
    samples
        .chunks(chunk_size)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(chunk_size, 0);
            frame
        })
        .collect()
}

/// Setzt beliebig lange Sample-Blöcke zu ganzen Frames zusammen.
///
/// Was nicht für einen ganzen Frame reicht, bleibt als Rest liegen und wird
/// dem nächsten `push` vorangestellt.
#[derive(Debug, Clone)]
pub struct ChunkResizer {
    chunk_size: usize,
    remainder: Vec<i16>,
}

impl ChunkResizer {
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            remainder: Vec::with_capacity(chunk_size),
        }
    }

    /// Nimmt Samples auf und gibt alle vollständigen Frames zurück
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.remainder.extend_from_slice(samples);

        let complete = self.remainder.len() / self.chunk_size;
        if complete == 0 {
            return Vec::new();
        }

        let tail = self.remainder.split_off(complete * self.chunk_size);
        let whole = std::mem::replace(&mut self.remainder, tail);
        whole
            .chunks_exact(self.chunk_size)
            .map(<[i16]>::to_vec)
            .collect()
    }

    /// Gibt den Rest als aufgefüllten Frame aus (Ende eines Streams)
    pub fn finish(&mut self) -> Option<AudioFrame> {
        if self.remainder.is_empty() {
            return None;
        }
        let mut frame = std::mem::take(&mut self.remainder);
        frame.resize(self.chunk_size, 0);
        Some(frame)
    }

    /// Anzahl der Samples, die noch auf einen ganzen Frame warten
    pub fn pending(&self) -> usize {
        self.remainder.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn reset(&mut self) {
        self.remainder.clear();
    }
}
