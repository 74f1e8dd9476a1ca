//! Audio-Producer: eine benannte Quelle, die vom Engine-Thread gemischt wird

use super::buffer::{split_into_frames, AudioBuffer, AudioFrame, ChunkResizer, Dequeue};
use super::error::AudioError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Benannte Audio-Quelle mit eigener Frame-FIFO
pub struct AudioProducer {
    name: String,
    chunk_size: usize,
    buffer: AudioBuffer,
    active: AtomicBool,
    looping: AtomicBool,
    /// Verhindert doppelte Requeue-Anfragen, solange eine unterwegs ist
    requeue_pending: AtomicBool,
    cached_original: Mutex<Option<Arc<[i16]>>>,
    resizer: Mutex<ChunkResizer>,
    /// Angebrochener Frame, wenn Producer- und Engine-Frame verschieden groß sind
    outlet: Mutex<Vec<i16>>,
}

impl AudioProducer {
    pub fn new(name: impl Into<String>, chunk_size: usize, buffer_size: usize, volume: f32) -> Self {
        let buffer = AudioBuffer::new(buffer_size);
        buffer.set_volume(volume);

        Self {
            name: name.into(),
            chunk_size: chunk_size.max(1),
            buffer,
            active: AtomicBool::new(true),
            looping: AtomicBool::new(false),
            requeue_pending: AtomicBool::new(false),
            cached_original: Mutex::new(None),
            resizer: Mutex::new(ChunkResizer::new(chunk_size)),
            outlet: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Reiht einen ganzen Frame ein
    pub fn enqueue(&self, frame: AudioFrame) -> Result<(), AudioError> {
        self.buffer
            .put(frame)
            .map_err(|_| AudioError::BufferOverflow(self.name.clone()))
    }

    /// Teilt Samples in Frames (letzter aufgefüllt) und reiht sie ein.
    ///
    /// Bei vollem Puffer wird der Rest verworfen. Gibt die Anzahl der
    /// eingereihten Frames zurück.
    pub fn enqueue_samples(&self, samples: &[i16]) -> usize {
        let mut added = 0;
        for frame in split_into_frames(samples, self.chunk_size) {
            if let Err(e) = self.enqueue(frame) {
                tracing::warn!("{}", e);
                break;
            }
            added += 1;
        }
        added
    }

    /// Streaming-Eingang: nur vollständige Frames werden eingereiht,
    /// der Rest wartet auf den nächsten Aufruf
    pub fn push_stream(&self, samples: &[i16]) -> usize {
        let frames = self.resizer.lock().push(samples);
        let mut added = 0;
        for frame in frames {
            match self.enqueue(frame) {
                Ok(()) => added += 1,
                Err(e) => tracing::debug!("{}", e),
            }
        }
        added
    }

    /// Schließt einen Stream ab und reiht den aufgefüllten Rest ein
    pub fn finish_stream(&self) -> Result<(), AudioError> {
        let rest = self.resizer.lock().finish();
        match rest {
            Some(frame) => self.enqueue(frame),
            None => Ok(()),
        }
    }

    /// Nächster gepufferter Frame in Producer-Größe. Nicht für den Audio-Thread.
    pub fn next_frame(&self) -> Option<AudioFrame> {
        if !self.is_active() {
            return None;
        }
        self.buffer.get()
    }

    /// Genau `len` Samples für eine Engine-Periode (nicht blockierend).
    ///
    /// Weicht die Frame-Größe des Producers ab, werden Frames zerlegt bzw.
    /// zusammengesetzt; der Rest bleibt für die nächste Periode liegen.
    /// Nur am Ende der gepufferten Daten wird mit Nullen aufgefüllt.
    pub fn pull_period(&self, len: usize) -> Dequeue {
        if !self.is_active() {
            return Dequeue::Empty;
        }
        let Some(mut outlet) = self.outlet.try_lock() else {
            return Dequeue::Busy;
        };

        if outlet.is_empty() {
            match self.buffer.try_get() {
                Dequeue::Frame(frame) if frame.len() == len => return Dequeue::Frame(frame),
                Dequeue::Frame(frame) => *outlet = frame,
                other => return other,
            }
        }
        while outlet.len() < len {
            match self.buffer.try_get() {
                Dequeue::Frame(frame) => outlet.extend_from_slice(&frame),
                Dequeue::Empty | Dequeue::Busy => break,
            }
        }

        let take = len.min(outlet.len());
        let mut period: AudioFrame = outlet.drain(..take).collect();
        period.resize(len, 0);
        Dequeue::Frame(period)
    }

    /// Liefert die Loop-Daten, falls ein Requeue fällig ist.
    ///
    /// Pro leerem Puffer wird höchstens eine Anfrage ausgelöst.
    pub fn take_requeue(&self) -> Option<Arc<[i16]>> {
        if !self.is_active() || !self.is_looping() {
            return None;
        }
        if self.requeue_pending.swap(true, Ordering::AcqRel) {
            return None;
        }
        let cached = self
            .cached_original
            .try_lock()
            .and_then(|cached| (*cached).clone());
        if cached.is_none() {
            self.requeue_pending.store(false, Ordering::Release);
        }
        cached
    }

    /// Gibt eine nicht zugestellte Requeue-Anfrage wieder frei
    pub fn cancel_requeue(&self) {
        self.requeue_pending.store(false, Ordering::Release);
    }

    /// Füllt den Puffer erneut mit den Loop-Daten (Hintergrund-Thread).
    /// Wurde der Loop inzwischen beendet, passiert nichts.
    pub fn refill_loop(&self, samples: &[i16]) -> usize {
        let added = if self.is_active() && self.is_looping() {
            self.enqueue_samples(samples)
        } else {
            0
        };
        self.requeue_pending.store(false, Ordering::Release);
        added
    }

    /// Aktiviert den Loop mit den gegebenen Original-Samples
    pub fn set_loop(&self, samples: &[i16]) {
        *self.cached_original.lock() = Some(Arc::from(samples));
        self.looping.store(true, Ordering::Release);
    }

    pub fn clear_loop(&self) {
        self.looping.store(false, Ordering::Release);
        *self.cached_original.lock() = None;
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn set_volume(&self, volume: f32) {
        self.buffer.set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.buffer.volume()
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    /// Samples eines angebrochenen Frames, die noch auf die nächste Periode warten
    pub fn pending_samples(&self) -> usize {
        self.outlet.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Verwirft gepufferte Frames und den Stream-Rest
    pub fn clear(&self) {
        self.buffer.clear();
        self.resizer.lock().reset();
        self.outlet.lock().clear();
    }

    /// Deaktiviert den Producer und leert alles
    pub fn shutdown(&self) {
        self.set_active(false);
        self.clear_loop();
        self.clear();
    }
}

impl std::fmt::Debug for AudioProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioProducer")
            .field("name", &self.name)
            .field("chunk_size", &self.chunk_size)
            .field("buffered", &self.buffered_frames())
            .field("active", &self.is_active())
            .field("looping", &self.is_looping())
            .finish()
    }
}
