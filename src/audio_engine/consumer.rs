//! Audio-Consumer: Empfänger für aufgenommene Frames

use super::buffer::ChunkResizer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback, der auf dem Audio-Thread läuft und nicht blockieren darf
pub type ConsumerCallback = Arc<dyn Fn(&[i16]) + Send + Sync>;

/// Eindeutige Kennung eines Consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(pub u64);

pub struct AudioConsumer {
    id: ConsumerId,
    callback: ConsumerCallback,
    active: AtomicBool,
    /// Nur gesetzt, wenn der Consumer eine andere Frame-Größe wünscht
    resizer: Option<Mutex<ChunkResizer>>,
}

impl AudioConsumer {
    pub fn new(
        id: ConsumerId,
        callback: ConsumerCallback,
        chunk_size: Option<usize>,
        engine_chunk_size: usize,
    ) -> Self {
        let resizer = chunk_size
            .filter(|size| *size != engine_chunk_size)
            .map(|size| Mutex::new(ChunkResizer::new(size)));

        Self {
            id,
            callback,
            active: AtomicBool::new(true),
            resizer,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Übergibt einen aufgenommenen Frame an den Callback
    pub fn deliver(&self, frame: &[i16]) {
        if !self.is_active() {
            return;
        }

        match &self.resizer {
            None => (self.callback)(frame),
            Some(resizer) => {
                // Bei Contention wird der Frame für diesen Consumer übersprungen
                let Some(mut resizer) = resizer.try_lock() else {
                    return;
                };
                for chunk in resizer.push(frame) {
                    (self.callback)(&chunk);
                }
            }
        }
    }
}

impl std::fmt::Debug for AudioConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioConsumer")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("resized", &self.resizer.is_some())
            .finish()
    }
}
