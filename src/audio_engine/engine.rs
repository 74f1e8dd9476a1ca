//! Audio Engine - Mischt alle Producer und verteilt die Aufnahme an Consumer
//!
//! Pro Hardware-Periode läuft genau ein Durchgang von `process_period`:
//! Aufnahme an alle Consumer, je ein Frame pro Producer, Summe, Clipping.
//! Auf diesem Pfad wird nie blockiert; bei Contention wird übersprungen.

use super::buffer::{AudioFrame, Dequeue};
use super::consumer::{AudioConsumer, ConsumerCallback, ConsumerId};
use super::device::{self, DeviceHandle, DeviceMode};
use super::error::AudioError;
use super::producer::AudioProducer;
use crate::config::AudioConfig;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Wie lange der Requeue-Thread auf eine Anfrage wartet
const REQUEUE_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// REQUEUE
// ============================================================================

/// Anfrage, einen leergelaufenen Loop-Producer neu zu befüllen
struct RequeueRequest {
    producer: Weak<AudioProducer>,
    samples: Arc<[i16]>,
}

impl RequeueRequest {
    fn handle(self) -> usize {
        match self.producer.upgrade() {
            Some(producer) => {
                let added = producer.refill_loop(&self.samples);
                tracing::trace!("Requeued {} frames for '{}'", added, producer.name());
                added
            }
            None => 0,
        }
    }
}

// ============================================================================
// AUDIO ENGINE
// ============================================================================

/// Mischpult für alle Audio-Quellen und -Senken.
///
/// Wird als `Arc<AudioEngine>` an alle Dienste übergeben, die Audio brauchen.
pub struct AudioEngine {
    config: AudioConfig,
    producers: RwLock<HashMap<String, Arc<AudioProducer>>>,
    consumers: RwLock<Vec<Arc<AudioConsumer>>>,
    next_consumer_id: AtomicU64,
    requeue_tx: Sender<RequeueRequest>,
    requeue_rx: Receiver<RequeueRequest>,
    /// Akkumulator für den Mix, wird pro Periode wiederverwendet
    mix: Mutex<Vec<i32>>,
    running: Arc<AtomicBool>,
    requeue_worker: Mutex<Option<thread::JoinHandle<()>>>,
    device: Mutex<Option<DeviceHandle>>,
}

impl AudioEngine {
    /// Erstellt eine neue Engine (ohne Hardware zu öffnen)
    pub fn new(config: AudioConfig) -> Self {
        let (requeue_tx, requeue_rx) = crossbeam_channel::bounded(config.requeue_capacity.max(1));
        let chunk_size = config.chunk_size;

        tracing::info!(
            "AudioEngine initialized: {}Hz, {} samples per period",
            config.sample_rate,
            chunk_size
        );

        Self {
            config,
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(Vec::new()),
            next_consumer_id: AtomicU64::new(1),
            requeue_tx,
            requeue_rx,
            mix: Mutex::new(vec![0; chunk_size]),
            running: Arc::new(AtomicBool::new(false)),
            requeue_worker: Mutex::new(None),
            device: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Startet Requeue-Thread und Audio-Gerät.
    ///
    /// Ohne nutzbare Hardware läuft die Engine mit einem stillen Takt weiter.
    pub fn start(self: &Arc<Self>) -> Result<DeviceMode, AudioError> {
        if self.running.swap(true, Ordering::AcqRel) {
            let mode = self.device.lock().as_ref().map(DeviceHandle::mode);
            return Ok(mode.unwrap_or(DeviceMode::Silent));
        }

        let rx = self.requeue_rx.clone();
        let running = Arc::clone(&self.running);
        let worker = thread::Builder::new()
            .name("audio-requeue".into())
            .spawn(move || Self::run_requeue_worker(rx, running))
            .inspect_err(|_| self.running.store(false, Ordering::Release))?;
        *self.requeue_worker.lock() = Some(worker);

        let device = match device::spawn(Arc::downgrade(self), &self.config) {
            Ok(device) => device,
            Err(e) => {
                self.stop();
                return Err(e);
            }
        };
        let mode = device.mode();
        *self.device.lock() = Some(device);

        tracing::info!("AudioEngine started ({:?})", mode);
        Ok(mode)
    }

    /// Stoppt die Engine: erst alles deaktivieren, dann das Gerät schließen
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);

        for producer in self.producers.write().drain().map(|(_, p)| p) {
            producer.shutdown();
        }
        for consumer in self.consumers.write().drain(..) {
            consumer.set_active(false);
        }

        if let Some(device) = self.device.lock().take() {
            device.stop();
        }
        if let Some(worker) = self.requeue_worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("Requeue worker panicked");
            }
        }

        if was_running {
            tracing::info!("AudioEngine stopped");
        }
    }

    // ========================================================================
    // PRODUCERS
    // ========================================================================

    /// Legt einen Producer an. Ein gleichnamiger Producer wird ersetzt.
    pub fn add_producer(
        &self,
        name: &str,
        chunk_size: Option<usize>,
        buffer_size: usize,
        initial_volume: Option<f32>,
    ) -> Arc<AudioProducer> {
        let chunk_size = chunk_size.unwrap_or(self.config.chunk_size);
        if chunk_size != self.config.chunk_size {
            tracing::debug!(
                "Producer '{}' uses {} samples per frame, engine period is {}; re-chunking on output",
                name,
                chunk_size,
                self.config.chunk_size
            );
        }
        let producer = Arc::new(AudioProducer::new(
            name,
            chunk_size,
            buffer_size,
            initial_volume.unwrap_or(1.0),
        ));

        let previous = self
            .producers
            .write()
            .insert(name.to_string(), Arc::clone(&producer));
        if let Some(previous) = previous {
            previous.shutdown();
            tracing::info!("Replaced existing producer '{}'", name);
        } else {
            tracing::debug!("Added producer '{}' (buffer {})", name, buffer_size);
        }

        producer
    }

    /// Entfernt einen Producer (idempotent)
    pub fn remove_producer(&self, name: &str) -> bool {
        match self.producers.write().remove(name) {
            Some(producer) => {
                producer.shutdown();
                tracing::debug!("Removed producer '{}'", name);
                true
            }
            None => false,
        }
    }

    /// Beendet einen (loopenden) Producer sofort
    pub fn stop_producer(&self, name: &str) -> bool {
        if let Some(producer) = self.producer(name) {
            producer.clear_loop();
        }
        self.remove_producer(name)
    }

    pub fn producer(&self, name: &str) -> Option<Arc<AudioProducer>> {
        self.producers.read().get(name).cloned()
    }

    pub fn producer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.producers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Spielt Samples über den benannten Producer ab.
    ///
    /// Der Producer wird bei Bedarf angelegt. Gibt die Anzahl der
    /// eingereihten Frames zurück.
    pub fn play_audio(&self, samples: &[i16], producer_name: &str, looping: bool) -> usize {
        let producer = match self.producer(producer_name) {
            Some(producer) => producer,
            None => self.add_producer(producer_name, None, self.config.play_buffer_size, None),
        };

        if looping {
            producer.set_loop(samples);
        } else {
            producer.clear_loop();
        }

        let expected = samples.len().div_ceil(producer.chunk_size());
        let added = producer.enqueue_samples(samples);
        if added < expected {
            tracing::warn!(
                "Buffer full for producer '{}', dropped {} of {} frames",
                producer_name,
                expected - added,
                expected
            );
        } else {
            tracing::debug!("Added {} frames to producer '{}'", added, producer_name);
        }
        added
    }

    /// Setzt die Lautstärke eines Producers (wirkt auch auf gepufferte Frames)
    pub fn set_producer_volume(&self, name: &str, volume: f32) -> Result<(), AudioError> {
        let producer = self
            .producer(name)
            .ok_or_else(|| AudioError::UnknownProducer(name.to_string()))?;
        producer.set_volume(volume);
        Ok(())
    }

    // ========================================================================
    // CONSUMERS
    // ========================================================================

    /// Registriert einen Consumer für aufgenommenes Audio.
    ///
    /// Der Callback läuft auf dem Audio-Thread und darf nicht blockieren.
    pub fn add_consumer<F>(&self, callback: F, chunk_size: Option<usize>) -> Arc<AudioConsumer>
    where
        F: Fn(&[i16]) + Send + Sync + 'static,
    {
        let id = ConsumerId(self.next_consumer_id.fetch_add(1, Ordering::Relaxed));
        let callback: ConsumerCallback = Arc::new(callback);
        let consumer = Arc::new(AudioConsumer::new(
            id,
            callback,
            chunk_size,
            self.config.chunk_size,
        ));
        self.consumers.write().push(Arc::clone(&consumer));
        tracing::debug!("Added consumer {:?}", id);
        consumer
    }

    /// Entfernt einen Consumer (idempotent)
    pub fn remove_consumer(&self, id: ConsumerId) -> bool {
        let mut consumers = self.consumers.write();
        let Some(index) = consumers.iter().position(|c| c.id() == id) else {
            return false;
        };
        let consumer = consumers.remove(index);
        consumer.set_active(false);
        tracing::debug!("Removed consumer {:?}", id);
        true
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    // ========================================================================
    // REAL-TIME PATH
    // ========================================================================

    /// Ein Durchgang pro Hardware-Periode. Panics werden abgefangen und die
    /// Ausgabe für diese Periode stummgeschaltet.
    pub fn process_period(&self, input: &[i16], output: &mut [i16]) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.mix_period(input, output)));
        if result.is_err() {
            output.fill(0);
            tracing::error!("Audio period failed, output silenced");
        }
    }

    fn mix_period(&self, input: &[i16], output: &mut [i16]) {
        if let Some(consumers) = self.consumers.try_read() {
            for consumer in consumers.iter() {
                consumer.deliver(input);
            }
        }

        let mut scratch;
        let mut guard = self.mix.try_lock();
        let mix: &mut Vec<i32> = match guard.as_deref_mut() {
            Some(mix) => mix,
            None => {
                scratch = Vec::new();
                &mut scratch
            }
        };
        mix.clear();
        mix.resize(output.len(), 0);

        if let Some(producers) = self.producers.try_read() {
            for producer in producers.values() {
                match producer.pull_period(mix.len()) {
                    Dequeue::Frame(frame) => accumulate(mix, &frame),
                    // Nur ein wirklich leerer Puffer löst den Loop-Requeue aus
                    Dequeue::Empty => self.request_requeue(producer),
                    Dequeue::Busy => {}
                }
            }
        }

        for (out, acc) in output.iter_mut().zip(mix.iter()) {
            *out = (*acc).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        }
    }

    fn request_requeue(&self, producer: &Arc<AudioProducer>) {
        let Some(samples) = producer.take_requeue() else {
            return;
        };
        let request = RequeueRequest {
            producer: Arc::downgrade(producer),
            samples,
        };
        if let Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) =
            self.requeue_tx.try_send(request)
        {
            // Nächste Periode erneut versuchen
            producer.cancel_requeue();
        }
    }

    /// Arbeitet alle wartenden Requeue-Anfragen sofort ab
    pub fn drain_requeue_requests(&self) -> usize {
        let mut handled = 0;
        while let Ok(request) = self.requeue_rx.try_recv() {
            request.handle();
            handled += 1;
        }
        handled
    }

    fn run_requeue_worker(rx: Receiver<RequeueRequest>, running: Arc<AtomicBool>) {
        tracing::debug!("Requeue worker started");
        while running.load(Ordering::Acquire) {
            match rx.recv_timeout(REQUEUE_POLL) {
                Ok(request) => {
                    request.handle();
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("Requeue worker stopped");
    }
}

fn accumulate(mix: &mut [i32], frame: &AudioFrame) {
    for (acc, sample) in mix.iter_mut().zip(frame.iter()) {
        *acc += *sample as i32;
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEngine")
            .field("running", &self.is_running())
            .field("producers", &self.producer_names())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine(chunk_size: usize) -> AudioEngine {
        AudioEngine::new(AudioConfig {
            chunk_size,
            use_hardware: false,
            ..AudioConfig::default()
        })
    }

    fn run_period(engine: &AudioEngine) -> Vec<i16> {
        let input = vec![0; engine.chunk_size()];
        let mut output = vec![0; engine.chunk_size()];
        engine.process_period(&input, &mut output);
        output
    }

    #[test]
    fn test_play_audio_chunks_and_pads() {
        let engine = test_engine(640);
        engine.add_producer("p1", None, 100, None);

        let samples: Vec<i16> = (1..=2000).map(|s| s as i16).collect();
        assert_eq!(engine.play_audio(&samples, "p1", false), 4);

        let producer = engine.producer("p1").unwrap();
        assert_eq!(producer.buffered_frames(), 4);

        let frames: Vec<Vec<i16>> = (0..4).map(|_| producer.next_frame().unwrap()).collect();
        assert!(frames.iter().all(|f| f.len() == 640));
        assert_eq!(frames[0][0], 1);
        assert_eq!(frames[3][79], 2000);
        assert!(frames[3][80..].iter().all(|s| *s == 0));
    }

    #[test]
    fn test_play_audio_creates_producer() {
        let engine = test_engine(4);
        engine.play_audio(&[1, 2, 3, 4], "tts", false);

        let producer = engine.producer("tts").unwrap();
        assert_eq!(producer.capacity(), engine.config().play_buffer_size);
        assert_eq!(producer.buffered_frames(), 1);
    }

    #[test]
    fn test_add_producer_replaces_same_name() {
        let engine = test_engine(4);
        let old = engine.add_producer("fx", None, 10, None);
        old.enqueue(vec![1; 4]).unwrap();

        let new = engine.add_producer("fx", None, 10, None);
        assert!(!old.is_active());
        assert_eq!(old.buffered_frames(), 0);
        assert!(Arc::ptr_eq(&engine.producer("fx").unwrap(), &new));
        assert_eq!(engine.producer_names(), vec!["fx".to_string()]);
    }

    #[test]
    fn test_remove_producer_idempotent() {
        let engine = test_engine(4);
        engine.add_producer("p", None, 10, None);
        assert!(engine.remove_producer("p"));
        assert!(!engine.remove_producer("p"));
        assert!(!engine.remove_producer("never-existed"));
    }

    #[test]
    fn test_mix_sums_producers() {
        let engine = test_engine(4);
        engine.play_audio(&[100, 200, 300, 400], "a", false);
        engine.play_audio(&[1, 2, 3, 4], "b", false);

        assert_eq!(run_period(&engine), vec![101, 202, 303, 404]);
        // Beide leer: Stille
        assert_eq!(run_period(&engine), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_mix_clips_instead_of_wrapping() {
        let engine = test_engine(2);
        engine.play_audio(&[30_000, -30_000], "a", false);
        engine.play_audio(&[30_000, -30_000], "b", false);
        engine.play_audio(&[30_000, -30_000], "c", false);

        assert_eq!(run_period(&engine), vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_volume_change_affects_buffered_frames() {
        let engine = test_engine(2);
        engine.play_audio(&[10_000, 10_000, 10_000, 10_000], "v", false);

        assert_eq!(run_period(&engine), vec![10_000, 10_000]);

        engine.set_producer_volume("v", 0.0).unwrap();
        assert_eq!(run_period(&engine), vec![0, 0]);

        assert!(matches!(
            engine.set_producer_volume("missing", 0.5),
            Err(AudioError::UnknownProducer(_))
        ));
    }

    #[test]
    fn test_consumers_receive_input() {
        let engine = test_engine(4);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let consumer = engine.add_consumer(move |frame| sink.lock().push(frame.to_vec()), None);

        let mut output = vec![0; 4];
        engine.process_period(&[1, 2, 3, 4], &mut output);
        assert_eq!(*received.lock(), vec![vec![1, 2, 3, 4]]);

        assert!(engine.remove_consumer(consumer.id()));
        assert!(!engine.remove_consumer(consumer.id()));
        engine.process_period(&[5, 6, 7, 8], &mut output);
        assert_eq!(received.lock().len(), 1);
    }

    #[test]
    fn test_panicking_consumer_silences_period() {
        let engine = test_engine(2);
        engine.play_audio(&[500, 500], "p", false);
        engine.add_consumer(|_| panic!("consumer failure"), None);

        let mut output = vec![7, 7];
        engine.process_period(&[0, 0], &mut output);
        assert_eq!(output, vec![0, 0]);
    }

    #[test]
    fn test_loop_requeue_refills_producer() {
        let engine = test_engine(2);
        engine.play_audio(&[10, 20, 30], "loop", true);

        assert_eq!(run_period(&engine), vec![10, 20]);
        assert_eq!(run_period(&engine), vec![30, 0]);

        // Puffer leer: Anfrage geht an den Requeue-Kanal
        assert_eq!(run_period(&engine), vec![0, 0]);
        assert_eq!(engine.drain_requeue_requests(), 1);

        assert_eq!(run_period(&engine), vec![10, 20]);
        assert_eq!(run_period(&engine), vec![30, 0]);
    }

    #[test]
    fn test_stop_producer_ends_loop() {
        let engine = test_engine(2);
        engine.play_audio(&[10, 20], "loop", true);
        assert!(engine.stop_producer("loop"));

        assert_eq!(run_period(&engine), vec![0, 0]);
        assert_eq!(engine.drain_requeue_requests(), 0);
        assert!(engine.producer("loop").is_none());
    }

    #[test]
    fn test_smaller_producer_chunk_fills_whole_period() {
        let engine = test_engine(8);
        engine.add_producer("small", Some(4), 10, None);
        assert_eq!(engine.play_audio(&[100; 8], "small", false), 2);

        assert_eq!(run_period(&engine), vec![100; 8]);
        assert_eq!(run_period(&engine), vec![0; 8]);
    }

    #[test]
    fn test_larger_producer_chunk_keeps_every_sample() {
        let engine = test_engine(4);
        engine.add_producer("big", Some(8), 10, None);
        engine.play_audio(&[1, 2, 3, 4, 5, 6, 7, 8], "big", false);

        assert_eq!(run_period(&engine), vec![1, 2, 3, 4]);
        assert_eq!(run_period(&engine), vec![5, 6, 7, 8]);
        assert_eq!(run_period(&engine), vec![0; 4]);
    }

    #[test]
    fn test_mismatched_chunk_loop_requeues_after_drain() {
        let engine = test_engine(4);
        engine.add_producer("loop", Some(2), 10, None);
        engine.play_audio(&[1, 2, 3, 4, 5, 6], "loop", true);

        assert_eq!(run_period(&engine), vec![1, 2, 3, 4]);
        assert_eq!(engine.drain_requeue_requests(), 0);
        assert_eq!(run_period(&engine), vec![5, 6, 0, 0]);
        assert_eq!(run_period(&engine), vec![0; 4]);
        assert_eq!(engine.drain_requeue_requests(), 1);
        assert_eq!(run_period(&engine), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_start_and_stop_silent() {
        let engine = Arc::new(test_engine(160));
        let mode = engine.start().unwrap();
        assert_eq!(mode, DeviceMode::Silent);
        assert!(engine.is_running());

        let producer = engine.add_producer("p", None, 10, None);
        engine.stop();
        assert!(!engine.is_running());
        assert!(!producer.is_active());
        assert!(engine.producer_names().is_empty());
    }
}
