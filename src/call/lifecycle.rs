//! Call Lifecycle - Zustandsmaschine eines Anrufs
//!
//! Jeder Zustandswechsel läuft serialisiert unter `transition_lock`:
//! Übergang prüfen, Zustand setzen, Event veröffentlichen, Handler ausführen.
//! Schlägt ein Handler fehl, landet der Anruf in ERROR.
//!
//! Solange der Anruf JOINED ist, hängt genau ein Producer/Consumer-Paar an
//! der Engine. Der Consumer-Callback läuft auf dem Audio-Thread und reicht
//! Frames nur per `try_send` an den Uplink-Task weiter.

use super::session::CallSession;
use super::state::{CallState, Capabilities};
use crate::audio_engine::{AudioConsumer, AudioEngine, AudioFrame, AudioProducer};
use crate::config::CallConfig;
use crate::events::{Event, EventBus};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: CallState, to: CallState },

    #[error("Call did not become ready in time")]
    JoinTimeout,

    #[error("Cannot start a new call in state {0}")]
    CannotStart(CallState),

    #[error("Call failed")]
    Failed,

    #[error("Call already ended")]
    Ended,

    #[error("Handler for {state} failed: {message}")]
    Handler { state: CallState, message: String },
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Verbindung zur Gegenstelle eines Anrufs (Telefonleitung, Konferenz, ...)
pub trait SessionTransport: Send + Sync {
    /// Uplink: ein aufgenommener Frame in nativer Rate
    fn send_audio(&self, frame: AudioFrame);

    /// Wird beim Eintritt in JOINED aufgerufen
    fn open_media(&self) -> Result<(), String> {
        Ok(())
    }

    /// Legt auf der Gegenseite auf
    fn hang_up(&self) -> BoxFuture<'_, ()>;
}

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Producer, über den die Gegenstelle abgespielt wird
    pub producer_name: String,
    pub buffer_size: usize,
    pub join_timeout: Duration,
    pub leave_timeout: Duration,
    pub uplink_capacity: usize,
}

impl LifecycleSettings {
    pub fn from_config(producer_name: impl Into<String>, config: &CallConfig) -> Self {
        Self {
            producer_name: producer_name.into(),
            buffer_size: config.producer_buffer_size,
            join_timeout: config.join_timeout(),
            leave_timeout: config.leave_timeout(),
            uplink_capacity: config.uplink_capacity.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadySignal {
    Pending,
    Ready,
    Failed,
    /// Anruf regulär beendet (LEAVING/LEFT)
    Ended,
}

/// Das an der Engine hängende Audio-Paar eines Anrufs
struct AttachedAudio {
    producer: Arc<AudioProducer>,
    consumer: Arc<AudioConsumer>,
    uplink: JoinHandle<()>,
}

// ============================================================================
// CALL LIFECYCLE
// ============================================================================

pub struct CallLifecycle {
    engine: Arc<AudioEngine>,
    bus: Arc<EventBus>,
    transport: Arc<dyn SessionTransport>,
    settings: LifecycleSettings,
    session: Mutex<CallSession>,
    transition_lock: AsyncMutex<()>,
    audio: Mutex<Option<AttachedAudio>>,
    join_timeout: Mutex<Option<JoinHandle<()>>>,
    state_tx: watch::Sender<CallState>,
    ready_tx: watch::Sender<ReadySignal>,
    self_ref: Weak<CallLifecycle>,
}

impl CallLifecycle {
    pub fn new(
        engine: Arc<AudioEngine>,
        bus: Arc<EventBus>,
        transport: Arc<dyn SessionTransport>,
        settings: LifecycleSettings,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(CallState::Initialized);
        let (ready_tx, _) = watch::channel(ReadySignal::Pending);

        Arc::new_cyclic(|self_ref| Self {
            engine,
            bus,
            transport,
            settings,
            session: Mutex::new(CallSession::new()),
            transition_lock: AsyncMutex::new(()),
            audio: Mutex::new(None),
            join_timeout: Mutex::new(None),
            state_tx,
            ready_tx,
            self_ref: self_ref.clone(),
        })
    }

    pub fn state(&self) -> CallState {
        self.session.lock().state
    }

    pub fn capabilities(&self) -> &'static Capabilities {
        self.state().capabilities()
    }

    pub fn session(&self) -> CallSession {
        self.session.lock().clone()
    }

    /// Receiver, der jeden Zustandswechsel sieht
    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// Wechselt in `new`, sofern die Übergangstabelle es erlaubt
    pub async fn transition_to(&self, new: CallState) -> Result<(), CallError> {
        let _guard = self.transition_lock.lock().await;
        self.transition_locked(new).await
    }

    /// Wechselt nur, wenn der aktuelle Zustand noch `expected` ist
    pub async fn transition_if(&self, expected: CallState, new: CallState) -> Result<bool, CallError> {
        let _guard = self.transition_lock.lock().await;
        if self.state() != expected {
            return Ok(false);
        }
        self.transition_locked(new).await.map(|_| true)
    }

    async fn transition_locked(&self, requested: CallState) -> Result<(), CallError> {
        let old = self.state();
        if !old.can_transition_to(requested) {
            tracing::warn!("Rejected call state transition {} -> {}", old, requested);
            return Err(CallError::InvalidStateTransition {
                from: old,
                to: requested,
            });
        }

        self.enter(old, requested);
        let Err(error) = self.run_handler(requested).await else {
            return Ok(());
        };

        tracing::error!("{}", error);
        if requested != CallState::Error {
            let current = self.state();
            if current.can_transition_to(CallState::Error) {
                self.enter(current, CallState::Error);
                if let Err(e) = self.run_handler(CallState::Error).await {
                    tracing::error!("{}", e);
                }
            }
        }
        Err(error)
    }

    fn enter(&self, old: CallState, new: CallState) {
        self.session.lock().state = new;
        self.state_tx.send_replace(new);

        tracing::info!("Call state: {} -> {}", old, new);
        self.bus.publish(Event::CallStateChanged {
            old,
            new,
            semantic: new.semantic(),
        });
    }

    async fn run_handler(&self, state: CallState) -> Result<(), CallError> {
        match state {
            CallState::Initialized => {
                self.cleanup().await;
                self.session.lock().participants.clear();
                self.ready_tx.send_replace(ReadySignal::Pending);
            }
            CallState::Joining => {
                self.release_audio().await;
                self.session.lock().participants.clear();
                self.ready_tx.send_replace(ReadySignal::Pending);
                self.bus.publish(Event::ConversationJoining);
                self.start_join_timeout();
            }
            CallState::Joined => {
                self.cancel_join_timeout().await;
                self.attach_audio().await;
                self.transport
                    .open_media()
                    .map_err(|message| CallError::Handler { state, message })?;
                self.ready_tx.send_replace(ReadySignal::Ready);
                self.bus.publish(Event::ConversationStarted);
            }
            CallState::Leaving => {
                self.ready_tx.send_replace(ReadySignal::Ended);
                // Audio sofort trennen, nicht erst nach dem Auflegen
                self.release_audio().await;
            }
            CallState::Left => {
                self.ready_tx.send_replace(ReadySignal::Ended);
                self.cleanup().await;
            }
            CallState::Error => {
                self.ready_tx.send_replace(ReadySignal::Failed);
                self.cleanup().await;
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    transport.hang_up().await;
                });
            }
        }
        Ok(())
    }

    // ========================================================================
    // JOIN TIMEOUT
    // ========================================================================

    fn start_join_timeout(&self) {
        let lifecycle = self.self_ref.clone();
        let timeout = self.settings.join_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(lifecycle) = lifecycle.upgrade() else {
                return;
            };
            // Eigenes Handle entfernen, damit das Cleanup diesen Task nicht abbricht
            drop(lifecycle.join_timeout.lock().take());
            lifecycle.on_join_timeout(timeout).await;
        });

        if let Some(previous) = self.join_timeout.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn on_join_timeout(&self, timeout: Duration) {
        let _guard = self.transition_lock.lock().await;
        if self.state() != CallState::Joining {
            return;
        }
        tracing::warn!("Call not joined within {:?}", timeout);
        if let Err(e) = self.transition_locked(CallState::Error).await {
            tracing::error!("Failed to enter error state after join timeout: {}", e);
        }
    }

    async fn cancel_join_timeout(&self) {
        let handle = self.join_timeout.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    // ========================================================================
    // AUDIO
    // ========================================================================

    async fn attach_audio(&self) {
        self.release_audio().await;

        let (volume, muted) = {
            let session = self.session.lock();
            (session.volume, session.muted)
        };

        let producer = self.engine.add_producer(
            &self.settings.producer_name,
            None,
            self.settings.buffer_size,
            Some(volume),
        );

        let (uplink_tx, mut uplink_rx) = mpsc::channel::<AudioFrame>(self.settings.uplink_capacity);
        let consumer = self.engine.add_consumer(
            move |frame| {
                // Voller Uplink: Frame verwerfen
                let _ = uplink_tx.try_send(frame.to_vec());
            },
            None,
        );
        consumer.set_active(!muted);

        let transport = Arc::clone(&self.transport);
        let uplink = tokio::spawn(async move {
            while let Some(frame) = uplink_rx.recv().await {
                transport.send_audio(frame);
            }
        });

        tracing::debug!("Call audio attached ('{}')", self.settings.producer_name);
        *self.audio.lock() = Some(AttachedAudio {
            producer,
            consumer,
            uplink,
        });
    }

    /// Trennt das Audio-Paar von der Engine. Gibt den abgebrochenen
    /// Uplink-Task zurück, der noch abgewartet werden muss.
    fn detach_audio(&self) -> Option<JoinHandle<()>> {
        let audio = self.audio.lock().take()?;

        // Nur entfernen, wenn der Producer nicht inzwischen ersetzt wurde
        let current = self.engine.producer(&self.settings.producer_name);
        if current.is_some_and(|p| Arc::ptr_eq(&p, &audio.producer)) {
            self.engine.remove_producer(&self.settings.producer_name);
        } else {
            audio.producer.shutdown();
        }
        self.engine.remove_consumer(audio.consumer.id());
        audio.uplink.abort();

        tracing::debug!("Call audio detached ('{}')", self.settings.producer_name);
        Some(audio.uplink)
    }

    async fn release_audio(&self) {
        if let Some(uplink) = self.detach_audio() {
            let _ = uplink.await;
        }
    }

    async fn cleanup(&self) {
        self.cancel_join_timeout().await;
        self.release_audio().await;
    }

    pub fn has_audio_attached(&self) -> bool {
        self.audio.lock().is_some()
    }

    // ========================================================================
    // CALL CONTROL
    // ========================================================================

    /// Startet einen neuen Anruf (nur aus INITIALIZED oder LEFT)
    pub async fn begin(&self) -> Result<Uuid, CallError> {
        let _guard = self.transition_lock.lock().await;

        let state = self.state();
        if !state.capabilities().can_start_new_call {
            return Err(CallError::CannotStart(state));
        }

        let id = {
            let mut session = self.session.lock();
            session.renew();
            session.id
        };
        tracing::info!("Starting call {}", id);

        self.transition_locked(CallState::Joining).await?;
        Ok(id)
    }

    /// Beendet den Anruf. Bestätigt die Gegenseite nicht rechtzeitig,
    /// wird LEFT erzwungen.
    pub async fn leave(&self) -> Result<(), CallError> {
        let state = self.state();
        if state.capabilities().is_terminal {
            tracing::debug!("leave() ignored in state {}", state);
            return Ok(());
        }

        if state == CallState::Joining {
            self.transport.hang_up().await;
            self.transition_if(CallState::Joining, CallState::Left)
                .await?;
            return Ok(());
        }

        if state == CallState::Joined {
            self.transition_if(CallState::Joined, CallState::Leaving)
                .await?;
        }
        self.transport.hang_up().await;

        let mut state_rx = self.state_tx.subscribe();
        let confirmed = matches!(
            tokio::time::timeout(
                self.settings.leave_timeout,
                state_rx.wait_for(|s| s.capabilities().is_terminal),
            )
            .await,
            Ok(Ok(_))
        );

        if !confirmed {
            tracing::warn!(
                "No LEFT confirmation within {:?}, forcing LEFT",
                self.settings.leave_timeout
            );
            self.transition_if(CallState::Leaving, CallState::Left)
                .await?;
        }
        Ok(())
    }

    /// Zurück nach INITIALIZED (aus LEFT oder ERROR)
    pub async fn reset(&self) -> Result<(), CallError> {
        let _guard = self.transition_lock.lock().await;
        if self.state() == CallState::Initialized {
            return Ok(());
        }
        self.transition_locked(CallState::Initialized).await
    }

    /// Beendet einen laufenden Anruf und setzt zurück
    pub async fn shutdown(&self) {
        if let Err(e) = self.leave().await {
            tracing::warn!("Leave during shutdown failed: {}", e);
        }
        if matches!(self.state(), CallState::Left | CallState::Error) {
            if let Err(e) = self.reset().await {
                tracing::warn!("Reset during shutdown failed: {}", e);
            }
        }
        self.cleanup().await;
    }

    /// Wartet, bis der Anruf JOINED (Ok) oder ERROR (Err) erreicht.
    /// Ein bereits beendeter Anruf liefert `CallError::Ended`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), CallError> {
        let mut ready_rx = self.ready_tx.subscribe();
        let outcome = tokio::time::timeout(
            timeout,
            ready_rx.wait_for(|signal| *signal != ReadySignal::Pending),
        )
        .await;

        match outcome {
            Ok(Ok(signal)) => match *signal {
                ReadySignal::Ready => Ok(()),
                ReadySignal::Ended => Err(CallError::Ended),
                ReadySignal::Pending | ReadySignal::Failed => Err(CallError::Failed),
            },
            Ok(Err(_)) => Err(CallError::Failed),
            Err(_) => Err(CallError::JoinTimeout),
        }
    }

    /// Übernimmt einen von der Gegenseite gemeldeten Zustand
    pub async fn apply_remote_state(&self, remote: CallState) -> Result<(), CallError> {
        let current = self.state();
        if remote == current || remote == CallState::Initialized {
            tracing::debug!("Ignoring remote state {} (local {})", remote, current);
            return Ok(());
        }

        if remote == CallState::Left && current == CallState::Joined {
            self.transition_if(CallState::Joined, CallState::Leaving)
                .await?;
        }
        self.transition_to(remote).await
    }

    // ========================================================================
    // AUDIO CONTROL
    // ========================================================================

    /// Downlink: beliebig lange Samples, werden zu Frames zusammengesetzt
    pub fn push_remote_audio(&self, samples: &[i16]) -> usize {
        if !self.capabilities().can_receive_audio {
            return 0;
        }
        match self.attached_producer() {
            Some(producer) => producer.push_stream(samples),
            None => 0,
        }
    }

    /// Downlink: ein ganzer Frame
    pub fn push_remote_frame(&self, frame: AudioFrame) -> bool {
        if !self.capabilities().can_receive_audio {
            return false;
        }
        let Some(producer) = self.attached_producer() else {
            return false;
        };
        match producer.enqueue(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("{}", e);
                false
            }
        }
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.session.lock().volume = volume;
        if let Some(producer) = self.attached_producer() {
            producer.set_volume(volume);
        }
    }

    pub fn volume(&self) -> f32 {
        self.session.lock().volume
    }

    pub fn set_muted(&self, muted: bool) {
        self.session.lock().muted = muted;
        if let Some(audio) = self.audio.lock().as_ref() {
            audio.consumer.set_active(!muted);
        }
        tracing::debug!("Call muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.session.lock().muted
    }

    fn attached_producer(&self) -> Option<Arc<AudioProducer>> {
        self.audio.lock().as_ref().map(|a| Arc::clone(&a.producer))
    }

    // ========================================================================
    // PARTICIPANTS
    // ========================================================================

    pub fn participant_joined(&self, participant: impl Into<String>) {
        let participant = participant.into();
        tracing::info!("Participant joined: {}", participant);
        self.session.lock().participants.insert(participant);
    }

    pub fn participant_left(&self, participant: &str) {
        if self.session.lock().participants.remove(participant) {
            tracing::info!("Participant left: {}", participant);
        }
    }

    pub fn participants(&self) -> Vec<String> {
        self.session.lock().participants.iter().cloned().collect()
    }
}

impl std::fmt::Debug for CallLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLifecycle")
            .field("state", &self.state())
            .field("producer", &self.settings.producer_name)
            .field("audio_attached", &self.has_audio_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<AudioFrame>>,
        hang_ups: AtomicUsize,
        fail_open: bool,
    }

    impl SessionTransport for MockTransport {
        fn send_audio(&self, frame: AudioFrame) {
            self.sent.lock().push(frame);
        }

        fn open_media(&self) -> Result<(), String> {
            if self.fail_open {
                Err("media path unavailable".into())
            } else {
                Ok(())
            }
        }

        fn hang_up(&self) -> BoxFuture<'_, ()> {
            self.hang_ups.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        }
    }

    struct Fixture {
        engine: Arc<AudioEngine>,
        transport: Arc<MockTransport>,
        lifecycle: Arc<CallLifecycle>,
    }

    fn fixture(transport: MockTransport) -> Fixture {
        let engine = Arc::new(AudioEngine::new(AudioConfig {
            chunk_size: 4,
            use_hardware: false,
            ..AudioConfig::default()
        }));
        let bus = Arc::new(EventBus::new(Handle::current()));
        let transport = Arc::new(transport);
        let settings = LifecycleSettings::from_config("daily_call", &CallConfig::default());
        let lifecycle = CallLifecycle::new(
            Arc::clone(&engine),
            bus,
            Arc::clone(&transport) as Arc<dyn SessionTransport>,
            settings,
        );
        Fixture {
            engine,
            transport,
            lifecycle,
        }
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let f = fixture(MockTransport::default());

        let result = f.lifecycle.transition_to(CallState::Joined).await;
        assert_eq!(
            result,
            Err(CallError::InvalidStateTransition {
                from: CallState::Initialized,
                to: CallState::Joined
            })
        );
        assert_eq!(f.lifecycle.state(), CallState::Initialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_enters_error() {
        let f = fixture(MockTransport::default());
        f.lifecycle.begin().await.unwrap();
        assert_eq!(f.lifecycle.state(), CallState::Joining);

        let ready = f.lifecycle.wait_ready(Duration::from_secs(30)).await;
        assert_eq!(ready, Err(CallError::Failed));
        assert_eq!(f.lifecycle.state(), CallState::Error);

        // Auflegen wird im Hintergrund angestoßen
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.transport.hang_ups.load(Ordering::SeqCst), 1);

        // Aus ERROR geht es nur zurück nach INITIALIZED
        assert!(f.lifecycle.transition_to(CallState::Joining).await.is_err());
        f.lifecycle.reset().await.unwrap();
        assert_eq!(f.lifecycle.state(), CallState::Initialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_cancels_timeout() {
        let f = fixture(MockTransport::default());
        f.lifecycle.begin().await.unwrap();
        f.lifecycle.transition_to(CallState::Joined).await.unwrap();

        f.lifecycle.wait_ready(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.lifecycle.state(), CallState::Joined);
    }

    #[tokio::test]
    async fn test_joined_attaches_exactly_one_pair() {
        let f = fixture(MockTransport::default());
        f.lifecycle.begin().await.unwrap();
        assert!(!f.lifecycle.has_audio_attached());

        f.lifecycle.transition_to(CallState::Joined).await.unwrap();
        assert!(f.lifecycle.has_audio_attached());
        assert_eq!(f.engine.producer_names(), vec!["daily_call".to_string()]);
        assert_eq!(f.engine.consumer_count(), 1);

        // Downlink
        assert!(f.lifecycle.push_remote_frame(vec![1, 2, 3, 4]));
        assert_eq!(f.lifecycle.push_remote_audio(&[5, 6, 7, 8, 9]), 1);
        assert_eq!(f.engine.producer("daily_call").unwrap().buffered_frames(), 2);

        // Uplink: Audio-Thread -> Transport
        let mut output = vec![0; 4];
        f.engine.process_period(&[9, 9, 9, 9], &mut output);
        assert_eq!(output, vec![1, 2, 3, 4]);
        for _ in 0..100 {
            if !f.transport.sent.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*f.transport.sent.lock(), vec![vec![9, 9, 9, 9]]);
    }

    #[tokio::test]
    async fn test_mute_and_volume() {
        let f = fixture(MockTransport::default());
        f.lifecycle.set_volume(0.25);
        f.lifecycle.set_muted(true);
        f.lifecycle.begin().await.unwrap();
        f.lifecycle.transition_to(CallState::Joined).await.unwrap();

        let producer = f.engine.producer("daily_call").unwrap();
        assert_eq!(producer.volume(), 0.25);

        let mut output = vec![0; 4];
        f.engine.process_period(&[1, 1, 1, 1], &mut output);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.transport.sent.lock().is_empty());

        f.lifecycle.set_volume(2.0);
        assert_eq!(producer.volume(), 1.0);
        assert!(f.lifecycle.is_muted());
    }

    #[tokio::test]
    async fn test_handler_failure_enters_error() {
        let f = fixture(MockTransport {
            fail_open: true,
            ..MockTransport::default()
        });
        f.lifecycle.begin().await.unwrap();

        let result = f.lifecycle.transition_to(CallState::Joined).await;
        assert!(matches!(
            result,
            Err(CallError::Handler {
                state: CallState::Joined,
                ..
            })
        ));
        assert_eq!(f.lifecycle.state(), CallState::Error);
        assert!(!f.lifecycle.has_audio_attached());
        assert!(f.engine.producer("daily_call").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_forces_left_without_confirmation() {
        let f = fixture(MockTransport::default());
        f.lifecycle.begin().await.unwrap();
        f.lifecycle.transition_to(CallState::Joined).await.unwrap();

        f.lifecycle.leave().await.unwrap();
        assert_eq!(f.lifecycle.state(), CallState::Left);
        assert_eq!(f.transport.hang_ups.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.lifecycle.wait_ready(Duration::from_millis(100)).await,
            Err(CallError::Ended)
        );
        assert!(!f.lifecycle.has_audio_attached());
        assert_eq!(f.engine.consumer_count(), 0);

        // Erneutes leave ist ein No-op
        f.lifecycle.leave().await.unwrap();
        assert_eq!(f.transport.hang_ups.load(Ordering::SeqCst), 1);

        // Neuer Anruf aus LEFT
        let first = f.lifecycle.session().id;
        let second = f.lifecycle.begin().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_remote_left_while_joined() {
        let f = fixture(MockTransport::default());
        let mut states = f.lifecycle.watch_state();
        f.lifecycle.begin().await.unwrap();
        f.lifecycle.apply_remote_state(CallState::Joined).await.unwrap();
        f.lifecycle.apply_remote_state(CallState::Joined).await.unwrap();

        f.lifecycle.apply_remote_state(CallState::Left).await.unwrap();
        assert_eq!(f.lifecycle.state(), CallState::Left);
        assert_eq!(*states.borrow_and_update(), CallState::Left);
    }

    #[tokio::test]
    async fn test_wait_ready_after_call_ended() {
        let f = fixture(MockTransport::default());
        f.lifecycle.begin().await.unwrap();
        f.lifecycle.transition_to(CallState::Joined).await.unwrap();
        f.lifecycle.wait_ready(Duration::from_millis(100)).await.unwrap();

        f.lifecycle.apply_remote_state(CallState::Left).await.unwrap();
        assert_eq!(f.lifecycle.state(), CallState::Left);
        assert_eq!(
            f.lifecycle.wait_ready(Duration::from_millis(100)).await,
            Err(CallError::Ended)
        );

        // Neuer Anruf wartet wieder
        f.lifecycle.begin().await.unwrap();
        f.lifecycle.transition_to(CallState::Joined).await.unwrap();
        f.lifecycle.wait_ready(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_uplink_task_finished_after_leave() {
        let f = fixture(MockTransport::default());
        // Fixture und Lifecycle
        assert_eq!(Arc::strong_count(&f.transport), 2);

        f.lifecycle.begin().await.unwrap();
        f.lifecycle.transition_to(CallState::Joined).await.unwrap();
        // Der Uplink-Task hält eine weitere Referenz
        assert_eq!(Arc::strong_count(&f.transport), 3);

        f.lifecycle.apply_remote_state(CallState::Left).await.unwrap();
        assert_eq!(Arc::strong_count(&f.transport), 2);
    }

    #[tokio::test]
    async fn test_begin_rejected_while_active() {
        let f = fixture(MockTransport::default());
        f.lifecycle.begin().await.unwrap();
        assert_eq!(
            f.lifecycle.begin().await,
            Err(CallError::CannotStart(CallState::Joining))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_participants_cleared_on_new_call() {
        let f = fixture(MockTransport::default());
        f.lifecycle.begin().await.unwrap();
        f.lifecycle.transition_to(CallState::Joined).await.unwrap();
        f.lifecycle.participant_joined("grandma");
        f.lifecycle.participant_joined("robot");
        f.lifecycle.participant_left("robot");
        assert_eq!(f.lifecycle.participants(), vec!["grandma".to_string()]);

        f.lifecycle.shutdown().await;
        assert_eq!(f.lifecycle.state(), CallState::Initialized);
        assert!(f.lifecycle.participants().is_empty());
    }
}
