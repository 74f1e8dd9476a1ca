//! Telephony Bridge - verbindet die Telefonleitung mit dem Call-Lifecycle
//!
//! Eingehend: Media-Stream-Payloads werden dekodiert, auf die Engine-Rate
//! gebracht, zu Frames gesammelt und an den Call-Producer gegeben.
//! Ausgehend: Frames des Call-Consumers gehen als µ-law Payload über den
//! WebSocket zurück. Status-Callbacks steuern den Lebenszyklus.

use super::codec::CodecError;
use super::leg::TelephonyLeg;
use crate::audio_engine::{AudioEngine, AudioFrame, SoundEffect};
use crate::call::{CallError, CallLifecycle, CallState, LifecycleSettings, SessionTransport};
use crate::config::{Config, ConfigError};
use crate::events::{Event, EventBus};
use crate::signaling::{self, CallStatus, MediaMessage, SignalingError, StatusCallback};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum TelephonyError {
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("No active media stream")]
    NoActiveLeg,

    #[error("Call placement failed: {0}")]
    Placement(String),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

// ============================================================================
// CALL PLACER
// ============================================================================

/// Schnittstelle zum Telefonie-Anbieter (REST-API o.ä.)
pub trait CallPlacer: Send + Sync {
    /// Startet einen ausgehenden Anruf und liefert dessen Call-SID
    fn place_call<'a>(
        &'a self,
        to: &'a str,
        setup_url: &'a Url,
        status_url: &'a Url,
    ) -> BoxFuture<'a, Result<String, TelephonyError>>;

    fn hang_up<'a>(&'a self, call_sid: &'a str) -> BoxFuture<'a, Result<(), TelephonyError>>;
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// Aktiver Media-Stream samt Rückkanal zum WebSocket-Writer
struct MediaLink {
    leg: TelephonyLeg,
    outbound: mpsc::Sender<String>,
}

/// Zustand, den Bridge und Lifecycle (als Transport) gemeinsam nutzen
struct BridgeShared {
    link: Mutex<Option<MediaLink>>,
    call_sid: Mutex<Option<String>>,
    placer: Option<Arc<dyn CallPlacer>>,
}

impl SessionTransport for BridgeShared {
    fn send_audio(&self, frame: AudioFrame) {
        let mut link = self.link.lock();
        let Some(link) = link.as_mut() else {
            return;
        };

        let payload = link.leg.encode(&frame);
        let message = match MediaMessage::outbound_media(link.leg.stream_id(), payload).to_json() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Failed to encode outbound media: {}", e);
                return;
            }
        };

        // Voller Writer: Frame verwerfen statt den Uplink zu blockieren
        if let Err(e) = link.outbound.try_send(message) {
            tracing::debug!("Dropping outbound telephony frame: {}", e);
        }
    }

    fn hang_up(&self) -> BoxFuture<'_, ()> {
        async move {
            let call_sid = self.call_sid.lock().take();
            match (&self.placer, call_sid) {
                (Some(placer), Some(call_sid)) => {
                    tracing::info!("Hanging up call {}", call_sid);
                    if let Err(e) = placer.hang_up(&call_sid).await {
                        tracing::warn!("Hang-up of {} failed: {}", call_sid, e);
                    }
                }
                _ => tracing::debug!("No placed call to hang up"),
            }
        }
        .boxed()
    }
}

// ============================================================================
// TELEPHONY BRIDGE
// ============================================================================

pub struct TelephonyBridge {
    shared: Arc<BridgeShared>,
    lifecycle: Arc<CallLifecycle>,
    bus: Arc<EventBus>,
    native_rate: u32,
    line_rate: u32,
    chunk_size: usize,
    media_url: Url,
    setup_url: Url,
    status_url: Url,
}

impl TelephonyBridge {
    pub fn new(
        engine: Arc<AudioEngine>,
        bus: Arc<EventBus>,
        config: &Config,
        placer: Option<Arc<dyn CallPlacer>>,
    ) -> Result<Self, TelephonyError> {
        let telephony = &config.telephony;
        let shared = Arc::new(BridgeShared {
            link: Mutex::new(None),
            call_sid: Mutex::new(None),
            placer,
        });

        let mut settings = LifecycleSettings::from_config(&telephony.producer_name, &config.call);
        settings.join_timeout = Duration::from_millis(telephony.join_timeout_ms);

        let native_rate = engine.sample_rate();
        let chunk_size = engine.chunk_size();
        let lifecycle = CallLifecycle::new(
            engine,
            Arc::clone(&bus),
            Arc::clone(&shared) as Arc<dyn SessionTransport>,
            settings,
        );

        Ok(Self {
            shared,
            lifecycle,
            bus,
            native_rate,
            line_rate: telephony.line_rate,
            chunk_size,
            media_url: telephony.media_url()?,
            setup_url: telephony.twiml_url()?,
            status_url: telephony.status_url()?,
        })
    }

    pub fn lifecycle(&self) -> &Arc<CallLifecycle> {
        &self.lifecycle
    }

    pub fn call_sid(&self) -> Option<String> {
        self.shared.call_sid.lock().clone()
    }

    pub fn has_active_leg(&self) -> bool {
        self.shared.link.lock().is_some()
    }

    /// Dokument, das den Anruf mit dem Media-Stream verbindet
    pub fn call_setup_xml(&self) -> String {
        signaling::call_setup_xml(&self.media_url)
    }

    // ========================================================================
    // CALL CONTROL
    // ========================================================================

    /// Ruft `number` an. Der Anruf ist danach JOINING, bis der Status-Callback
    /// die Annahme meldet.
    pub async fn place_call(&self, number: &str) -> Result<String, TelephonyError> {
        let placer = self
            .shared
            .placer
            .clone()
            .ok_or_else(|| TelephonyError::Placement("no call placer configured".into()))?;

        self.lifecycle.begin().await?;

        match placer
            .place_call(number, &self.setup_url, &self.status_url)
            .await
        {
            Ok(call_sid) => {
                tracing::info!("Placed call {}", call_sid);
                *self.shared.call_sid.lock() = Some(call_sid.clone());
                Ok(call_sid)
            }
            Err(e) => {
                tracing::error!("Call placement failed: {}", e);
                if let Err(err) = self.lifecycle.transition_to(CallState::Error).await {
                    tracing::warn!("Could not enter error state: {}", err);
                }
                Err(e)
            }
        }
    }

    pub async fn hang_up(&self) -> Result<(), TelephonyError> {
        self.lifecycle.leave().await?;
        Ok(())
    }

    // ========================================================================
    // MEDIA STREAM
    // ========================================================================

    /// Verarbeitet eine Textnachricht des Media-WebSockets.
    /// Fehlerhafte Nachrichten werden geloggt und übersprungen.
    pub async fn handle_media_text(&self, text: &str, outbound: &mpsc::Sender<String>) {
        match MediaMessage::parse(text) {
            Ok(message) => self.handle_media_message(message, outbound).await,
            Err(e) => tracing::warn!("Skipping malformed media message: {}", e),
        }
    }

    pub async fn handle_media_message(&self, message: MediaMessage, outbound: &mpsc::Sender<String>) {
        match message {
            MediaMessage::Connected { protocol } => {
                tracing::debug!("Media stream connected ({:?})", protocol);
            }
            MediaMessage::Start { start } => {
                if let Err(e) = self.open_leg(start.stream_sid, start.call_sid, outbound.clone()) {
                    tracing::error!("Failed to open media stream: {}", e);
                }
            }
            MediaMessage::Media { media, .. } => {
                if let Err(e) = self.receive_media(&media.payload) {
                    tracing::warn!("Dropping inbound media: {}", e);
                }
            }
            MediaMessage::Stop { .. } => {
                self.close_leg();
                if self.lifecycle.state() == CallState::Joined {
                    if let Err(e) = self.lifecycle.apply_remote_state(CallState::Left).await {
                        tracing::warn!("Failed to end call after stream stop: {}", e);
                    }
                }
            }
            MediaMessage::Unknown => {}
        }
    }

    fn open_leg(
        &self,
        stream_sid: String,
        call_sid: Option<String>,
        outbound: mpsc::Sender<String>,
    ) -> Result<(), TelephonyError> {
        let leg = TelephonyLeg::new(
            stream_sid,
            call_sid.clone(),
            self.native_rate,
            self.line_rate,
            self.chunk_size,
        )?;
        tracing::info!("Media stream {} started", leg.stream_id());

        if let Some(call_sid) = call_sid {
            self.shared.call_sid.lock().get_or_insert(call_sid);
        }
        let previous = self.shared.link.lock().replace(MediaLink { leg, outbound });
        if let Some(previous) = previous {
            tracing::warn!("Replacing media stream {}", previous.leg.stream_id());
        }
        Ok(())
    }

    fn close_leg(&self) {
        if let Some(link) = self.shared.link.lock().take() {
            tracing::info!("Media stream {} stopped", link.leg.stream_id());
        }
    }

    /// Leitet einen Payload an den Call-Producer weiter.
    /// Liefert die Anzahl der übergebenen Frames.
    pub fn receive_media(&self, payload: &str) -> Result<usize, TelephonyError> {
        let frames = {
            let mut link = self.shared.link.lock();
            let link = link.as_mut().ok_or(TelephonyError::NoActiveLeg)?;
            link.leg.receive(payload)?
        };

        let mut delivered = 0;
        for frame in frames {
            if self.lifecycle.push_remote_frame(frame) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// WebSocket-Verbindung ist weg; nur der eigene Stream wird geschlossen
    pub fn media_closed(&self, outbound: &mpsc::Sender<String>) {
        let mut link = self.shared.link.lock();
        if link
            .as_ref()
            .is_some_and(|l| l.outbound.same_channel(outbound))
        {
            if let Some(link) = link.take() {
                tracing::info!("Media connection for {} closed", link.leg.stream_id());
            }
        }
    }

    // ========================================================================
    // STATUS CALLBACKS
    // ========================================================================

    pub async fn handle_status(&self, callback: StatusCallback) {
        let StatusCallback {
            call_sid,
            call_status,
        } = callback;
        tracing::info!("Call {} status: {}", call_sid, call_status);

        match call_status {
            CallStatus::Ringing => {
                if !call_sid.is_empty() {
                    self.shared.call_sid.lock().get_or_insert(call_sid.clone());
                }
                self.bus.publish(Event::TelephonyRinging { call_sid });
                self.bus.publish(Event::PlaySound {
                    effect: SoundEffect::BringBring,
                    looping: true,
                });
            }
            CallStatus::InProgress | CallStatus::Answered => {
                self.stop_ringing();
                self.apply_remote(CallState::Joined).await;
                self.bus.publish(Event::TelephonyAnswered { call_sid });
            }
            CallStatus::Completed | CallStatus::Canceled | CallStatus::NoAnswer | CallStatus::Busy => {
                self.stop_ringing();
                self.apply_remote(CallState::Left).await;
                self.bus.publish(Event::TelephonyCompleted {
                    call_sid,
                    status: call_status.to_string(),
                });
            }
            CallStatus::Failed => {
                self.stop_ringing();
                self.apply_remote(CallState::Error).await;
                self.bus.publish(Event::TelephonyCompleted {
                    call_sid,
                    status: call_status.to_string(),
                });
            }
            CallStatus::Queued | CallStatus::Initiated | CallStatus::Unknown => {}
        }
    }

    fn stop_ringing(&self) {
        self.bus.publish(Event::StopSound {
            effect: SoundEffect::BringBring,
        });
    }

    async fn apply_remote(&self, state: CallState) {
        if let Err(e) = self.lifecycle.apply_remote_state(state).await {
            tracing::warn!("Ignoring remote call state {}: {}", state, e);
        }
    }
}

impl std::fmt::Debug for TelephonyBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelephonyBridge")
            .field("state", &self.lifecycle.state())
            .field("call_sid", &self.call_sid())
            .field("active_leg", &self.has_active_leg())
            .field("line_rate", &self.line_rate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use tokio::runtime::Handle;
    use tokio::sync::broadcast;

    struct MockPlacer {
        fail: bool,
        hung_up: Mutex<Vec<String>>,
    }

    impl CallPlacer for MockPlacer {
        fn place_call<'a>(
            &'a self,
            _to: &'a str,
            setup_url: &'a Url,
            _status_url: &'a Url,
        ) -> BoxFuture<'a, Result<String, TelephonyError>> {
            async move {
                assert_eq!(setup_url.path(), "/twiml");
                if self.fail {
                    Err(TelephonyError::Placement("rejected".into()))
                } else {
                    Ok("CA42".to_string())
                }
            }
            .boxed()
        }

        fn hang_up<'a>(&'a self, call_sid: &'a str) -> BoxFuture<'a, Result<(), TelephonyError>> {
            self.hung_up.lock().push(call_sid.to_string());
            async { Ok(()) }.boxed()
        }
    }

    struct Fixture {
        engine: Arc<AudioEngine>,
        bridge: TelephonyBridge,
        events: broadcast::Receiver<Event>,
    }

    fn fixture(placer: Option<Arc<dyn CallPlacer>>) -> Fixture {
        let config = Config {
            audio: AudioConfig {
                use_hardware: false,
                ..AudioConfig::default()
            },
            ..Config::default()
        };
        let engine = Arc::new(AudioEngine::new(config.audio.clone()));
        let bus = Arc::new(EventBus::new(Handle::current()));
        let events = bus.stream();
        let bridge = TelephonyBridge::new(Arc::clone(&engine), bus, &config, placer).unwrap();
        Fixture {
            engine,
            bridge,
            events,
        }
    }

    fn status(call_status: CallStatus) -> StatusCallback {
        StatusCallback {
            call_sid: "CA1".into(),
            call_status,
        }
    }

    fn start_message() -> String {
        r#"{"event":"start","start":{"streamSid":"MZ1","callSid":"CA1"}}"#.to_string()
    }

    fn media_message(bytes: usize) -> String {
        format!(
            r#"{{"event":"media","streamSid":"MZ1","media":{{"payload":"{}"}}}}"#,
            STANDARD.encode(vec![0xFF; bytes])
        )
    }

    fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    async fn joined(f: &Fixture) {
        f.bridge.lifecycle().begin().await.unwrap();
        f.bridge.handle_status(status(CallStatus::InProgress)).await;
        assert_eq!(f.bridge.lifecycle().state(), CallState::Joined);
    }

    #[tokio::test]
    async fn test_inbound_payloads_become_engine_frames() {
        let f = fixture(None);
        let (tx, _rx) = mpsc::channel(8);
        joined(&f).await;

        f.bridge.handle_media_text(&start_message(), &tx).await;
        assert!(f.bridge.has_active_leg());

        // 20 ms µ-law ergeben 320 Samples, erst zwei davon einen Frame
        f.bridge.handle_media_text(&media_message(160), &tx).await;
        let producer = f.engine.producer("twilio_call").unwrap();
        assert_eq!(producer.buffered_frames(), 0);

        f.bridge.handle_media_text(&media_message(160), &tx).await;
        assert_eq!(producer.buffered_frames(), 1);
        assert_eq!(producer.next_frame().unwrap().len(), 640);
    }

    #[tokio::test]
    async fn test_outbound_frames_reach_media_socket() {
        let f = fixture(None);
        let (tx, mut rx) = mpsc::channel(8);
        joined(&f).await;
        f.bridge.handle_media_text(&start_message(), &tx).await;

        let mut output = vec![0; 640];
        f.engine.process_period(&[0; 640], &mut output);

        let json = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let MediaMessage::Media { stream_sid, media } = MediaMessage::parse(&json).unwrap() else {
            panic!("expected media message, got {}", json);
        };
        assert_eq!(stream_sid.as_deref(), Some("MZ1"));
        assert_eq!(STANDARD.decode(media.payload).unwrap().len(), 320);
    }

    #[tokio::test]
    async fn test_media_without_stream_is_rejected() {
        let f = fixture(None);
        assert!(matches!(
            f.bridge.receive_media("//8="),
            Err(TelephonyError::NoActiveLeg)
        ));

        // Kaputte Nachrichten werden übersprungen
        let (tx, _rx) = mpsc::channel(8);
        f.bridge.handle_media_text("{not json", &tx).await;
        f.bridge.handle_media_text(r#"{"event":"mark"}"#, &tx).await;
        assert!(!f.bridge.has_active_leg());
        assert_eq!(f.bridge.lifecycle().state(), CallState::Initialized);
    }

    #[tokio::test]
    async fn test_status_callbacks_drive_lifecycle() {
        let mut f = fixture(None);
        f.bridge.lifecycle().begin().await.unwrap();

        f.bridge.handle_status(status(CallStatus::Ringing)).await;
        let events = drain(&mut f.events);
        assert!(events.contains(&Event::TelephonyRinging {
            call_sid: "CA1".into()
        }));
        assert!(events.contains(&Event::PlaySound {
            effect: SoundEffect::BringBring,
            looping: true
        }));
        assert_eq!(f.bridge.call_sid().as_deref(), Some("CA1"));

        f.bridge.handle_status(status(CallStatus::InProgress)).await;
        assert_eq!(f.bridge.lifecycle().state(), CallState::Joined);
        let events = drain(&mut f.events);
        assert!(events.contains(&Event::StopSound {
            effect: SoundEffect::BringBring
        }));
        assert!(events.contains(&Event::ConversationStarted));

        f.bridge.handle_status(status(CallStatus::Completed)).await;
        assert_eq!(f.bridge.lifecycle().state(), CallState::Left);
        assert!(drain(&mut f.events).contains(&Event::TelephonyCompleted {
            call_sid: "CA1".into(),
            status: "completed".into()
        }));
    }

    #[tokio::test]
    async fn test_busy_while_ringing_ends_call() {
        let f = fixture(None);
        f.bridge.lifecycle().begin().await.unwrap();
        f.bridge.handle_status(status(CallStatus::Busy)).await;
        assert_eq!(f.bridge.lifecycle().state(), CallState::Left);

        f.bridge.lifecycle().begin().await.unwrap();
        f.bridge.handle_status(status(CallStatus::Failed)).await;
        assert_eq!(f.bridge.lifecycle().state(), CallState::Error);
    }

    #[tokio::test]
    async fn test_stream_stop_ends_joined_call() {
        let f = fixture(None);
        let (tx, _rx) = mpsc::channel(8);
        joined(&f).await;
        f.bridge.handle_media_text(&start_message(), &tx).await;

        f.bridge
            .handle_media_text(r#"{"event":"stop","streamSid":"MZ1"}"#, &tx)
            .await;
        assert!(!f.bridge.has_active_leg());
        assert_eq!(f.bridge.lifecycle().state(), CallState::Left);
    }

    #[tokio::test]
    async fn test_media_closed_only_closes_own_stream() {
        let f = fixture(None);
        let (tx, _rx) = mpsc::channel(8);
        let (other, _other_rx) = mpsc::channel(8);
        f.bridge.handle_media_text(&start_message(), &tx).await;

        f.bridge.media_closed(&other);
        assert!(f.bridge.has_active_leg());
        f.bridge.media_closed(&tx);
        assert!(!f.bridge.has_active_leg());
    }

    #[tokio::test]
    async fn test_place_call() {
        let placer = Arc::new(MockPlacer {
            fail: false,
            hung_up: Mutex::new(Vec::new()),
        });
        let f = fixture(Some(Arc::clone(&placer) as Arc<dyn CallPlacer>));

        let call_sid = f.bridge.place_call("+4912345").await.unwrap();
        assert_eq!(call_sid, "CA42");
        assert_eq!(f.bridge.lifecycle().state(), CallState::Joining);

        f.bridge.hang_up().await.unwrap();
        assert_eq!(f.bridge.lifecycle().state(), CallState::Left);
        assert_eq!(*placer.hung_up.lock(), vec!["CA42".to_string()]);
    }

    #[tokio::test]
    async fn test_place_call_failures() {
        let f = fixture(None);
        assert!(matches!(
            f.bridge.place_call("+4912345").await,
            Err(TelephonyError::Placement(_))
        ));
        assert_eq!(f.bridge.lifecycle().state(), CallState::Initialized);

        let f = fixture(Some(Arc::new(MockPlacer {
            fail: true,
            hung_up: Mutex::new(Vec::new()),
        })));
        assert!(f.bridge.place_call("+4912345").await.is_err());
        assert_eq!(f.bridge.lifecycle().state(), CallState::Error);
    }

    #[tokio::test]
    async fn test_call_setup_xml_points_at_media_url() {
        let f = fixture(None);
        assert!(f
            .bridge
            .call_setup_xml()
            .contains(r#"<Stream url="ws://localhost:3000/"/>"#));
    }
}
