//! Event Bus - Entkoppelte Benachrichtigungen zwischen den Diensten
//!
//! `publish` ist fire-and-forget und von jedem Thread aus aufrufbar: jeder
//! passende Handler läuft als eigener Task auf der Runtime. Ein Handler, der
//! paniert, wird geloggt und beeinflusst die anderen nicht.

use crate::audio_engine::SoundEffect;
use crate::call::CallState;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

// ============================================================================
// EVENTS
// ============================================================================

/// Alle Events, die über den Bus laufen
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Zustandswechsel eines Anrufs, `semantic` ist die nach außen sichtbare Bezeichnung
    CallStateChanged {
        old: CallState,
        new: CallState,
        semantic: &'static str,
    },
    ConversationJoining,
    ConversationStarted,
    PlaySound { effect: SoundEffect, looping: bool },
    StopSound { effect: SoundEffect },
    TelephonyRinging { call_sid: String },
    TelephonyAnswered { call_sid: String },
    TelephonyCompleted { call_sid: String, status: String },
}

/// Event-Typ ohne Nutzdaten, zum Abonnieren
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CallStateChanged,
    ConversationJoining,
    ConversationStarted,
    PlaySound,
    StopSound,
    TelephonyRinging,
    TelephonyAnswered,
    TelephonyCompleted,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::CallStateChanged { .. } => EventKind::CallStateChanged,
            Event::ConversationJoining => EventKind::ConversationJoining,
            Event::ConversationStarted => EventKind::ConversationStarted,
            Event::PlaySound { .. } => EventKind::PlaySound,
            Event::StopSound { .. } => EventKind::StopSound,
            Event::TelephonyRinging { .. } => EventKind::TelephonyRinging,
            Event::TelephonyAnswered { .. } => EventKind::TelephonyAnswered,
            Event::TelephonyCompleted { .. } => EventKind::TelephonyCompleted,
        }
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// `None` abonniert alle Events
    kind: Option<EventKind>,
    handler: EventHandler,
}

pub struct EventBus {
    runtime: Handle,
    subscribers: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Erstellt einen Bus, der Handler auf der gegebenen Runtime ausführt
    pub fn new(runtime: Handle) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            runtime,
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Abonniert einen Event-Typ (oder mit `None` alle Events)
    pub fn subscribe<F, Fut>(&self, kind: Option<EventKind>, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: EventHandler = Arc::new(move |event| handler(event).boxed());

        self.subscribers.write().push(Subscription { id, kind, handler });
        tracing::debug!("Subscribed {:?} to {:?}", id, kind);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Veröffentlicht ein Event. Kehrt sofort zurück.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.kind.is_none() || s.kind == Some(kind))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        tracing::debug!("Publishing {:?} to {} handler(s)", kind, handlers.len());

        // Ohne Empfänger schlägt send fehl, das ist in Ordnung
        let _ = self.event_tx.send(event.clone());

        for handler in handlers {
            let event = event.clone();
            self.runtime.spawn(async move {
                let result = AssertUnwindSafe(async move { handler(event).await })
                    .catch_unwind()
                    .await;
                if result.is_err() {
                    tracing::error!("Event handler for {:?} panicked", kind);
                }
            });
        }
    }

    /// Gibt einen Receiver für alle veröffentlichten Events zurück
    pub fn stream(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
