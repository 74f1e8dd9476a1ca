//! Call Module - Lebenszyklus von Anrufen
//!
//! Dieses Modul verwaltet:
//! - Die Zustandsmaschine eines Anrufs und ihre Übergangstabelle
//! - Das Ein- und Aushängen des Anruf-Audios an der Engine
//! - Join-Timeout und erzwungenes Beenden

mod lifecycle;
mod session;
mod state;

pub use lifecycle::{CallError, CallLifecycle, LifecycleSettings, SessionTransport};
pub use session::CallSession;
pub use state::{Capabilities, CallState};
