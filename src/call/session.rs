use super::state::CallState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Daten des aktuellen Anrufs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSession {
    pub id: Uuid,
    pub state: CallState,
    pub participants: BTreeSet<String>,
    pub volume: f32,
    pub muted: bool,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: CallState::Initialized,
            participants: BTreeSet::new(),
            volume: 1.0,
            muted: false,
            created_at: Utc::now(),
        }
    }

    /// Neue Sitzung mit frischer ID; Lautstärke und Mute bleiben erhalten
    pub fn renew(&mut self) {
        self.id = Uuid::new_v4();
        self.participants.clear();
        self.created_at = Utc::now();
    }
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}
