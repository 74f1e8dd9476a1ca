//! Zustände eines Anrufs, erlaubte Übergänge und Fähigkeiten

use serde::{Deserialize, Serialize};

// ============================================================================
// CALL STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Bereit für einen neuen Anruf
    Initialized,
    /// Verbindung wird aufgebaut (Join-Timeout läuft)
    Joining,
    /// Anruf aktiv, Audio ist verbunden
    Joined,
    /// Anruf wird beendet
    Leaving,
    /// Anruf beendet
    Left,
    /// Fehler, nur Reset nach `Initialized` möglich
    Error,
}

impl CallState {
    pub const ALL: [CallState; 6] = [
        CallState::Initialized,
        CallState::Joining,
        CallState::Joined,
        CallState::Leaving,
        CallState::Left,
        CallState::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Initialized => "initialized",
            CallState::Joining => "joining",
            CallState::Joined => "joined",
            CallState::Leaving => "leaving",
            CallState::Left => "left",
            CallState::Error => "error",
        }
    }

    /// Nach außen sichtbare Bezeichnung des Zustands
    pub fn semantic(self) -> &'static str {
        match self {
            CallState::Joined => "started",
            CallState::Left => "ended",
            other => other.as_str(),
        }
    }

    pub fn allowed_transitions(self) -> &'static [CallState] {
        use CallState::*;
        match self {
            Initialized => &[Joining, Error],
            Joining => &[Joined, Error, Left],
            Joined => &[Leaving, Error],
            Leaving => &[Left, Error],
            Left => &[Initialized, Error, Joining],
            Error => &[Initialized],
        }
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn capabilities(self) -> &'static Capabilities {
        &CAPABILITIES[self as usize]
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CAPABILITIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub is_active: bool,
    pub can_receive_audio: bool,
    pub can_start_new_call: bool,
    pub needs_cleanup: bool,
    pub is_terminal: bool,
}

const fn caps(
    is_active: bool,
    can_receive_audio: bool,
    can_start_new_call: bool,
    needs_cleanup: bool,
    is_terminal: bool,
) -> Capabilities {
    Capabilities {
        is_active,
        can_receive_audio,
        can_start_new_call,
        needs_cleanup,
        is_terminal,
    }
}

/// Reihenfolge entspricht der Deklaration von `CallState`
static CAPABILITIES: [Capabilities; 6] = [
    // Initialized
    caps(false, false, true, false, true),
    // Joining
    caps(true, false, false, false, false),
    // Joined
    caps(true, true, false, false, false),
    // Leaving
    caps(false, false, false, false, false),
    // Left
    caps(false, false, true, true, true),
    // Error
    caps(false, false, false, true, true),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use CallState::*;
        assert!(Initialized.can_transition_to(Joining));
        assert!(!Initialized.can_transition_to(Joined));
        assert!(Joining.can_transition_to(Left));
        assert!(Left.can_transition_to(Joining));
        assert!(!Joined.can_transition_to(Left));
        assert_eq!(Error.allowed_transitions(), &[Initialized]);

        // Kein Zustand erlaubt einen Übergang auf sich selbst
        for state in CallState::ALL {
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn test_semantic_names() {
        assert_eq!(CallState::Joined.semantic(), "started");
        assert_eq!(CallState::Left.semantic(), "ended");
        assert_eq!(CallState::Joining.semantic(), "joining");
        assert_eq!(CallState::Error.to_string(), "error");
    }

    #[test]
    fn test_capabilities() {
        let active: Vec<_> = CallState::ALL
            .into_iter()
            .filter(|s| s.capabilities().is_active)
            .collect();
        assert_eq!(active, vec![CallState::Joining, CallState::Joined]);

        assert!(CallState::Joined.capabilities().can_receive_audio);
        assert!(!CallState::Joining.capabilities().can_receive_audio);
        assert!(CallState::Left.capabilities().can_start_new_call);
        assert!(CallState::Initialized.capabilities().can_start_new_call);
        assert!(CallState::Error.capabilities().needs_cleanup);
        assert!(CallState::Left.capabilities().needs_cleanup);
        assert!(!CallState::Leaving.capabilities().is_terminal);
        assert!(CallState::Error.capabilities().is_terminal);
    }
}
