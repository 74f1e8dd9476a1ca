//! Message Types für Media-Streams und Status-Callbacks der Telefonie
//!
//! Die Strukturen spiegeln das JSON des Media-Stream-WebSockets und die
//! Formularfelder der Status-Callbacks wider.

use super::SignalingError;
use serde::{Deserialize, Serialize};
use url::Url;

// ============================================================================
// MEDIA STREAM MESSAGES
// ============================================================================

/// Alle Nachrichten auf dem Media-Stream-WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum MediaMessage {
    /// Verbindung steht, noch kein Stream
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },

    /// Stream beginnt
    Start { start: StreamStart },

    /// Audio-Payload (base64 µ-law)
    Media {
        #[serde(
            rename = "streamSid",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        stream_sid: Option<String>,
        media: MediaPayload,
    },

    /// Stream endet
    Stop {
        #[serde(
            rename = "streamSid",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        stream_sid: Option<String>,
    },

    /// Marker und sonstige Events werden ignoriert
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStart {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    #[serde(rename = "callSid", default, skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

impl MediaMessage {
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::MalformedMessage(e.to_string()))
    }

    /// Ausgehender Audio-Frame für einen Stream
    pub fn outbound_media(stream_sid: &str, payload: String) -> Self {
        MediaMessage::Media {
            stream_sid: Some(stream_sid.to_string()),
            media: MediaPayload { payload },
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::InvalidPayload(e.to_string()))
    }
}

// ============================================================================
// STATUS CALLBACKS
// ============================================================================

/// Anrufstatus aus den Status-Callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Queued,
    Initiated,
    Ringing,
    InProgress,
    Answered,
    Completed,
    Busy,
    Failed,
    NoAnswer,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in-progress",
            CallStatus::Answered => "answered",
            CallStatus::Completed => "completed",
            CallStatus::Busy => "busy",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no-answer",
            CallStatus::Canceled => "canceled",
            CallStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formularfelder eines Status-Callbacks
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusCallback {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "CallStatus")]
    pub call_status: CallStatus,
}

// ============================================================================
// CALL SETUP
// ============================================================================

/// Antwort auf den Call-Setup-Request: verbindet den Anruf mit dem Media-Stream
pub fn call_setup_xml(media_url: &Url) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<Response><Connect><Stream url="{}"/></Connect></Response>"#
        ),
        escape_xml(media_url.as_str())
    )
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}
