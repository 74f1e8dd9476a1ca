//! Signaling Module - Media-Stream-WebSocket und HTTP-Callbacks der Telefonie
//!
//! Dieses Modul verwaltet:
//! - Den WebSocket-Server, über den der Anbieter Audio streamt
//! - Den HTTP-Server für Call-Setup und Status-Callbacks
//! - Die Nachrichtenformate beider Kanäle
//!

mod http;
mod media_server;
mod messages;

pub use http::{router, serve_http};
pub use media_server::serve_media;
pub use messages::*;

use std::net::SocketAddr;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bindet einen TCP-Listener mit sprechendem Fehler
pub async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener, SignalingError> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| SignalingError::Bind { addr, source })
}
