//! WebSocket-Server für Media-Streams
//!
//! Pro Verbindung laufen ein Lese-Loop und ein Writer-Task. Ausgehende
//! Nachrichten gehen über einen mpsc-Kanal an den Writer, damit der
//! Uplink nie auf den Socket wartet.

use super::SignalingError;
use crate::telephony::TelephonyBridge;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const OUTBOUND_CAPACITY: usize = 100;

/// Nimmt Verbindungen an, bis der Listener fehlschlägt
pub async fn serve_media(
    listener: TcpListener,
    bridge: Arc<TelephonyBridge>,
) -> Result<(), SignalingError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Media stream server listening on {}", addr);
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, bridge).await {
                tracing::warn!("Media connection {} ended with error: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    bridge: Arc<TelephonyBridge>,
) -> Result<(), SignalingError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| SignalingError::Handshake(e.to_string()))?;
    tracing::info!("Media connection from {}", peer);

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                tracing::debug!("Media socket write failed: {}", e);
                break;
            }
        }
        let _ = write.close().await;
    });

    let mut result = Ok(());
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => bridge.handle_media_text(&text, &tx).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Media socket read failed: {}", e);
                result = Err(SignalingError::ConnectionClosed);
                break;
            }
        }
    }

    bridge.media_closed(&tx);
    drop(tx);
    writer.abort();
    tracing::info!("Media connection from {} closed", peer);
    result
}
