//! HTTP-Endpunkte für Call-Setup und Status-Callbacks

use super::{SignalingError, StatusCallback};
use crate::telephony::TelephonyBridge;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Form, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

pub fn router(bridge: Arc<TelephonyBridge>) -> Router {
    Router::new()
        .route("/twiml", post(call_setup).get(call_setup))
        .route("/status", post(call_status))
        .with_state(bridge)
}

pub async fn serve_http(
    listener: TcpListener,
    bridge: Arc<TelephonyBridge>,
) -> Result<(), SignalingError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Telephony HTTP server listening on {}", addr);
    }
    axum::serve(listener, router(bridge)).await?;
    Ok(())
}

async fn call_setup(State(bridge): State<Arc<TelephonyBridge>>) -> impl IntoResponse {
    tracing::debug!("Serving call setup document");
    ([(header::CONTENT_TYPE, "text/xml")], bridge.call_setup_xml())
}

async fn call_status(
    State(bridge): State<Arc<TelephonyBridge>>,
    Form(callback): Form<StatusCallback>,
) -> StatusCode {
    bridge.handle_status(callback).await;
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::AudioEngine;
    use crate::call::CallState;
    use crate::config::{AudioConfig, Config};
    use crate::events::EventBus;
    use crate::signaling::CallStatus;
    use tokio::runtime::Handle;

    fn bridge() -> Arc<TelephonyBridge> {
        let config = Config {
            audio: AudioConfig {
                use_hardware: false,
                ..AudioConfig::default()
            },
            ..Config::default()
        };
        let engine = Arc::new(AudioEngine::new(config.audio.clone()));
        let bus = Arc::new(EventBus::new(Handle::current()));
        Arc::new(TelephonyBridge::new(engine, bus, &config, None).unwrap())
    }

    #[tokio::test]
    async fn test_call_setup_response() {
        let response = call_setup(State(bridge())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/xml");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("<Connect><Stream"));
    }

    #[tokio::test]
    async fn test_status_callback_updates_call() {
        let bridge = bridge();
        bridge.lifecycle().begin().await.unwrap();

        let status = call_status(
            State(Arc::clone(&bridge)),
            Form(StatusCallback {
                call_sid: "CA7".into(),
                call_status: CallStatus::NoAnswer,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bridge.lifecycle().state(), CallState::Left);
    }
}
