//! # Provider Link
//!
//! Owns the outbound WebSocket connection to the transcription provider
//! for one session: connect with the ephemeral credential, then declare
//! the session configuration (audio format, model, language, server-side
//! voice-activity turn detection) before any audio flows.
//!
//! The link never retries; any failure here terminates the session after
//! at most one client-visible error event.

use crate::config::ProviderConfig;
use crate::error::LinkFailure;
use futures_util::SinkExt;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// The provider-side WebSocket stream.
pub type ProviderSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Protocol-version marker required by the provider's realtime endpoint.
const PROTOCOL_HEADER: (&str, &str) = ("OpenAI-Beta", "realtime=v1");

/// Establish the provider WebSocket and send the initial session
/// configuration. Returns the configured socket, ready for streaming.
pub async fn open_provider_link(
    provider: &ProviderConfig,
    credential: &str,
    language: &str,
) -> Result<ProviderSocket, LinkFailure> {
    debug!(url = %provider.realtime_url, "connecting to provider realtime endpoint");

    let mut request = provider
        .realtime_url
        .as_str()
        .into_client_request()
        .map_err(|err| LinkFailure::Transport(format!("invalid realtime URL: {}", err)))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {}", credential))
        .map_err(|err| LinkFailure::Transport(format!("invalid credential header: {}", err)))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);
    request
        .headers_mut()
        .insert(PROTOCOL_HEADER.0, HeaderValue::from_static(PROTOCOL_HEADER.1));

    let (mut socket, _response) = connect_async(request)
        .await
        .map_err(classify_connect_error)?;

    let session_update = initial_session_update(&provider.model, language);
    socket
        .send(Message::Text(session_update.to_string()))
        .await
        .map_err(classify_setup_error)?;

    info!("provider link established and configured");
    Ok(socket)
}

/// The first outbound message on a fresh link: declares PCM16 input,
/// the transcription model, the target language, and server-side
/// voice-activity turn detection.
pub(crate) fn initial_session_update(model: &str, language: &str) -> Value {
    json!({
        "type": "transcription_session.update",
        "input_audio_format": "pcm16",
        "input_audio_transcription": {
            "model": model,
            "language": language,
        },
        "turn_detection": { "type": "server_vad" },
    })
}

/// An explicit rejection status means an auth or configuration problem;
/// everything else during connect is a generic transport failure.
fn classify_connect_error(err: WsError) -> LinkFailure {
    match err {
        WsError::Http(response) => LinkFailure::Rejected(response.status().as_u16()),
        other => LinkFailure::Transport(other.to_string()),
    }
}

/// Failures after the socket was open (sending the session config) mean
/// the provider closed on us early.
fn classify_setup_error(err: WsError) -> LinkFailure {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            LinkFailure::ClosedEarly("closed during session configuration".to_string())
        }
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            LinkFailure::ClosedEarly("connection reset".to_string())
        }
        other => LinkFailure::Transport(other.to_string()),
    }
}
