//! # Session Coordinator
//!
//! Handles the client-facing WebSocket at `/v1/transcriptions`. Each
//! connection is one actor owning one session end to end.
//!
//! ## Client Protocol:
//! 1. **Handshake**: first client message is text JSON
//!    `{"action": "start", "language": "<tag>"}`; `language` defaults to
//!    `"en"`. Anything else closes the connection with a policy code.
//! 2. **Ack**: server replies `{"session_id": "<uuid>"}`.
//! 3. **Steady state, client → server**: binary PCM16 audio frames.
//! 4. **Steady state, server → client**: JSON text messages, one of
//!    `{"partial": ...}`, `{"final": ...}`, `{"error": ...}`.
//!
//! ## Lifecycle:
//! `Accepted → Handshaking → Authorizing → Linking → Streaming →
//! Closing → Closed`, with `Closed` reachable from every state. After a
//! successful handshake the actor hands the provider side to a spawned
//! relay task (see `relay`) and from then on only forwards audio frames
//! into the relay's channel and transcript events out to the client.
//! One session's failure never escapes this actor.

use crate::error::RelayError;
use crate::provider::events::TranscriptEvent;
use crate::relay::{self, ClientHandle, RelayInputs};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Server ping interval for client liveness.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Close the connection when the client has been silent this long. This
/// also bounds how long a connection may sit in `Handshaking` without
/// sending its start message.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum audio frames queued towards the relay before the session is
/// dropped. The queue only grows while the provider side lags (most
/// notably during `Authorizing` and `Linking`); a client that outruns it
/// this far is closed rather than buffered without bound.
const AUDIO_BACKLOG_LIMIT: usize = 256;

/// Session lifecycle states. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Handshaking,
    Authorizing,
    Linking,
    Streaming,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

/// The client's opening message.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub action: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Handshake acknowledgment carrying the generated session identifier.
#[derive(Debug, Serialize)]
pub struct SessionGreeting {
    pub session_id: String,
}

/// A transcript event for the client, sent by the relay task.
#[derive(Message)]
#[rtype(result = "()")]
pub struct DeliverTranscript(pub TranscriptEvent);

/// State-machine advance driven by the relay task.
#[derive(Message)]
#[rtype(result = "()")]
pub struct AdvancePhase(pub SessionState);

/// Ask the actor to close the client connection.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseClient {
    pub code: ws::CloseCode,
    pub reason: Option<String>,
}

/// How an audio frame fared against the relay channel.
#[derive(Debug, PartialEq, Eq)]
enum AudioEnqueue {
    Queued,
    Backlogged,
    RelayGone,
}

/// One client connection, one session.
pub struct RelaySession {
    session_id: String,
    language: String,
    state: SessionState,
    app_state: AppState,
    /// Hands binary audio frames to the audio forwarder. `None` until
    /// the handshake succeeds; dropping it ends the audio forwarder.
    audio_tx: Option<mpsc::Sender<Bytes>>,
    last_heartbeat: Instant,
}

impl RelaySession {
    pub fn new(app_state: AppState) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            language: "en".to_string(),
            state: SessionState::Accepted,
            app_state,
            audio_tx: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn advance(&mut self, next: SessionState) {
        if self.state != next && !self.state.is_terminal() {
            debug!(
                session_id = %self.session_id,
                from = ?self.state,
                to = ?next,
                "session state change"
            );
            self.state = next;
        }
    }

    /// Handle the one expected handshake message. On success, echo the
    /// session id and hand the provider side to the relay task; on any
    /// failure, close with a policy code before any credential is minted.
    fn handle_handshake(&mut self, raw: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<StartRequest>(raw) {
            Ok(request) if request.action == "start" => {
                self.language = request.language.unwrap_or_else(|| "en".to_string());
                info!(
                    session_id = %self.session_id,
                    language = %self.language,
                    "handshake accepted"
                );

                let greeting = SessionGreeting {
                    session_id: self.session_id.clone(),
                };
                match serde_json::to_string(&greeting) {
                    Ok(json) => ctx.text(json),
                    Err(err) => {
                        error!(session_id = %self.session_id, %err, "failed to serialize greeting");
                        self.close_with(ctx, ws::CloseCode::Error, None);
                        return;
                    }
                }

                self.start_relay(ctx);
            }
            Ok(request) => {
                let err = RelayError::Handshake(format!("unexpected action {:?}", request.action));
                warn!(session_id = %self.session_id, %err, "closing connection");
                self.close_with(ctx, ws::CloseCode::Policy, None);
            }
            Err(parse_err) => {
                let err = RelayError::Handshake(format!("invalid JSON: {}", parse_err));
                warn!(session_id = %self.session_id, %err, "closing connection");
                self.close_with(ctx, ws::CloseCode::Policy, None);
            }
        }
    }

    /// Spawn the provider-side relay task for this session. Exactly one
    /// relay (and therefore one credential mint and one provider link)
    /// exists per session: the state leaves `Handshaking` synchronously
    /// here, so a second start message can never reach this path.
    fn start_relay(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_BACKLOG_LIMIT);
        self.audio_tx = Some(audio_tx);
        self.advance(SessionState::Authorizing);

        let addr = ctx.address();
        let inputs = RelayInputs {
            session_id: self.session_id.clone(),
            language: self.language.clone(),
            provider: self.app_state.get_config().provider,
            http: self.app_state.http_client(),
            audio_rx,
            client: ClientHandle {
                transcripts: addr.clone().recipient(),
                phases: addr.clone().recipient(),
                close: addr.recipient(),
            },
        };
        tokio::spawn(relay::run_relay(inputs));
    }

    fn handle_audio_frame(&mut self, data: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        match self.state {
            SessionState::Accepted | SessionState::Handshaking => {
                // No audio is accepted before the session id is issued.
                warn!(
                    session_id = %self.session_id,
                    "binary frame before handshake, closing"
                );
                self.close_with(ctx, ws::CloseCode::Policy, None);
            }
            SessionState::Closing | SessionState::Closed => {}
            _ => match self.enqueue_audio(data) {
                AudioEnqueue::Queued => {}
                AudioEnqueue::Backlogged => {
                    warn!(
                        session_id = %self.session_id,
                        limit = AUDIO_BACKLOG_LIMIT,
                        "audio backlog limit reached, closing"
                    );
                    self.close_with(
                        ctx,
                        ws::CloseCode::Error,
                        Some("audio backlog exceeded".to_string()),
                    );
                }
                AudioEnqueue::RelayGone => {
                    // Relay side already gone; it will ask us to close.
                    debug!(
                        session_id = %self.session_id,
                        "audio channel closed, frame dropped"
                    );
                }
            },
        }
    }

    fn enqueue_audio(&mut self, data: Bytes) -> AudioEnqueue {
        let Some(audio_tx) = &self.audio_tx else {
            return AudioEnqueue::RelayGone;
        };
        match audio_tx.try_send(data) {
            Ok(()) => AudioEnqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => AudioEnqueue::Backlogged,
            Err(mpsc::error::TrySendError::Closed(_)) => AudioEnqueue::RelayGone,
        }
    }

    /// Record that this session is shutting down: abnormal close codes
    /// count as a failed session. Returns false when the session is
    /// already on its way out, so a second close never double-counts.
    fn mark_closing(&mut self, code: ws::CloseCode) -> bool {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        if code != ws::CloseCode::Normal {
            self.app_state.session_failed();
        }
        self.advance(SessionState::Closing);
        true
    }

    fn close_with(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        code: ws::CloseCode,
        reason: Option<String>,
    ) {
        if !self.mark_closing(code) {
            return;
        }
        ctx.close(Some(ws::CloseReason {
            code,
            description: reason,
        }));
        ctx.stop();
    }

    fn heartbeat_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat) > CLIENT_TIMEOUT
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if act.heartbeat_expired(Instant::now()) {
                warn!(session_id = %act.session_id, "client heartbeat timeout, closing");
                act.close_with(ctx, ws::CloseCode::Abnormal, None);
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for RelaySession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "session accepted");
        self.app_state.session_started();
        self.advance(SessionState::Handshaking);
        self.heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the actor drops audio_tx, which ends the audio
        // forwarder and winds down the relay task.
        self.advance(SessionState::Closed);
        self.app_state.session_finished();
        info!(session_id = %self.session_id, "session closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => match self.state {
                SessionState::Accepted | SessionState::Handshaking => {
                    self.handle_handshake(&text, ctx)
                }
                _ => {
                    warn!(
                        session_id = %self.session_id,
                        "unexpected text message after handshake, ignoring"
                    );
                }
            },
            Ok(ws::Message::Binary(data)) => self.handle_audio_frame(data, ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, ?reason, "client closed the connection");
                self.advance(SessionState::Closing);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, %err, "client protocol error");
                self.mark_closing(ws::CloseCode::Protocol);
                ctx.stop();
            }
        }
    }
}

impl Handler<DeliverTranscript> for RelaySession {
    type Result = ();

    fn handle(&mut self, msg: DeliverTranscript, ctx: &mut Self::Context) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }

        match &msg.0 {
            TranscriptEvent::Partial(_) => self.app_state.record_transcript(false),
            TranscriptEvent::Final(_) => self.app_state.record_transcript(true),
            TranscriptEvent::Error(_) => self.app_state.increment_error_count(),
        }

        match serde_json::to_string(&msg.0) {
            Ok(json) => ctx.text(json),
            Err(err) => {
                error!(
                    session_id = %self.session_id,
                    %err,
                    "failed to serialize transcript event"
                );
            }
        }
    }
}

impl Handler<AdvancePhase> for RelaySession {
    type Result = ();

    fn handle(&mut self, msg: AdvancePhase, _ctx: &mut Self::Context) {
        self.advance(msg.0);
    }
}

impl Handler<CloseClient> for RelaySession {
    type Result = ();

    fn handle(&mut self, msg: CloseClient, ctx: &mut Self::Context) {
        self.close_with(ctx, msg.code, msg.reason);
    }
}

/// WebSocket upgrade handler for `/v1/transcriptions`.
pub async fn transcription_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        "new transcription WebSocket request"
    );

    let session = RelaySession::new(app_state.get_ref().clone());
    ws::start(session, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn start_request_parses_with_language() {
        let request: StartRequest =
            serde_json::from_str(r#"{"action": "start", "language": "de"}"#).unwrap();
        assert_eq!(request.action, "start");
        assert_eq!(request.language.as_deref(), Some("de"));
    }

    #[test]
    fn start_request_language_is_optional() {
        let request: StartRequest = serde_json::from_str(r#"{"action": "start"}"#).unwrap();
        assert_eq!(request.language, None);
    }

    #[test]
    fn start_request_rejects_missing_action() {
        assert!(serde_json::from_str::<StartRequest>(r#"{"language": "en"}"#).is_err());
    }

    #[test]
    fn greeting_serializes_to_session_id_object() {
        let greeting = SessionGreeting {
            session_id: "abc-123".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&greeting).unwrap(),
            r#"{"session_id":"abc-123"}"#
        );
    }

    #[test]
    fn sessions_get_unique_ids() {
        let state = AppState::new(AppConfig::default());
        let a = RelaySession::new(state.clone());
        let b = RelaySession::new(state);
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.state, SessionState::Accepted);
        assert_eq!(a.language, "en");
    }

    #[test]
    fn heartbeat_timeout_counts_as_failed_session() {
        let state = AppState::new(AppConfig::default());
        let mut session = RelaySession::new(state.clone());

        let before_deadline = session.last_heartbeat + CLIENT_TIMEOUT;
        assert!(!session.heartbeat_expired(before_deadline));

        let past_deadline = before_deadline + Duration::from_secs(1);
        assert!(session.heartbeat_expired(past_deadline));

        assert!(session.mark_closing(ws::CloseCode::Abnormal));
        assert_eq!(session.state, SessionState::Closing);
        assert_eq!(state.get_metrics_snapshot().sessions_failed, 1);

        // a second close must not double-count
        assert!(!session.mark_closing(ws::CloseCode::Abnormal));
        assert_eq!(state.get_metrics_snapshot().sessions_failed, 1);
    }

    #[test]
    fn normal_close_is_not_a_failure() {
        let state = AppState::new(AppConfig::default());
        let mut session = RelaySession::new(state.clone());
        assert!(session.mark_closing(ws::CloseCode::Normal));
        assert_eq!(state.get_metrics_snapshot().sessions_failed, 0);
    }

    #[test]
    fn overfull_audio_backlog_is_reported() {
        let mut session = RelaySession::new(AppState::new(AppConfig::default()));
        session.state = SessionState::Streaming;
        let (tx, _rx) = mpsc::channel(2);
        session.audio_tx = Some(tx);

        assert_eq!(
            session.enqueue_audio(Bytes::from_static(&[1])),
            AudioEnqueue::Queued
        );
        assert_eq!(
            session.enqueue_audio(Bytes::from_static(&[2])),
            AudioEnqueue::Queued
        );
        assert_eq!(
            session.enqueue_audio(Bytes::from_static(&[3])),
            AudioEnqueue::Backlogged
        );
    }

    #[test]
    fn audio_after_relay_shutdown_is_dropped_quietly() {
        let mut session = RelaySession::new(AppState::new(AppConfig::default()));
        session.state = SessionState::Streaming;
        let (tx, rx) = mpsc::channel(2);
        session.audio_tx = Some(tx);
        drop(rx);

        assert_eq!(
            session.enqueue_audio(Bytes::from_static(&[1])),
            AudioEnqueue::RelayGone
        );
    }

    #[test]
    fn advance_never_leaves_closed() {
        let mut session = RelaySession::new(AppState::new(AppConfig::default()));
        session.advance(SessionState::Handshaking);
        session.advance(SessionState::Authorizing);
        session.advance(SessionState::Closed);
        assert!(session.state.is_terminal());

        session.advance(SessionState::Streaming);
        assert_eq!(session.state, SessionState::Closed);
    }
}
