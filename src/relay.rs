//! # Streaming Relay
//!
//! The provider-side half of one session: mint a credential, open the
//! provider link, then pump both directions concurrently until either
//! forwarder terminates.
//!
//! ## Concurrency:
//! - The **audio forwarder** reads client frames from the coordinator's
//!   channel and writes append commands to the provider sink.
//! - The **transcript forwarder** reads the provider stream and sends
//!   translated events back to the session actor.
//! - The coordinator waits for the first forwarder to finish and aborts
//!   the sibling; cancellation only ever flows coordinator → task.
//!
//! Each forwarder reports how it ended through [`ForwardOutcome`] so the
//! coordinator can branch on outcome kind instead of error downcasting:
//! ordinary disconnects are logged, real failures are logged as errors,
//! and both end the session the same way.

use crate::error::RelayError;
use crate::provider::credentials::mint_credential;
use crate::provider::events::{parse_provider_event, ProviderEvent, TranscriptEvent};
use crate::provider::link::open_provider_link;
use crate::websocket::{AdvancePhase, CloseClient, DeliverTranscript, SessionState};
use crate::config::ProviderConfig;

use actix::Recipient;
use actix_web_actors::ws::CloseCode as ClientCloseCode;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use futures_util::{Sink, SinkExt, Stream};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as ProviderCloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error, info, trace, warn};

/// How a forwarder terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The side this forwarder reads from ended normally.
    NormalEnd,
    /// The opposite peer closed the connection.
    PeerClosed,
    /// An unrecoverable error inside the forwarder.
    Failure(RelayError),
}

/// The relay task's view of the client side: the three messages it
/// sends back to the session actor. Any actor handling those messages
/// can stand on the client end of a relay.
#[derive(Clone)]
pub struct ClientHandle {
    pub transcripts: Recipient<DeliverTranscript>,
    pub phases: Recipient<AdvancePhase>,
    pub close: Recipient<CloseClient>,
}

/// Everything the provider-side task needs; handed over by the session
/// actor when the handshake succeeds.
pub struct RelayInputs {
    pub session_id: String,
    pub language: String,
    pub provider: ProviderConfig,
    pub http: reqwest::Client,
    pub audio_rx: mpsc::Receiver<Bytes>,
    pub client: ClientHandle,
}

/// Run one session's provider side to completion: authorize, link,
/// stream, tear down. Always finishes by asking the session actor to
/// close the client connection; never panics the hosting process.
pub async fn run_relay(inputs: RelayInputs) {
    let RelayInputs {
        session_id,
        language,
        provider,
        http,
        audio_rx,
        client,
    } = inputs;

    client.phases.do_send(AdvancePhase(SessionState::Authorizing));
    let credential = match mint_credential(&http, &provider).await {
        Ok(credential) => {
            info!(%session_id, "ephemeral credential obtained");
            credential
        }
        Err(err) => {
            error!(%session_id, %err, "credential minting failed");
            fail_session(&client, &err);
            return;
        }
    };

    client.phases.do_send(AdvancePhase(SessionState::Linking));
    let socket = match open_provider_link(&provider, &credential, &language).await {
        Ok(socket) => {
            info!(%session_id, "provider link open");
            socket
        }
        Err(failure) => {
            let err = RelayError::Link(failure);
            error!(%session_id, %err, "provider link failed");
            fail_session(&client, &err);
            return;
        }
    };

    client.phases.do_send(AdvancePhase(SessionState::Streaming));
    let (sink, stream) = socket.split();
    stream_session(audio_rx, sink, stream, &client, &session_id).await;

    info!(%session_id, "streaming finished");
    client.close.do_send(CloseClient {
        code: ClientCloseCode::Normal,
        reason: None,
    });
}

fn fail_session(client: &ClientHandle, err: &RelayError) {
    if let Some(message) = err.client_message() {
        client
            .transcripts
            .do_send(DeliverTranscript(TranscriptEvent::Error(message)));
    }
    client.close.do_send(CloseClient {
        code: ClientCloseCode::Error,
        reason: None,
    });
}

/// Pump both directions until one forwarder finishes. The winner decides
/// the outcome; the sibling is cancelled and awaited so neither forwarder
/// outlives the link it was spawned against.
async fn stream_session<S, St>(
    audio_rx: mpsc::Receiver<Bytes>,
    sink: S,
    stream: St,
    client: &ClientHandle,
    session_id: &str,
) where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
    St: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    let mut audio_task = tokio::spawn(forward_audio(audio_rx, sink, session_id.to_string()));
    let mut transcript_task = tokio::spawn(forward_transcripts(
        stream,
        client.transcripts.clone(),
        session_id.to_string(),
    ));

    tokio::select! {
        outcome = &mut audio_task => {
            transcript_task.abort();
            let _ = (&mut transcript_task).await;
            log_forwarder_outcome(session_id, "audio", outcome);
        }
        outcome = &mut transcript_task => {
            audio_task.abort();
            let _ = (&mut audio_task).await;
            log_forwarder_outcome(session_id, "transcripts", outcome);
        }
    }
}

fn log_forwarder_outcome(
    session_id: &str,
    task: &'static str,
    outcome: Result<ForwardOutcome, JoinError>,
) {
    match outcome {
        Ok(ForwardOutcome::NormalEnd) => info!(%session_id, task, "forwarder finished"),
        Ok(ForwardOutcome::PeerClosed) => info!(%session_id, task, "peer closed the connection"),
        Ok(ForwardOutcome::Failure(err)) => error!(%session_id, task, %err, "forwarder failed"),
        Err(join_err) => error!(%session_id, task, %join_err, "forwarder task ended abnormally"),
    }
}

/// Pump client audio frames to the provider until the client stream
/// ends, the provider closes, or an unrecoverable send error occurs.
/// Frames are forwarded strictly in arrival order; empty frames are
/// skipped without ending the stream.
pub(crate) async fn forward_audio<S>(
    mut audio_rx: mpsc::Receiver<Bytes>,
    mut sink: S,
    session_id: String,
) -> ForwardOutcome
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    debug!(%session_id, "audio forwarder started");

    while let Some(frame) = audio_rx.recv().await {
        if frame.is_empty() {
            debug!(%session_id, "skipping empty audio frame");
            continue;
        }

        let command = append_command(&frame);
        if let Err(err) = sink.send(Message::Text(command)).await {
            return match err {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    info!(%session_id, "provider closed while forwarding audio");
                    ForwardOutcome::PeerClosed
                }
                other => ForwardOutcome::Failure(RelayError::Stream {
                    task: "audio",
                    detail: other.to_string(),
                }),
            };
        }
        trace!(%session_id, bytes = frame.len(), "audio frame forwarded");
    }

    info!(%session_id, "client audio stream ended");
    ForwardOutcome::NormalEnd
}

/// One provider "append audio buffer" command for a single frame.
pub(crate) fn append_command(frame: &[u8]) -> String {
    serde_json::json!({
        "type": "input_audio_buffer.append",
        "audio": BASE64.encode(frame),
    })
    .to_string()
}

/// Pump provider events to the client until the provider stream ends or
/// an unrecoverable error occurs. Malformed messages are logged and
/// skipped; unknown event types are ignored; abnormal provider closure
/// produces one client-visible error, normal closure exits silently.
pub(crate) async fn forward_transcripts<St>(
    mut stream: St,
    client: Recipient<DeliverTranscript>,
    session_id: String,
) -> ForwardOutcome
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    debug!(%session_id, "transcript forwarder started");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(raw)) => match parse_provider_event(&raw) {
                ProviderEvent::Delta(text) => {
                    if !text.is_empty() {
                        client.do_send(DeliverTranscript(TranscriptEvent::Partial(text)));
                    }
                }
                ProviderEvent::Completed(text) => {
                    // Completion is signaled even when the text is empty.
                    client.do_send(DeliverTranscript(TranscriptEvent::Final(text)));
                }
                ProviderEvent::Error(message) => {
                    warn!(%session_id, %message, "provider reported an error event");
                    client.do_send(DeliverTranscript(TranscriptEvent::Error(message)));
                }
                ProviderEvent::Ignored => {}
                ProviderEvent::Malformed => {
                    warn!(%session_id, raw = %raw, "skipping malformed provider message");
                }
            },
            Ok(Message::Close(frame)) => {
                return match frame {
                    Some(frame) if frame.code != ProviderCloseCode::Normal => {
                        let reason = close_reason(&frame);
                        warn!(%session_id, %reason, "provider closed abnormally");
                        client.do_send(DeliverTranscript(TranscriptEvent::Error(format!(
                            "Transcription service connection closed: {}",
                            reason
                        ))));
                        ForwardOutcome::PeerClosed
                    }
                    _ => {
                        info!(%session_id, "provider closed normally");
                        ForwardOutcome::NormalEnd
                    }
                };
            }
            // Ping/pong and binary frames carry no transcription payload.
            Ok(_) => {}
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                info!(%session_id, "provider connection closed");
                return ForwardOutcome::NormalEnd;
            }
            Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => {
                warn!(%session_id, "provider connection dropped without close handshake");
                client.do_send(DeliverTranscript(TranscriptEvent::Error(
                    "Transcription service connection closed: connection reset".to_string(),
                )));
                return ForwardOutcome::PeerClosed;
            }
            Err(err) => {
                error!(%session_id, %err, "error receiving from provider");
                client.do_send(DeliverTranscript(TranscriptEvent::Error(
                    "Error receiving transcription.".to_string(),
                )));
                return ForwardOutcome::Failure(RelayError::Stream {
                    task: "transcripts",
                    detail: err.to_string(),
                });
            }
        }
    }

    info!(%session_id, "provider message stream ended");
    ForwardOutcome::NormalEnd
}

fn close_reason(frame: &CloseFrame<'_>) -> String {
    if frame.reason.is_empty() {
        format!("code {}", frame.code)
    } else {
        frame.reason.to_string()
    }
}
