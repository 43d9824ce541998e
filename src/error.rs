//! # Error Taxonomy
//!
//! Fatal session errors are converted into at most one client-visible
//! `{"error": ...}` message and drive the session state machine to
//! `Closing`; nothing escalates past the per-session boundary. Malformed
//! provider messages are not represented here because they are
//! recoverable: they are logged and skipped where they are parsed.
//!
//! ## Error Categories:
//! - **Handshake**: the client's start message was missing, malformed, or
//!   carried the wrong action. No provider contact is attempted.
//! - **Credential**: minting the ephemeral credential failed (transport,
//!   non-2xx status, or missing credential field).
//! - **Link**: the provider WebSocket could not be established or died
//!   during setup, with the most specific available cause.
//! - **Stream**: a forwarder failed after streaming began; the sibling
//!   forwarder is cancelled and the session closes.

use std::fmt;

/// How the provider link failed. Each cause maps to a distinct
/// client-visible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    /// The provider rejected the connection with an explicit HTTP status.
    Rejected(u16),

    /// The connection closed after it had been open (e.g. during the
    /// initial session configuration exchange).
    ClosedEarly(String),

    /// Any other transport-level failure.
    Transport(String),
}

/// Fatal, per-session relay errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Malformed or missing client start message.
    Handshake(String),

    /// Ephemeral credential minting failed.
    Credential(String),

    /// Provider WebSocket connection failed.
    Link(LinkFailure),

    /// A forwarder failed after streaming began.
    Stream {
        /// Which forwarder originated the failure ("audio" or "transcripts").
        task: &'static str,
        detail: String,
    },
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFailure::Rejected(status) => {
                write!(f, "provider rejected connection with status {}", status)
            }
            LinkFailure::ClosedEarly(reason) => {
                write!(f, "provider connection closed: {}", reason)
            }
            LinkFailure::Transport(detail) => {
                write!(f, "provider transport error: {}", detail)
            }
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Handshake(msg) => write!(f, "handshake error: {}", msg),
            RelayError::Credential(msg) => write!(f, "credential error: {}", msg),
            RelayError::Link(failure) => write!(f, "link error: {}", failure),
            RelayError::Stream { task, detail } => {
                write!(f, "stream error in {} forwarder: {}", task, detail)
            }
        }
    }
}

impl std::error::Error for LinkFailure {}
impl std::error::Error for RelayError {}

impl RelayError {
    /// The single client-visible error message for this failure, if one
    /// should be sent before closing. Handshake failures are answered
    /// with a close code only, so they have no message. Audio-forwarder
    /// failures are logged but not reported to the client.
    pub fn client_message(&self) -> Option<String> {
        match self {
            RelayError::Handshake(_) => None,
            RelayError::Credential(_) => Some(
                "Failed to connect to transcription service (token minting failed).".to_string(),
            ),
            RelayError::Link(LinkFailure::Rejected(_)) => Some(
                "Failed to connect to transcription service (auth or config issue).".to_string(),
            ),
            RelayError::Link(LinkFailure::ClosedEarly(reason)) => Some(format!(
                "Transcription service connection closed: {}",
                reason
            )),
            RelayError::Link(LinkFailure::Transport(_)) => Some(
                "An unexpected error occurred with the transcription service.".to_string(),
            ),
            RelayError::Stream {
                task: "transcripts",
                ..
            } => Some("Error receiving transcription.".to_string()),
            RelayError::Stream { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_errors_have_no_client_message() {
        let err = RelayError::Handshake("bad action".to_string());
        assert_eq!(err.client_message(), None);
    }

    #[test]
    fn credential_failure_maps_to_minting_message() {
        let err = RelayError::Credential("status 401".to_string());
        assert_eq!(
            err.client_message().unwrap(),
            "Failed to connect to transcription service (token minting failed)."
        );
    }

    #[test]
    fn rejected_link_maps_to_auth_message() {
        let err = RelayError::Link(LinkFailure::Rejected(403));
        assert_eq!(
            err.client_message().unwrap(),
            "Failed to connect to transcription service (auth or config issue)."
        );
    }

    #[test]
    fn early_close_message_carries_the_reason() {
        let err = RelayError::Link(LinkFailure::ClosedEarly("going away".to_string()));
        assert_eq!(
            err.client_message().unwrap(),
            "Transcription service connection closed: going away"
        );
    }

    #[test]
    fn audio_stream_failures_are_log_only() {
        let err = RelayError::Stream {
            task: "audio",
            detail: "io error".to_string(),
        };
        assert_eq!(err.client_message(), None);
    }

    #[test]
    fn display_includes_the_originating_task() {
        let err = RelayError::Stream {
            task: "transcripts",
            detail: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "stream error in transcripts forwarder: boom"
        );
    }
}
