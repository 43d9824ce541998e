//! # Provider Wire Events
//!
//! Translation between the provider's JSON event protocol and the
//! client's minimal partial/final/error vocabulary.
//!
//! Provider events are discriminated by a `type` field. Only the
//! transcription delta and completion events carry text; any event type
//! containing "error" (case-insensitive) is surfaced to the client;
//! everything else is ignored so unknown event types never terminate a
//! session. Messages that do not parse as JSON are reported as
//! `Malformed` and skipped by the caller.

use serde::Serialize;
use serde_json::Value;

/// Event type emitted while an utterance is still being transcribed.
pub const DELTA_EVENT: &str = "conversation.item.input_audio_transcription.delta";

/// Event type emitted when one utterance's transcription is complete.
pub const COMPLETED_EVENT: &str = "conversation.item.input_audio_transcription.completed";

/// Client-visible message when a provider error event carries no text.
pub const FALLBACK_ERROR_MESSAGE: &str = "Transcription error from provider.";

/// A message bound for the client, serialized to the wire vocabulary
/// `{"partial": ...}`, `{"final": ...}` or `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptEvent {
    Partial(String),
    Final(String),
    Error(String),
}

/// One provider wire message, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Incremental transcript text for the current utterance.
    Delta(String),
    /// Completed transcript for one utterance; text may be empty.
    Completed(String),
    /// Provider-reported error, already reduced to a message.
    Error(String),
    /// A valid event we do not act on.
    Ignored,
    /// Not parseable as JSON; log and skip.
    Malformed,
}

/// Classify one raw provider message.
pub fn parse_provider_event(raw: &str) -> ProviderEvent {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => return ProviderEvent::Malformed,
    };

    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    if event_type == DELTA_EVENT {
        ProviderEvent::Delta(transcription_text(&value))
    } else if event_type == COMPLETED_EVENT {
        ProviderEvent::Completed(transcription_text(&value))
    } else if event_type.to_ascii_lowercase().contains("error") {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(FALLBACK_ERROR_MESSAGE)
            .to_string();
        ProviderEvent::Error(message)
    } else {
        ProviderEvent::Ignored
    }
}

fn transcription_text(value: &Value) -> String {
    value
        .get("input_audio_transcription")
        .and_then(|t| t.get("text"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_event_extracts_partial_text() {
        let raw = r#"{
            "type": "conversation.item.input_audio_transcription.delta",
            "input_audio_transcription": {"text": "hello wor"}
        }"#;
        assert_eq!(
            parse_provider_event(raw),
            ProviderEvent::Delta("hello wor".to_string())
        );
    }

    #[test]
    fn delta_without_text_yields_empty_delta() {
        let raw = r#"{"type": "conversation.item.input_audio_transcription.delta"}"#;
        assert_eq!(parse_provider_event(raw), ProviderEvent::Delta(String::new()));
    }

    #[test]
    fn completed_event_keeps_empty_text() {
        let raw = r#"{
            "type": "conversation.item.input_audio_transcription.completed",
            "input_audio_transcription": {"text": ""}
        }"#;
        assert_eq!(
            parse_provider_event(raw),
            ProviderEvent::Completed(String::new())
        );
    }

    #[test]
    fn error_type_is_matched_case_insensitively() {
        let raw = r#"{"type": "transcription.ERROR", "message": "quota exceeded"}"#;
        assert_eq!(
            parse_provider_event(raw),
            ProviderEvent::Error("quota exceeded".to_string())
        );
    }

    #[test]
    fn error_without_message_uses_fallback() {
        let raw = r#"{"type": "session.error"}"#;
        assert_eq!(
            parse_provider_event(raw),
            ProviderEvent::Error(FALLBACK_ERROR_MESSAGE.to_string())
        );
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let raw = r#"{"type": "transcription_session.updated"}"#;
        assert_eq!(parse_provider_event(raw), ProviderEvent::Ignored);
    }

    #[test]
    fn missing_type_field_is_ignored() {
        let raw = r#"{"text": "no type here"}"#;
        assert_eq!(parse_provider_event(raw), ProviderEvent::Ignored);
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert_eq!(parse_provider_event("not json at all"), ProviderEvent::Malformed);
    }

    #[test]
    fn transcript_events_serialize_to_the_client_vocabulary() {
        let partial = TranscriptEvent::Partial("hel".to_string());
        assert_eq!(
            serde_json::to_string(&partial).unwrap(),
            r#"{"partial":"hel"}"#
        );

        let final_event = TranscriptEvent::Final(String::new());
        assert_eq!(serde_json::to_string(&final_event).unwrap(), r#"{"final":""}"#);

        let error = TranscriptEvent::Error("boom".to_string());
        assert_eq!(serde_json::to_string(&error).unwrap(), r#"{"error":"boom"}"#);
    }
}
