//! Model event vocabulary.
//!
//! Inbound events (bridge → model) are JSON objects of shape
//! `{"event":{"<name>":<payload>}}` serialized to UTF-8 bytes. Outbound
//! events (model → bridge) arrive as JSON chunks named by the single
//! top-level key inside `event`, or as bare error variants.

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::InferenceConfig;

/// Error variant names the model RPC can deliver instead of an event.
pub const ERROR_VARIANTS: &[&str] = &[
    "modelStreamErrorException",
    "internalServerException",
    "validationException",
    "throttlingException",
    "accessDeniedException",
];

/// Typed event classification.
///
/// Anything outside the enumerated vocabulary is preserved as `Custom`
/// and reaches observers only through the subject and the `any` handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    SessionStart,
    PromptStart,
    ContentStart,
    AudioInput,
    AudioOutput,
    TextOutput,
    ContentEnd,
    PromptEnd,
    SessionEnd,
    CompletionStart,
    CompletionEnd,
    UsageEvent,
    Error,
    StreamComplete,
    Custom(String),
}

impl EventType {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::SessionStart => "sessionStart",
            Self::PromptStart => "promptStart",
            Self::ContentStart => "contentStart",
            Self::AudioInput => "audioInput",
            Self::AudioOutput => "audioOutput",
            Self::TextOutput => "textOutput",
            Self::ContentEnd => "contentEnd",
            Self::PromptEnd => "promptEnd",
            Self::SessionEnd => "sessionEnd",
            Self::CompletionStart => "completionStart",
            Self::CompletionEnd => "completionEnd",
            Self::UsageEvent => "usageEvent",
            Self::Error => "error",
            Self::StreamComplete => "streamComplete",
            Self::Custom(name) => name,
        }
    }

    /// Maps a wire name onto the typed vocabulary.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "sessionStart" => Self::SessionStart,
            "promptStart" => Self::PromptStart,
            "contentStart" => Self::ContentStart,
            "audioInput" => Self::AudioInput,
            "audioOutput" => Self::AudioOutput,
            "textOutput" => Self::TextOutput,
            "contentEnd" => Self::ContentEnd,
            "promptEnd" => Self::PromptEnd,
            "sessionEnd" => Self::SessionEnd,
            "completionStart" => Self::CompletionStart,
            "completionEnd" => Self::CompletionEnd,
            "usageEvent" => Self::UsageEvent,
            "error" => Self::Error,
            "streamComplete" => Self::StreamComplete,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// A normalized event delivered through the session subject.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    #[serde(serialize_with = "serialize_event_type")]
    pub event_type: EventType,
    pub data: Value,
}

fn serialize_event_type<S: serde::Serializer>(
    event_type: &EventType,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(event_type.name())
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound Event Builders (bridge → model)
// ─────────────────────────────────────────────────────────────────────────────

fn envelope(name: &str, payload: Value) -> Value {
    json!({ "event": { name: payload } })
}

fn inference_payload(inference: &InferenceConfig) -> Value {
    json!({
        "maxTokens": inference.max_tokens,
        "topP": inference.top_p,
        "temperature": inference.temperature,
    })
}

pub fn session_start(inference: &InferenceConfig) -> Value {
    envelope(
        "sessionStart",
        json!({ "inferenceConfiguration": inference_payload(inference) }),
    )
}

pub fn prompt_start(prompt_name: &str, inference: &InferenceConfig) -> Value {
    envelope(
        "promptStart",
        json!({
            "promptName": prompt_name,
            "inferenceConfiguration": inference_payload(inference),
        }),
    )
}

pub fn content_start(prompt_name: &str, content_name: &str) -> Value {
    envelope(
        "contentStart",
        json!({
            "promptName": prompt_name,
            "contentName": content_name,
            "type": "AUDIO",
            "interactive": true,
            "audioInputConfiguration": {
                "mediaType": "audio/pcm",
                "sampleRateHertz": 16000,
                "sampleSizeBits": 16,
                "channelCount": 1,
            },
        }),
    )
}

pub fn audio_input(prompt_name: &str, content_name: &str, base64_pcm: &str) -> Value {
    envelope(
        "audioInput",
        json!({
            "promptName": prompt_name,
            "contentName": content_name,
            "content": base64_pcm,
        }),
    )
}

pub fn content_end(prompt_name: &str, content_name: &str) -> Value {
    envelope(
        "contentEnd",
        json!({ "promptName": prompt_name, "contentName": content_name }),
    )
}

pub fn prompt_end(prompt_name: &str) -> Value {
    envelope("promptEnd", json!({ "promptName": prompt_name }))
}

pub fn session_end() -> Value {
    envelope("sessionEnd", json!({}))
}

/// Synthetic event emitted when an inbound event fails to serialize.
pub fn synthetic_error(reason: &str) -> Value {
    envelope("error", json!({ "reason": reason }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound Chunk Parsing (model → bridge)
// ─────────────────────────────────────────────────────────────────────────────

/// One decoded response chunk.
#[derive(Debug, Clone)]
pub enum ParsedResponse {
    /// A regular event: `{"event":{"<name>":<payload>}}` or a bare
    /// single-key object for providers that skip the envelope.
    Event { event_type: EventType, data: Value },
    /// An error variant such as `{"modelStreamErrorException":{...}}`.
    Error { error_type: String, details: Value },
}

/// Decodes one UTF-8 JSON response chunk.
///
/// Returns `Err` only for malformed JSON; the caller logs and skips such
/// chunks without terminating the stream.
pub fn parse_response_chunk(chunk: &[u8]) -> Result<ParsedResponse, serde_json::Error> {
    let value: Value = serde_json::from_slice(chunk)?;

    if let Some(object) = value.as_object() {
        // Bare error variants take priority: they arrive without envelope.
        for &variant in ERROR_VARIANTS {
            if let Some(details) = object.get(variant) {
                return Ok(ParsedResponse::Error {
                    error_type: variant.to_string(),
                    details: details.clone(),
                });
            }
        }

        let inner = object.get("event").and_then(Value::as_object);
        if let Some(inner) = inner {
            if let Some((name, payload)) = inner.iter().next() {
                for &variant in ERROR_VARIANTS {
                    if name == variant {
                        return Ok(ParsedResponse::Error {
                            error_type: variant.to_string(),
                            details: payload.clone(),
                        });
                    }
                }
                return Ok(ParsedResponse::Event {
                    event_type: EventType::from_name(name),
                    data: payload.clone(),
                });
            }
        }

        // Single-key object without envelope: treat the key as the name.
        if object.len() == 1 {
            let (name, payload) = object.iter().next().expect("len checked");
            return Ok(ParsedResponse::Event {
                event_type: EventType::from_name(name),
                data: payload.clone(),
            });
        }
    }

    // Shapeless but valid JSON: surface as a custom event so nothing is
    // silently lost.
    Ok(ParsedResponse::Event {
        event_type: EventType::Custom("unknown".to_string()),
        data: value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_events_use_single_key_envelope() {
        let inference = InferenceConfig::default();
        let event = session_start(&inference);
        assert_eq!(
            event["event"]["sessionStart"]["inferenceConfiguration"]["maxTokens"],
            1024
        );

        let event = audio_input("p1", "c1", "QUJD");
        let payload = &event["event"]["audioInput"];
        assert_eq!(payload["promptName"], "p1");
        assert_eq!(payload["contentName"], "c1");
        assert_eq!(payload["content"], "QUJD");
    }

    #[test]
    fn content_start_declares_pcm_audio() {
        let event = content_start("p1", "c1");
        let payload = &event["event"]["contentStart"];
        assert_eq!(payload["type"], "AUDIO");
        assert_eq!(payload["audioInputConfiguration"]["mediaType"], "audio/pcm");
        assert_eq!(
            payload["audioInputConfiguration"]["sampleRateHertz"],
            16000
        );
    }

    #[test]
    fn parse_enveloped_event() {
        let chunk = br#"{"event":{"textOutput":{"content":"hello"}}}"#;
        match parse_response_chunk(chunk).expect("valid json") {
            ParsedResponse::Event { event_type, data } => {
                assert_eq!(event_type, EventType::TextOutput);
                assert_eq!(data["content"], "hello");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_bare_error_variant() {
        let chunk = br#"{"modelStreamErrorException":{"message":"boom"}}"#;
        match parse_response_chunk(chunk).expect("valid json") {
            ParsedResponse::Error {
                error_type,
                details,
            } => {
                assert_eq!(error_type, "modelStreamErrorException");
                assert_eq!(details["message"], "boom");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parse_enveloped_error_variant() {
        let chunk = br#"{"event":{"throttlingException":{"message":"slow"}}}"#;
        match parse_response_chunk(chunk).expect("valid json") {
            ParsedResponse::Error { error_type, .. } => {
                assert_eq!(error_type, "throttlingException");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_becomes_custom() {
        let chunk = br#"{"event":{"toolUse":{"name":"lookup"}}}"#;
        match parse_response_chunk(chunk).expect("valid json") {
            ParsedResponse::Event { event_type, .. } => {
                assert_eq!(event_type, EventType::Custom("toolUse".to_string()));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_response_chunk(b"{not json").is_err());
    }

    #[test]
    fn event_type_names_roundtrip() {
        for name in [
            "sessionStart",
            "audioOutput",
            "completionEnd",
            "usageEvent",
            "streamComplete",
        ] {
            assert_eq!(EventType::from_name(name).name(), name);
        }
        assert_eq!(EventType::from_name("somethingNew").name(), "somethingNew");
    }
}
