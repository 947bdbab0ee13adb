//! Agent-side protocol: outbound record builders and inbound classification.
//!
//! Provider variants disagree on nesting (metadata and ping payloads come
//! both wrapped in `*_event` objects and flat; audio shows up under several
//! field names), so inbound records are classified by probing a
//! `serde_json::Value` rather than forced through a rigid enum. Unknown
//! tags classify as [`AgentEvent::Other`] and never fail.

use crate::AudioFormat;
use serde_json::{Value, json};

/// Initial record sent as soon as the agent socket opens. Dynamic variables
/// only; the agent's own configuration rules, so no voice or prompt
/// overrides are ever included.
pub fn initiation(dynamic_variables: Value) -> String {
    json!({
        "type": "conversation_initiation_client_data",
        "conversation_initiation_client_data": {
            "dynamic_variables": dynamic_variables,
        },
    })
    .to_string()
}

/// One packet of caller audio, base64 in the agent's expected input format.
pub fn user_audio_chunk(payload_b64: &str) -> String {
    json!({ "user_audio_chunk": payload_b64 }).to_string()
}

pub fn user_audio_start() -> String {
    json!({ "type": "user_audio_start" }).to_string()
}

pub fn user_audio_end() -> String {
    json!({ "type": "user_audio_end" }).to_string()
}

/// Barge-in signal: the caller started speaking over the agent.
pub fn user_activity() -> String {
    json!({ "type": "user_activity" }).to_string()
}

pub fn user_message(text: &str) -> String {
    json!({ "type": "user_message", "user_message": { "message": text } }).to_string()
}

pub fn conversation_start() -> String {
    json!({ "type": "conversation_start" }).to_string()
}

pub fn pong(event_id: Option<&Value>) -> String {
    match event_id {
        Some(id) => json!({ "type": "pong", "event_id": id }).to_string(),
        None => json!({ "type": "pong" }).to_string(),
    }
}

/// Field paths probed, in order, for an audio payload.
const AUDIO_PATHS: &[&str] = &[
    "/audio_event/audio_base_64",
    "/audio",
    "/audio/chunk",
    "/tts/audio",
    "/response/audio",
    "/chunk",
];

/// A classified inbound agent record.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Metadata {
        input_format: Option<AudioFormat>,
        output_format: Option<AudioFormat>,
    },
    Audio {
        payload_b64: String,
    },
    Ping {
        event_id: Option<Value>,
    },
    Interruption,
    UserTranscript {
        text: Option<String>,
    },
    AgentResponse {
        text: Option<String>,
    },
    Error {
        message: String,
    },
    Other {
        kind: String,
    },
}

impl AgentEvent {
    pub fn classify(value: &Value) -> Self {
        // an `error` field anywhere at the top level is fatal regardless of tag
        if let Some(err) = value.get("error") {
            return Self::Error {
                message: stringify(err),
            };
        }
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "error" => Self::Error {
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified agent error")
                    .to_string(),
            },
            "conversation_initiation_metadata" => {
                let meta = value
                    .get("conversation_initiation_metadata_event")
                    .or_else(|| value.get("conversation_initiation_metadata"))
                    .unwrap_or(value);
                Self::Metadata {
                    input_format: format_of(meta, "user_input_audio_format"),
                    output_format: format_of(meta, "agent_output_audio_format"),
                }
            }
            "ping" => Self::Ping {
                event_id: value
                    .pointer("/ping_event/event_id")
                    .or_else(|| value.get("event_id"))
                    .cloned(),
            },
            "interruption" => Self::Interruption,
            "user_transcript" => Self::UserTranscript {
                text: string_at(value, "/user_transcription_event/user_transcript"),
            },
            "agent_response" => Self::AgentResponse {
                text: string_at(value, "/agent_response_event/agent_response"),
            },
            _ => match extract_audio(value) {
                Some(payload_b64) => Self::Audio { payload_b64 },
                None => Self::Other {
                    kind: kind.to_string(),
                },
            },
        }
    }
}

fn extract_audio(value: &Value) -> Option<String> {
    AUDIO_PATHS
        .iter()
        .find_map(|path| value.pointer(path).and_then(Value::as_str))
        .map(str::to_owned)
}

fn format_of(meta: &Value, field: &str) -> Option<AudioFormat> {
    meta.get(field)
        .and_then(Value::as_str)
        .and_then(AudioFormat::from_label)
}

fn string_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn stringify(err: &Value) -> String {
    match err.as_str() {
        Some(s) => s.to_string(),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(text: &str) -> AgentEvent {
        AgentEvent::classify(&serde_json::from_str(text).unwrap())
    }

    #[test]
    fn classifies_nested_metadata() {
        let ev = classify(
            r#"{
                "type": "conversation_initiation_metadata",
                "conversation_initiation_metadata_event": {
                    "conversation_id": "c1",
                    "user_input_audio_format": "pcm_16000",
                    "agent_output_audio_format": "ulaw_8000"
                }
            }"#,
        );
        assert_eq!(
            ev,
            AgentEvent::Metadata {
                input_format: Some(AudioFormat::Pcm16k),
                output_format: Some(AudioFormat::Ulaw8000),
            }
        );
    }

    #[test]
    fn classifies_flat_metadata() {
        let ev = classify(
            r#"{
                "type": "conversation_initiation_metadata",
                "user_input_audio_format": "ulaw_8000",
                "agent_output_audio_format": "pcm_16000"
            }"#,
        );
        assert_eq!(
            ev,
            AgentEvent::Metadata {
                input_format: Some(AudioFormat::Ulaw8000),
                output_format: Some(AudioFormat::Pcm16k),
            }
        );
    }

    #[test]
    fn metadata_with_unknown_formats_keeps_none() {
        let ev = classify(
            r#"{"type":"conversation_initiation_metadata","user_input_audio_format":"opus_48000"}"#,
        );
        assert_eq!(
            ev,
            AgentEvent::Metadata {
                input_format: None,
                output_format: None,
            }
        );
    }

    #[test]
    fn classifies_every_audio_shape() {
        let shapes = [
            r#"{"type":"audio","audio_event":{"audio_base_64":"QUJD","event_id":4}}"#,
            r#"{"type":"audio","audio":"QUJD"}"#,
            r#"{"audio":{"chunk":"QUJD"}}"#,
            r#"{"tts":{"audio":"QUJD"}}"#,
            r#"{"response":{"audio":"QUJD"}}"#,
            r#"{"chunk":"QUJD"}"#,
        ];
        for shape in shapes {
            assert_eq!(
                classify(shape),
                AgentEvent::Audio {
                    payload_b64: "QUJD".into()
                },
                "shape {shape}"
            );
        }
    }

    #[test]
    fn classifies_ping_both_shapes() {
        let ev = classify(r#"{"type":"ping","ping_event":{"event_id":12}}"#);
        assert_eq!(
            ev,
            AgentEvent::Ping {
                event_id: Some(json!(12))
            }
        );
        let ev = classify(r#"{"type":"ping","event_id":"abc"}"#);
        assert_eq!(
            ev,
            AgentEvent::Ping {
                event_id: Some(json!("abc"))
            }
        );
    }

    #[test]
    fn classifies_interruption_and_transcripts() {
        assert_eq!(classify(r#"{"type":"interruption"}"#), AgentEvent::Interruption);
        assert_eq!(
            classify(
                r#"{"type":"user_transcript","user_transcription_event":{"user_transcript":"hi"}}"#
            ),
            AgentEvent::UserTranscript {
                text: Some("hi".into())
            }
        );
        assert_eq!(
            classify(r#"{"type":"agent_response","agent_response_event":{"agent_response":"yo"}}"#),
            AgentEvent::AgentResponse {
                text: Some("yo".into())
            }
        );
    }

    #[test]
    fn classifies_errors() {
        assert_eq!(
            classify(r#"{"type":"error","message":"bad agent id"}"#),
            AgentEvent::Error {
                message: "bad agent id".into()
            }
        );
        // an error field wins even with another tag
        assert_eq!(
            classify(r#"{"type":"audio","error":"quota exceeded"}"#),
            AgentEvent::Error {
                message: "quota exceeded".into()
            }
        );
    }

    #[test]
    fn unknown_tag_is_other() {
        assert_eq!(
            classify(r#"{"type":"internal_tentative_agent_response"}"#),
            AgentEvent::Other {
                kind: "internal_tentative_agent_response".into()
            }
        );
    }

    #[test]
    fn pong_echoes_event_id() {
        let id = json!(7);
        let record: Value = serde_json::from_str(&pong(Some(&id))).unwrap();
        assert_eq!(record["type"], "pong");
        assert_eq!(record["event_id"], json!(7));
    }

    #[test]
    fn initiation_carries_dynamic_variables_only() {
        let record: Value = serde_json::from_str(&initiation(json!({
            "caller_phone": "+15550100",
            "mode": "discovery",
        })))
        .unwrap();
        let data = &record["conversation_initiation_client_data"];
        assert_eq!(data["dynamic_variables"]["mode"], "discovery");
        assert!(data.get("conversation_config_override").is_none());
        assert!(data.get("tts").is_none());
    }
}
