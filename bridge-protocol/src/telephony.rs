//! Telephony media-stream protocol: newline-free JSON text frames, one
//! record per WebSocket message, tagged by `event`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Inbound events from the telephony provider.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(default, rename = "streamSid")]
        stream_sid: Option<String>,
        start: StartMeta,
    },
    Media {
        media: MediaFrame,
    },
    Mark {
        #[serde(default)]
        mark: Option<MarkName>,
    },
    Stop,
    /// Anything else (`dtmf`, future event kinds) is ignored upstream.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StartMeta {
    #[serde(default, rename = "streamSid")]
    pub stream_sid: Option<String>,
    #[serde(default, rename = "customParameters")]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaFrame {
    /// `inbound` (caller) or `outbound` (our own echo); absent on some
    /// provider variants, which means inbound.
    #[serde(default)]
    pub track: Option<String>,
    /// base64 μ-law 8 kHz, nominally one 20 ms frame.
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkName {
    #[serde(default)]
    pub name: Option<String>,
}

/// Outbound records to the telephony provider. Sequencing fields are
/// string-typed on the wire.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundEvent {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        #[serde(rename = "sequenceNumber")]
        sequence_number: String,
        media: OutboundMedia,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: OutboundMark,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Serialize)]
pub struct OutboundMedia {
    pub track: &'static str,
    pub chunk: String,
    pub timestamp: String,
    /// base64 of exactly 160 μ-law bytes (20 ms).
    pub payload: String,
}

#[derive(Debug, Serialize)]
pub struct OutboundMark {
    pub name: String,
}

impl OutboundEvent {
    pub fn media(stream_sid: &str, seq: u64, chunk: u64, ts_ms: u64, payload_b64: String) -> Self {
        Self::Media {
            stream_sid: stream_sid.to_string(),
            sequence_number: seq.to_string(),
            media: OutboundMedia {
                track: "outbound",
                chunk: chunk.to_string(),
                timestamp: ts_ms.to_string(),
                payload: payload_b64,
            },
        }
    }

    pub fn mark(stream_sid: &str, chunk: u64) -> Self {
        Self::Mark {
            stream_sid: stream_sid.to_string(),
            mark: OutboundMark {
                name: format!("chunk-{chunk}"),
            },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        Self::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_connected() {
        let ev: TelephonyEvent = serde_json::from_str(r#"{"event":"connected"}"#).unwrap();
        assert!(matches!(ev, TelephonyEvent::Connected { .. }));
    }

    #[test]
    fn parses_start_with_custom_parameters() {
        let text = r#"{
            "event": "start",
            "streamSid": "MZ0000",
            "start": {
                "streamSid": "MZ0000",
                "customParameters": {
                    "token": "t0",
                    "agent_id": "agent-7",
                    "mode": "daily",
                    "caller_phone": "+15550100"
                }
            }
        }"#;
        let ev: TelephonyEvent = serde_json::from_str(text).unwrap();
        let TelephonyEvent::Start { stream_sid, start } = ev else {
            panic!("expected start");
        };
        assert_eq!(stream_sid.as_deref(), Some("MZ0000"));
        assert_eq!(start.stream_sid.as_deref(), Some("MZ0000"));
        assert_eq!(start.custom_parameters["agent_id"], "agent-7");
        assert_eq!(start.custom_parameters["mode"], "daily");
    }

    #[test]
    fn parses_start_without_parameters() {
        let text = r#"{"event":"start","start":{"streamSid":"MZ1"}}"#;
        let ev: TelephonyEvent = serde_json::from_str(text).unwrap();
        let TelephonyEvent::Start { start, .. } = ev else {
            panic!("expected start");
        };
        assert!(start.custom_parameters.is_empty());
    }

    #[test]
    fn parses_media_with_and_without_track() {
        let ev: TelephonyEvent =
            serde_json::from_str(r#"{"event":"media","media":{"track":"inbound","payload":"AAAA"}}"#)
                .unwrap();
        let TelephonyEvent::Media { media } = ev else {
            panic!("expected media");
        };
        assert_eq!(media.track.as_deref(), Some("inbound"));
        assert_eq!(media.payload, "AAAA");

        let ev: TelephonyEvent =
            serde_json::from_str(r#"{"event":"media","media":{"payload":"AAAA"}}"#).unwrap();
        let TelephonyEvent::Media { media } = ev else {
            panic!("expected media");
        };
        assert!(media.track.is_none());
    }

    #[test]
    fn parses_mark_and_stop() {
        let ev: TelephonyEvent =
            serde_json::from_str(r#"{"event":"mark","mark":{"name":"chunk-3"}}"#).unwrap();
        assert!(matches!(ev, TelephonyEvent::Mark { .. }));
        let ev: TelephonyEvent = serde_json::from_str(r#"{"event":"stop"}"#).unwrap();
        assert!(matches!(ev, TelephonyEvent::Stop));
    }

    #[test]
    fn unknown_event_does_not_error() {
        let ev: TelephonyEvent =
            serde_json::from_str(r#"{"event":"dtmf","dtmf":{"digit":"5"}}"#).unwrap();
        assert!(matches!(ev, TelephonyEvent::Unknown));
    }

    #[test]
    fn media_record_shape() {
        let ev = OutboundEvent::media("MZ9", 3, 3, 40, "UExW".into());
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({
                "event": "media",
                "streamSid": "MZ9",
                "sequenceNumber": "3",
                "media": {
                    "track": "outbound",
                    "chunk": "3",
                    "timestamp": "40",
                    "payload": "UExW"
                }
            })
        );
    }

    #[test]
    fn mark_record_shape() {
        let ev = OutboundEvent::mark("MZ9", 7);
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"event": "mark", "streamSid": "MZ9", "mark": {"name": "chunk-7"}})
        );
    }

    #[test]
    fn clear_record_shape() {
        let ev = OutboundEvent::clear("MZ9");
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"event": "clear", "streamSid": "MZ9"})
        );
    }
}
