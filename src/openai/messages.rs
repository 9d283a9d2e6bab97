//! # Realtime Speech Protocol Messages
//!
//! Wire types for the speech service's WebSocket protocol. Every frame is a
//! JSON object discriminated by a `type` field; the strings here are the
//! protocol and must not drift.
//!
//! ## Message Flow:
//! - **Client → Server**: `session.update`, `input_audio_buffer.append`,
//!   `input_audio_buffer.commit`, `response.create`,
//!   `conversation.item.create`
//! - **Server → Client**: `session.created`, `session.updated`, audio and
//!   text deltas, VAD speech events, commit acknowledgments, `response.done`,
//!   `error`, `session.expired`

use serde::{Deserialize, Serialize};

/// Server-side voice activity detection settings sent in `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub detection_type: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl TurnDetection {
    pub fn server_vad(threshold: f32, prefix_padding_ms: u32, silence_duration_ms: u32) -> Self {
        Self {
            detection_type: "server_vad".to_string(),
            threshold,
            prefix_padding_ms,
            silence_duration_ms,
        }
    }
}

/// Input transcription settings sent in `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputAudioTranscription {
    pub model: String,
}

/// Session configuration declared once per connection attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection: TurnDetection,
    pub input_audio_transcription: InputAudioTranscription,
}

/// One content part of a conversation item.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub part_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

/// A conversation item (message, function call, ...).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ConversationItem {
    /// A plain text message item for `conversation.item.create`.
    pub fn text_message(role: &str, text: &str) -> Self {
        Self {
            item_type: "message".to_string(),
            role: Some(role.to_string()),
            content: vec![ContentPart {
                part_type: "input_text".to_string(),
                text: Some(text.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

/// Messages sent to the speech service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "response.create")]
    ResponseCreate,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
}

/// Remote session metadata attached to `session.created`/`session.updated`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: String,
}

/// Error payload carried by `error` frames.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ErrorDetail {
    /// Errors that mean the remote session is gone and the socket should be
    /// closed deliberately to re-enter the reconnect path.
    pub fn is_session_invalid(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("session_expired") | Some("invalid_session") | Some("session_not_found")
        )
    }

    /// The fallback `response.create` racing the server VAD's own response is
    /// expected; the rejection is benign.
    pub fn is_benign(&self) -> bool {
        self.code.as_deref() == Some("conversation_already_has_active_response")
            || self.message.contains("already has an active response")
    }
}

/// Messages received from the speech service.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.content_part.added")]
    ResponseContentPartAdded {
        #[serde(default)]
        part: ContentPart,
    },

    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        item: ConversationItem,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted,

    #[serde(rename = "input_audio_buffer.cleared")]
    InputAudioBufferCleared,

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ErrorDetail,
    },

    #[serde(rename = "session.expired")]
    SessionExpired,

    /// Anything this build does not handle; logged at trace and ignored.
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_update_wire_shape() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig {
                modalities: vec!["text".into(), "audio".into()],
                instructions: "be kind".into(),
                voice: "alloy".into(),
                input_audio_format: "pcm16".into(),
                output_audio_format: "pcm16".into(),
                turn_detection: TurnDetection::server_vad(0.5, 300, 500),
                input_audio_transcription: InputAudioTranscription {
                    model: "whisper-1".into(),
                },
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"session.update""#));
        assert!(json.contains(r#""turn_detection":{"type":"server_vad""#));
        assert!(json.contains(r#""silence_duration_ms":500"#));
        assert!(json.contains(r#""input_audio_transcription":{"model":"whisper-1"}"#));
    }

    #[test]
    fn test_append_and_commit_wire_shape() {
        let json = serde_json::to_string(&ClientEvent::InputAudioBufferAppend {
            audio: "QUJD".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"input_audio_buffer.append","audio":"QUJD"}"#);

        let json = serde_json::to_string(&ClientEvent::InputAudioBufferCommit).unwrap();
        assert_eq!(json, r#"{"type":"input_audio_buffer.commit"}"#);

        let json = serde_json::to_string(&ClientEvent::ResponseCreate).unwrap();
        assert_eq!(json, r#"{"type":"response.create"}"#);
    }

    #[test]
    fn test_conversation_item_create_shape() {
        let json = serde_json::to_string(&ClientEvent::ConversationItemCreate {
            item: ConversationItem::text_message("user", "hello"),
        })
        .unwrap();
        assert!(json.contains(r#""type":"conversation.item.create""#));
        assert!(json.contains(r#""role":"user""#));
        assert!(json.contains(r#""type":"input_text""#));
        assert!(json.contains(r#""text":"hello""#));
    }

    #[test]
    fn test_server_event_parsing() {
        let ev: ServerEvent =
            serde_json::from_str(r#"{"type":"session.created","session":{"id":"sess_1"}}"#)
                .unwrap();
        assert!(matches!(ev, ServerEvent::SessionCreated { session } if session.id == "sess_1"));

        let ev: ServerEvent =
            serde_json::from_str(r#"{"type":"response.audio.delta","delta":"QUJD"}"#).unwrap();
        assert!(matches!(ev, ServerEvent::ResponseAudioDelta { delta } if delta == "QUJD"));

        let ev: ServerEvent =
            serde_json::from_str(r#"{"type":"input_audio_buffer.speech_stopped"}"#).unwrap();
        assert!(matches!(ev, ServerEvent::SpeechStopped));

        let ev: ServerEvent = serde_json::from_str(r#"{"type":"input_audio_buffer.committed","item_id":"it_1"}"#)
            .unwrap();
        assert!(matches!(ev, ServerEvent::InputAudioBufferCommitted));
    }

    #[test]
    fn test_unknown_server_event_is_tolerated() {
        let ev: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert!(matches!(ev, ServerEvent::Unknown));
    }

    #[test]
    fn test_error_classification() {
        let expired = ErrorDetail {
            code: Some("session_expired".into()),
            message: "Session expired".into(),
        };
        assert!(expired.is_session_invalid());

        let benign = ErrorDetail {
            code: None,
            message: "Conversation already has an active response".into(),
        };
        assert!(benign.is_benign());
        assert!(!benign.is_session_invalid());
    }
}
