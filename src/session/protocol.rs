//! # WebSocket Protocol Messages
//!
//! One JSON object per WebSocket text frame, discriminated by a `type` field.
//!
//! ## Client → Server:
//! - `load_model`: request that the recognizer model be loaded
//! - `unload_model`: request that the recognizer model be released
//! - `audio`: base64-encoded audio payload to transcribe
//!
//! ## Server → Client:
//! - `status`: current model state, sent on connect and after every change
//! - `transcribing`: acknowledgement that an audio payload was accepted
//! - `result`: transcribed text
//! - `error`: human-readable failure description

use serde::{Deserialize, Serialize};

/// WebSocket message types for client-server communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebSocketMessage {
    /// Client request: load the recognizer model
    #[serde(rename = "load_model")]
    LoadModel,

    /// Client request: unload the recognizer model
    #[serde(rename = "unload_model")]
    UnloadModel,

    /// Client request: transcribe an audio clip
    #[serde(rename = "audio")]
    Audio {
        /// Base64-encoded audio bytes (raw PCM16 mono 16kHz, or a WAV file)
        data: String,
    },

    /// Server notification: current model state
    #[serde(rename = "status")]
    Status {
        /// One of "unloaded", "loading", "loaded"
        model_state: String,
        /// Seconds until idle eviction; null unless the model is loaded
        idle_remaining: Option<f64>,
    },

    /// Server acknowledgement that transcription has started
    #[serde(rename = "transcribing")]
    Transcribing,

    /// Server response carrying transcribed text
    #[serde(rename = "result")]
    Result {
        /// The recognized text
        text: String,
    },

    /// Server-reported failure, delivered only to the affected session
    #[serde(rename = "error")]
    Error {
        /// Human-readable error message
        message: String,
    },
}

impl WebSocketMessage {
    /// Convenience constructor for error replies.
    pub fn error(message: impl Into<String>) -> Self {
        WebSocketMessage::Error {
            message: message.into(),
        }
    }
}
