/// Typed Wyoming messages
///
/// Each message maps to one event type. Data fields travel as the event's
/// JSON data; audio travels as the binary payload.

use super::event::{CodecError, Event};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Conversion between a typed message and a raw [`Event`]
pub trait Message: Serialize + DeserializeOwned {
    const TYPE: &'static str;

    fn is_type(event_type: &str) -> bool {
        event_type == Self::TYPE
    }

    fn to_event(&self) -> Event {
        Event::new(Self::TYPE).with_data(to_data(self))
    }

    fn from_event(event: &Event) -> Result<Self, CodecError> {
        decode_data(event, Self::TYPE)
    }
}

fn to_data<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn decode_data<T: DeserializeOwned>(event: &Event, expected: &str) -> Result<T, CodecError> {
    if event.event_type != expected {
        return Err(CodecError::MalformedFrame(format!(
            "expected '{}' event, got '{}'",
            expected, event.event_type
        )));
    }

    serde_json::from_value(Value::Object(event.data.clone()))
        .map_err(|e| CodecError::MalformedFrame(format!("invalid '{}' data: {}", expected, e)))
}

/// Request for service information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Describe {}

impl Message for Describe {
    const TYPE: &'static str = "describe";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeModel {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub phrase: Option<String>,
    pub attribution: Attribution,
    pub installed: bool,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeProgram {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub attribution: Attribution,
    pub installed: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub models: Vec<WakeModel>,
}

/// Reply to [`Describe`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub wake: Vec<WakeProgram>,
}

impl Message for Info {
    const TYPE: &'static str = "info";
}

/// Wake-word selection sent before audio starts
///
/// `sensitivities` and `language` are extensions; clients that only send
/// `names` get the server defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivities: Option<BTreeMap<String, f32>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Message for Detect {
    const TYPE: &'static str = "detect";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStart {
    pub rate: u32,
    pub width: u16,
    pub channels: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Message for AudioStart {
    const TYPE: &'static str = "audio-start";
}

/// Raw PCM audio; samples are carried in the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChunk {
    pub rate: u32,
    pub width: u16,
    pub channels: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,

    /// Optional client sequence number; must strictly increase when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    #[serde(skip)]
    pub audio: Bytes,
}

impl Message for AudioChunk {
    const TYPE: &'static str = "audio-chunk";

    fn to_event(&self) -> Event {
        Event::new(Self::TYPE)
            .with_data(to_data(self))
            .with_payload(self.audio.clone())
    }

    fn from_event(event: &Event) -> Result<Self, CodecError> {
        let mut chunk: Self = decode_data(event, Self::TYPE)?;
        chunk.audio = event.payload.clone().unwrap_or_default();
        Ok(chunk)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioStop {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Message for AudioStop {
    const TYPE: &'static str = "audio-stop";
}

/// Acknowledges a completed negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReady {
    pub session: String,
    pub keywords: Vec<String>,
    pub frame_length: usize,
    pub rate: u32,
}

impl Message for SessionReady {
    const TYPE: &'static str = "session-ready";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl Message for Detection {
    const TYPE: &'static str = "detection";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotDetected {}

impl Message for NotDetected {
    const TYPE: &'static str = "not-detected";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Message for ErrorMessage {
    const TYPE: &'static str = "error";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Message for Ping {
    const TYPE: &'static str = "ping";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Message for Pong {
    const TYPE: &'static str = "pong";
}
