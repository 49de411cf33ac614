/// Wyoming event framing
///
/// Each event on the wire is a single JSON header line, optionally followed by
/// a JSON data block (`data_length` bytes) and a binary payload
/// (`payload_length` bytes). Data may also be carried inline in the header;
/// both sources are merged on decode.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Protocol version advertised in outbound headers
pub const PROTOCOL_VERSION: &str = "1.5.2";

/// Upper bound for a single header line
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Upper bound for the JSON data block
pub const MAX_DATA_BYTES: usize = 1024 * 1024;

/// Upper bound for a binary payload (~2 minutes of 16kHz mono PCM)
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame too large: {what} is {size} bytes (limit {limit})")]
    TooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },
}

/// A single protocol event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    pub data: Map<String, Value>,
    pub payload: Option<Bytes>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Map::new(),
            payload: None,
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// Payload bytes, empty when the event carries none
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_length: Option<usize>,
}

/// Incremental codec for Wyoming events
///
/// Input may arrive in arbitrary fragments; nothing is yielded until the
/// header, data block and payload of an event are all buffered. Bytes past
/// the end of an event stay in the buffer for the next call.
#[derive(Debug, Default)]
pub struct WyomingCodec {
    pending: Option<Header>,
}

impl WyomingCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_header(line: &[u8]) -> Result<Header, CodecError> {
        let header: Header = serde_json::from_slice(line)
            .map_err(|e| CodecError::MalformedFrame(format!("invalid header: {}", e)))?;

        if header.event_type.is_empty() {
            return Err(CodecError::MalformedFrame("event type is empty".to_string()));
        }

        let data_len = header.data_length.unwrap_or(0);
        if data_len > MAX_DATA_BYTES {
            return Err(CodecError::TooLarge {
                what: "data",
                size: data_len,
                limit: MAX_DATA_BYTES,
            });
        }

        let payload_len = header.payload_length.unwrap_or(0);
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(CodecError::TooLarge {
                what: "payload",
                size: payload_len,
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        Ok(header)
    }
}

impl Decoder for WyomingCodec {
    type Item = Event;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Event>, CodecError> {
        while self.pending.is_none() {
            let Some(newline) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_HEADER_BYTES {
                    return Err(CodecError::TooLarge {
                        what: "header",
                        size: src.len(),
                        limit: MAX_HEADER_BYTES,
                    });
                }
                return Ok(None);
            };

            if newline > MAX_HEADER_BYTES {
                return Err(CodecError::TooLarge {
                    what: "header",
                    size: newline,
                    limit: MAX_HEADER_BYTES,
                });
            }

            let line = src.split_to(newline + 1);
            let line = line[..newline].trim_ascii();
            if line.is_empty() {
                continue;
            }

            self.pending = Some(Self::parse_header(line)?);
        }

        let (data_len, payload_len) = match &self.pending {
            Some(header) => (
                header.data_length.unwrap_or(0),
                header.payload_length.unwrap_or(0),
            ),
            None => return Ok(None),
        };

        let needed = data_len + payload_len;
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        let Some(header) = self.pending.take() else {
            return Ok(None);
        };

        let mut data = header.data.unwrap_or_default();
        if data_len > 0 {
            let block = src.split_to(data_len);
            let extra: Map<String, Value> = serde_json::from_slice(&block)
                .map_err(|e| CodecError::MalformedFrame(format!("invalid data block: {}", e)))?;
            data.extend(extra);
        }

        let payload = if payload_len > 0 {
            Some(src.split_to(payload_len).freeze())
        } else {
            None
        };

        trace!(
            "Decoded '{}' event ({} data bytes, {} payload bytes)",
            header.event_type,
            data_len,
            payload_len
        );

        Ok(Some(Event {
            event_type: header.event_type,
            data,
            payload,
        }))
    }
}

impl Encoder<Event> for WyomingCodec {
    type Error = CodecError;

    fn encode(&mut self, event: Event, dst: &mut BytesMut) -> Result<(), CodecError> {
        let data = if event.data.is_empty() {
            None
        } else {
            Some(
                serde_json::to_vec(&event.data)
                    .map_err(|e| CodecError::MalformedFrame(e.to_string()))?,
            )
        };

        let payload = event.payload.filter(|p| !p.is_empty());
        if let Some(payload) = &payload {
            if payload.len() > MAX_PAYLOAD_BYTES {
                return Err(CodecError::TooLarge {
                    what: "payload",
                    size: payload.len(),
                    limit: MAX_PAYLOAD_BYTES,
                });
            }
        }

        let header = Header {
            event_type: event.event_type,
            version: Some(PROTOCOL_VERSION.to_string()),
            data: None,
            data_length: data.as_ref().map(Vec::len),
            payload_length: payload.as_ref().map(Bytes::len),
        };
        let line =
            serde_json::to_vec(&header).map_err(|e| CodecError::MalformedFrame(e.to_string()))?;

        dst.reserve(
            line.len() + 1 + data.as_ref().map_or(0, Vec::len) + payload.as_ref().map_or(0, Bytes::len),
        );
        dst.put_slice(&line);
        dst.put_u8(b'\n');
        if let Some(data) = data {
            dst.put_slice(&data);
        }
        if let Some(payload) = payload {
            dst.put_slice(&payload);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(event: Event) -> BytesMut {
        let mut buf = BytesMut::new();
        WyomingCodec::new().encode(event, &mut buf).unwrap();
        buf
    }

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_decode_fragmented_input() {
        let event = Event::new("audio-chunk")
            .with_data(data(json!({"rate": 16000, "width": 2, "channels": 1})))
            .with_payload(vec![1u8, 2, 3, 4]);
        let wire = encode(event.clone());

        let mut codec = WyomingCodec::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;

        // Feed one byte at a time
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let result = codec.decode(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none(), "decoded early at byte {}", i);
            } else {
                decoded = result;
            }
        }

        assert_eq!(decoded, Some(event));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_excess_bytes_are_retained() {
        let mut buf = encode(Event::new("describe"));
        buf.extend_from_slice(&encode(Event::new("ping")));
        buf.extend_from_slice(b"{\"type\":");

        let mut codec = WyomingCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().event_type, "describe");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().event_type, "ping");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"{\"type\":");
    }

    #[test]
    fn test_inline_and_block_data_are_merged() {
        let block = br#"{"rate":16000}"#;
        let header = format!(
            "{{\"type\":\"audio-start\",\"data\":{{\"width\":2}},\"data_length\":{}}}\n",
            block.len()
        );
        let mut buf = BytesMut::from(header.as_bytes());
        buf.extend_from_slice(block);

        let event = WyomingCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(event.data.get("width"), Some(&json!(2)));
        assert_eq!(event.data.get("rate"), Some(&json!(16000)));
        assert!(event.payload.is_none());
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let mut buf = BytesMut::from(&b"\n\r\n"[..]);
        buf.extend_from_slice(&encode(Event::new("describe")));

        let event = WyomingCodec::new().decode(&mut buf).unwrap().unwrap();
        assert!(event.is_type("describe"));
    }

    #[test]
    fn test_invalid_header_is_malformed() {
        let mut buf = BytesMut::from(&b"not json\n"[..]);
        let result = WyomingCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(CodecError::MalformedFrame(_))));
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let header = format!(
            "{{\"type\":\"audio-chunk\",\"payload_length\":{}}}\n",
            MAX_PAYLOAD_BYTES + 1
        );
        let mut buf = BytesMut::from(header.as_bytes());
        let result = WyomingCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(CodecError::TooLarge { what: "payload", .. })));
    }

    #[test]
    fn test_unterminated_header_limit() {
        let mut buf = BytesMut::from(vec![b'x'; MAX_HEADER_BYTES + 1].as_slice());
        let result = WyomingCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(CodecError::TooLarge { what: "header", .. })));
    }

    #[test]
    fn test_encode_omits_empty_sections() {
        let wire = encode(Event::new("not-detected"));
        let line = std::str::from_utf8(&wire[..wire.len() - 1]).unwrap();
        let header: Value = serde_json::from_str(line).unwrap();

        assert_eq!(header["type"], "not-detected");
        assert_eq!(header["version"], PROTOCOL_VERSION);
        assert!(header.get("data_length").is_none());
        assert!(header.get("payload_length").is_none());
        assert_eq!(*wire.last().unwrap(), b'\n');
    }
}
