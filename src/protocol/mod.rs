//! Wyoming protocol: event framing and typed messages.

mod event;
mod messages;

pub use event::{
    CodecError, Event, WyomingCodec, MAX_DATA_BYTES, MAX_HEADER_BYTES, MAX_PAYLOAD_BYTES,
    PROTOCOL_VERSION,
};
pub use messages::{
    Attribution, AudioChunk, AudioStart, AudioStop, Describe, Detect, Detection, ErrorMessage, Info,
    Message, NotDetected, Ping, Pong, SessionReady, WakeModel, WakeProgram,
};
