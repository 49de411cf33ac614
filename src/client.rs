/// Wyoming wake-word client
///
/// Connects to a server, negotiates a stream and sends PCM audio. Used by the
/// `wake-client` binary and the integration tests.

use crate::audio_buffer::{encode_pcm, AudioFormat, AudioSample};
use crate::protocol::{
    AudioChunk, AudioStart, AudioStop, CodecError, Describe, Detect, ErrorMessage, Event, Info,
    Message, SessionReady, WyomingCodec,
};
use crate::server::Endpoint;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

/// Default wait for a server reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Server closed the connection")]
    Closed,

    #[error("Server error ({}): {text}", .code.as_deref().unwrap_or("unknown"))]
    Server { code: Option<String>, text: String },

    #[error("Unexpected '{0}' event")]
    Unexpected(String),
}

impl From<ErrorMessage> for ClientError {
    fn from(message: ErrorMessage) -> Self {
        ClientError::Server {
            code: message.code,
            text: message.text,
        }
    }
}

/// Any bidirectional byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub struct WakeClient {
    framed: Framed<Box<dyn ByteStream>, WyomingCodec>,
    reply_timeout: Duration,

    /// Samples per channel sent since `audio-start`
    position: u64,
}

impl WakeClient {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, ClientError> {
        debug!("Connecting to {}", endpoint);

        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Self::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Self::new(tokio::net::UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            ))),
        }
    }

    pub fn new<S: ByteStream + 'static>(stream: S) -> Self {
        let stream: Box<dyn ByteStream> = Box::new(stream);
        Self {
            framed: Framed::new(stream, WyomingCodec::new()),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            position: 0,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub async fn send_event(&mut self, event: Event) -> Result<(), ClientError> {
        trace!("Sending '{}'", event.event_type);
        self.framed.send(event).await?;
        Ok(())
    }

    pub async fn send<M: Message>(&mut self, message: &M) -> Result<(), ClientError> {
        self.send_event(message.to_event()).await
    }

    /// Next event from the server; `None` once it hangs up
    pub async fn recv(&mut self) -> Result<Option<Event>, ClientError> {
        match tokio::time::timeout(self.reply_timeout, self.framed.next()).await {
            Err(_) => Err(ClientError::Timeout(self.reply_timeout)),
            Ok(None) => Ok(None),
            Ok(Some(event)) => Ok(Some(event?)),
        }
    }

    /// Wait for a `M` event, skipping keep-alive pings
    pub async fn expect<M: Message>(&mut self) -> Result<M, ClientError> {
        loop {
            let event = self.recv().await?.ok_or(ClientError::Closed)?;

            if M::is_type(&event.event_type) {
                return Ok(M::from_event(&event)?);
            }
            if ErrorMessage::is_type(&event.event_type) {
                return Err(ErrorMessage::from_event(&event)?.into());
            }
            if event.event_type != "ping" {
                return Err(ClientError::Unexpected(event.event_type));
            }
        }
    }

    pub async fn describe(&mut self) -> Result<Info, ClientError> {
        self.send(&Describe::default()).await?;
        self.expect::<Info>().await
    }

    /// Request keywords (server defaults when `detect` is `None`) and open
    /// an audio stream
    pub async fn start(
        &mut self,
        detect: Option<&Detect>,
        format: AudioFormat,
    ) -> Result<SessionReady, ClientError> {
        if let Some(detect) = detect {
            self.send(detect).await?;
        }

        self.position = 0;
        self.send(&AudioStart {
            rate: format.rate,
            width: format.width,
            channels: format.channels,
            timestamp: Some(0),
        })
        .await?;

        self.expect::<SessionReady>().await
    }

    /// Send interleaved samples in chunks of `chunk_frames` per channel
    ///
    /// `first_seq` numbers the first chunk; the next free number is returned.
    pub async fn stream_samples(
        &mut self,
        samples: &[AudioSample],
        format: AudioFormat,
        chunk_frames: usize,
        first_seq: u64,
    ) -> Result<u64, ClientError> {
        let channels = format.channels.max(1) as usize;
        let mut seq = first_seq;

        for block in samples.chunks(chunk_frames.max(1) * channels) {
            let chunk = AudioChunk {
                rate: format.rate,
                width: format.width,
                channels: format.channels,
                timestamp: Some(self.position * 1000 / format.rate.max(1) as u64),
                seq: Some(seq),
                audio: encode_pcm(block).into(),
            };

            self.framed.feed(chunk.to_event()).await?;
            self.position += (block.len() / channels) as u64;
            seq += 1;
        }

        self.framed.flush().await?;
        Ok(seq)
    }

    /// End the stream and collect everything the server sends until it
    /// hangs up
    pub async fn stop(&mut self) -> Result<Vec<Event>, ClientError> {
        self.send(&AudioStop::default()).await?;

        let mut events = Vec::new();
        while let Some(event) = self.recv().await? {
            events.push(event);
        }
        Ok(events)
    }
}
