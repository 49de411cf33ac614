/// Per-connection session state machine
///
/// A session starts in `Negotiating`, collects the requested keywords and
/// audio format, allocates its own detector and then scores audio until the
/// stream stops. Every failure moves it to `Failed`, which releases the
/// detector and tells the client why.
///
/// ```text
/// Negotiating --audio-start--> Streaming --audio-stop--> Closing --> Closed
///      \______________________ error _____________________/--> Failed
/// ```

use crate::audio_buffer::{AudioError, AudioFormat, AudioFrame, FrameAssembler};
use crate::detector::{
    DetectionEvent, DetectionResult, DetectorConfig, DetectorError, DetectorHandle, KeywordRef,
    KeywordSetting, Language, WakeEngine,
};
use crate::dispatcher::{DispatchError, Outbox};
use crate::error::ErrorKind;
use crate::protocol::{
    AudioChunk, AudioStart, AudioStop, CodecError, Describe, Detect, ErrorMessage, Event, Info,
    Message, NotDetected, Ping, Pong, SessionReady,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Keyword used when neither the client nor the operator names one
pub const DEFAULT_KEYWORD: &str = "porcupine";

/// Default detection sensitivity
pub const DEFAULT_SENSITIVITY: f32 = 0.5;

/// Unique per server, assigned in accept order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Streaming,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Unexpected '{event}' while {state}")]
    UnexpectedMessage { event: String, state: SessionState },

    #[error("Audio chunk {got} is out of order (last chunk was {last})")]
    OutOfOrder { last: u64, got: u64 },

    #[error("No audio configuration within {0:?}")]
    NegotiationTimeout(Duration),

    #[error("No audio for {0:?}")]
    IdleTimeout(Duration),

    #[error("Outbound channel closed")]
    ChannelClosed,

    #[error("Client stopped reading for {0:?}")]
    Stalled(Duration),
}

impl From<DispatchError> for SessionError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Stalled(timeout) => SessionError::Stalled(timeout),
            _ => SessionError::ChannelClosed,
        }
    }
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Detector(e) => e.kind(),
            SessionError::Audio(AudioError::UnsupportedFormat(_)) => ErrorKind::Configuration,
            SessionError::Codec(CodecError::Io(_)) => ErrorKind::Transport,
            SessionError::Audio(AudioError::MalformedFrame(_))
            | SessionError::Codec(_)
            | SessionError::UnexpectedMessage { .. }
            | SessionError::OutOfOrder { .. } => ErrorKind::Protocol,
            SessionError::NegotiationTimeout(_)
            | SessionError::IdleTimeout(_)
            | SessionError::ChannelClosed
            | SessionError::Stalled(_) => ErrorKind::Transport,
        }
    }

    /// Code sent in the `error` event
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NegotiationTimeout(_) | SessionError::IdleTimeout(_) => "timeout",
            _ => self.kind().code(),
        }
    }

    /// Whether the client gets an `error` event
    pub fn is_reported(&self) -> bool {
        matches!(self, SessionError::NegotiationTimeout(_)) || self.kind().is_reported()
    }
}

/// Operator defaults applied to every session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Keywords loaded when `detect` names none
    pub default_keywords: Vec<String>,

    /// Fallback sensitivity
    pub sensitivity: f32,

    /// Per keyword overrides of `sensitivity`
    pub keyword_sensitivities: BTreeMap<String, f32>,

    pub language: Language,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_keywords: vec![DEFAULT_KEYWORD.to_string()],
            sensitivity: DEFAULT_SENSITIVITY,
            keyword_sensitivities: BTreeMap::new(),
            language: Language::default(),
        }
    }
}

impl SessionSettings {
    /// Detector configuration for a session
    ///
    /// Sensitivity is taken from the request, then the per keyword
    /// overrides, then the global default. An explicit empty `names` list is
    /// rejected rather than replaced by the defaults.
    pub fn detector_config(&self, request: Option<&Detect>) -> Result<DetectorConfig, DetectorError> {
        let names = request
            .and_then(|detect| detect.names.clone())
            .unwrap_or_else(|| self.default_keywords.clone());

        let language = match request.and_then(|detect| detect.language.as_deref()) {
            Some(code) => code.parse()?,
            None => self.language,
        };

        let requested = request.and_then(|detect| detect.sensitivities.as_ref());

        let keywords = names
            .iter()
            .map(|raw| {
                let keyword = KeywordRef::parse(raw);
                let name = keyword.name();
                let lookup = |map: &BTreeMap<String, f32>| {
                    map.get(raw.as_str()).or_else(|| map.get(&name)).copied()
                };

                let sensitivity = requested
                    .and_then(lookup)
                    .or_else(|| lookup(&self.keyword_sensitivities))
                    .unwrap_or(self.sensitivity);

                KeywordSetting {
                    keyword,
                    sensitivity,
                }
            })
            .collect();

        let config = DetectorConfig { keywords, language };
        config.validate()?;
        Ok(config)
    }
}

/// What the connection should do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks: u64,
    pub frames: u64,
    pub detections: u64,
    pub discarded: u64,
}

/// Detector and assembler, present only while streaming
struct Stream {
    detector: DetectorHandle,
    assembler: FrameAssembler,
}

pub struct Session {
    id: SessionId,
    state: SessionState,
    engine: Arc<dyn WakeEngine>,
    settings: Arc<SessionSettings>,
    info: Arc<Info>,
    outbox: Outbox,
    requested: Option<Detect>,
    stream: Option<Stream>,
    last_chunk_seq: Option<u64>,
    detected: bool,
    stats: SessionStats,
}

impl Session {
    pub fn new(
        id: SessionId,
        engine: Arc<dyn WakeEngine>,
        settings: Arc<SessionSettings>,
        info: Arc<Info>,
        outbox: Outbox,
    ) -> Self {
        debug!("Session {} created", id);

        Self {
            id,
            state: SessionState::Negotiating,
            engine,
            settings,
            info,
            outbox,
            requested: None,
            stream: None,
            last_chunk_seq: None,
            detected: false,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Keywords of the running detector
    pub fn keywords(&self) -> Option<&[String]> {
        self.stream.as_ref().map(|stream| stream.detector.keywords())
    }

    /// Handle one inbound event
    ///
    /// On error the session has already moved to `Failed` and reported the
    /// failure; the caller only needs to close the connection.
    pub async fn handle_event(&mut self, event: Event) -> Result<Flow, SessionError> {
        if self.state.is_terminal() {
            self.stats.discarded += 1;
            trace!("Session {} discarding '{}' while {}", self.id, event.event_type, self.state);
            return Ok(Flow::Close);
        }

        match self.dispatch(event).await {
            Ok(flow) => Ok(flow),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn dispatch(&mut self, event: Event) -> Result<Flow, SessionError> {
        let kind = event.event_type.as_str();

        if Describe::is_type(kind) {
            self.outbox.send(self.info.to_event()).await?;
        } else if Ping::is_type(kind) {
            let ping = Ping::from_event(&event)?;
            self.outbox.send(Pong { text: ping.text }.to_event()).await?;
        } else if Detect::is_type(kind) {
            self.on_detect(Detect::from_event(&event)?)?;
        } else if AudioStart::is_type(kind) {
            self.on_audio_start(AudioStart::from_event(&event)?).await?;
        } else if AudioChunk::is_type(kind) {
            self.on_audio_chunk(AudioChunk::from_event(&event)?).await?;
        } else if AudioStop::is_type(kind) {
            AudioStop::from_event(&event)?;
            self.stop().await?;
            return Ok(Flow::Close);
        } else {
            debug!("Session {} ignoring '{}' event", self.id, kind);
        }

        Ok(Flow::Continue)
    }

    fn on_detect(&mut self, detect: Detect) -> Result<(), SessionError> {
        if self.state != SessionState::Negotiating {
            return Err(self.unexpected(Detect::TYPE));
        }

        debug!(
            "Session {} requested keywords {:?} (language {:?})",
            self.id, detect.names, detect.language
        );
        self.requested = Some(detect);
        Ok(())
    }

    async fn on_audio_start(&mut self, start: AudioStart) -> Result<(), SessionError> {
        if self.state != SessionState::Negotiating {
            return Err(self.unexpected(AudioStart::TYPE));
        }

        self.negotiate(AudioFormat::new(start.rate, start.width, start.channels))
            .await
    }

    async fn on_audio_chunk(&mut self, chunk: AudioChunk) -> Result<(), SessionError> {
        match self.state {
            SessionState::Negotiating => {
                debug!("Session {} received audio before audio-start", self.id);
                self.negotiate(AudioFormat::new(chunk.rate, chunk.width, chunk.channels))
                    .await?;
            }
            SessionState::Streaming => {}
            _ => return Err(self.unexpected(AudioChunk::TYPE)),
        }

        if let Some(seq) = chunk.seq {
            if let Some(last) = self.last_chunk_seq {
                if seq <= last {
                    return Err(SessionError::OutOfOrder { last, got: seq });
                }
            }
            self.last_chunk_seq = Some(seq);
        }
        self.stats.chunks += 1;

        let declared = AudioFormat::new(chunk.rate, chunk.width, chunk.channels);
        let frames = match self.stream.as_mut() {
            Some(stream) => stream.assembler.push(declared, &chunk.audio, chunk.timestamp)?,
            None => return Err(self.unexpected(AudioChunk::TYPE)),
        };

        for frame in &frames {
            if let Some(detection) = self.score_frame(frame)? {
                self.outbox.send(detection.to_event()).await?;
            }
        }

        Ok(())
    }

    /// Allocate the detector for `format` and start streaming
    async fn negotiate(&mut self, format: AudioFormat) -> Result<(), SessionError> {
        let config = self.settings.detector_config(self.requested.as_ref())?;
        let mut detector = DetectorHandle::initialize(self.engine.as_ref(), &config)?;

        let assembler = format
            .validate_for(detector.sample_rate())
            .and_then(|_| FrameAssembler::new(format, detector.frame_length()));

        let assembler = match assembler {
            Ok(assembler) => assembler,
            Err(e) => {
                detector.release();
                return Err(e.into());
            }
        };

        let ready = SessionReady {
            session: self.id.to_string(),
            keywords: detector.keywords().to_vec(),
            frame_length: detector.frame_length(),
            rate: detector.sample_rate(),
        };

        info!(
            "Session {} streaming {}Hz/{}ch, keywords {:?}",
            self.id, format.rate, format.channels, ready.keywords
        );

        self.stream = Some(Stream {
            detector,
            assembler,
        });
        self.detected = false;
        self.state = SessionState::Streaming;

        self.outbox.send(ready.to_event()).await?;
        Ok(())
    }

    /// Score one assembled frame
    pub fn score_frame(&mut self, frame: &AudioFrame) -> Result<Option<DetectionEvent>, SessionError> {
        if self.state != SessionState::Streaming {
            return Err(self.unexpected(AudioChunk::TYPE));
        }

        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(self.unexpected(AudioChunk::TYPE)),
        };

        let result = stream.detector.score(frame)?;
        self.stats.frames += 1;

        match result {
            DetectionResult::NoDetection => Ok(None),
            DetectionResult::Detected {
                keyword_index,
                frame: sequence,
            } => {
                let keyword = stream
                    .detector
                    .keyword(keyword_index)
                    .unwrap_or_default()
                    .to_string();

                info!(
                    "Session {} detected '{}' at frame {} ({} ms)",
                    self.id, keyword, sequence, frame.timestamp_ms
                );

                self.detected = true;
                self.stats.detections += 1;

                Ok(Some(DetectionEvent {
                    keyword_index,
                    keyword,
                    session_id: self.id,
                    timestamp_ms: frame.timestamp_ms,
                }))
            }
        }
    }

    /// End of audio: report a miss, release the detector
    async fn stop(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Closing;
        self.release();

        if !self.detected {
            self.outbox.send(NotDetected::default().to_event()).await?;
        }

        self.state = SessionState::Closed;
        info!("Session {} closed: {:?}", self.id, self.stats);
        Ok(())
    }

    /// Transport went away; tear down without a reply
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        self.state = SessionState::Closing;
        self.release();
        self.state = SessionState::Closed;
        info!("Session {} closed by peer: {:?}", self.id, self.stats);
    }

    /// Move to `Failed`, release the detector and report the error
    pub async fn fail(&mut self, err: &SessionError) {
        if self.state.is_terminal() {
            return;
        }

        match err {
            SessionError::Detector(DetectorError::InvalidAccessCredential(_)) => {
                error!("Session {} failed: {}", self.id, err)
            }
            _ if err.kind() == ErrorKind::Transport => {
                debug!("Session {} ended: {}", self.id, err)
            }
            _ => warn!("Session {} failed ({}): {}", self.id, err.kind(), err),
        }

        self.state = SessionState::Failed;
        self.release();

        if err.is_reported() {
            let message = ErrorMessage {
                text: err.to_string(),
                code: Some(err.code().to_string()),
            };
            if self.outbox.send(message.to_event()).await.is_err() {
                debug!("Session {} could not report failure, connection gone", self.id);
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.assembler.clear();
            stream.detector.release();
        }
    }

    fn unexpected(&self, event: &str) -> SessionError {
        SessionError::UnexpectedMessage {
            event: event.to_string(),
            state: self.state,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::encode_pcm;
    use crate::detector::{MockKeywordSpotter, MockWakeEngine};
    use crate::engine::{render_tone, signature_hz, ToneEngine, FRAME_LENGTH};
    use crate::protocol::Detection;
    use tokio::sync::mpsc;

    const KEY: &str = "test_key";

    struct Harness {
        session: Session,
        events: mpsc::Receiver<Event>,
        engine: Arc<ToneEngine>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_settings(SessionSettings::default())
        }

        fn with_settings(settings: SessionSettings) -> Self {
            let engine = Arc::new(ToneEngine::new(KEY).with_keyword(Language::En, "test"));
            let (outbox, events) = Outbox::channel(256);
            let session = Session::new(
                SessionId(1),
                engine.clone(),
                Arc::new(settings),
                Arc::new(Info::default()),
                outbox,
            );
            Self {
                session,
                events,
                engine,
            }
        }

        fn sent(&mut self) -> Vec<Event> {
            let mut sent = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                sent.push(event);
            }
            sent
        }
    }

    fn detect(names: &[&str]) -> Event {
        Detect {
            names: Some(names.iter().map(|n| n.to_string()).collect()),
            ..Default::default()
        }
        .to_event()
    }

    fn start(rate: u32, channels: u16) -> Event {
        AudioStart {
            rate,
            width: 2,
            channels,
            timestamp: None,
        }
        .to_event()
    }

    fn chunk(samples: &[i16], seq: Option<u64>) -> Event {
        AudioChunk {
            rate: 16000,
            width: 2,
            channels: 1,
            timestamp: None,
            seq,
            audio: encode_pcm(samples).into(),
        }
        .to_event()
    }

    fn stop() -> Event {
        AudioStop::default().to_event()
    }

    fn types(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.event_type.as_str()).collect()
    }

    #[tokio::test]
    async fn test_describe_and_ping() {
        let mut h = Harness::new();

        h.session.handle_event(Describe::default().to_event()).await.unwrap();
        let ping = Ping {
            text: Some("hello".to_string()),
        };
        h.session.handle_event(ping.to_event()).await.unwrap();

        let sent = h.sent();
        assert_eq!(types(&sent), vec!["info", "pong"]);
        assert_eq!(Pong::from_event(&sent[1]).unwrap().text.as_deref(), Some("hello"));
        assert_eq!(h.session.state(), SessionState::Negotiating);
    }

    #[tokio::test]
    async fn test_detect_stream_and_stop() {
        let mut h = Harness::new();
        let tone = render_tone(signature_hz("test"), 16000, 0.5);

        h.session.handle_event(detect(&["test"])).await.unwrap();
        h.session.handle_event(start(16000, 1)).await.unwrap();
        assert_eq!(h.session.state(), SessionState::Streaming);
        assert_eq!(h.engine.live_handles(), 1);

        // Uneven chunk sizes
        for (seq, part) in tone.chunks(1000).enumerate() {
            h.session.handle_event(chunk(part, Some(seq as u64))).await.unwrap();
        }

        let flow = h.session.handle_event(stop()).await.unwrap();
        assert_eq!(flow, Flow::Close);
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.engine.live_handles(), 0);

        let sent = h.sent();
        assert_eq!(types(&sent), vec!["session-ready", "detection"]);

        let ready = SessionReady::from_event(&sent[0]).unwrap();
        assert_eq!(ready.keywords, vec!["test"]);
        assert_eq!(ready.frame_length, FRAME_LENGTH);

        let detection = Detection::from_event(&sent[1]).unwrap();
        assert_eq!(detection.name, "test");
        assert_eq!(detection.keyword_index, Some(0));
        assert_eq!(detection.session.as_deref(), Some("1"));
        assert_eq!(h.session.stats().detections, 1);
    }

    #[tokio::test]
    async fn test_stop_without_detection() {
        let mut h = Harness::new();

        h.session.handle_event(start(16000, 1)).await.unwrap();
        h.session.handle_event(chunk(&[0; 4096], None)).await.unwrap();
        h.session.handle_event(stop()).await.unwrap();

        assert_eq!(types(&h.sent()), vec!["session-ready", "not-detected"]);
        assert_eq!(h.session.stats().frames, 8);
    }

    #[tokio::test]
    async fn test_chunks_after_stop_are_discarded() {
        let mut h = Harness::new();

        h.session.handle_event(start(16000, 1)).await.unwrap();
        h.session.handle_event(stop()).await.unwrap();
        h.sent();

        let flow = h.session.handle_event(chunk(&[0; 512], None)).await.unwrap();
        assert_eq!(flow, Flow::Close);
        assert!(h.sent().is_empty());
        assert_eq!(h.session.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_audio_before_start_negotiates_default_keyword() {
        let mut h = Harness::new();

        h.session.handle_event(chunk(&[0; 100], None)).await.unwrap();
        assert_eq!(h.session.state(), SessionState::Streaming);
        assert_eq!(h.session.keywords(), Some(&[DEFAULT_KEYWORD.to_string()][..]));
        assert_eq!(types(&h.sent()), vec!["session-ready"]);
    }

    #[tokio::test]
    async fn test_detect_while_streaming_fails() {
        let mut h = Harness::new();

        h.session.handle_event(start(16000, 1)).await.unwrap();
        let result = h.session.handle_event(detect(&["computer"])).await;

        assert!(matches!(result, Err(SessionError::UnexpectedMessage { .. })));
        assert_eq!(h.session.state(), SessionState::Failed);
        assert_eq!(h.engine.live_handles(), 0);

        let sent = h.sent();
        let error = ErrorMessage::from_event(sent.last().unwrap()).unwrap();
        assert_eq!(error.code.as_deref(), Some("protocol"));
    }

    #[tokio::test]
    async fn test_unsupported_format_releases_detector() {
        let mut h = Harness::new();

        let result = h.session.handle_event(start(44100, 2)).await;
        assert!(matches!(result, Err(SessionError::Audio(AudioError::UnsupportedFormat(_)))));
        assert_eq!(h.engine.live_handles(), 0);

        let sent = h.sent();
        assert_eq!(types(&sent), vec!["error"]);
        let error = ErrorMessage::from_event(&sent[0]).unwrap();
        assert_eq!(error.code.as_deref(), Some("config"));
    }

    #[tokio::test]
    async fn test_bad_sensitivity_is_configuration_error() {
        let mut h = Harness::new();
        let request = Detect {
            names: Some(vec!["computer".to_string()]),
            sensitivities: Some(BTreeMap::from([("computer".to_string(), 1.5)])),
            language: None,
        };

        h.session.handle_event(request.to_event()).await.unwrap();
        let result = h.session.handle_event(start(16000, 1)).await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Configuration);
        assert_eq!(h.engine.live_handles(), 0);
        assert_eq!(h.session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_out_of_order_chunk() {
        let mut h = Harness::new();

        h.session.handle_event(start(16000, 1)).await.unwrap();
        h.session.handle_event(chunk(&[0; 10], Some(4))).await.unwrap();
        let result = h.session.handle_event(chunk(&[0; 10], Some(3))).await;

        assert!(matches!(result, Err(SessionError::OutOfOrder { last: 4, got: 3 })));
        assert_eq!(h.engine.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_events_after_failure_are_ignored() {
        let mut h = Harness::new();

        let _ = h.session.handle_event(start(8000, 1)).await;
        h.sent();

        let flow = h.session.handle_event(Describe::default().to_event()).await.unwrap();
        assert_eq!(flow, Flow::Close);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_events_are_ignored() {
        let mut h = Harness::new();

        let flow = h.session.handle_event(Event::new("transcribe")).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.session.state(), SessionState::Negotiating);
    }

    #[tokio::test]
    async fn test_negotiation_timeout_is_reported() {
        let mut h = Harness::new();

        let timeout = SessionError::NegotiationTimeout(Duration::from_secs(10));
        h.session.fail(&timeout).await;

        let sent = h.sent();
        let error = ErrorMessage::from_event(&sent[0]).unwrap();
        assert_eq!(error.code.as_deref(), Some("timeout"));
        assert_eq!(h.session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_unread_replies_fail_session_silently() {
        let engine = Arc::new(ToneEngine::new(KEY));
        let (outbox, mut events) = Outbox::channel(1);
        let mut session = Session::new(
            SessionId(3),
            engine.clone(),
            Arc::new(SessionSettings::default()),
            Arc::new(Info::default()),
            outbox.with_send_timeout(Duration::from_millis(20)),
        );

        // session-ready takes the only slot and nobody reads it
        session.handle_event(start(16000, 1)).await.unwrap();
        let result = session.handle_event(Describe::default().to_event()).await;

        assert!(matches!(result, Err(SessionError::Stalled(_))));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transport);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(engine.live_handles(), 0);

        assert!(events.try_recv().unwrap().is_type(SessionReady::TYPE));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_close_releases_without_reply() {
        let mut h = Harness::new();

        h.session.handle_event(start(16000, 1)).await.unwrap();
        h.sent();

        h.session.close();
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.engine.live_handles(), 0);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_spotter_released_once_across_teardown() {
        let mut spotter = MockKeywordSpotter::new();
        spotter.expect_frame_length().return_const(4usize);
        spotter.expect_sample_rate().return_const(16000u32);
        spotter.expect_keywords().return_const(vec![DEFAULT_KEYWORD.to_string()]);
        spotter.expect_process().returning(|_| Ok(None));
        spotter.expect_release().times(1).return_const(());

        let mut engine = MockWakeEngine::new();
        engine
            .expect_initialize()
            .times(1)
            .return_once(move |_| Ok(Box::new(spotter) as Box<dyn crate::detector::KeywordSpotter>));

        let (outbox, _events) = Outbox::channel(16);
        let mut session = Session::new(
            SessionId(7),
            Arc::new(engine),
            Arc::new(SessionSettings::default()),
            Arc::new(Info::default()),
            outbox,
        );

        session.handle_event(start(16000, 1)).await.unwrap();
        session.handle_event(chunk(&[0; 8], None)).await.unwrap();
        session.handle_event(stop()).await.unwrap();
        session.close();
        drop(session);
    }

    #[test]
    fn test_sensitivity_precedence() {
        let settings = SessionSettings {
            default_keywords: vec!["computer".to_string(), "jarvis".to_string()],
            sensitivity: 0.3,
            keyword_sensitivities: BTreeMap::from([("jarvis".to_string(), 0.6)]),
            language: Language::En,
        };

        let config = settings.detector_config(None).unwrap();
        assert_eq!(config.keywords[0].sensitivity, 0.3);
        assert_eq!(config.keywords[1].sensitivity, 0.6);

        let request = Detect {
            names: None,
            sensitivities: Some(BTreeMap::from([("jarvis".to_string(), 0.9)])),
            language: Some("de".to_string()),
        };
        let config = settings.detector_config(Some(&request)).unwrap();
        assert_eq!(config.keywords[1].sensitivity, 0.9);
        assert_eq!(config.language, Language::De);
    }

    #[test]
    fn test_empty_names_rejected() {
        let request = Detect {
            names: Some(Vec::new()),
            ..Default::default()
        };
        let result = SessionSettings::default().detector_config(Some(&request));
        assert!(matches!(result, Err(DetectorError::NoKeywords)));
    }

    #[test]
    fn test_unknown_language_rejected() {
        let request = Detect {
            language: Some("xx".to_string()),
            ..Default::default()
        };
        let result = SessionSettings::default().detector_config(Some(&request));
        assert!(matches!(result, Err(DetectorError::UnsupportedLanguage(_))));
    }
}
