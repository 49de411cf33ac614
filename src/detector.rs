/// Wake-word detector adapter
///
/// Isolates the scoring engine behind two capability traits: a shared
/// [`WakeEngine`] that validates configuration and creates per-session
/// [`KeywordSpotter`]s, and the spotter itself which scores one frame at a
/// time. [`DetectorHandle`] wraps a spotter for the lifetime of a session:
/// it enforces block length and frame order, and releases the engine state
/// exactly once.

use crate::audio_buffer::{AudioFrame, AudioSample};
use crate::error::ErrorKind;
use crate::protocol::{Detection, Event, Message};
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Access key rejected: {0}")]
    InvalidAccessCredential(String),

    #[error("Invalid keyword: {0}")]
    InvalidKeyword(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Keyword list is empty")]
    NoKeywords,

    #[error("Sensitivity for '{keyword}' must be between 0.0 and 1.0, got {value}")]
    InvalidSensitivity { keyword: String, value: f32 },

    #[error("Frame has {actual} samples, detector requires exactly {expected}")]
    FrameLength { expected: usize, actual: usize },

    #[error("Frame {got} is out of order (last scored frame was {last})")]
    OutOfOrder { last: u64, got: u64 },

    #[error("Engine failure: {0}")]
    Engine(String),

    #[error("Detector already released")]
    Released,
}

impl DetectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DetectorError::InvalidKeyword(_)
            | DetectorError::UnsupportedLanguage(_)
            | DetectorError::NoKeywords
            | DetectorError::InvalidSensitivity { .. } => ErrorKind::Configuration,
            DetectorError::FrameLength { .. } | DetectorError::OutOfOrder { .. } => {
                ErrorKind::Protocol
            }
            DetectorError::InvalidAccessCredential(_)
            | DetectorError::Engine(_)
            | DetectorError::Released => ErrorKind::Engine,
        }
    }
}

/// Languages with keyword models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    De,
    Es,
    Fr,
    It,
    Ja,
    Ko,
    Pt,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::En,
        Language::De,
        Language::Es,
        Language::Fr,
        Language::It,
        Language::Ja,
        Language::Ko,
        Language::Pt,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::De => "de",
            Language::Es => "es",
            Language::Fr => "fr",
            Language::It => "it",
            Language::Ja => "ja",
            Language::Ko => "ko",
            Language::Pt => "pt",
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Language::En
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_lowercase();
        Language::ALL
            .into_iter()
            .find(|lang| lang.code() == code)
            .ok_or_else(|| DetectorError::UnsupportedLanguage(s.to_string()))
    }
}

/// A keyword: either a built-in identifier or a path to a custom model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeywordRef {
    Builtin(String),
    Custom(PathBuf),
}

impl KeywordRef {
    /// Model files are recognised by extension or a path separator
    pub fn parse(value: &str) -> Self {
        let path = Path::new(value);
        let is_model = path.extension().map_or(false, |ext| ext == "json")
            || value.contains(std::path::MAIN_SEPARATOR)
            || value.contains('/');

        if is_model {
            KeywordRef::Custom(path.to_path_buf())
        } else {
            KeywordRef::Builtin(value.trim().to_lowercase())
        }
    }

    /// Name known before any model is loaded; custom models use their
    /// file stem
    pub fn name(&self) -> String {
        match self {
            KeywordRef::Builtin(name) => name.clone(),
            KeywordRef::Custom(path) => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

/// One keyword with its detection threshold
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordSetting {
    pub keyword: KeywordRef,

    /// Sensitivity (0.0 - 1.0, higher = more sensitive, more false positives)
    pub sensitivity: f32,
}

/// Detector configuration, fixed once a session is negotiated
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub keywords: Vec<KeywordSetting>,
    pub language: Language,
}

impl DetectorConfig {
    /// Validate configuration before any engine resources are touched
    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.keywords.is_empty() {
            return Err(DetectorError::NoKeywords);
        }

        for setting in &self.keywords {
            if !(0.0..=1.0).contains(&setting.sensitivity) {
                return Err(DetectorError::InvalidSensitivity {
                    keyword: setting.keyword.name(),
                    value: setting.sensitivity,
                });
            }
        }

        Ok(())
    }
}

/// A keyword an engine can load without a model file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub language: Language,
}

/// Shared wake-word engine, one per process
#[cfg_attr(test, mockall::automock)]
pub trait WakeEngine: Send + Sync {
    /// Built-in keywords, for service discovery
    fn catalog(&self) -> Vec<CatalogEntry>;

    /// Allocate engine state for one session
    fn initialize(&self, config: &DetectorConfig) -> Result<Box<dyn KeywordSpotter>, DetectorError>;
}

/// Per-session engine state; scores frames sequentially
#[cfg_attr(test, mockall::automock)]
pub trait KeywordSpotter: Send {
    /// Exact number of samples `process` expects
    fn frame_length(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// Keyword names in index order, as reported in detections
    fn keywords(&self) -> Vec<String>;

    /// Score one frame; returns the index of a detected keyword
    fn process(&mut self, frame: &[AudioSample]) -> Result<Option<usize>, DetectorError>;

    /// Free engine resources
    fn release(&mut self);
}

/// Outcome of scoring a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionResult {
    NoDetection,
    Detected { keyword_index: usize, frame: u64 },
}

/// Wake-word detection produced for a session
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub keyword_index: usize,
    pub keyword: String,
    pub session_id: SessionId,

    /// Milliseconds, from the audio chunk timestamps
    pub timestamp_ms: u64,
}

impl DetectionEvent {
    pub fn to_event(&self) -> Event {
        Detection {
            name: self.keyword.clone(),
            timestamp: Some(self.timestamp_ms),
            keyword_index: Some(self.keyword_index),
            session: Some(self.session_id.to_string()),
        }
        .to_event()
    }
}

/// Scoped ownership of one session's engine state
pub struct DetectorHandle {
    spotter: Option<Box<dyn KeywordSpotter>>,
    keywords: Vec<String>,
    frame_length: usize,
    sample_rate: u32,
    last_sequence: Option<u64>,
    frames_scored: u64,
}

impl DetectorHandle {
    /// Validate the config and allocate engine state
    ///
    /// Nothing is allocated when validation fails.
    pub fn initialize(engine: &dyn WakeEngine, config: &DetectorConfig) -> Result<Self, DetectorError> {
        config.validate()?;

        let spotter = engine.initialize(config)?;
        let frame_length = spotter.frame_length();
        let sample_rate = spotter.sample_rate();
        let keywords = spotter.keywords();

        info!(
            "Detector initialized: keywords={:?}, language={}, frame_length={}",
            keywords, config.language, frame_length
        );

        Ok(Self {
            spotter: Some(spotter),
            keywords,
            frame_length,
            sample_rate,
            last_sequence: None,
            frames_scored: 0,
        })
    }

    /// Score one frame
    ///
    /// Frames must be exactly `frame_length` samples and arrive in strictly
    /// increasing sequence order.
    pub fn score(&mut self, frame: &AudioFrame) -> Result<DetectionResult, DetectorError> {
        let spotter = self.spotter.as_mut().ok_or(DetectorError::Released)?;

        if frame.samples.len() != self.frame_length {
            return Err(DetectorError::FrameLength {
                expected: self.frame_length,
                actual: frame.samples.len(),
            });
        }

        if let Some(last) = self.last_sequence {
            if frame.sequence <= last {
                return Err(DetectorError::OutOfOrder {
                    last,
                    got: frame.sequence,
                });
            }
        }
        self.last_sequence = Some(frame.sequence);

        let result = spotter.process(&frame.samples)?;
        self.frames_scored += 1;

        match result {
            Some(keyword_index) if keyword_index < self.keywords.len() => {
                Ok(DetectionResult::Detected {
                    keyword_index,
                    frame: frame.sequence,
                })
            }
            Some(keyword_index) => Err(DetectorError::Engine(format!(
                "engine reported keyword index {} but only {} are loaded",
                keyword_index,
                self.keywords.len()
            ))),
            None => Ok(DetectionResult::NoDetection),
        }
    }

    /// Release engine state; returns false if already released
    pub fn release(&mut self) -> bool {
        match self.spotter.take() {
            Some(mut spotter) => {
                spotter.release();
                debug!("Detector released after {} frames", self.frames_scored);
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.spotter.is_none()
    }

    pub fn keyword(&self, index: usize) -> Option<&str> {
        self.keywords.get(index).map(String::as_str)
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames_scored(&self) -> u64 {
        self.frames_scored
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        if self.release() {
            warn!("Detector released on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn config(sensitivities: &[f32]) -> DetectorConfig {
        DetectorConfig {
            keywords: sensitivities
                .iter()
                .enumerate()
                .map(|(i, &sensitivity)| KeywordSetting {
                    keyword: KeywordRef::Builtin(format!("keyword{}", i)),
                    sensitivity,
                })
                .collect(),
            language: Language::En,
        }
    }

    fn frame(sequence: u64, len: usize) -> AudioFrame {
        AudioFrame {
            sequence,
            samples: vec![0; len],
            timestamp_ms: 0,
        }
    }

    /// Spotter with a fixed block length that releases exactly once
    fn spotter(frame_length: usize, detect_on_call: Option<usize>) -> MockKeywordSpotter {
        let mut spotter = MockKeywordSpotter::new();
        spotter.expect_frame_length().return_const(frame_length);
        spotter.expect_sample_rate().return_const(16000u32);
        spotter.expect_keywords().return_const(vec!["keyword0".to_string()]);
        let mut calls = 0;
        spotter.expect_process().returning(move |_| {
            calls += 1;
            Ok(if Some(calls) == detect_on_call { Some(0) } else { None })
        });
        spotter.expect_release().times(1).return_const(());
        spotter
    }

    fn engine_with(frame_length: usize, detect_on_call: Option<usize>) -> MockWakeEngine {
        let mut engine = MockWakeEngine::new();
        engine
            .expect_initialize()
            .times(1)
            .returning(move |_| {
                Ok(Box::new(spotter(frame_length, detect_on_call)) as Box<dyn KeywordSpotter>)
            });
        engine
    }

    #[test_case(&[0.0] ; "lower_bound")]
    #[test_case(&[1.0] ; "upper_bound")]
    #[test_case(&[0.5, 0.25, 0.75] ; "several_keywords")]
    fn test_valid_config(sensitivities: &[f32]) {
        assert!(config(sensitivities).validate().is_ok());
    }

    #[test_case(&[1.5] ; "above_range")]
    #[test_case(&[-0.1] ; "below_range")]
    #[test_case(&[0.5, f32::NAN] ; "not_a_number")]
    fn test_invalid_sensitivity(sensitivities: &[f32]) {
        let result = config(sensitivities).validate();
        assert!(matches!(result, Err(DetectorError::InvalidSensitivity { .. })));
    }

    #[test]
    fn test_empty_keywords() {
        assert!(matches!(config(&[]).validate(), Err(DetectorError::NoKeywords)));
    }

    #[test]
    fn test_invalid_config_never_reaches_engine() {
        let mut engine = MockWakeEngine::new();
        engine.expect_initialize().never();

        let result = DetectorHandle::initialize(&engine, &config(&[2.0]));
        assert!(result.is_err());
    }

    #[test]
    fn test_score_detection() {
        let engine = engine_with(4, Some(2));
        let mut handle = DetectorHandle::initialize(&engine, &config(&[0.5])).unwrap();

        assert_eq!(handle.score(&frame(0, 4)).unwrap(), DetectionResult::NoDetection);
        assert_eq!(
            handle.score(&frame(1, 4)).unwrap(),
            DetectionResult::Detected {
                keyword_index: 0,
                frame: 1
            }
        );
        assert_eq!(handle.frames_scored(), 2);
        assert!(handle.release());
    }

    #[test]
    fn test_wrong_block_length() {
        let engine = engine_with(4, None);
        let mut handle = DetectorHandle::initialize(&engine, &config(&[0.5])).unwrap();

        let result = handle.score(&frame(0, 3));
        assert!(matches!(
            result,
            Err(DetectorError::FrameLength {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_duplicate_frame_is_out_of_order() {
        let engine = engine_with(4, None);
        let mut handle = DetectorHandle::initialize(&engine, &config(&[0.5])).unwrap();

        handle.score(&frame(5, 4)).unwrap();
        let result = handle.score(&frame(5, 4));
        assert!(matches!(result, Err(DetectorError::OutOfOrder { last: 5, got: 5 })));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_release_exactly_once() {
        // `times(1)` on release panics if the spotter is released twice
        let engine = engine_with(4, None);
        let mut handle = DetectorHandle::initialize(&engine, &config(&[0.5])).unwrap();

        assert!(handle.release());
        assert!(!handle.release());
        assert!(handle.is_released());
        assert!(matches!(handle.score(&frame(0, 4)), Err(DetectorError::Released)));
        drop(handle);
    }

    #[test]
    fn test_release_on_drop() {
        let engine = engine_with(4, None);
        let handle = DetectorHandle::initialize(&engine, &config(&[0.5])).unwrap();
        drop(handle);
    }

    #[test]
    fn test_engine_error_is_propagated() {
        let mut engine = MockWakeEngine::new();
        engine
            .expect_initialize()
            .returning(|_| Err(DetectorError::InvalidAccessCredential("expired".to_string())));

        let result = DetectorHandle::initialize(&engine, &config(&[0.5]));
        match result {
            Err(e) => assert_eq!(e.kind(), ErrorKind::Engine),
            Ok(_) => panic!("Expected credential rejection"),
        }
    }

    #[test_case("en", Language::En ; "lowercase")]
    #[test_case("FR", Language::Fr ; "uppercase")]
    #[test_case(" de ", Language::De ; "padded")]
    fn test_language_parse(input: &str, expected: Language) {
        assert_eq!(input.parse::<Language>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_language() {
        assert!(matches!(
            "xx".parse::<Language>(),
            Err(DetectorError::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn test_keyword_ref_parse() {
        assert_eq!(
            KeywordRef::parse("Hey Siri"),
            KeywordRef::Builtin("hey siri".to_string())
        );

        let custom = KeywordRef::parse("models/hey_aether.json");
        assert_eq!(custom, KeywordRef::Custom(PathBuf::from("models/hey_aether.json")));
        assert_eq!(custom.name(), "hey_aether");
    }
}
