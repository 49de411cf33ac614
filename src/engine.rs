/// Reference wake-word engine
///
/// A deterministic stand-in for a neural keyword spotter, used when no
/// vendor engine is linked. Every keyword is assigned a signature tone; the
/// spotter measures the share of frame energy at each signature frequency
/// (Goertzel filter) and fires once the tone has been held long enough.
/// Silence never fires.

use crate::audio_buffer::{AudioSample, SAMPLE_RATE};
use crate::detector::{
    CatalogEntry, DetectorConfig, DetectorError, KeywordRef, KeywordSpotter, Language, WakeEngine,
};
use serde::Deserialize;
use std::f64::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Samples per scored frame (32ms at 16kHz)
pub const FRAME_LENGTH: usize = 512;

/// How long a signature tone must be held before it counts
pub const DEFAULT_MIN_DURATION_MS: u32 = 300;

/// Frames quieter than this (normalized RMS) are treated as silence
const SILENCE_RMS: f64 = 0.01;

const SIGNATURE_BASE_HZ: f32 = 400.0;
const SIGNATURE_STEP_HZ: f32 = 100.0;
const SIGNATURE_SLOTS: u32 = 32;

/// Built-in keywords shipped for each language
const BUILTIN_KEYWORDS: &[(Language, &[&str])] = &[
    (
        Language::En,
        &[
            "alexa",
            "americano",
            "blueberry",
            "bumblebee",
            "computer",
            "grapefruit",
            "grasshopper",
            "hey google",
            "hey siri",
            "jarvis",
            "ok google",
            "picovoice",
            "porcupine",
            "terminator",
        ],
    ),
    (
        Language::De,
        &["ananas", "heuschrecke", "himbeere", "leguan", "stachelschwein"],
    ),
    (
        Language::Es,
        &["emparedado", "leopardo", "manzana", "murcielago"],
    ),
    (
        Language::Fr,
        &["framboise", "mon chouchou", "parapluie", "perroquet", "tournesol"],
    ),
    (
        Language::It,
        &["cameriere", "espresso", "porcospino", "silenzio bruno"],
    ),
    (Language::Ja, &["bushi", "ninja", "ringo"]),
    (Language::Ko, &["aiseukeulim", "bigseubi", "koppulso"]),
    (
        Language::Pt,
        &["abacaxi", "fenomeno", "formiga", "porco espinho"],
    ),
];

/// Custom keyword model file
#[derive(Debug, Clone, Deserialize)]
pub struct ToneModel {
    /// Reported keyword name, the file stem when absent
    #[serde(default)]
    pub name: Option<String>,

    pub frequency_hz: f32,
    #[serde(default = "default_min_duration")]
    pub min_duration_ms: u32,
}

fn default_min_duration() -> u32 {
    DEFAULT_MIN_DURATION_MS
}

impl ToneModel {
    pub fn load(path: &Path) -> Result<Self, DetectorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DetectorError::InvalidKeyword(format!("cannot read model {}: {}", path.display(), e))
        })?;

        let model: ToneModel = serde_json::from_str(&raw).map_err(|e| {
            DetectorError::InvalidKeyword(format!("corrupt model {}: {}", path.display(), e))
        })?;

        let nyquist = SAMPLE_RATE as f32 / 2.0;
        if !(model.frequency_hz > 0.0 && model.frequency_hz < nyquist) {
            return Err(DetectorError::InvalidKeyword(format!(
                "model {} frequency {} Hz outside (0, {})",
                path.display(),
                model.frequency_hz,
                nyquist
            )));
        }

        Ok(model)
    }
}

/// Signature frequency of a built-in keyword
pub fn signature_hz(keyword: &str) -> f32 {
    // FNV-1a
    let hash = keyword
        .to_lowercase()
        .bytes()
        .fold(0x811c_9dc5u32, |h, b| (h ^ b as u32).wrapping_mul(0x0100_0193));

    SIGNATURE_BASE_HZ + (hash % SIGNATURE_SLOTS) as f32 * SIGNATURE_STEP_HZ
}

/// Synthesize a sine at `frequency_hz`, `amplitude` relative to full scale
pub fn render_tone(frequency_hz: f32, samples: usize, amplitude: f32) -> Vec<AudioSample> {
    let step = 2.0 * PI * frequency_hz as f64 / SAMPLE_RATE as f64;
    let peak = amplitude.clamp(0.0, 1.0) as f64 * i16::MAX as f64;

    (0..samples)
        .map(|i| (peak * (step * i as f64).sin()) as AudioSample)
        .collect()
}

/// Energy share a frame must reach at the signature frequency
fn ratio_threshold(sensitivity: f32) -> f64 {
    0.9 - 0.6 * sensitivity as f64
}

/// Reference engine
pub struct ToneEngine {
    access_key: String,
    extra_keywords: Vec<CatalogEntry>,
    live: Arc<AtomicUsize>,
}

impl ToneEngine {
    pub fn new(access_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            extra_keywords: Vec::new(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register an additional keyword name for a language
    pub fn with_keyword(mut self, language: Language, name: &str) -> Self {
        self.extra_keywords.push(CatalogEntry {
            name: name.trim().to_lowercase(),
            language,
        });
        self
    }

    /// Spotters currently allocated and not yet released
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn is_known(&self, language: Language, name: &str) -> bool {
        self.catalog()
            .iter()
            .any(|entry| entry.language == language && entry.name == name)
    }

    fn check_access_key(&self) -> Result<(), DetectorError> {
        if self.access_key.is_empty() {
            return Err(DetectorError::InvalidAccessCredential(
                "access key is empty".to_string(),
            ));
        }

        if self.access_key.chars().any(char::is_whitespace) {
            return Err(DetectorError::InvalidAccessCredential(
                "access key contains whitespace".to_string(),
            ));
        }

        Ok(())
    }
}

impl WakeEngine for ToneEngine {
    fn catalog(&self) -> Vec<CatalogEntry> {
        BUILTIN_KEYWORDS
            .iter()
            .flat_map(|(language, names)| {
                names.iter().map(move |name| CatalogEntry {
                    name: name.to_string(),
                    language: *language,
                })
            })
            .chain(self.extra_keywords.iter().cloned())
            .collect()
    }

    fn initialize(&self, config: &DetectorConfig) -> Result<Box<dyn KeywordSpotter>, DetectorError> {
        self.check_access_key()?;

        if !self.catalog().iter().any(|e| e.language == config.language) {
            return Err(DetectorError::UnsupportedLanguage(config.language.to_string()));
        }

        let mut targets = Vec::with_capacity(config.keywords.len());
        let mut names = Vec::with_capacity(config.keywords.len());
        for setting in &config.keywords {
            let (name, frequency_hz, min_duration_ms) = match &setting.keyword {
                KeywordRef::Builtin(name) => {
                    if !self.is_known(config.language, name) {
                        return Err(DetectorError::InvalidKeyword(format!(
                            "'{}' is not a {} keyword",
                            name, config.language
                        )));
                    }
                    (name.clone(), signature_hz(name), DEFAULT_MIN_DURATION_MS)
                }
                KeywordRef::Custom(path) => {
                    let model = ToneModel::load(path)?;
                    let name = model.name.unwrap_or_else(|| setting.keyword.name());
                    (name, model.frequency_hz, model.min_duration_ms)
                }
            };

            let frame_ms = FRAME_LENGTH as f64 * 1000.0 / SAMPLE_RATE as f64;
            let required_frames = ((min_duration_ms as f64 / frame_ms).ceil() as u32).max(1);

            debug!(
                "Keyword '{}': {:.0} Hz, {} frames, threshold {:.2}",
                name,
                frequency_hz,
                required_frames,
                ratio_threshold(setting.sensitivity)
            );

            targets.push(Target {
                frequency_hz,
                threshold: ratio_threshold(setting.sensitivity),
                required_frames,
                held: 0,
                fired: false,
            });
            names.push(name);
        }

        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ToneSpotter {
            targets,
            names,
            sample_rate: SAMPLE_RATE,
            live: self.live.clone(),
            released: false,
        }))
    }
}

struct Target {
    frequency_hz: f32,
    threshold: f64,
    required_frames: u32,
    held: u32,
    fired: bool,
}

/// Per-session spotter created by [`ToneEngine`]
pub struct ToneSpotter {
    targets: Vec<Target>,
    names: Vec<String>,
    sample_rate: u32,
    live: Arc<AtomicUsize>,
    released: bool,
}

impl KeywordSpotter for ToneSpotter {
    fn frame_length(&self) -> usize {
        FRAME_LENGTH
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn keywords(&self) -> Vec<String> {
        self.names.clone()
    }

    fn process(&mut self, frame: &[AudioSample]) -> Result<Option<usize>, DetectorError> {
        if self.released {
            return Err(DetectorError::Released);
        }

        if frame.is_empty() {
            return Ok(None);
        }

        let samples: Vec<f64> = frame.iter().map(|&s| s as f64 / i16::MAX as f64).collect();
        let energy: f64 = samples.iter().map(|s| s * s).sum();
        let rms = (energy / samples.len() as f64).sqrt();
        let voiced = rms >= SILENCE_RMS;

        let mut detected = None;

        for (index, target) in self.targets.iter_mut().enumerate() {
            let matched = voiced && {
                let power = goertzel_power(&samples, target.frequency_hz as f64, self.sample_rate as f64);
                let ratio = power / (energy * samples.len() as f64 / 2.0);
                trace!("Keyword {} ratio {:.3}", index, ratio);
                ratio >= target.threshold
            };

            if matched {
                target.held += 1;
                if target.held >= target.required_frames && !target.fired {
                    target.fired = true;
                    detected.get_or_insert(index);
                }
            } else {
                target.held = 0;
                target.fired = false;
            }
        }

        Ok(detected)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ToneSpotter {
    fn drop(&mut self) {
        self.release();
    }
}

/// Squared DFT magnitude of `samples` at `frequency`
fn goertzel_power(samples: &[f64], frequency: f64, sample_rate: f64) -> f64 {
    let coeff = 2.0 * (2.0 * PI * frequency / sample_rate).cos();
    let (mut s1, mut s2) = (0.0, 0.0);

    for &x in samples {
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }

    s1 * s1 + s2 * s2 - coeff * s1 * s2
}
