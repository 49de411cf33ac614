/// Audio buffer module: PCM decoding and frame assembly
///
/// Audio chunks arrive with arbitrary sizes. The assembler decodes them into
/// mono 16-bit samples, accumulates them in a ring buffer and yields
/// fixed-size frames of exactly the detector's block length. Samples short of
/// a full frame carry over to the next chunk.

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use thiserror::Error;
use tracing::{debug, trace};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Sample rate the detector operates at
pub const SAMPLE_RATE: u32 = 16000;

/// Bytes per sample (16-bit)
pub const SAMPLE_WIDTH: u16 = 2;

/// Ring capacity in frames
const RING_FRAMES: usize = 4;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Malformed audio frame: {0}")]
    MalformedFrame(String),
}

/// Negotiated PCM format of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub rate: u32,
    pub width: u16,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(rate: u32, width: u16, channels: u16) -> Self {
        Self {
            rate,
            width,
            channels,
        }
    }

    /// 16kHz, 16-bit, mono
    pub fn detector_format() -> Self {
        Self::new(SAMPLE_RATE, SAMPLE_WIDTH, 1)
    }

    /// Size of one sample across all channels
    pub fn bytes_per_frame(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Check the format against what a detector running at `engine_rate` accepts
    ///
    /// Rate must match exactly, samples must be 16-bit, and only mono or
    /// stereo (down-mixed) input is accepted. Nothing is resampled or
    /// converted: clients send 16 kHz 16-bit PCM, and the error text names
    /// the required value.
    pub fn validate_for(&self, engine_rate: u32) -> Result<(), AudioError> {
        if self.rate != engine_rate {
            return Err(AudioError::UnsupportedFormat(format!(
                "sample rate {} Hz (detector requires {} Hz)",
                self.rate, engine_rate
            )));
        }

        if self.width != SAMPLE_WIDTH {
            return Err(AudioError::UnsupportedFormat(format!(
                "sample width {} bytes (detector requires {})",
                self.width, SAMPLE_WIDTH
            )));
        }

        if self.channels == 0 || self.channels > 2 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels (must be 1 or 2)",
                self.channels
            )));
        }

        Ok(())
    }
}

/// Fixed-length block of mono samples, the unit the detector scores
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Strictly increasing within a session, starting at 0
    pub sequence: u64,

    pub samples: Vec<AudioSample>,

    /// Timestamp in milliseconds of the chunk that completed this frame,
    /// or the stream position when the client sent none
    pub timestamp_ms: u64,
}

/// Splits incoming PCM into detector-sized frames
pub struct FrameAssembler {
    format: AudioFormat,
    frame_length: usize,
    ring: HeapRb<AudioSample>,
    next_sequence: u64,
    samples_emitted: u64,
}

impl FrameAssembler {
    /// Create an assembler for a validated format and the engine's block length
    pub fn new(format: AudioFormat, frame_length: usize) -> Result<Self, AudioError> {
        if frame_length == 0 {
            return Err(AudioError::UnsupportedFormat(
                "detector frame length is zero".to_string(),
            ));
        }

        // Rate is checked against the engine by the caller
        format.validate_for(format.rate)?;

        debug!(
            "Creating frame assembler: {}Hz/{}-bit/{}ch -> {} samples per frame",
            format.rate,
            format.width * 8,
            format.channels,
            frame_length
        );

        Ok(Self {
            format,
            frame_length,
            ring: HeapRb::new(frame_length * RING_FRAMES),
            next_sequence: 0,
            samples_emitted: 0,
        })
    }

    /// Decode one chunk and return every frame it completes
    ///
    /// The chunk's declared format must equal the negotiated one and its
    /// payload must hold a whole number of samples.
    pub fn push(
        &mut self,
        declared: AudioFormat,
        payload: &[u8],
        timestamp: Option<u64>,
    ) -> Result<Vec<AudioFrame>, AudioError> {
        if declared != self.format {
            return Err(AudioError::MalformedFrame(format!(
                "chunk declares {}Hz/{}B/{}ch but stream negotiated {}Hz/{}B/{}ch",
                declared.rate,
                declared.width,
                declared.channels,
                self.format.rate,
                self.format.width,
                self.format.channels
            )));
        }

        let stride = self.format.bytes_per_frame();
        if payload.len() % stride != 0 {
            return Err(AudioError::MalformedFrame(format!(
                "payload of {} bytes is not a multiple of {}",
                payload.len(),
                stride
            )));
        }

        let samples = decode_pcm(payload, self.format.channels as usize);
        trace!("Decoded {} samples from {} bytes", samples.len(), payload.len());

        let mut frames = Vec::new();
        let mut rest = samples.as_slice();

        while !rest.is_empty() {
            let written = self.ring.push_slice(rest);
            rest = &rest[written..];

            while self.ring.occupied_len() >= self.frame_length {
                let mut block = vec![0; self.frame_length];
                self.ring.pop_slice(&mut block);
                self.samples_emitted += self.frame_length as u64;

                let position_ms = self.samples_emitted * 1000 / self.format.rate as u64;
                frames.push(AudioFrame {
                    sequence: self.next_sequence,
                    samples: block,
                    timestamp_ms: timestamp.unwrap_or(position_ms),
                });
                self.next_sequence += 1;
            }
        }

        Ok(frames)
    }

    /// Samples waiting for a full frame
    pub fn pending(&self) -> usize {
        self.ring.occupied_len()
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        let occupied = self.ring.occupied_len();
        self.ring.skip(occupied);
        debug!("Discarded {} buffered samples", occupied);
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Frames produced so far
    pub fn frames_emitted(&self) -> u64 {
        self.next_sequence
    }

    /// Duration of audio turned into frames so far (in seconds)
    pub fn duration_secs(&self) -> f32 {
        self.samples_emitted as f32 / self.format.rate as f32
    }
}

/// Little-endian 16-bit PCM to mono samples, averaging across channels
fn decode_pcm(payload: &[u8], channels: usize) -> Vec<AudioSample> {
    let samples = payload
        .chunks_exact(2)
        .map(|b| AudioSample::from_le_bytes([b[0], b[1]]));

    if channels <= 1 {
        return samples.collect();
    }

    let interleaved: Vec<AudioSample> = samples.collect();
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as AudioSample
        })
        .collect()
}

/// Encode mono or interleaved samples as little-endian PCM bytes
pub fn encode_pcm(samples: &[AudioSample]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
