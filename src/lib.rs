//! Wyoming wake-word server
//!
//! This library provides a wake-word detection service for voice pipelines:
//! - Wyoming event framing (JSON header + data + binary payload)
//! - Per-session frame assembly and detector lifecycle
//! - A bounded session pool over TCP and Unix sockets
//! - A single-writer outbound dispatcher per connection
//! - A deterministic reference engine behind pluggable engine traits

pub mod audio_buffer;
pub mod client;
pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod info;
pub mod protocol;
pub mod server;
pub mod session;

pub use audio_buffer::{AudioFormat, AudioFrame, AudioSample, FrameAssembler, SAMPLE_RATE};
pub use client::{ClientError, WakeClient};
pub use config::{Cli, LogFormat, OptionsFile, Settings, SettingsError};
pub use detector::{
    DetectionEvent, DetectionResult, DetectorConfig, DetectorError, DetectorHandle, KeywordRef,
    KeywordSpotter, Language, WakeEngine,
};
pub use dispatcher::{Dispatcher, Outbox};
pub use engine::{ToneEngine, FRAME_LENGTH};
pub use error::ErrorKind;
pub use server::{Endpoint, OverflowPolicy, ServerConfig, ServerError, ServerHandle, WakeServer};
pub use session::{Session, SessionError, SessionId, SessionSettings, SessionState};

use tracing_subscriber::EnvFilter;

/// Initialize logging on stderr
///
/// `RUST_LOG` takes precedence over `debug`.
pub fn init_logging(debug: bool, format: LogFormat) {
    let default = if debug {
        "wyoming_wakeword=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _config = ServerConfig::default();
        let _settings = SessionSettings::default();
        let _format = AudioFormat::detector_format();
    }
}
