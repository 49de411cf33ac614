/// Service configuration
///
/// Settings come from three places, later ones winning: built-in defaults,
/// an optional YAML or JSON options file, and command-line flags (some of
/// which can also be set through the environment).

use crate::detector::Language;
use crate::server::{Endpoint, OverflowPolicy, ServerConfig, ServerError, DEFAULT_URI};
use crate::session::{SessionSettings, DEFAULT_KEYWORD, DEFAULT_SENSITIVITY};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error(
        "No access key given. Obtain one from the Picovoice console \
         (https://console.picovoice.ai/) and pass it with --access-key \
         or PORCUPINE_ACCESS_KEY"
    )]
    MissingAccessKey,

    #[error("Failed to read options file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid options file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid setting: {0}")]
    Invalid(String),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Log output style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Pretty,
    Json,
}

/// Wyoming wake-word detection server
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "wyoming-wakeword", version, about, long_about = None)]
pub struct Cli {
    /// Listen URI (tcp://host:port or unix:///path/to/socket)
    #[arg(long)]
    pub uri: Option<String>,

    /// Picovoice access key
    #[arg(long, env = "PORCUPINE_ACCESS_KEY", hide_env_values = true)]
    pub access_key: Option<String>,

    /// Default sensitivity (0.0 - 1.0)
    #[arg(long)]
    pub sensitivity: Option<f32>,

    /// Keyword language
    #[arg(long)]
    pub language: Option<Language>,

    /// Keyword used when a client does not name one (repeatable)
    #[arg(long = "keyword")]
    pub keywords: Vec<String>,

    /// YAML or JSON options file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Maximum concurrent sessions
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// What to do with connections beyond --max-sessions
    #[arg(long, value_enum)]
    pub overflow: Option<OverflowPolicy>,

    /// Seconds a queued connection waits for a slot
    #[arg(long)]
    pub queue_timeout: Option<f64>,

    /// Seconds allowed between connect and audio-start
    #[arg(long)]
    pub negotiation_timeout: Option<f64>,

    /// Seconds without input before a streaming session is closed
    #[arg(long)]
    pub idle_timeout: Option<f64>,

    /// Seconds between keep-alive pings (0 disables)
    #[arg(long)]
    pub keepalive: Option<f64>,

    /// Print the available keywords and exit
    #[arg(long)]
    pub list_keywords: bool,

    /// Log DEBUG messages
    #[arg(long)]
    pub debug: bool,

    /// Log output style
    #[arg(long, value_enum, default_value_t = LogFormat::Full)]
    pub log_format: LogFormat,
}

/// A single keyword or a list of them
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(keyword) => vec![keyword],
            OneOrMany::Many(keywords) => keywords,
        }
    }
}

/// Contents of the options file; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptionsFile {
    pub uri: Option<String>,
    pub access_key: Option<String>,
    pub sensitivity: Option<f32>,
    pub language: Option<Language>,
    pub keyword: Option<OneOrMany>,
    pub keyword_sensitivities: BTreeMap<String, f32>,

    /// Extra keyword names accepted for the configured language
    pub custom_keywords: Vec<String>,

    pub max_sessions: Option<usize>,
    pub overflow: Option<OverflowPolicy>,
    pub queue_timeout: Option<f64>,
    pub negotiation_timeout: Option<f64>,
    pub idle_timeout: Option<f64>,
    pub keepalive: Option<f64>,
}

impl OptionsFile {
    /// Load YAML (or JSON, which YAML accepts) from `path`
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }
}

/// Fully resolved service settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub endpoint: Endpoint,
    pub access_key: String,
    pub session: SessionSettings,
    pub custom_keywords: Vec<String>,
    pub server: ServerConfig,
}

impl Settings {
    /// Read the options file named on the command line, then merge
    pub fn resolve(cli: &Cli) -> Result<Self, SettingsError> {
        let file = match &cli.config {
            Some(path) => {
                debug!("Loading options from {}", path.display());
                OptionsFile::load(path)?
            }
            None => OptionsFile::default(),
        };

        Self::merge(cli, file)
    }

    /// Combine flags and file values; flags take precedence
    pub fn merge(cli: &Cli, file: OptionsFile) -> Result<Self, SettingsError> {
        let access_key = cli
            .access_key
            .clone()
            .or(file.access_key)
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or(SettingsError::MissingAccessKey)?;

        let uri = cli.uri.clone().or(file.uri).unwrap_or_else(|| DEFAULT_URI.to_string());
        let endpoint = Endpoint::parse(&uri)?;

        let sensitivity = cli
            .sensitivity
            .or(file.sensitivity)
            .unwrap_or(DEFAULT_SENSITIVITY);
        check_sensitivity("sensitivity", sensitivity)?;

        for (keyword, value) in &file.keyword_sensitivities {
            check_sensitivity(keyword, *value)?;
        }

        let default_keywords = if !cli.keywords.is_empty() {
            cli.keywords.clone()
        } else {
            file.keyword
                .map(OneOrMany::into_vec)
                .filter(|keywords| !keywords.is_empty())
                .unwrap_or_else(|| vec![DEFAULT_KEYWORD.to_string()])
        };

        let defaults = ServerConfig::default();
        let server = ServerConfig {
            max_sessions: cli
                .max_sessions
                .or(file.max_sessions)
                .unwrap_or(defaults.max_sessions),
            overflow: cli.overflow.or(file.overflow).unwrap_or(defaults.overflow),
            queue_timeout: seconds(
                "queue_timeout",
                cli.queue_timeout.or(file.queue_timeout),
                defaults.queue_timeout,
            )?,
            negotiation_timeout: seconds(
                "negotiation_timeout",
                cli.negotiation_timeout.or(file.negotiation_timeout),
                defaults.negotiation_timeout,
            )?,
            idle_timeout: seconds(
                "idle_timeout",
                cli.idle_timeout.or(file.idle_timeout),
                defaults.idle_timeout,
            )?,
            keepalive: match cli.keepalive.or(file.keepalive) {
                Some(secs) => Some(seconds("keepalive", Some(secs), Duration::ZERO)?)
                    .filter(|period| !period.is_zero()),
                None => defaults.keepalive,
            },
            outbox_capacity: defaults.outbox_capacity,
        };
        server.validate()?;

        Ok(Self {
            endpoint,
            access_key,
            session: SessionSettings {
                default_keywords,
                sensitivity,
                keyword_sensitivities: file.keyword_sensitivities,
                language: cli.language.or(file.language).unwrap_or_default(),
            },
            custom_keywords: file.custom_keywords,
            server,
        })
    }
}

fn check_sensitivity(name: &str, value: f32) -> Result<(), SettingsError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SettingsError::Invalid(format!(
            "{} must be between 0.0 and 1.0, got {}",
            name, value
        )))
    }
}

fn seconds(name: &str, value: Option<f64>, default: Duration) -> Result<Duration, SettingsError> {
    match value {
        None => Ok(default),
        Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
        Some(secs) => Err(SettingsError::Invalid(format!(
            "{} must be a non-negative number of seconds, got {}",
            name, secs
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["wyoming-wakeword"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::merge(&cli(&["--access-key", "abc"]), OptionsFile::default()).unwrap();

        assert_eq!(settings.endpoint, Endpoint::Tcp("0.0.0.0:10400".to_string()));
        assert_eq!(settings.session.default_keywords, vec![DEFAULT_KEYWORD]);
        assert_eq!(settings.session.language, Language::En);
        assert_eq!(settings.server, ServerConfig::default());
    }

    #[test]
    fn test_missing_access_key() {
        let result = Settings::merge(&Cli::default(), OptionsFile::default());
        let err = result.unwrap_err();
        assert!(matches!(err, SettingsError::MissingAccessKey));
        assert!(err.to_string().contains("Picovoice console"));
    }

    #[test]
    fn test_blank_access_key_is_missing() {
        let file = OptionsFile {
            access_key: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            Settings::merge(&Cli::default(), file),
            Err(SettingsError::MissingAccessKey)
        ));
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "uri: tcp://127.0.0.1:9000\n\
             access_key: from-file\n\
             sensitivity: 0.2\n\
             language: de\n\
             keyword: [ananas, leguan]\n\
             keyword_sensitivities:\n  leguan: 0.8\n\
             max_sessions: 4\n\
             overflow: queue\n\
             keepalive: 15"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = cli(&["--config", &path, "--sensitivity", "0.7", "--max-sessions", "2"]);
        let settings = Settings::resolve(&cli).unwrap();

        assert_eq!(settings.access_key, "from-file");
        assert_eq!(settings.endpoint, Endpoint::Tcp("127.0.0.1:9000".to_string()));
        assert_eq!(settings.session.sensitivity, 0.7);
        assert_eq!(settings.session.language, Language::De);
        assert_eq!(settings.session.default_keywords, vec!["ananas", "leguan"]);
        assert_eq!(settings.session.keyword_sensitivities["leguan"], 0.8);
        assert_eq!(settings.server.max_sessions, 2);
        assert_eq!(settings.server.overflow, OverflowPolicy::Queue);
        assert_eq!(settings.server.keepalive, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_json_options_file() {
        let raw = r#"{"access_key": "k", "keyword": "jarvis", "custom_keywords": ["hey aether"]}"#;
        let file = OptionsFile::parse(raw).unwrap();
        let settings = Settings::merge(&Cli::default(), file).unwrap();

        assert_eq!(settings.session.default_keywords, vec!["jarvis"]);
        assert_eq!(settings.custom_keywords, vec!["hey aether"]);
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(OptionsFile::parse("acess_key: typo").is_err());
    }

    #[test]
    fn test_unreadable_options_file() {
        let cli = cli(&["--config", "/nonexistent/wakeword.yaml"]);
        assert!(matches!(Settings::resolve(&cli), Err(SettingsError::Read { .. })));
    }

    #[test]
    fn test_sensitivity_out_of_range() {
        let result = Settings::merge(
            &cli(&["--access-key", "abc", "--sensitivity", "1.5"]),
            OptionsFile::default(),
        );
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_negative_timeout() {
        let result = Settings::merge(
            &cli(&["--access-key", "abc", "--idle-timeout=-1"]),
            OptionsFile::default(),
        );
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_zero_keepalive_disables() {
        let settings = Settings::merge(
            &cli(&["--access-key", "abc", "--keepalive", "0"]),
            OptionsFile::default(),
        )
        .unwrap();
        assert_eq!(settings.server.keepalive, None);
    }

    #[test]
    fn test_invalid_uri() {
        let result = Settings::merge(
            &cli(&["--access-key", "abc", "--uri", "udp://0.0.0.0:1"]),
            OptionsFile::default(),
        );
        assert!(matches!(result, Err(SettingsError::Server(_))));
    }

    #[test]
    fn test_language_flag() {
        let settings =
            Settings::merge(&cli(&["--access-key", "abc", "--language", "FR"]), OptionsFile::default())
                .unwrap();
        assert_eq!(settings.session.language, Language::Fr);
    }
}
