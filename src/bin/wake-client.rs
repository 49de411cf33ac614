//! Wake-word client CLI
//!
//! Streams a WAV file (or a synthesized keyword tone) to a wake-word server
//! and prints every event it gets back.

use anyhow::{bail, Context};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wyoming_wakeword::engine::{render_tone, signature_hz};
use wyoming_wakeword::protocol::{Detect, Event};
use wyoming_wakeword::{init_logging, AudioFormat, Endpoint, LogFormat, WakeClient, SAMPLE_RATE};

#[derive(Parser)]
#[command(name = "wake-client")]
#[command(about = "Stream audio to a Wyoming wake-word server", long_about = None)]
struct Cli {
    /// Server URI
    #[arg(long, default_value = "tcp://127.0.0.1:10400")]
    uri: String,

    /// 16-bit PCM WAV file to stream
    #[arg(required_unless_present = "tone")]
    wav: Option<PathBuf>,

    /// Synthesize the signature tone of this built-in keyword instead
    #[arg(long, conflicts_with = "wav")]
    tone: Option<String>,

    /// Length of the synthesized tone (seconds)
    #[arg(long, default_value_t = 1.0)]
    seconds: f32,

    /// Keyword to listen for (repeatable, server default when omitted)
    #[arg(long = "keyword")]
    keywords: Vec<String>,

    /// Sensitivity for every requested keyword
    #[arg(long)]
    sensitivity: Option<f32>,

    /// Keyword language
    #[arg(long)]
    language: Option<String>,

    /// Audio per chunk (milliseconds)
    #[arg(long, default_value_t = 64)]
    chunk_ms: u32,

    /// Send chunks at playback speed
    #[arg(long)]
    realtime: bool,

    /// Only print the server description
    #[arg(long)]
    describe: bool,

    /// Log DEBUG messages
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, LogFormat::Compact);

    let endpoint = Endpoint::parse(&cli.uri)?;
    let mut client = WakeClient::connect(&endpoint)
        .await
        .with_context(|| format!("Cannot connect to {}", endpoint))?;

    if cli.describe {
        let info = client.describe().await?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let (samples, format) = match (&cli.wav, &cli.tone) {
        (Some(path), _) => read_wav(path)?,
        (None, Some(keyword)) => {
            let count = (cli.seconds.max(0.0) * SAMPLE_RATE as f32) as usize;
            (
                render_tone(signature_hz(keyword), count, 0.5),
                AudioFormat::detector_format(),
            )
        }
        (None, None) => bail!("Give a WAV file or --tone"),
    };

    let detect = detect_request(&cli);
    let ready = client.start(detect.as_ref(), format).await?;
    println!(
        "session {} ready: keywords {:?}, {} samples per frame",
        ready.session, ready.keywords, ready.frame_length
    );

    let chunk_frames = (format.rate as u64 * cli.chunk_ms.max(1) as u64 / 1000).max(1) as usize;
    if cli.realtime {
        let block = chunk_frames * format.channels as usize;
        let mut seq = 0;
        for part in samples.chunks(block) {
            seq = client.stream_samples(part, format, chunk_frames, seq).await?;
            tokio::time::sleep(Duration::from_millis(cli.chunk_ms as u64)).await;
        }
    } else {
        client.stream_samples(&samples, format, chunk_frames, 0).await?;
    }

    for event in client.stop().await? {
        print_event(&event);
    }

    Ok(())
}

fn detect_request(cli: &Cli) -> Option<Detect> {
    if cli.keywords.is_empty() && cli.language.is_none() {
        return None;
    }

    let names = (!cli.keywords.is_empty()).then(|| cli.keywords.clone());
    let sensitivities = cli.sensitivity.map(|value| {
        cli.keywords
            .iter()
            .map(|keyword| (keyword.clone(), value))
            .collect::<BTreeMap<_, _>>()
    });

    Some(Detect {
        names,
        sensitivities,
        language: cli.language.clone(),
    })
}

fn read_wav(path: &Path) -> anyhow::Result<(Vec<i16>, AudioFormat)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        bail!(
            "{} is not 16-bit PCM ({:?}, {} bits)",
            path.display(),
            spec.sample_format,
            spec.bits_per_sample
        );
    }

    if spec.sample_rate != SAMPLE_RATE {
        bail!(
            "{} is {} Hz; the server only accepts {} Hz, resample it first",
            path.display(),
            spec.sample_rate,
            SAMPLE_RATE
        );
    }

    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Corrupt WAV data in {}", path.display()))?;

    Ok((samples, AudioFormat::new(spec.sample_rate, 2, spec.channels)))
}

fn print_event(event: &Event) {
    match serde_json::to_string(&event.data) {
        Ok(data) => println!("{} {}", event.event_type, data),
        Err(_) => println!("{}", event.event_type),
    }
}
