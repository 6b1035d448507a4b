use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vc_audio::{
    default_sample_rate, list_input_devices, list_output_devices, spawn_voice_changer_stream,
    AudioStreamOptions,
};
use vc_core::{ModelFamily, ModelSlot};
use vc_session::{PassthroughFactory, VoiceChangerManager};

#[derive(Parser)]
#[command(name = "vc-cli")]
#[command(about = "Streaming voice changer session driver", long_about = None)]
struct Cli {
    /// JSON settings store, created on first change.
    #[arg(long, global = true, default_value = "vc-settings.json")]
    settings: PathBuf,
    /// Native sampling rate of the model slot.
    #[arg(long, global = true, default_value_t = 16_000)]
    model_rate: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List audio devices.
    Devices,
    /// Print the session state as JSON.
    Info,
    /// Change one setting and persist it.
    Set {
        key: String,
        /// JSON value; bare words are taken as strings.
        value: String,
    },
    /// Convert a WAV file in one shot.
    Convert {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Stream from the input device to the output device.
    Run {
        /// Stop after this many seconds; runs until the stream dies otherwise.
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => print_devices(),
        Commands::Info => {
            let manager = open_manager(&cli.settings, cli.model_rate);
            println!("{}", serde_json::to_string_pretty(&manager.info())?);
            Ok(())
        }
        Commands::Set { key, value } => {
            let manager = open_manager(&cli.settings, cli.model_rate);
            let value = parse_value(&value);
            let info = manager
                .update_settings(&key, value)
                .with_context(|| format!("failed to set {key}"))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Commands::Convert { input, output } => {
            let manager = open_manager(&cli.settings, cli.model_rate);
            convert_file(&manager, &input, &output)
        }
        Commands::Run { seconds } => {
            let manager = Arc::new(open_manager(&cli.settings, cli.model_rate));
            run_stream(manager, seconds.map(Duration::from_secs))
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vc_cli=info,vc_session=info,vc_audio=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Builds a manager around the passthrough pipeline with a single slot,
/// selecting it when the stored settings have none.
fn open_manager(settings: &Path, model_rate: u32) -> VoiceChangerManager {
    let mut slot = ModelSlot::new(0, ModelFamily::Rvc, model_rate);
    slot.name = "passthrough".to_string();
    let manager = VoiceChangerManager::open(settings, Arc::new(PassthroughFactory), vec![slot]);
    if manager.settings().model_slot_index < 0 {
        if let Err(err) = manager.select_slot(0) {
            warn!("slot 0 not loaded: {err}");
        }
    }
    manager
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_devices() -> Result<()> {
    println!("input devices:");
    for name in list_input_devices()? {
        println!("  {name}");
    }
    println!("output devices:");
    for name in list_output_devices()? {
        println!("  {name}");
    }
    match default_sample_rate() {
        Ok(rate) => println!("default input rate: {rate} Hz"),
        Err(err) => println!("default input rate unavailable: {err}"),
    }
    Ok(())
}

fn convert_file(manager: &VoiceChangerManager, input: &Path, output: &Path) -> Result<()> {
    let (samples, sample_rate) = read_mono_wav(input)?;
    info!(
        path = %input.display(),
        samples = samples.len(),
        sample_rate,
        "converting file"
    );
    let converted = manager
        .convert(&samples, sample_rate)
        .context("conversion failed")?;

    let out_rate = manager.settings().output_sample_rate;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: out_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(output, spec)
        .with_context(|| format!("create {}", output.display()))?;
    for s in converted {
        writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    info!(path = %output.display(), sample_rate = out_rate, "wrote converted audio");
    Ok(())
}

fn read_mono_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("open {}", path.display()))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    let channels = spec.channels.max(1) as usize;
    let mono = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

fn run_stream(manager: Arc<VoiceChangerManager>, limit: Option<Duration>) -> Result<()> {
    let settings = manager.settings();
    if settings.input_sample_rate != settings.output_sample_rate {
        bail!(
            "device streaming needs equal input and output rates, got {} and {}",
            settings.input_sample_rate,
            settings.output_sample_rate
        );
    }
    let options = AudioStreamOptions::from_settings(&settings);
    let engine = spawn_voice_changer_stream(Arc::clone(&manager), options)?;
    info!("streaming, press Ctrl+C to stop");

    let started = Instant::now();
    while engine.is_running() {
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        thread::sleep(Duration::from_secs(1));
        let (rms, peak) = engine.levels();
        let stats = engine.stats();
        info!(
            rms,
            peak,
            volume = stats.volume,
            chunks = stats.chunks,
            errors = stats.errors,
            "levels"
        );
    }
    engine.stop_and_abort();
    Ok(())
}
