// Aura Detect command line
// Live detection, file replay, sample collection and model management

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use aura_detect::audio::{decode_wav, encode_wav, AudioSource};
use aura_detect::state::default_data_dir;
use aura_detect::{ClassScope, Detector, DetectorConfig, SourceState, SyntheticSource};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Aura Detect - hotword and sound-event detection with per-user models
#[derive(Parser)]
#[command(name = "aura-detect", version, about)]
struct Cli {
    /// Config file; `config.json` in the data directory by default
    #[arg(short, long, env = "AURA_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, env = "AURA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Override the owner from the config
    #[arg(short, long)]
    owner: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Detect from the microphone and print trigger events
    Listen {
        /// Stop after this many seconds (0 runs until killed)
        #[arg(short, long, default_value = "0")]
        seconds: u64,
    },
    /// Run detection over a WAV file
    Replay {
        path: PathBuf,
        /// Pace frames in real time
        #[arg(long)]
        realtime: bool,
    },
    /// Record labeled samples from the microphone or a WAV file
    Collect {
        /// Label for the collected samples ("positive" or a class scope name for positives)
        #[arg(short, long)]
        label: String,
        /// Seconds to record from the microphone
        #[arg(short, long, default_value = "5")]
        seconds: u64,
        /// Collect from this WAV file instead of the microphone
        #[arg(long)]
        wav: Option<PathBuf>,
    },
    /// Train a model from the collected samples and activate it
    Train {
        #[arg(short, long, default_value = "hotword")]
        scope: String,
        /// Override the configured epoch count
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// List published model versions and the active one
    Models {
        #[arg(short, long, default_value = "hotword")]
        scope: String,
    },
    /// Activate a published version (0 restores the baseline)
    Activate {
        #[arg(short, long, default_value = "hotword")]
        scope: String,
        version: u32,
    },
    /// List collected samples
    Samples {
        #[arg(short, long)]
        label: Option<String>,
    },
    /// Show active models and sample counts for the owner
    Status,
    /// Write a stored sample back out as a WAV file
    Export {
        id: uuid::Uuid,
        out: PathBuf,
    },
    /// List audio input devices
    Devices,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<DetectorConfig, Box<dyn std::error::Error>> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => default_data_dir()?.join("config.json"),
    };

    let mut config = DetectorConfig::load_or_default(&path)?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(owner) = &cli.owner {
        config.owner = owner.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> CliResult {
    if let Command::Devices = cli.command {
        for name in AudioSource::list_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    let owner = config.owner.clone();

    match cli.command {
        Command::Listen { seconds } => {
            let detector = Detector::with_microphone(config)?;
            print_triggers(&detector)?;
            detector.start()?;
            wait(&detector, (seconds > 0).then(|| Duration::from_secs(seconds)));
            detector.stop();
        }
        Command::Replay { path, realtime } => {
            let detector = replay_detector(config, &path, realtime)?;
            print_triggers(&detector)?;
            detector.start()?;
            wait(&detector, None);
            detector.stop();
            if detector.dropped_frames() > 0 {
                log::warn!("{} frames dropped during replay", detector.dropped_frames());
            }
        }
        Command::Collect { label, seconds, wav } => {
            let detector = match wav {
                Some(path) => replay_detector(config, &path, false)?,
                None => Detector::with_microphone(config)?,
            };
            detector.start_collecting(&label)?;
            detector.start()?;
            wait(&detector, Some(Duration::from_secs(seconds)));
            detector.stop();

            let saved = detector.stop_collecting();
            for record in &saved {
                println!("{}\t{}\t{:.2}s\t{}", record.id, record.label, record.duration_secs(), record.path);
            }
            log::info!("Collected {} samples for {}", saved.len(), owner);
        }
        Command::Train { scope, epochs } => {
            let mut params = config.training.clone();
            if let Some(epochs) = epochs {
                params.epochs = epochs;
            }
            let detector = idle_detector(config)?;
            let job = detector.train_from_store(&owner, &ClassScope::new(scope), params)?;

            let outcome = job.wait();
            match &outcome.result {
                Ok(record) => {
                    println!("{}", serde_json::to_string_pretty(record)?);
                }
                Err(e) => return Err(format!("training failed: {}", e).into()),
            }
        }
        Command::Models { scope } => {
            let detector = idle_detector(config)?;
            let scope = ClassScope::new(scope);
            let active = detector.get_active_model_info(&owner, &scope)?;

            println!("{}", serde_json::to_string_pretty(&active)?);
            for record in detector.list_model_versions(&owner, &scope)? {
                let marker = if record.version == active.version { "*" } else { " " };
                println!(
                    "{} v{}\t{}\taccuracy {:.3}\tf1 {:.3}",
                    marker,
                    record.version,
                    record.created_at.to_rfc3339(),
                    record.metrics.accuracy,
                    record.metrics.f1
                );
            }
        }
        Command::Activate { scope, version } => {
            let detector = idle_detector(config)?;
            let info = detector.activate_model_version(&owner, &ClassScope::new(scope), version)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Samples { label } => {
            let detector = idle_detector(config)?;
            for record in detector.list_samples(&owner, label.as_deref())? {
                println!("{}\t{}\t{:.2}s\t{}", record.id, record.label, record.duration_secs(), record.path);
            }
        }
        Command::Status => {
            let detector = idle_detector(config)?;
            println!("owner: {}", owner);
            for record in detector.active_models(&owner)? {
                println!(
                    "{}\tv{}\tactivated {}",
                    record.class_scope,
                    record.version,
                    record.activated_at.to_rfc3339()
                );
            }
            for (label, count) in detector.sample_counts(&owner)? {
                println!("{}\t{} samples", label, count);
            }
        }
        Command::Export { id, out } => {
            let detector = idle_detector(config)?;
            let record = detector
                .store()
                .get_sample(&id)?
                .ok_or_else(|| format!("no sample with id {}", id))?;
            let sample = detector.store().load_sample(&record)?;
            std::fs::write(&out, encode_wav(&sample.audio, sample.sample_rate)?)?;
            println!("{}\t{:.2}s\t{}", record.label, sample.duration_secs(), out.display());
        }
        Command::Devices => {}
    }

    Ok(())
}

/// Registry management without opening an input device
fn idle_detector(config: DetectorConfig) -> Result<Detector, Box<dyn std::error::Error>> {
    let source = SyntheticSource::new(Vec::new(), config.audio.sample_rate, config.audio.frame_size);
    let detector = Detector::new(config, Box::new(source))?;
    for failure in detector.recent_load_errors() {
        log::warn!(
            "Model {}/{} v{} failed to load: {}",
            failure.owner,
            failure.class_scope,
            failure.version,
            failure.error
        );
    }
    Ok(detector)
}

fn replay_detector(mut config: DetectorConfig, path: &Path, realtime: bool) -> Result<Detector, Box<dyn std::error::Error>> {
    let audio = decode_wav(&std::fs::read(path)?)?;
    log::info!("Replaying {} ({:.2}s at {} Hz)", path.display(), audio.duration_secs(), audio.sample_rate);

    if !realtime {
        // Without pacing the whole file lands in the queue at once
        let frames = audio.samples.len() / config.audio.frame_size.max(1) + 1;
        config.audio.queue_capacity = config.audio.queue_capacity.max(frames);
    }
    let frame_size = config.audio.frame_size;
    let source = SyntheticSource::from_audio(audio, frame_size).realtime(realtime);
    Ok(Detector::new(config, Box::new(source))?)
}

fn print_triggers(detector: &Detector) -> CliResult {
    for scope in detector.config().scopes() {
        detector.register_trigger_callback(&scope, |event| {
            println!("{}", serde_json::to_string(event)?);
            Ok(())
        })?;
    }
    Ok(())
}

/// Block until the source ends or `limit` elapses
fn wait(detector: &Detector, limit: Option<Duration>) {
    let started = Instant::now();
    loop {
        thread::sleep(Duration::from_millis(50));
        if detector.source_state() == SourceState::Stopped {
            break;
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
    }
}
