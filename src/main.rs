use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn, LevelFilter};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use punchin::audio::{self, AudioEngine, BackingTrack};
use punchin::config::{parse_punch_arg, validate_monitor_channels, Config};
use punchin::{
    CommandOutcome, ExportFormat, Exporter, MixSettings, RecordingSession, SessionCommand,
    TakeId, TakeStore, WavEncoder,
};

const DEFAULT_CONFIG: &str = "punchin.yaml";

/// punchin - punch-in recorder with take management
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Punch-in recorder with take management",
    long_about = "Punch-in recorder with take management.\n\n\
                  Records takes against an optional backing track, keeping only the \
                  frames inside the punch window, and stores them as numbered takes \
                  that can be renamed, deleted and exported as stems or a mix.\n\n\
                  Configuration is loaded from punchin.yaml by default, or use --config \
                  to specify a different file."
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG, global = true)]
    config: String,

    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available audio devices
    Devices,

    /// Record a new take
    Record {
        /// Take name (defaults to "Take N")
        #[arg(short, long)]
        name: Option<String>,

        /// Punch window in seconds, e.g. "12.5-20", "8-" or "-30"
        #[arg(short, long, value_name = "START-END")]
        punch: Option<String>,

        /// WAV file played while recording
        #[arg(short, long, value_name = "FILE")]
        backing: Option<PathBuf>,

        /// Commit automatically after this many seconds
        #[arg(short, long, value_name = "SECONDS")]
        duration: Option<f64>,
    },

    /// List takes in recording order
    List,

    /// Rename a take
    Rename { id: u64, name: String },

    /// Delete a take and its audio
    Delete { id: u64 },

    /// Export one take
    Export {
        id: u64,
        dest: PathBuf,

        #[arg(short, long)]
        format: Option<ExportFormat>,
    },

    /// Export every take as a separate file
    Stems {
        dir: PathBuf,

        #[arg(short, long)]
        format: Option<ExportFormat>,
    },

    /// Mix all takes down to one file
    Mix {
        dest: PathBuf,

        #[arg(short, long)]
        format: Option<ExportFormat>,

        /// Master gain applied to the whole mix (0.0 - 1.0)
        #[arg(long, default_value_t = 1.0, value_parser = parse_gain)]
        master: f32,

        /// Per-take gain (0.0 - 1.0)
        #[arg(long = "gain", value_name = "ID=GAIN", value_parser = parse_take_gain)]
        gains: Vec<(u64, f32)>,

        /// Leave a take out of the mix
        #[arg(long = "mute", value_name = "ID")]
        muted: Vec<u64>,

        /// Include the configured backing track
        #[arg(long)]
        with_backing: bool,
    },
}

impl Args {
    /// Get the log level filter based on verbosity flags
    fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Keep dependencies at warn, punchin at the requested level
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("punchin", args.log_level());

    builder.format_timestamp_millis().init();
}

fn parse_take_gain(s: &str) -> Result<(u64, f32), String> {
    let (id, gain) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid take gain '{}'. Expected ID=GAIN", s))?;
    let id = id
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("Invalid take id '{}'", id))?;
    Ok((id, parse_gain(gain)?))
}

fn parse_gain(s: &str) -> Result<f32, String> {
    let gain = s
        .trim()
        .parse::<f32>()
        .map_err(|_| format!("Invalid gain '{}'", s))?;
    if !(0.0..=1.0).contains(&gain) {
        return Err(format!("Gain must be between 0.0 and 1.0, got {}", gain));
    }
    Ok(gain)
}

/// Load configuration from file or use defaults
fn load_config(config_path: &str) -> Result<Config> {
    let path = Path::new(config_path);

    // If explicit config path provided and file doesn't exist, error
    if config_path != DEFAULT_CONFIG && !path.exists() {
        anyhow::bail!("Config file not found: {}", config_path);
    }

    // If default path and file doesn't exist, use defaults
    if config_path == DEFAULT_CONFIG && !path.exists() {
        return Ok(Config::default());
    }

    Config::from_file(path)
}

fn open_store(config: &Config) -> Result<TakeStore> {
    let dir = &config.recording.takes_dir;
    TakeStore::open(dir, config.store_options())
        .with_context(|| format!("Failed to open takes directory: {}", dir.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args.config)?;

    match args.command {
        Command::Devices => list_all_devices(),
        Command::Record {
            name,
            punch,
            backing,
            duration,
        } => record(&config, name, punch, backing, duration),
        Command::List => list_takes(&config),
        Command::Rename { id, name } => {
            let mut session = RecordingSession::new(open_store(&config)?);
            if let CommandOutcome::Renamed(take) = session.execute(SessionCommand::Rename {
                id: TakeId::new(id),
                name,
            })? {
                println!("Renamed take {} to '{}'", take.id(), take.name());
            }
            Ok(())
        }
        Command::Delete { id } => {
            let mut session = RecordingSession::new(open_store(&config)?);
            if let CommandOutcome::Deleted(take) =
                session.execute(SessionCommand::Delete { id: TakeId::new(id) })?
            {
                println!("Deleted take {} '{}'", take.id(), take.name());
            }
            Ok(())
        }
        Command::Export { id, dest, format } => {
            let store = open_store(&config)?;
            let format = export_format(&config, format, Some(&dest));
            let path = exporter(&config).export_take(&store, TakeId::new(id), &dest, format)?;
            println!("Exported take {} to {}", id, path.display());
            Ok(())
        }
        Command::Stems { dir, format } => {
            let store = open_store(&config)?;
            let format = export_format(&config, format, None);
            let paths = exporter(&config).export_stems(&store, &dir, format)?;
            for path in &paths {
                println!("{}", path.display());
            }
            println!("Exported {} stems", paths.len());
            Ok(())
        }
        Command::Mix {
            dest,
            format,
            master,
            gains,
            muted,
            with_backing,
        } => {
            let store = open_store(&config)?;
            let format = export_format(&config, format, Some(&dest));

            let mut settings = MixSettings::default();
            settings.set_master_gain(master);
            for (id, gain) in gains {
                settings.set_gain(TakeId::new(id), gain);
            }
            for id in muted {
                settings.set_muted(TakeId::new(id), true);
            }
            if with_backing {
                let backing = config
                    .backing
                    .as_ref()
                    .context("No backing track configured")?;
                let track = load_backing(&backing.file, backing.level, store.format().sample_rate)?;
                settings.backing = Some(std::sync::Arc::new(track));
            }

            let path = exporter(&config).export_mix(&store, &settings, &dest, format)?;
            println!("Exported mix to {}", path.display());
            Ok(())
        }
    }
}

fn exporter(config: &Config) -> Exporter {
    Exporter::new(WavEncoder::new(config.export.depth.unwrap_or_default()))
}

/// Explicit flag, then the destination's extension, then config, then WAV
fn export_format(config: &Config, flag: Option<ExportFormat>, dest: Option<&Path>) -> ExportFormat {
    flag.or_else(|| dest.and_then(ExportFormat::from_path))
        .or(config.export.format)
        .unwrap_or(ExportFormat::Wav)
}

fn load_backing(path: &Path, level: Option<f32>, sample_rate: u32) -> Result<BackingTrack> {
    let track = BackingTrack::load_wav_file(path, sample_rate)
        .with_context(|| format!("Failed to load backing track: {}", path.display()))?;
    if let Some(level) = level {
        track.set_level(level);
    }
    Ok(track)
}

/// Record one take. Enter commits, "a" then Enter aborts.
fn record(
    config: &Config,
    name: Option<String>,
    punch: Option<String>,
    backing: Option<PathBuf>,
    duration: Option<f64>,
) -> Result<()> {
    let device = match config.devices.audio {
        Some(ref device_str) => audio::device::resolve_input_device(device_str)?,
        None => audio::device::get_default_input_device()?,
    };

    let mut options = config.store_options();
    options.format = audio::device::input_format(
        &device,
        options.format.sample_rate,
        options.format.channels,
    )?;
    let sample_rate = options.format.sample_rate;

    let store = TakeStore::open(&config.recording.takes_dir, options).with_context(|| {
        format!(
            "Failed to open takes directory: {}",
            config.recording.takes_dir.display()
        )
    })?;
    let mut engine = AudioEngine::new(device, store);

    // Configure monitor output channels if specified in config
    if let Some(ref channels_str) = config.devices.monitorch {
        let (start, end) = validate_monitor_channels(channels_str)?;
        engine.set_monitor_channels(start, end);
    }
    engine.set_input_gain(config.recording.input_gain);
    engine.set_monitoring(config.recording.monitor_input);

    let backing_file = backing.or_else(|| config.backing.as_ref().map(|b| b.file.clone()));
    if let Some(file) = backing_file {
        let level = config.backing.as_ref().and_then(|b| b.level);
        engine.set_backing_track(load_backing(&file, level, sample_rate)?)?;
        info!("Backing track: {}", file.display());
    }

    let window = match punch {
        Some(ref arg) => parse_punch_arg(arg, sample_rate)?,
        None => config.punch_window()?,
    };
    if let Some(window) = window {
        engine.execute(SessionCommand::SetWindow {
            start_frame: window.start_frame,
            end_frame: window.end_frame,
        })?;
    }

    if let Some(warning) = engine.start_stream()? {
        warn!("{}", warning);
    }

    let name = name.unwrap_or_else(|| format!("Take {}", engine.store().next_id()));
    engine.execute(SessionCommand::BeginTake { name: name.clone() })?;

    println!(
        "Recording '{}' on {} ({}ch @ {}Hz)",
        name,
        engine.device_name(),
        engine.num_channels(),
        engine.sample_rate()
    );
    if let Some(window) = engine.window() {
        println!(
            "Punch window: frames {}..{}",
            window.start_frame, window.end_frame
        );
    }
    println!("Press Enter to commit, 'a' then Enter to abort");

    let result = run_record_loop(&mut engine, spawn_stdin_reader(), duration);
    println!();

    match result? {
        CommandOutcome::Committed(take) => println!(
            "Committed take {} '{}' ({:.2}s)",
            take.id(),
            take.name(),
            take.duration().as_secs_f64()
        ),
        _ => println!("Take discarded"),
    }

    engine.stop_stream()
}

/// Lines typed on stdin, read on a helper thread
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Main recording loop
fn run_record_loop(
    engine: &mut AudioEngine,
    input: Receiver<String>,
    duration: Option<f64>,
) -> Result<CommandOutcome> {
    let deadline = duration.map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    let mut stdout = io::stdout();

    loop {
        if let Some(err) = engine.poll() {
            return Err(err).context("Recording stopped");
        }

        let command = match input.try_recv() {
            Ok(line) if line.trim().eq_ignore_ascii_case("a") => Some(SessionCommand::Abort),
            Ok(_) => Some(SessionCommand::Commit),
            Err(TryRecvError::Empty) => None,
            // stdin closed: only a timed take keeps running
            Err(TryRecvError::Disconnected) if deadline.is_none() => Some(SessionCommand::Commit),
            Err(TryRecvError::Disconnected) => None,
        };
        let command = command.or_else(|| {
            deadline
                .filter(|deadline| Instant::now() >= *deadline)
                .map(|_| SessionCommand::Commit)
        });

        if let Some(command) = command {
            return Ok(engine.execute(command)?);
        }

        let controls = engine.controls();
        print!(
            "\r{} {}  peak {:>4.2}",
            engine.state(),
            engine.clock().format_elapsed(),
            controls.get_peak_level()
        );
        stdout.flush()?;
        controls.decay_peak_level(0.05);

        thread::sleep(Duration::from_millis(50));
    }
}

fn list_takes(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let takes = store.list();

    if takes.is_empty() {
        println!("No takes in {}", config.recording.takes_dir.display());
        return Ok(());
    }

    println!(
        "{:>4}  {:<24} {:>9} {:>10}  {:<19}  {}",
        "ID", "NAME", "LENGTH", "PUNCH-IN", "CREATED", "STORAGE"
    );
    for take in &takes {
        let punch_in = take
            .punch_in_frame()
            .map(|frame| format!("{:.2}s", frame as f64 / take.sample_rate() as f64))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>4}  {:<24} {:>8.2}s {:>10}  {:<19}  {}",
            take.id().get(),
            take.name(),
            take.duration().as_secs_f64(),
            punch_in,
            take.created_at().format("%Y-%m-%d %H:%M:%S"),
            take.storage()
        );
    }

    Ok(())
}

/// List all available audio devices
fn list_all_devices() -> Result<()> {
    println!("punchin - available devices");
    println!("===========================");
    println!();

    println!("Audio Input Devices:");
    match audio::device::list_input_devices() {
        Ok(devices) => {
            if devices.is_empty() {
                println!("  No audio input devices found");
            } else {
                for (i, device) in devices.iter().enumerate() {
                    let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
                    println!(
                        "  [{}] {} - {}ch @ {}Hz{}",
                        i, device.name, device.max_input_channels, device.sample_rate, default_marker
                    );
                }
            }
        }
        Err(e) => {
            println!("  Error: {}", e);
        }
    }

    println!();
    println!("Configuration:");
    println!("  Create a punchin.yaml file to configure devices and recording");
    println!("  Use --config <path> to specify a different config file");
    println!();
    println!("Example punchin.yaml:");
    println!("  devices:");
    println!("    audio: \"Scarlett 2i2\"");
    println!("    monitorch: \"1-2\"");
    println!();
    println!("  recording:");
    println!("    sample_rate: 48000");
    println!("    channels: 2");
    println!("    takes_dir: takes");
    println!();
    println!("  punch:");
    println!("    start: 12.0");
    println!("    end: 20.5");
    println!();
    println!("  backing:");
    println!("    file: backing.wav");
    println!("    level: 0.8");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_take_gain() {
        assert_eq!(parse_take_gain("3=0.5").unwrap(), (3, 0.5));
        assert!(parse_take_gain("3").is_err());
        assert!(parse_take_gain("x=1").is_err());
        assert!(parse_take_gain("3=1.5").is_err());
        assert!(parse_take_gain("3=-0.1").is_err());
    }

    #[test]
    fn test_cli_rejects_out_of_range_master() {
        for master in ["2.0", "-1", "nan"] {
            assert!(
                Args::try_parse_from(["punchin", "mix", "out.wav", "--master", master]).is_err(),
                "master {} accepted",
                master
            );
        }

        let args = Args::try_parse_from(["punchin", "mix", "out.wav", "--master", "0.8"]).unwrap();
        match args.command {
            Command::Mix { master, .. } => assert_eq!(master, 0.8),
            other => panic!("expected mix, got {:?}", other),
        }
    }

    #[test]
    fn test_export_format_precedence() {
        let config = Config::default();
        assert_eq!(export_format(&config, None, None), ExportFormat::Wav);
        assert_eq!(
            export_format(&config, None, Some(Path::new("mix.flac"))),
            ExportFormat::Flac
        );
        assert_eq!(
            export_format(&config, Some(ExportFormat::Mp3), Some(Path::new("mix.flac"))),
            ExportFormat::Mp3
        );
    }

    #[test]
    fn test_cli_parses_mix() {
        let args = Args::try_parse_from([
            "punchin", "-vv", "mix", "out.wav", "--gain", "1=0.5", "--mute", "2",
        ])
        .unwrap();
        assert_eq!(args.log_level(), LevelFilter::Debug);
        match args.command {
            Command::Mix { gains, muted, .. } => {
                assert_eq!(gains, vec![(1, 0.5)]);
                assert_eq!(muted, vec![2]);
            }
            other => panic!("expected mix, got {:?}", other),
        }
    }
}
