use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use levelflow::cli::{Cli, Commands, ConfigAction, StatsFormat};
use levelflow::components::{
    CsvSink, Energy, Framer, Functionals, LiveFeed, LiveSource, TurnDetector, WaveSource,
};
use levelflow::config::Config;
use levelflow::level::Sample;
use levelflow::{Pipeline, RunSummary, defaults};
use owo_colors::OwoColorize;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Options of `levelflow run` that override the configuration file.
struct RunOptions {
    input: String,
    sample_rate: Option<u32>,
    frame_size: Option<Duration>,
    frame_step: Option<Duration>,
    output: Option<PathBuf>,
    functionals: Option<PathBuf>,
    summary: Option<PathBuf>,
    stats: Option<StatsFormat>,
    max_ticks: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    match cli.command {
        Commands::Run {
            input,
            sample_rate,
            frame_size,
            frame_step,
            output,
            functionals,
            summary,
            stats,
            max_ticks,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let options = RunOptions {
                input,
                sample_rate,
                frame_size,
                frame_step,
                output,
                functionals,
                summary,
                stats,
                max_ticks,
            };
            run_command(config, options)?;
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "levelflow", &mut io::stdout());
        }
    }

    Ok(())
}

fn init_logging(quiet: bool, verbose: u8) {
    let fallback = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        // Load from custom path
        Config::load(path)?
    } else {
        // Try default path, fall back to defaults
        Config::load_or_default(&Config::default_path())?
    };

    // Apply environment variable overrides
    Ok(config.with_env_overrides())
}

fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => {
            let path = custom_path
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_path);
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn run_command(mut config: Config, options: RunOptions) -> Result<()> {
    if let Some(rate) = options.sample_rate {
        config.demo.sample_rate = rate;
    }
    if let Some(size) = options.frame_size {
        config.demo.frame_size = humantime::format_duration(size).to_string();
    }
    if let Some(step) = options.frame_step {
        config.demo.frame_step = humantime::format_duration(step).to_string();
    }
    if let Some(max_ticks) = options.max_ticks {
        config.scheduler.max_ticks = max_ticks;
    }
    config.validate()?;

    let mut pipeline = Pipeline::new(config.pipeline_config());
    let feeder = if options.input == "-" {
        let (source, feed) = LiveSource::new(
            "live",
            config.demo.sample_rate,
            defaults::LIVE_QUEUE_CHUNKS,
        );
        pipeline.add(source)?;
        Some(spawn_stdin_feeder(feed)?)
    } else {
        let source = WaveSource::open("wave", &options.input)
            .with_context(|| format!("cannot open {}", options.input))?;
        info!(
            input = %options.input,
            sample_rate = source.sample_rate(),
            seconds = source.duration_sec(),
            "reading WAV"
        );
        pipeline.add(source)?;
        None
    };

    pipeline.add(
        Framer::new("framer", "pcm", "frames")
            .with_frame_size(config.demo.frame_size()?)
            .with_frame_step(config.demo.frame_step()?),
    )?;
    pipeline.add(Energy::new("energy", "frames", "energy"))?;
    pipeline.add(
        TurnDetector::new("turn", "energy")
            .with_threshold(config.demo.turn_threshold)
            .with_min_frames(config.demo.turn_min_frames)
            .with_gap_frames(config.demo.turn_gap_frames)
            .with_recipient("energy_csv"),
    )?;
    let energy_csv = match &options.output {
        Some(path) => CsvSink::to_path("energy_csv", "energy", path)
            .with_context(|| format!("cannot create {}", path.display()))?,
        None => CsvSink::to_writer("energy_csv", "energy", Box::new(io::stdout())),
    };
    pipeline.add(energy_csv.with_turn_column())?;
    if let Some(path) = &options.functionals {
        pipeline.add(Functionals::new("functionals", "energy", "functionals"))?;
        pipeline.add(
            CsvSink::to_path("functionals_csv", "functionals", path)
                .with_context(|| format!("cannot create {}", path.display()))?,
        )?;
    }

    let summary = pipeline.run()?;
    if let Some(handle) = feeder
        && handle.join().is_err()
    {
        warn!("stdin feeder thread panicked");
    }

    if let Some(path) = &options.summary {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("cannot write summary to {}", path.display()))?;
    }
    match options.stats {
        Some(StatsFormat::Json) => eprintln!("{}", serde_json::to_string_pretty(&summary)?),
        Some(StatsFormat::Text) => print_stats(&summary),
        None => {}
    }
    Ok(())
}

/// Reads raw s16le mono PCM from stdin into the live feed until EOF.
fn spawn_stdin_feeder(feed: LiveFeed) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("stdin-feeder".to_string())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            let mut buf = vec![0u8; 8192];
            let mut carry: Option<u8> = None;
            loop {
                let n = match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("stdin read failed: {e}");
                        break;
                    }
                };
                let mut bytes: Vec<u8> = carry.take().into_iter().collect();
                bytes.extend_from_slice(&buf[..n]);
                if bytes.len() % 2 == 1 {
                    carry = bytes.pop();
                }
                let chunk: Vec<Sample> = bytes
                    .chunks_exact(2)
                    .map(|p| f32::from(i16::from_le_bytes([p[0], p[1]])) / 32768.0)
                    .collect();
                if !chunk.is_empty() && !feed.push_blocking(chunk) {
                    debug!("pipeline stopped reading stdin");
                    break;
                }
            }
            if feed.dropped_samples() > 0 {
                info!(dropped = feed.dropped_samples(), "samples dropped while paused");
            }
        })?;
    Ok(handle)
}

fn print_stats(summary: &RunSummary) {
    eprintln!(
        "{} {:?} after {} rounds ({} ticks, {} EOI passes)",
        "pipeline".bold(),
        summary.outcome,
        summary.rounds,
        summary.ticks,
        summary.eoi_passes
    );
    for level in &summary.levels {
        eprintln!(
            "  {:<14} frames {:>8}  width {:>4}  capacity {:>8}{}  readers {:?}",
            level.name.green(),
            level.cur_w,
            level.n_elements,
            level.capacity,
            if level.growable { " (growable)" } else { "" },
            level.readers
        );
        if level.evicted > 0 || level.left_reads > 0 {
            eprintln!(
                "  {:<14} {} frames evicted, {} late reads",
                "",
                level.evicted.yellow(),
                level.left_reads.yellow()
            );
        }
    }
}
