//! Command-line interface for levelflow
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Streaming signal pipelines over shared ring-buffer levels
#[derive(Parser, Debug)]
#[command(
    name = "levelflow",
    version,
    about = "Streaming signal pipelines over shared ring-buffer levels"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parse a frame duration.
///
/// Accepts `humantime` durations (`25ms`, `500us`, `1s`); a bare number is
/// taken as milliseconds.
fn parse_frame_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let duration = match s.parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => humantime::parse_duration(s).map_err(|e| e.to_string())?,
    };
    if duration.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(duration)
}

/// How `--stats` prints level statistics
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatsFormat {
    Text,
    Json,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the energy / turn-detection pipeline over a WAV file or stdin
    Run {
        /// WAV file, or `-` for raw signed 16-bit little-endian mono PCM on stdin
        input: String,

        /// Sample rate of PCM read from stdin (default from config)
        #[arg(long, value_name = "HZ")]
        sample_rate: Option<u32>,

        /// Analysis frame length, e.g. 25ms
        #[arg(long, value_name = "DURATION", value_parser = parse_frame_duration)]
        frame_size: Option<Duration>,

        /// Hop between analysis frames, e.g. 10ms
        #[arg(long, value_name = "DURATION", value_parser = parse_frame_duration)]
        frame_step: Option<Duration>,

        /// Per-frame energy CSV (default: stdout)
        #[arg(long, short = 'o', value_name = "PATH")]
        output: Option<PathBuf>,

        /// CSV with statistics over the whole input
        #[arg(long, value_name = "PATH")]
        functionals: Option<PathBuf>,

        /// Write the run summary as JSON
        #[arg(long, value_name = "PATH")]
        summary: Option<PathBuf>,

        /// Print level statistics to stderr when the run ends
        #[arg(long, value_name = "FORMAT")]
        stats: Option<StatsFormat>,

        /// Stop after this many scheduler rounds
        #[arg(long, value_name = "N")]
        max_ticks: Option<u64>,
    },

    /// View configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_defaults() {
        let cli = Cli::try_parse_from(["levelflow", "run", "speech.wav"]).unwrap();
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
                assert_eq!(input, "speech.wav");
                assert!(sample_rate.is_none());
                assert!(frame_size.is_none());
                assert!(frame_step.is_none());
                assert!(output.is_none());
                assert!(functionals.is_none());
                assert!(summary.is_none());
                assert!(stats.is_none());
                assert!(max_ticks.is_none());
            }
            other => panic!("Expected Run command, got {other:?}"),
        }
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_run_with_options() {
        let cli = Cli::try_parse_from([
            "levelflow",
            "run",
            "-",
            "--sample-rate",
            "8000",
            "--frame-size",
            "32ms",
            "--frame-step",
            "16",
            "-o",
            "/tmp/energy.csv",
            "--stats",
            "json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                input,
                sample_rate,
                frame_size,
                frame_step,
                output,
                stats,
                ..
            } => {
                assert_eq!(input, "-");
                assert_eq!(sample_rate, Some(8000));
                assert_eq!(frame_size, Some(Duration::from_millis(32)));
                assert_eq!(frame_step, Some(Duration::from_millis(16)));
                assert_eq!(output, Some(PathBuf::from("/tmp/energy.csv")));
                assert_eq!(stats, Some(StatsFormat::Json));
            }
            other => panic!("Expected Run command, got {other:?}"),
        }
    }

    #[test]
    fn test_run_requires_input() {
        let err = Cli::try_parse_from(["levelflow", "run"]).unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn test_zero_frame_step_rejected() {
        let result = Cli::try_parse_from(["levelflow", "run", "a.wav", "--frame-step", "0ms"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_frame_duration() {
        assert_eq!(parse_frame_duration("25"), Ok(Duration::from_millis(25)));
        assert_eq!(parse_frame_duration("25ms"), Ok(Duration::from_millis(25)));
        assert_eq!(parse_frame_duration(" 1s "), Ok(Duration::from_secs(1)));
        assert_eq!(parse_frame_duration("500us"), Ok(Duration::from_micros(500)));
        assert!(parse_frame_duration("soon").is_err());
        assert!(parse_frame_duration("0").is_err());
    }

    #[test]
    fn test_parse_verbose_count() {
        let cli = Cli::try_parse_from(["levelflow", "-vv", "config", "path"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_global_options_after_command() {
        let cli = Cli::try_parse_from([
            "levelflow",
            "config",
            "show",
            "--config",
            "/tmp/levelflow.toml",
            "-q",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/levelflow.toml")));
        assert!(cli.quiet);
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Show
            }
        ));
    }

    #[test]
    fn test_parse_completions() {
        let cli = Cli::try_parse_from(["levelflow", "completions", "bash"]).unwrap();
        match cli.command {
            Commands::Completions { shell } => assert_eq!(shell, Shell::Bash),
            other => panic!("Expected Completions command, got {other:?}"),
        }
    }

    #[test]
    fn test_config_requires_subcommand() {
        assert!(Cli::try_parse_from(["levelflow", "config"]).is_err());
    }

    #[test]
    fn test_invalid_command_returns_error() {
        let err = Cli::try_parse_from(["levelflow", "invalid"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn test_invalid_stats_format() {
        let result = Cli::try_parse_from(["levelflow", "run", "a.wav", "--stats", "xml"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_version_flag() {
        let err = Cli::try_parse_from(["levelflow", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
