//! Replay Harness - Main Binary
//!
//! Replays captured sessions against an engine build and reports which ones
//! still produce the recorded wire conversation.

use clap::{Parser, ValueEnum};
use replay_harness::{
    batch::{run_path, EngineRunner},
    config::{HarnessConfig, ProfilerCommand},
    logger::{HarnessLogger, VerbosityLevel},
    verify::{MismatchPolicy, PromptPolicy, StrictPolicy},
    wire::{parse_end_marker, Framing},
    HarnessError, Result,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Verbosity level for harness output (custom parser supporting both names and numbers)
#[derive(Debug, Clone, Copy)]
struct VerbosityArg(VerbosityLevel);

impl std::str::FromStr for VerbosityArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "silent" | "0" => Ok(VerbosityArg(VerbosityLevel::Silent)),
            "minimal" | "1" => Ok(VerbosityArg(VerbosityLevel::Minimal)),
            "normal" | "2" => Ok(VerbosityArg(VerbosityLevel::Normal)),
            "verbose" | "3" => Ok(VerbosityArg(VerbosityLevel::Verbose)),
            _ => Err(format!(
                "invalid verbosity level '{s}' (expected: silent/0, minimal/1, normal/2, verbose/3)"
            )),
        }
    }
}

/// Message framing used by the engine build
#[derive(Debug, Clone, Copy, ValueEnum)]
enum FramingArg {
    /// Type byte, payload, end marker
    Terminated,
    /// Big-endian u32 length, type byte, payload
    LengthPrefixed,
}

#[derive(Parser)]
#[command(name = "replay-harness")]
#[command(about = "Replay captured game sessions against an engine build", long_about = None)]
struct Cli {
    /// Engine binary to test
    #[arg(value_name = "ENGINE")]
    engine: PathBuf,

    /// Replay file, or a directory of replay files
    #[arg(value_name = "REPLAY_PATH")]
    replays: PathBuf,

    /// Stop the batch at the first failing replay
    #[arg(long = "stop_on_error", alias = "stop-on-error")]
    stop_on_error: bool,

    /// Run the engine under the profiler launcher
    #[arg(long)]
    profile: bool,

    /// Profiler launcher used with --profile
    #[arg(long, default_value = "perf record -g --")]
    profiler: String,

    /// Ask before overwriting expected packets that no longer match
    #[arg(long = "ask_for_updates", alias = "ask-for-updates")]
    ask_for_updates: bool,

    /// How long to wait for each engine message, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// How long to wait for each handshake answer, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    handshake_timeout_ms: u64,

    /// Message framing of the engine build
    #[arg(long, value_enum, default_value = "terminated")]
    framing: FramingArg,

    /// End marker for terminated framing, as hex (e.g. fffefd)
    #[arg(long, value_name = "HEX")]
    end_marker: Option<String>,

    /// Verbosity level (0=silent, 1=minimal, 2=normal, 3=verbose)
    #[arg(long, default_value = "normal", short = 'v')]
    verbosity: VerbosityArg,
}

impl Cli {
    fn into_config(self) -> Result<(HarnessConfig, PathBuf)> {
        let framing = match self.framing {
            FramingArg::Terminated => match &self.end_marker {
                Some(hex) => Framing::Terminated(
                    parse_end_marker(hex).map_err(HarnessError::InvalidConfig)?,
                ),
                None => Framing::default(),
            },
            FramingArg::LengthPrefixed => Framing::LengthPrefixed,
        };

        let mut config = HarnessConfig::new(self.engine).resolve_engine_path()?;
        config.receive_timeout = Duration::from_millis(self.timeout_ms);
        config.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        config.framing = framing;
        config.stop_on_error = self.stop_on_error;
        config.ask_for_updates = self.ask_for_updates;
        config.verbosity = self.verbosity.0;
        if self.profile {
            config.profiler = Some(ProfilerCommand::parse(&self.profiler)?);
        }
        config.validate()?;
        Ok((config, self.replays))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let (config, replays) = cli.into_config()?;
    let logger = HarnessLogger::with_verbosity(config.verbosity);

    let policy: Box<dyn MismatchPolicy> = if config.ask_for_updates {
        Box::new(PromptPolicy::stdio())
    } else {
        Box::new(StrictPolicy)
    };

    let mut runner = EngineRunner::new(&config, policy, &logger);
    let result = run_path(&mut runner, &replays, config.stop_on_error, &logger)?;
    Ok(result.all_passed())
}
