//! Harness configuration shared by the CLI, bootstrap and verification

use crate::logger::VerbosityLevel;
use crate::wire::Framing;
use crate::{HarnessError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default wait for one inbound message
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for the one-byte handshake answer
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Launcher the engine is wrapped in when profiling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProfilerCommand {
    /// Parse a whitespace separated launcher such as `perf record -g --`
    pub fn parse(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            HarnessError::InvalidConfig("profiler command must not be empty".to_string())
        })?;
        Ok(ProfilerCommand {
            program,
            args: parts.collect(),
        })
    }
}

impl Default for ProfilerCommand {
    fn default() -> Self {
        ProfilerCommand {
            program: "perf".to_string(),
            args: vec!["record".to_string(), "-g".to_string(), "--".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Engine binary under test
    pub engine_path: PathBuf,
    pub receive_timeout: Duration,
    pub handshake_timeout: Duration,
    pub framing: Framing,
    /// Wrap the engine in this launcher when set
    pub profiler: Option<ProfilerCommand>,
    pub stop_on_error: bool,
    /// Offer to overwrite golden payloads on mismatch
    pub ask_for_updates: bool,
    pub verbosity: VerbosityLevel,
}

impl HarnessConfig {
    pub fn new(engine_path: impl Into<PathBuf>) -> Self {
        HarnessConfig {
            engine_path: engine_path.into(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            framing: Framing::default(),
            profiler: None,
            stop_on_error: false,
            ask_for_updates: false,
            verbosity: VerbosityLevel::default(),
        }
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    /// Replace the engine path with its canonical absolute form
    pub fn resolve_engine_path(mut self) -> Result<Self> {
        self.engine_path = std::fs::canonicalize(&self.engine_path).map_err(|e| {
            HarnessError::InvalidConfig(format!(
                "engine {} not found: {e}",
                self.engine_path.display()
            ))
        })?;
        Ok(self)
    }

    /// Check values that would otherwise only fail deep inside a run
    pub fn validate(&self) -> Result<()> {
        if self.receive_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(HarnessError::InvalidConfig(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if let Framing::Terminated(marker) = &self.framing {
            if marker.is_empty() {
                return Err(HarnessError::InvalidConfig(
                    "end marker must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
