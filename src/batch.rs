//! Batch mode: run one replay file or every replay in a directory
//!
//! Replays run strictly one after another; each run owns the engine process
//! and its port until it finishes. A failing replay never aborts the batch
//! unless stop-on-error is set.

use crate::config::HarnessConfig;
use crate::logger::HarnessLogger;
use crate::verify::{run_replay, MismatchPolicy, Verdict};
use crate::Result;
use std::path::{Path, PathBuf};

/// Runs a single replay file to a pass/fail outcome
pub trait ReplayRunner {
    fn run_replay(&mut self, path: &Path) -> Result<Verdict>;
}

/// Runs replays against the real engine binary
pub struct EngineRunner<'a> {
    config: &'a HarnessConfig,
    policy: Box<dyn MismatchPolicy + 'a>,
    logger: &'a HarnessLogger,
}

impl<'a> EngineRunner<'a> {
    pub fn new(
        config: &'a HarnessConfig,
        policy: Box<dyn MismatchPolicy + 'a>,
        logger: &'a HarnessLogger,
    ) -> Self {
        EngineRunner {
            config,
            policy,
            logger,
        }
    }
}

impl ReplayRunner for EngineRunner<'_> {
    fn run_replay(&mut self, path: &Path) -> Result<Verdict> {
        run_replay(path, self.config, self.policy.as_mut(), self.logger)
    }
}

/// Outcome of a batch run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    /// Replays that were started
    pub attempted: usize,
    pub successful: usize,
    /// Failing replay files in the order they ran
    pub failed: Vec<PathBuf>,
    /// True if stop-on-error ended the batch early
    pub halted: bool,
}

impl RunResult {
    pub fn all_passed(&self) -> bool {
        self.successful == self.attempted && !self.halted
    }
}

/// Run `path` as a single replay, or every file in it if it is a directory
pub fn run_path(
    runner: &mut dyn ReplayRunner,
    path: &Path,
    stop_on_error: bool,
    logger: &HarnessLogger,
) -> Result<RunResult> {
    if path.is_dir() {
        run_directory(runner, path, stop_on_error, logger)
    } else {
        Ok(run_single(runner, path, logger))
    }
}

pub fn run_single(runner: &mut dyn ReplayRunner, path: &Path, logger: &HarnessLogger) -> RunResult {
    let mut result = RunResult {
        attempted: 1,
        ..Default::default()
    };
    if run_one(runner, path, logger) {
        result.successful = 1;
    } else {
        result.failed.push(path.to_path_buf());
    }
    result
}

/// Run every regular file directly inside `dir`
///
/// Files run in directory iteration order, which is not sorted.
pub fn run_directory(
    runner: &mut dyn ReplayRunner,
    dir: &Path,
    stop_on_error: bool,
    logger: &HarnessLogger,
) -> Result<RunResult> {
    let mut result = RunResult::default();

    for file in replay_files(dir)? {
        result.attempted += 1;
        if run_one(runner, &file, logger) {
            result.successful += 1;
        } else if stop_on_error {
            logger.minimal(&format!("Successful runs: {}", result.successful));
            result.failed.push(file);
            result.halted = true;
            return Ok(result);
        } else {
            result.failed.push(file);
        }
    }

    logger.minimal("======STATISTICS=======");
    for file in &result.failed {
        logger.minimal(&file.display().to_string());
    }
    logger.minimal(&format!("Passed: {}/{}", result.successful, result.attempted));
    Ok(result)
}

fn replay_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in jwalk::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .skip_hidden(false)
        .sort(false)
        .parallelism(jwalk::Parallelism::Serial)
    {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        if entry.file_type().is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

fn run_one(runner: &mut dyn ReplayRunner, path: &Path, logger: &HarnessLogger) -> bool {
    logger.normal(&format!("Testing {}", path.display()));
    match runner.run_replay(path) {
        Ok(verdict) => {
            if verdict.payloads_updated > 0 {
                logger.normal(&format!(
                    "Updated {} expected packet(s)",
                    verdict.payloads_updated
                ));
            }
            logger.normal("===Passed===");
            true
        }
        Err(e) => {
            logger.error(&format!("Failed: {e}"));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HarnessError;

    /// Fails the n-th replay it is asked to run (1-based)
    struct FailNth {
        fail_at: usize,
        calls: Vec<PathBuf>,
    }

    impl FailNth {
        fn new(fail_at: usize) -> Self {
            FailNth {
                fail_at,
                calls: Vec::new(),
            }
        }
    }

    impl ReplayRunner for FailNth {
        fn run_replay(&mut self, path: &Path) -> Result<Verdict> {
            self.calls.push(path.to_path_buf());
            if self.calls.len() == self.fail_at {
                Err(HarnessError::ReceiveTimeout {
                    index: 3,
                    player: 0,
                })
            } else {
                Ok(Verdict::default())
            }
        }
    }

    fn three_replays() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.json", "b.json", "c.json"] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        dir
    }

    #[test]
    fn test_batch_continues_after_failure() {
        let dir = three_replays();
        let logger = HarnessLogger::capturing();
        let mut runner = FailNth::new(2);

        let result = run_path(&mut runner, dir.path(), false, &logger).unwrap();
        assert_eq!(runner.calls.len(), 3);
        assert_eq!(result.attempted, 3);
        assert_eq!(result.successful, 2);
        assert_eq!(result.failed, vec![runner.calls[1].clone()]);
        assert!(!result.all_passed());
        assert!(logger.contains("Passed: 2/3"));
        assert!(logger.contains(&runner.calls[1].display().to_string()));
    }

    #[test]
    fn test_batch_stops_on_error() {
        let dir = three_replays();
        let logger = HarnessLogger::capturing();
        let mut runner = FailNth::new(2);

        let result = run_path(&mut runner, dir.path(), true, &logger).unwrap();
        assert_eq!(runner.calls.len(), 2);
        assert_eq!(result.successful, 1);
        assert!(result.halted);
        assert!(logger.contains("Successful runs: 1"));
        assert!(!logger.contains("Passed:"));
    }

    #[test]
    fn test_batch_all_pass() {
        let dir = three_replays();
        let logger = HarnessLogger::capturing();
        let mut runner = FailNth::new(usize::MAX);

        let result = run_path(&mut runner, dir.path(), true, &logger).unwrap();
        assert!(result.all_passed());
        assert!(result.failed.is_empty());
        assert!(logger.contains("Passed: 3/3"));
    }

    #[test]
    fn test_single_file() {
        let dir = three_replays();
        let logger = HarnessLogger::capturing();
        let mut runner = FailNth::new(1);
        let path = dir.path().join("a.json");

        let result = run_path(&mut runner, &path, false, &logger).unwrap();
        assert_eq!(result.attempted, 1);
        assert_eq!(result.failed, vec![path]);
        assert!(logger.contains("Failed:"));
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logger = HarnessLogger::capturing();
        let mut runner = FailNth::new(1);

        let result = run_path(&mut runner, dir.path(), false, &logger).unwrap();
        assert_eq!(result, RunResult::default());
        assert!(logger.contains("Passed: 0/0"));
    }
}
