//! Verification engine: walks a replay's actions against a live engine
//!
//! Outbound actions are written to the engine exactly as recorded; inbound
//! actions are read and compared byte for byte. What happens on a mismatch is
//! decided by a `MismatchPolicy`: `StrictPolicy` fails the replay,
//! `PromptPolicy` lets an operator accept the engine's output as the new
//! golden payload.

use crate::config::HarnessConfig;
use crate::logger::HarnessLogger;
use crate::replay::{GameAction, Replay};
use crate::session::{Received, Session};
use crate::wire::Frame;
use crate::{HarnessError, Result};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;

/// Access to both player connections of a running session
pub trait Transport {
    /// True if the engine sent `player` data that has not been read
    fn has_unread_data(&mut self, player: u8) -> io::Result<bool>;

    /// Write one complete encoded frame
    fn send(&mut self, player: u8, frame: &[u8]) -> io::Result<()>;

    fn receive(&mut self, player: u8, timeout: Duration) -> io::Result<Received>;
}

impl Transport for Session {
    fn has_unread_data(&mut self, player: u8) -> io::Result<bool> {
        self.connection(player).has_unread_data()
    }

    fn send(&mut self, player: u8, frame: &[u8]) -> io::Result<()> {
        self.connection(player).send(frame)
    }

    fn receive(&mut self, player: u8, timeout: Duration) -> io::Result<Received> {
        self.connection(player).receive(timeout)
    }
}

/// One differing byte at the same offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteDifference {
    pub offset: usize,
    pub expected: u8,
    pub actual: u8,
}

/// How an observed frame differs from the golden action
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketDiff {
    /// (expected, actual) type tags, if they differ
    pub packet_type: Option<(u8, u8)>,
    /// (expected, actual) payload lengths, if they differ
    pub length: Option<(usize, usize)>,
    /// Per-byte differences; only computed when the lengths agree
    pub bytes: Vec<ByteDifference>,
}

impl PacketDiff {
    /// Compare a golden action with what the engine sent
    ///
    /// Returns `None` when both are identical.
    pub fn compute(expected: &GameAction, observed: &Frame) -> Option<Self> {
        if expected.matches(observed) {
            return None;
        }
        let mut diff = PacketDiff::default();
        if expected.packet_type != observed.packet_type {
            diff.packet_type = Some((expected.packet_type, observed.packet_type));
        }
        let golden = expected.content_bytes();
        if golden.len() != observed.payload.len() {
            diff.length = Some((golden.len(), observed.payload.len()));
        } else {
            diff.bytes = golden
                .iter()
                .zip(&observed.payload)
                .enumerate()
                .filter(|(_, (e, a))| e != a)
                .map(|(offset, (e, a))| ByteDifference {
                    offset,
                    expected: *e,
                    actual: *a,
                })
                .collect();
        }
        Some(diff)
    }

    /// Short description for error messages
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some((expected, actual)) = self.packet_type {
            parts.push(format!("type {expected} vs {actual}"));
        }
        if let Some((expected, actual)) = self.length {
            parts.push(format!("lengths {expected} vs {actual}"));
        }
        if let Some(first) = self.bytes.first() {
            parts.push(format!(
                "{} differing byte(s), first at offset {}",
                self.bytes.len(),
                first.offset
            ));
        }
        parts.join(", ")
    }

    /// Detailed diagnostic lines, prefixed with the action index
    pub fn report_lines(&self, index: usize) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some((expected, actual)) = self.packet_type {
            lines.push(format!("[{index}]: Packet types differ: {expected} vs {actual}"));
        }
        if let Some((expected, actual)) = self.length {
            lines.push(format!(
                "[{index}]: Packets have different lengths: {expected} vs {actual}"
            ));
        }
        if !self.bytes.is_empty() {
            lines.push(format!("[{index}]: Packet difference:"));
            for byte in &self.bytes {
                lines.push(format!(
                    "  [{}]: {} vs. {} ({} vs. {})",
                    byte.offset,
                    byte.expected,
                    byte.actual,
                    printable(byte.expected),
                    printable(byte.actual)
                ));
            }
        }
        lines
    }
}

fn printable(byte: u8) -> char {
    if byte.is_ascii_graphic() || byte == b' ' {
        byte as char
    } else {
        '.'
    }
}

/// A mismatching inbound action as presented to a policy
#[derive(Debug)]
pub struct Mismatch<'a> {
    pub index: usize,
    pub player: u8,
    pub expected: &'a GameAction,
    pub observed: &'a Frame,
    pub diff: &'a PacketDiff,
    pub replay_path: &'a Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Store the observed frame as the new golden content and continue
    Accept,
    /// Fail the replay
    Reject,
}

/// Decides what to do when the engine's output differs from the replay
///
/// An error means no decision could be made; the mismatch then fails the replay.
pub trait MismatchPolicy {
    fn resolve(&mut self, mismatch: &Mismatch<'_>) -> io::Result<Resolution>;
}

/// Every mismatch fails the replay
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictPolicy;

impl MismatchPolicy for StrictPolicy {
    fn resolve(&mut self, _mismatch: &Mismatch<'_>) -> io::Result<Resolution> {
        Ok(Resolution::Reject)
    }
}

/// Asks an operator whether to overwrite the golden payload
pub struct PromptPolicy<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptPolicy<R, W> {
    pub fn new(input: R, output: W) -> Self {
        PromptPolicy { input, output }
    }

    fn ask(&mut self, mismatch: &Mismatch<'_>) -> io::Result<bool> {
        write!(
            self.output,
            "[{}]: Overwrite the expected packet in {} with the engine's output? [y/N] ",
            mismatch.index,
            mismatch.replay_path.display()
        )?;
        self.output.flush()?;
        let mut answer = String::new();
        self.input.read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

impl PromptPolicy<io::StdinLock<'static>, io::Stdout> {
    /// Prompt on the terminal
    pub fn stdio() -> Self {
        PromptPolicy::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> MismatchPolicy for PromptPolicy<R, W> {
    fn resolve(&mut self, mismatch: &Mismatch<'_>) -> io::Result<Resolution> {
        if self.ask(mismatch)? {
            Ok(Resolution::Accept)
        } else {
            Ok(Resolution::Reject)
        }
    }
}

/// Result of a replay that passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verdict {
    pub actions_replayed: usize,
    /// Golden payloads overwritten after operator confirmation
    pub payloads_updated: usize,
}

/// Walks a replay's actions in order against a transport
pub struct Verifier<'a> {
    config: &'a HarnessConfig,
    logger: &'a HarnessLogger,
    policy: &'a mut dyn MismatchPolicy,
}

impl<'a> Verifier<'a> {
    pub fn new(
        config: &'a HarnessConfig,
        logger: &'a HarnessLogger,
        policy: &'a mut dyn MismatchPolicy,
    ) -> Self {
        Verifier {
            config,
            logger,
            policy,
        }
    }

    /// Replay every action; stops at the first failure
    ///
    /// `replay_path` is where an accepted update is persisted.
    pub fn verify<T: Transport>(
        &mut self,
        transport: &mut T,
        replay: &mut Replay,
        replay_path: &Path,
    ) -> Result<Verdict> {
        let mut verdict = Verdict::default();
        for index in 0..replay.actions.len() {
            let action = &replay.actions[index];
            let player = action.player;

            if action.is_outbound() {
                if transport.has_unread_data(player)? {
                    self.logger.error(&format!(
                        "[{index}]: Engine sent data to player {player} while input was expected"
                    ));
                    return Err(HarnessError::UnsolicitedSend { index, player });
                }
                let frame = action.full_frame(&self.config.framing)?;
                self.logger.verbose(&format!(
                    "[{index}]: -> player {player}: type {}, {} bytes",
                    action.packet_type,
                    action.content_bytes().len()
                ));
                transport.send(player, &frame)?;
            } else {
                let observed = match transport.receive(player, self.config.receive_timeout)? {
                    Received::Frame(frame) => frame,
                    Received::TimedOut => {
                        self.logger.error(&format!(
                            "[{index}]: Could not receive a packet in time"
                        ));
                        return Err(HarnessError::ReceiveTimeout { index, player });
                    }
                    Received::Closed => {
                        self.logger.error(&format!(
                            "[{index}]: Connection of player {player} closed while waiting for a packet"
                        ));
                        return Err(HarnessError::ReceiveTimeout { index, player });
                    }
                };
                self.logger.verbose(&format!(
                    "[{index}]: <- player {player}: type {}, {} bytes",
                    observed.packet_type,
                    observed.payload.len()
                ));

                if let Some(diff) = PacketDiff::compute(action, &observed) {
                    for line in diff.report_lines(index) {
                        self.logger.error(&line);
                    }
                    let resolution = self
                        .policy
                        .resolve(&Mismatch {
                            index,
                            player,
                            expected: action,
                            observed: &observed,
                            diff: &diff,
                            replay_path,
                        })
                        .unwrap_or_else(|e| {
                            self.logger.error(&format!(
                                "[{index}]: Could not read an answer to the update prompt: {e}"
                            ));
                            Resolution::Reject
                        });
                    match resolution {
                        Resolution::Accept => {
                            replay.actions[index].update_from(&observed);
                            replay.save(replay_path)?;
                            verdict.payloads_updated += 1;
                            self.logger.normal(&format!(
                                "[{index}]: Updated expected packet in {}",
                                replay_path.display()
                            ));
                        }
                        Resolution::Reject => {
                            return Err(HarnessError::PacketMismatch {
                                index,
                                player,
                                detail: diff.summary(),
                            });
                        }
                    }
                }
            }
            verdict.actions_replayed += 1;
        }
        Ok(verdict)
    }
}

/// Load a replay, start the engine, verify every action and shut down
///
/// The engine is terminated on every path; on failure the session is dropped
/// before the error is returned.
pub fn run_replay(
    replay_path: &Path,
    config: &HarnessConfig,
    policy: &mut dyn MismatchPolicy,
    logger: &HarnessLogger,
) -> Result<Verdict> {
    let mut replay = Replay::load(replay_path)?;
    let mut session = Session::start(&replay, config, logger)?;
    let verdict =
        Verifier::new(config, logger, policy).verify(&mut session, &mut replay, replay_path)?;
    let status = session.finish()?;
    logger.verbose(&format!("Engine finished ({status})"));
    Ok(verdict)
}
