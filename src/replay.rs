//! Replay files: the golden record of one captured session
//!
//! A replay holds the command line the engine was started with, the seed, and
//! every message exchanged with both players in wire order. Replays are JSON:
//!
//! ```json
//! {
//!   "cmdlineArgs": ["--players=...", "--port=7043"],
//!   "seed": 1234,
//!   "actions": [
//!     { "player": 0, "clientToServer": true, "packetType": 3, "payload": "AAE=" }
//!   ]
//! }
//! ```
//!
//! Older captures store each message as `"packet": [type, payload...]`; those
//! are still accepted on load and rewritten in the current form on save.

use crate::roster::{decode_roster, PlayerIdentity, PLAYER_COUNT};
use crate::wire::{Frame, Framing};
use crate::{HarnessError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const PLAYERS_FLAG: &str = "--players=";
pub const PORT_FLAG: &str = "--port=";
pub const SEED_FLAG: &str = "--seed=";
pub const PIPE_FLAG: &str = "--pipe=";
pub const REPLAY_MODE_FLAG: &str = "--replay=true";

/// Which side of the connection produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Written by the harness, read by the engine
    ClientToServer,
    /// Written by the engine, read by the harness
    ServerToClient,
}

/// One framed message exchanged with one player
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ActionRecord", into = "ActionRecord")]
pub struct GameAction {
    /// Server-assigned player index (0 or 1)
    pub player: u8,
    pub direction: Direction,
    pub packet_type: u8,
    pub payload: Vec<u8>,
}

impl GameAction {
    pub fn new(player: u8, direction: Direction, packet_type: u8, payload: Vec<u8>) -> Self {
        GameAction {
            player,
            direction,
            packet_type,
            payload,
        }
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::ClientToServer
    }

    /// The exact bytes that go on the wire for this action
    pub fn full_frame(&self, framing: &Framing) -> std::io::Result<Vec<u8>> {
        framing.encode(self.packet_type, &self.payload)
    }

    /// Payload without type tag or framing
    pub fn content_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// True if `frame` carries exactly this action's content
    pub fn matches(&self, frame: &Frame) -> bool {
        self.packet_type == frame.packet_type && self.payload == frame.payload
    }

    /// Replace the golden content with what the engine actually sent
    pub fn update_from(&mut self, frame: &Frame) {
        self.packet_type = frame.packet_type;
        self.payload = frame.payload.clone();
    }
}

/// On-disk shape of an action
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionRecord {
    player: u8,
    client_to_server: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    packet_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    /// Legacy: type byte followed by payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    packet: Option<Vec<u8>>,
}

impl TryFrom<ActionRecord> for GameAction {
    type Error = String;

    fn try_from(record: ActionRecord) -> std::result::Result<Self, Self::Error> {
        if usize::from(record.player) >= PLAYER_COUNT {
            return Err(format!("player {} out of range", record.player));
        }
        let direction = if record.client_to_server {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        };

        let (packet_type, payload) = match (record.packet_type, record.payload, record.packet) {
            (Some(packet_type), payload, None) => {
                let payload = match payload {
                    Some(encoded) => STANDARD
                        .decode(encoded)
                        .map_err(|e| format!("payload is not base64: {e}"))?,
                    None => Vec::new(),
                };
                (packet_type, payload)
            }
            (None, None, Some(packet)) => match packet.split_first() {
                Some((packet_type, payload)) => (*packet_type, payload.to_vec()),
                None => return Err("empty packet".to_string()),
            },
            _ => {
                return Err(
                    "action needs either packetType/payload or a legacy packet array".to_string(),
                )
            }
        };

        Ok(GameAction {
            player: record.player,
            direction,
            packet_type,
            payload,
        })
    }
}

impl From<GameAction> for ActionRecord {
    fn from(action: GameAction) -> Self {
        ActionRecord {
            player: action.player,
            client_to_server: action.is_outbound(),
            packet_type: Some(action.packet_type),
            payload: Some(STANDARD.encode(&action.payload)),
            packet: None,
        }
    }
}

/// A captured game session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replay {
    /// Command line of the original session
    #[serde(rename = "cmdlineArgs")]
    pub launch_arguments: Vec<String>,
    pub seed: i64,
    /// Authoritative wire order
    pub actions: Vec<GameAction>,
}

impl Replay {
    /// Load and validate a replay file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
            .map_err(|e| HarnessError::MalformedReplay(format!("{}: {e}", path.display())))
    }

    /// Parse and validate replay JSON
    pub fn from_json(json: &str) -> std::result::Result<Self, String> {
        let replay: Replay = serde_json::from_str(json).map_err(|e| e.to_string())?;
        replay.validate().map_err(|e| match e {
            HarnessError::MalformedReplay(msg) => msg,
            other => other.to_string(),
        })?;
        Ok(replay)
    }

    /// Write the replay back in the current on-disk format
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| HarnessError::SerializationError(e.to_string()))?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.port()?;
        self.identities()?;
        Ok(())
    }

    /// Value of the first `--flag=value` argument
    pub fn argument(&self, flag: &str) -> Option<&str> {
        self.launch_arguments
            .iter()
            .find_map(|arg| arg.strip_prefix(flag))
    }

    pub fn port(&self) -> Result<u16> {
        let value = self
            .argument(PORT_FLAG)
            .ok_or_else(|| HarnessError::MalformedReplay("missing --port argument".to_string()))?;
        value
            .trim()
            .parse()
            .map_err(|_| HarnessError::MalformedReplay(format!("invalid port '{value}'")))
    }

    pub fn players_descriptor(&self) -> Result<&str> {
        self.argument(PLAYERS_FLAG)
            .ok_or_else(|| HarnessError::MalformedReplay("missing --players argument".to_string()))
    }

    pub fn identities(&self) -> Result<Vec<PlayerIdentity>> {
        decode_roster(self.players_descriptor()?)
    }

    /// Engine arguments for a fresh run
    ///
    /// Replay-mode, seed and pipe arguments from the capture are dropped; the
    /// replay's seed and the given ready-pipe handle are appended.
    pub fn engine_arguments(&self, pipe_handle: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .launch_arguments
            .iter()
            .filter(|arg| {
                arg.as_str() != REPLAY_MODE_FLAG
                    && !arg.starts_with(SEED_FLAG)
                    && !arg.starts_with(PIPE_FLAG)
            })
            .cloned()
            .collect();
        args.push(format!("{SEED_FLAG}{}", self.seed));
        args.push(format!("{PIPE_FLAG}{pipe_handle}"));
        args
    }
}
