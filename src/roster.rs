//! Player roster decoding
//!
//! The engine is launched with `--players=<base64>`. Older engine builds encode
//! the roster as a `µ`-delimited string of `name µ decklist µ id` triples, newer
//! ones as a JSON array of player objects. Both decode to the same
//! `PlayerIdentity` list.

use crate::{HarnessError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

/// Number of players a replay session always has
pub const PLAYER_COUNT: usize = 2;

const LEGACY_SEPARATOR: char = 'µ';
const LEGACY_FIELDS_PER_PLAYER: usize = 3;

/// One player as announced to the engine on its command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub name: String,
    /// Opaque identity sent during the handshake
    pub id: String,
}

#[derive(Deserialize)]
struct StructuredPlayer {
    #[serde(default)]
    name: String,
    id: String,
}

/// Decode a base64 roster descriptor into exactly two player identities
pub fn decode_roster(descriptor: &str) -> Result<Vec<PlayerIdentity>> {
    let bytes = STANDARD
        .decode(descriptor.trim())
        .map_err(|e| HarnessError::MalformedReplay(format!("players descriptor is not base64: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| HarnessError::MalformedReplay("players descriptor is not UTF-8".to_string()))?;

    let players = if text.trim_start().starts_with('[') {
        decode_structured(&text)?
    } else {
        decode_legacy(&text)?
    };

    if players.len() != PLAYER_COUNT {
        return Err(HarnessError::MalformedReplay(format!(
            "expected {PLAYER_COUNT} players in roster, found {}",
            players.len()
        )));
    }
    Ok(players)
}

fn decode_structured(text: &str) -> Result<Vec<PlayerIdentity>> {
    let players: Vec<StructuredPlayer> = serde_json::from_str(text)
        .map_err(|e| HarnessError::MalformedReplay(format!("invalid players array: {e}")))?;
    Ok(players
        .into_iter()
        .map(|p| PlayerIdentity {
            name: p.name,
            id: p.id,
        })
        .collect())
}

fn decode_legacy(text: &str) -> Result<Vec<PlayerIdentity>> {
    let parts: Vec<&str> = text.split(LEGACY_SEPARATOR).collect();
    let needed = PLAYER_COUNT * LEGACY_FIELDS_PER_PLAYER;
    if parts.len() < needed {
        return Err(HarnessError::MalformedReplay(format!(
            "players descriptor has {} fields, expected at least {needed}",
            parts.len()
        )));
    }
    Ok(parts[..needed]
        .chunks(LEGACY_FIELDS_PER_PLAYER)
        .map(|fields| PlayerIdentity {
            name: fields[0].to_string(),
            id: fields[2].to_string(),
        })
        .collect())
}

/// Encode identities in the structured format (used by tests and tooling)
pub fn encode_roster(players: &[PlayerIdentity]) -> String {
    let array: Vec<serde_json::Value> = players
        .iter()
        .map(|p| serde_json::json!({ "name": p.name, "id": p.id }))
        .collect();
    STANDARD.encode(serde_json::Value::Array(array).to_string())
}
