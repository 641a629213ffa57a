//! Error types for the replay harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Malformed replay: {0}")]
    MalformedReplay(String),

    #[error("Engine startup failed: {0}")]
    EngineStartupFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("[{index}]: engine sent data to player {player} while input was expected")]
    UnsolicitedSend { index: usize, player: u8 },

    #[error("[{index}]: no packet from the engine for player {player} in time")]
    ReceiveTimeout { index: usize, player: u8 },

    #[error("[{index}]: packet for player {player} differs from the replay: {detail}")]
    PacketMismatch {
        index: usize,
        player: u8,
        detail: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
