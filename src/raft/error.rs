use thiserror::Error;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unhandled message type: {0}")]
    UnhandledMessage(String),

    #[error("Heartbeat from {sent_from} claims leader {leader_id}")]
    LeaderMismatch { sent_from: String, leader_id: String },

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
