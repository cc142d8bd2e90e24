//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type tags; the state-carrying tags double as channel ids
pub mod msg_type {
    pub const WELCOME: &str = "welcome";
    pub const BATTLE_UPDATE: &str = "battle_update";
    pub const AR_SYNC: &str = "ar_sync";
    pub const PLAYER_ACTION: &str = "player_action";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
}

/// The logical message envelope.
///
/// `data` is either a compact codec string wrapped in a sync payload
/// (battle/character channels) or a generic key-value map (e.g. AR sync).
/// The security fields are present on signed traffic and absent on
/// housekeeping messages like ping/pong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Payload; shape depends on `msg_type`
    pub data: Value,
    /// Originating session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Single-use replay token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Sender wall clock, Unix milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Hex HMAC-SHA256 over the canonical payload minus this field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    /// Bare unsigned envelope
    pub fn new(msg_type: &str, data: Value) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            data,
            session_id: None,
            nonce: None,
            timestamp: None,
            signature: None,
        }
    }
}

/// Player action payload carried in a `player_action` envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionData {
    /// Player moved their battle avatar
    Move {
        player_id: u32,
        /// New world position
        position: [f32; 3],
    },

    /// Player triggered an ability
    Ability {
        player_id: u32,
        /// Ability tag, e.g. "fireball"
        name: String,
    },

    /// Client-reported character state
    StateReport {
        player_id: u32,
        /// Reported health, valid range 0-100
        health: i32,
    },
}

impl ActionData {
    pub fn player_id(&self) -> u32 {
        match self {
            ActionData::Move { player_id, .. }
            | ActionData::Ability { player_id, .. }
            | ActionData::StateReport { player_id, .. } => *player_id,
        }
    }
}

/// Ping payload for latency measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingData {
    /// Sender timestamp, echoed back in the pong
    pub t: u64,
}

/// Welcome payload after connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeData {
    pub session_id: String,
    pub battle_id: u32,
    pub server_time: u64,
}

/// Error payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
}
