//! Per-channel delta compression
//!
//! Reduces per-tick payload size to the top-level keys that changed since
//! the last state seen on a channel. States are JSON objects; `null` is the
//! removal tombstone, so live channel values must not use `null`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::codec::{self, BattleUpdate};

/// State payload as carried inside an envelope's `data` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// True when `state` holds only changed keys (and tombstones)
    pub is_delta: bool,
    /// Full state, or the changed subset when `is_delta` is set
    pub state: Map<String, Value>,
}

/// Delta reconstruction failures
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("delta received for channel '{0}' with no prior full state")]
    MissingBase(String),
}

/// Per-channel diff/reconstruct engine.
///
/// `last_full_state` per channel is always a complete, previously
/// materialized state, never a partial delta. It is updated unconditionally
/// on every optimize call; a delta dropped by the network leaves the two
/// sides out of step until the next full snapshot re-seeds the receiver.
#[derive(Debug, Default)]
pub struct DeltaEngine {
    last_full_state: HashMap<String, Map<String, Value>>,
}

impl DeltaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff `new_state` against the channel's cached state.
    ///
    /// First state on a channel goes out verbatim. Otherwise changed keys
    /// are included, keys absent from `new_state` become `null` tombstones,
    /// and the full state is sent instead whenever the serialized delta is
    /// not strictly smaller — the engine never transmits something larger
    /// than a full snapshot.
    pub fn optimize(&mut self, channel_id: &str, new_state: &Map<String, Value>) -> SyncPayload {
        let payload = match self.last_full_state.get(channel_id) {
            None => SyncPayload {
                is_delta: false,
                state: new_state.clone(),
            },
            Some(previous) => {
                let mut changed = Map::new();
                for (key, value) in new_state {
                    if previous.get(key) != Some(value) {
                        changed.insert(key.clone(), value.clone());
                    }
                }
                for key in previous.keys() {
                    if !new_state.contains_key(key) {
                        changed.insert(key.clone(), Value::Null);
                    }
                }

                let delta_size = serialized_size(&changed);
                let full_size = serialized_size(new_state);
                if delta_size < full_size {
                    debug!(
                        channel = channel_id,
                        delta_bytes = delta_size,
                        full_bytes = full_size,
                        changed_keys = changed.len(),
                        "delta smaller than snapshot"
                    );
                    SyncPayload {
                        is_delta: true,
                        state: changed,
                    }
                } else {
                    SyncPayload {
                        is_delta: false,
                        state: new_state.clone(),
                    }
                }
            }
        };

        self.last_full_state
            .insert(channel_id.to_string(), new_state.clone());
        payload
    }

    /// Apply a received payload to the channel's cached state.
    ///
    /// A full payload replaces the cache outright. A delta clones the cached
    /// base and applies each key: `null` removes, anything else overwrites
    /// or inserts. A delta with no base is a [`DeltaError::MissingBase`].
    pub fn reconstruct(
        &mut self,
        channel_id: &str,
        payload: &SyncPayload,
    ) -> Result<Map<String, Value>, DeltaError> {
        let full = if payload.is_delta {
            let mut base = self
                .last_full_state
                .get(channel_id)
                .ok_or_else(|| DeltaError::MissingBase(channel_id.to_string()))?
                .clone();
            for (key, value) in &payload.state {
                if value.is_null() {
                    base.remove(key);
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
            base
        } else {
            payload.state.clone()
        };

        self.last_full_state
            .insert(channel_id.to_string(), full.clone());
        Ok(full)
    }

    /// Drop a channel's cached state (disconnect cleanup)
    pub fn forget_channel(&mut self, channel_id: &str) {
        self.last_full_state.remove(channel_id);
    }

    /// Cached full state for a channel, if any
    pub fn last_state(&self, channel_id: &str) -> Option<&Map<String, Value>> {
        self.last_full_state.get(channel_id)
    }
}

fn serialized_size(state: &Map<String, Value>) -> usize {
    serde_json::to_string(state).map(|s| s.len()).unwrap_or(0)
}

/// Explode a battle update into its per-channel top-level map: a `battle`
/// header key plus one `char_<id>` key per character, each holding a compact
/// codec string. A lone health change then dirties exactly one key.
pub fn battle_state_map(update: &BattleUpdate) -> Map<String, Value> {
    let mut state = Map::new();
    state.insert(
        "battle".to_string(),
        Value::String(format!(
            "{}/{}/{:.1}",
            update.battle_id,
            update.status.as_str(),
            update.time_remaining
        )),
    );
    for character in &update.characters {
        state.insert(
            format!("char_{}", character.character_id),
            Value::String(codec::encode_character(character)),
        );
    }
    if !update.custom_data.is_empty() {
        state.insert(
            "custom".to_string(),
            Value::String(codec::encode_custom_section(&update.custom_data)),
        );
    }
    state
}

/// Rebuild a [`BattleUpdate`] from a reconstructed channel state map.
/// Characters come back ordered by id.
pub fn battle_from_state_map(
    state: &Map<String, Value>,
) -> Result<BattleUpdate, codec::CodecError> {
    let header = state
        .get("battle")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let custom = state
        .get("custom")
        .and_then(Value::as_str)
        .unwrap_or_default();

    // Header + sections reassemble into the canonical five-section form
    let mut characters = Vec::new();
    for (key, value) in state {
        if key.starts_with("char_") {
            if let Some(entry) = value.as_str() {
                characters.push(codec::decode_character(entry)?);
            }
        }
    }
    characters.sort_by_key(|c| c.character_id);

    let character_section: Vec<String> =
        characters.iter().map(codec::encode_character).collect();
    let full = format!("{}/{}/{}", header, character_section.join(","), custom);
    codec::decode(&full)
}
