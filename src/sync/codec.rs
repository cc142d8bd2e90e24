//! Compact battle-state codec
//!
//! Encodes a [`BattleUpdate`] into a single delimiter-based string and back,
//! trading generic-format overhead for a fixed field order. Five top-level
//! sections joined by `/`, character entries joined by `,`, fields within an
//! entry joined by `:`. Numeric fields are truncated to a fixed precision on
//! encode, so `decode(encode(x))` is stable on the truncated representation
//! while `encode(decode(x))` is not guaranteed bit-for-bit.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Battle lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    /// Waiting for participants
    Waiting,
    /// Battle in progress
    Active,
    /// Battle paused
    Paused,
    /// Battle finished
    Ended,
}

impl BattleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BattleStatus::Waiting => "waiting",
            BattleStatus::Active => "active",
            BattleStatus::Paused => "paused",
            BattleStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CodecError> {
        match s {
            "waiting" => Ok(BattleStatus::Waiting),
            "active" => Ok(BattleStatus::Active),
            "paused" => Ok(BattleStatus::Paused),
            "ended" => Ok(BattleStatus::Ended),
            other => Err(CodecError::UnknownStatus(other.to_string())),
        }
    }
}

/// A timed status effect on a character
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEffect {
    /// Effect tag, e.g. "burn", "stun"
    pub effect_type: String,
    /// Remaining duration (seconds)
    pub duration: f32,
    /// Effect strength
    pub intensity: f32,
}

/// Per-character state within a battle update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    pub character_id: u32,
    pub current_health: i32,
    /// World position (x, y, z)
    pub position: [f32; 3],
    /// Rotation components as carried on the wire
    pub rotation: [f32; 3],
    /// Animation tag, e.g. "idle", "attack_heavy"
    pub current_animation: String,
    pub status_effects: Vec<StatusEffect>,
}

/// Typed custom value, tagged on the wire with a 1-character prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CustomValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

/// One full battle state as produced per gameplay tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleUpdate {
    pub battle_id: u32,
    pub status: BattleStatus,
    /// Seconds until the battle ends
    pub time_remaining: f32,
    /// Ordered character states
    pub characters: Vec<CharacterState>,
    /// Custom key/value payload for game-specific extensions
    pub custom_data: BTreeMap<String, CustomValue>,
}

/// Codec failures; all malformed input maps here, never a panic
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("corrupt payload: {0} sections, expected at least 4")]
    TooFewSections(usize),

    #[error("corrupt payload: invalid {field} value '{raw}'")]
    InvalidNumber { field: &'static str, raw: String },

    #[error("corrupt payload: unknown battle status '{0}'")]
    UnknownStatus(String),

    #[error("corrupt payload: malformed character entry '{0}'")]
    MalformedCharacter(String),

    #[error("corrupt payload: malformed status effect '{0}'")]
    MalformedEffect(String),

    #[error("corrupt payload: malformed custom entry '{0}'")]
    MalformedCustom(String),

    #[error("corrupt payload: unknown custom type tag '{0}'")]
    UnknownTypeTag(char),
}

/// Minimum colon-separated fields in a character entry (no effects)
const CHARACTER_FIELDS: usize = 9;
/// Colon-separated fields in one status effect
const EFFECT_FIELDS: usize = 3;

/// Encode a full battle update into the compact wire string
pub fn encode(update: &BattleUpdate) -> String {
    let mut out = String::with_capacity(32 + update.characters.len() * 48);
    let _ = write!(
        out,
        "{}/{}/{:.1}/",
        update.battle_id,
        update.status.as_str(),
        update.time_remaining
    );

    for (i, character) in update.characters.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        encode_character_into(&mut out, character);
    }

    out.push('/');
    out.push_str(&encode_custom_section(&update.custom_data));

    out
}

/// Encode the custom-data section on its own (also one delta key's worth)
pub fn encode_custom_section(custom: &BTreeMap<String, CustomValue>) -> String {
    let mut out = String::new();
    for (i, (key, value)) in custom.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}={}", key, encode_custom_value(value));
    }
    out
}

/// Encode a single character entry (one top-level delta key's worth)
pub fn encode_character(character: &CharacterState) -> String {
    let mut out = String::with_capacity(48);
    encode_character_into(&mut out, character);
    out
}

fn encode_character_into(out: &mut String, character: &CharacterState) {
    let _ = write!(
        out,
        "{}:{}:{:.2}:{:.2}:{:.2}:{:.1}:{:.1}:{:.1}:{}",
        character.character_id,
        character.current_health,
        character.position[0],
        character.position[1],
        character.position[2],
        character.rotation[0],
        character.rotation[1],
        character.rotation[2],
        character.current_animation,
    );
    for (i, effect) in character.status_effects.iter().enumerate() {
        let sep = if i == 0 { ':' } else { ',' };
        let _ = write!(
            out,
            "{}{}:{:.1}:{:.1}",
            sep, effect.effect_type, effect.duration, effect.intensity
        );
    }
}

fn encode_custom_value(value: &CustomValue) -> String {
    match value {
        CustomValue::Int(v) => format!("i{}", v),
        CustomValue::Float(v) => format!("f{}", v),
        CustomValue::Bool(v) => format!("b{}", v),
        CustomValue::Text(v) => format!("s{}", v),
    }
}

/// Decode a compact wire string back into a [`BattleUpdate`].
///
/// Tolerates a missing trailing custom-data section for forward
/// compatibility; fewer than four sections is a corrupt payload.
pub fn decode(input: &str) -> Result<BattleUpdate, CodecError> {
    let sections: Vec<&str> = input.split('/').collect();
    if sections.len() < 4 {
        return Err(CodecError::TooFewSections(sections.len()));
    }

    let battle_id = sections[0]
        .parse::<u32>()
        .map_err(|_| CodecError::InvalidNumber {
            field: "battle_id",
            raw: sections[0].to_string(),
        })?;
    let status = BattleStatus::parse(sections[1])?;
    let time_remaining = parse_f32("time_remaining", sections[2])?;
    let characters = decode_characters(sections[3])?;
    let custom_data = if sections.len() >= 5 {
        decode_custom(sections[4])?
    } else {
        BTreeMap::new()
    };

    Ok(BattleUpdate {
        battle_id,
        status,
        time_remaining,
        characters,
        custom_data,
    })
}

/// Decode a character section: comma-split chunks where a chunk with at
/// least nine colon-fields opens a new character and a three-field chunk is
/// a status effect appended to the current one.
pub fn decode_characters(section: &str) -> Result<Vec<CharacterState>, CodecError> {
    let mut characters: Vec<CharacterState> = Vec::new();
    if section.is_empty() {
        return Ok(characters);
    }

    for chunk in section.split(',') {
        let fields: Vec<&str> = chunk.split(':').collect();
        if fields.len() >= CHARACTER_FIELDS {
            characters.push(decode_character_fields(&fields, chunk)?);
        } else if fields.len() == EFFECT_FIELDS {
            let current = characters
                .last_mut()
                .ok_or_else(|| CodecError::MalformedEffect(chunk.to_string()))?;
            current.status_effects.push(decode_effect(&fields, chunk)?);
        } else {
            return Err(CodecError::MalformedCharacter(chunk.to_string()));
        }
    }

    Ok(characters)
}

/// Decode a single character entry string (as stored under a delta key)
pub fn decode_character(entry: &str) -> Result<CharacterState, CodecError> {
    let mut characters = decode_characters(entry)?;
    match characters.len() {
        1 => Ok(characters.remove(0)),
        _ => Err(CodecError::MalformedCharacter(entry.to_string())),
    }
}

fn decode_character_fields(fields: &[&str], raw: &str) -> Result<CharacterState, CodecError> {
    let character_id = fields[0]
        .parse::<u32>()
        .map_err(|_| CodecError::InvalidNumber {
            field: "character_id",
            raw: fields[0].to_string(),
        })?;
    let current_health = fields[1]
        .parse::<i32>()
        .map_err(|_| CodecError::InvalidNumber {
            field: "current_health",
            raw: fields[1].to_string(),
        })?;
    let position = [
        parse_f32("position", fields[2])?,
        parse_f32("position", fields[3])?,
        parse_f32("position", fields[4])?,
    ];
    let rotation = [
        parse_f32("rotation", fields[5])?,
        parse_f32("rotation", fields[6])?,
        parse_f32("rotation", fields[7])?,
    ];
    let current_animation = fields[8].to_string();

    // Trailing fields past the fixed nine are inline effects, in triples
    let trailing = &fields[CHARACTER_FIELDS..];
    if trailing.len() % EFFECT_FIELDS != 0 {
        return Err(CodecError::MalformedCharacter(raw.to_string()));
    }
    let mut status_effects = Vec::with_capacity(trailing.len() / EFFECT_FIELDS);
    for triple in trailing.chunks(EFFECT_FIELDS) {
        status_effects.push(decode_effect(triple, raw)?);
    }

    Ok(CharacterState {
        character_id,
        current_health,
        position,
        rotation,
        current_animation,
        status_effects,
    })
}

fn decode_effect(fields: &[&str], raw: &str) -> Result<StatusEffect, CodecError> {
    if fields.len() != EFFECT_FIELDS {
        return Err(CodecError::MalformedEffect(raw.to_string()));
    }
    Ok(StatusEffect {
        effect_type: fields[0].to_string(),
        duration: parse_f32("effect duration", fields[1])?,
        intensity: parse_f32("effect intensity", fields[2])?,
    })
}

fn decode_custom(section: &str) -> Result<BTreeMap<String, CustomValue>, CodecError> {
    let mut custom = BTreeMap::new();
    if section.is_empty() {
        return Ok(custom);
    }

    for entry in section.split(',') {
        let (key, tagged) = entry
            .split_once('=')
            .ok_or_else(|| CodecError::MalformedCustom(entry.to_string()))?;
        let mut chars = tagged.chars();
        let tag = chars
            .next()
            .ok_or_else(|| CodecError::MalformedCustom(entry.to_string()))?;
        let literal = chars.as_str();

        let value = match tag {
            'i' => CustomValue::Int(literal.parse::<i64>().map_err(|_| {
                CodecError::InvalidNumber {
                    field: "custom int",
                    raw: literal.to_string(),
                }
            })?),
            'f' => CustomValue::Float(literal.parse::<f64>().map_err(|_| {
                CodecError::InvalidNumber {
                    field: "custom float",
                    raw: literal.to_string(),
                }
            })?),
            'b' => CustomValue::Bool(literal.parse::<bool>().map_err(|_| {
                CodecError::MalformedCustom(entry.to_string())
            })?),
            's' => CustomValue::Text(literal.to_string()),
            other => return Err(CodecError::UnknownTypeTag(other)),
        };
        custom.insert(key.to_string(), value);
    }

    Ok(custom)
}

fn parse_f32(field: &'static str, raw: &str) -> Result<f32, CodecError> {
    raw.parse::<f32>().map_err(|_| CodecError::InvalidNumber {
        field,
        raw: raw.to_string(),
    })
}
