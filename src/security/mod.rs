//! Message integrity and anti-cheat

pub mod guard;
pub mod nonce;

pub use guard::{
    IntegrityGuard, PlayerAction, RejectReason, SecurityEvent, SecurityTuning, ViolationKind,
};
pub use nonce::NonceRegistry;
