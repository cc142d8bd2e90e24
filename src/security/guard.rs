//! Message integrity and anti-cheat guard
//!
//! Server-authoritative validation of inbound traffic before it reaches any
//! sync or gameplay logic. Signature, replay and freshness failures drop the
//! message; behavioral findings accumulate suspicion while the action is
//! still applied. Punitive enforcement is a downstream consumer of the
//! event queue, not this module.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::warn;

use crate::ws::protocol::{msg_type, Envelope};

use super::nonce::{self, NonceRegistry};

type HmacSha256 = Hmac<Sha256>;

/// Guard tuning knobs
#[derive(Debug, Clone)]
pub struct SecurityTuning {
    /// Max action messages per player per 1 s window
    pub max_action_rate: u32,
    /// Max implied movement speed (world units per second)
    pub max_movement_speed: f32,
    /// Suspicion level at which a cheat-detected signal fires
    pub suspicion_threshold: f32,
    /// Linear suspicion decay per idle second
    pub suspicion_decay_per_sec: f32,
    /// Accepted deviation between message and local clocks
    pub timestamp_tolerance: Duration,
    /// Nonce uniqueness window
    pub nonce_ttl: Duration,
}

impl Default for SecurityTuning {
    fn default() -> Self {
        Self {
            max_action_rate: 20,
            max_movement_speed: 10.0,
            suspicion_threshold: 0.8,
            suspicion_decay_per_sec: 0.05,
            timestamp_tolerance: Duration::from_secs(30),
            nonce_ttl: nonce::DEFAULT_NONCE_TTL,
        }
    }
}

/// Why a message was rejected outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidSignature,
    ReplayedNonce,
    StaleTimestamp,
    /// A signed message type arrived without its security fields
    MissingSecurityFields,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            RejectReason::InvalidSignature => "invalid_signature",
            RejectReason::ReplayedNonce => "replayed_nonce",
            RejectReason::StaleTimestamp => "stale_timestamp",
            RejectReason::MissingSecurityFields => "missing_security_fields",
        };
        f.write_str(tag)
    }
}

/// Behavioral finding kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    RateExceeded,
    SpeedHack,
    InvalidStateRange,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ViolationKind::RateExceeded => "rate_exceeded",
            ViolationKind::SpeedHack => "speed_hack",
            ViolationKind::InvalidStateRange => "invalid_state_range",
        };
        f.write_str(tag)
    }
}

/// Signals handed to the external enforcement collaborator
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    /// A player's suspicion crossed the configured threshold
    CheatDetected {
        player_id: u32,
        reason: ViolationKind,
        suspicion: f32,
    },
    /// A hard integrity failure (dropped message or invalid state)
    SecurityViolation { reason: String },
}

/// One recorded behavioral finding
#[derive(Debug, Clone)]
pub struct ViolationRecord {
    pub kind: ViolationKind,
    pub at_ms: u64,
    pub severity: f32,
}

/// Per-player behavioral tracking state
#[derive(Debug)]
pub struct PlayerSecurityState {
    pub player_id: u32,
    last_position: Option<[f32; 3]>,
    last_move_ms: u64,
    window_start_ms: u64,
    actions_in_window: u32,
    suspicion: f32,
    last_decay_ms: u64,
    violations: Vec<ViolationRecord>,
}

impl PlayerSecurityState {
    fn new(player_id: u32, now_ms: u64) -> Self {
        Self {
            player_id,
            last_position: None,
            last_move_ms: 0,
            window_start_ms: now_ms,
            actions_in_window: 0,
            suspicion: 0.0,
            last_decay_ms: now_ms,
            violations: Vec::new(),
        }
    }

    fn decay(&mut self, now_ms: u64, per_sec: f32) {
        let elapsed_secs = now_ms.saturating_sub(self.last_decay_ms) as f32 / 1000.0;
        if elapsed_secs > 0.0 {
            self.suspicion = (self.suspicion - per_sec * elapsed_secs).max(0.0);
            self.last_decay_ms = now_ms;
        }
    }
}

/// Action counter window length
const ACTION_WINDOW_MS: u64 = 1_000;
/// Suspicion added per rate violation
const RATE_SEVERITY: f32 = 0.15;
/// Suspicion added per speed violation
const SPEED_SEVERITY: f32 = 0.25;

/// A player action as seen by the guard
#[derive(Debug, Clone)]
pub enum PlayerAction {
    Move { position: [f32; 3] },
    Ability,
    StateReport { health: i32 },
}

/// The integrity and anti-cheat guard for one session.
pub struct IntegrityGuard {
    secret: Vec<u8>,
    tuning: SecurityTuning,
    nonces: NonceRegistry,
    players: HashMap<u32, PlayerSecurityState>,
    events_tx: mpsc::UnboundedSender<SecurityEvent>,
}

impl IntegrityGuard {
    pub fn new(
        secret: &[u8],
        tuning: SecurityTuning,
        events_tx: mpsc::UnboundedSender<SecurityEvent>,
    ) -> Self {
        let nonces = NonceRegistry::new(tuning.nonce_ttl);
        Self {
            secret: secret.to_vec(),
            tuning,
            nonces,
            players: HashMap::new(),
            events_tx,
        }
    }

    /// Whether a message type carries security fields
    pub fn requires_signature(message_type: &str) -> bool {
        matches!(
            message_type,
            msg_type::BATTLE_UPDATE | msg_type::AR_SYNC | msg_type::PLAYER_ACTION
        )
    }

    /// Hex HMAC-SHA256 over the canonical payload (everything but the
    /// signature field itself)
    pub fn sign(&self, message_type: &str, nonce: &str, timestamp: i64, data: &Value) -> String {
        let canonical = canonical_payload(message_type, nonce, timestamp, data);
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Attach nonce, timestamp and signature to an outbound envelope
    pub fn seal(&self, envelope: &mut Envelope) {
        let nonce = nonce::generate();
        let timestamp = now_ms() as i64;
        envelope.signature = Some(self.sign(&envelope.msg_type, &nonce, timestamp, &envelope.data));
        envelope.nonce = Some(nonce);
        envelope.timestamp = Some(timestamp);
    }

    /// Validate an inbound envelope: signature, then replay, then freshness.
    ///
    /// A rejection drops the message and raises a security-violation event;
    /// it never reaches sync state, and processing of later messages
    /// continues. Unsigned message types are accepted as-is.
    pub fn validate_message(&mut self, envelope: &Envelope) -> Result<(), RejectReason> {
        self.validate_message_at(envelope, now_ms())
    }

    fn validate_message_at(
        &mut self,
        envelope: &Envelope,
        now_ms: u64,
    ) -> Result<(), RejectReason> {
        if !Self::requires_signature(&envelope.msg_type) {
            return Ok(());
        }

        let result = self.check_security_fields(envelope, now_ms);
        if let Err(reason) = result {
            warn!(
                message_type = %envelope.msg_type,
                reason = %reason,
                "rejected inbound message"
            );
            self.emit(SecurityEvent::SecurityViolation {
                reason: reason.to_string(),
            });
        }
        result
    }

    fn check_security_fields(
        &mut self,
        envelope: &Envelope,
        now_ms: u64,
    ) -> Result<(), RejectReason> {
        let (nonce, timestamp, signature) = match (
            envelope.nonce.as_deref(),
            envelope.timestamp,
            envelope.signature.as_deref(),
        ) {
            (Some(n), Some(t), Some(s)) => (n, t, s),
            _ => return Err(RejectReason::MissingSecurityFields),
        };

        let expected = self.sign(&envelope.msg_type, nonce, timestamp, &envelope.data);
        if expected != signature {
            return Err(RejectReason::InvalidSignature);
        }

        if !self.nonces.observe(nonce, now_ms) {
            return Err(RejectReason::ReplayedNonce);
        }

        let tolerance_ms = self.tuning.timestamp_tolerance.as_millis() as i64;
        if (now_ms as i64 - timestamp).abs() > tolerance_ms {
            return Err(RejectReason::StaleTimestamp);
        }

        Ok(())
    }

    /// Score one player action. Returns the suspicion added by this call.
    ///
    /// Soft findings (rate, speed) add suspicion while the action is still
    /// applied; an out-of-range state report is a hard violation reported
    /// immediately instead of scored.
    pub fn report_action(&mut self, player_id: u32, action: &PlayerAction) -> f32 {
        self.report_action_at(player_id, action, now_ms())
    }

    fn report_action_at(&mut self, player_id: u32, action: &PlayerAction, now_ms: u64) -> f32 {
        let decay_per_sec = self.tuning.suspicion_decay_per_sec;
        let max_action_rate = self.tuning.max_action_rate;
        let max_speed = self.tuning.max_movement_speed;

        let player = self
            .players
            .entry(player_id)
            .or_insert_with(|| PlayerSecurityState::new(player_id, now_ms));
        player.decay(now_ms, decay_per_sec);

        if now_ms.saturating_sub(player.window_start_ms) >= ACTION_WINDOW_MS {
            player.window_start_ms = now_ms;
            player.actions_in_window = 0;
        }
        player.actions_in_window += 1;

        let mut findings: Vec<(ViolationKind, f32)> = Vec::new();
        if player.actions_in_window > max_action_rate {
            findings.push((ViolationKind::RateExceeded, RATE_SEVERITY));
        }

        match action {
            PlayerAction::Move { position } => {
                if let Some(last) = player.last_position {
                    let elapsed_secs =
                        now_ms.saturating_sub(player.last_move_ms) as f32 / 1000.0;
                    if elapsed_secs > 0.0 {
                        let speed = distance(last, *position) / elapsed_secs;
                        if speed > max_speed {
                            findings.push((ViolationKind::SpeedHack, SPEED_SEVERITY));
                        }
                    }
                }
                player.last_position = Some(*position);
                player.last_move_ms = now_ms;
            }
            PlayerAction::Ability => {}
            PlayerAction::StateReport { health } => {
                if !(0..=100).contains(health) {
                    player.violations.push(ViolationRecord {
                        kind: ViolationKind::InvalidStateRange,
                        at_ms: now_ms,
                        severity: 0.0,
                    });
                    warn!(player_id, health, "state report out of valid range");
                    self.emit(SecurityEvent::SecurityViolation {
                        reason: ViolationKind::InvalidStateRange.to_string(),
                    });
                }
            }
        }

        let mut delta = 0.0;
        for (kind, severity) in findings {
            delta += self.add_violation(player_id, kind, severity, now_ms);
        }
        delta
    }

    fn add_violation(
        &mut self,
        player_id: u32,
        kind: ViolationKind,
        severity: f32,
        now_ms: u64,
    ) -> f32 {
        let threshold = self.tuning.suspicion_threshold;
        let player = match self.players.get_mut(&player_id) {
            Some(player) => player,
            None => return 0.0,
        };

        let before = player.suspicion;
        player.suspicion = (player.suspicion + severity).min(1.0);
        player.violations.push(ViolationRecord {
            kind,
            at_ms: now_ms,
            severity,
        });
        let added = player.suspicion - before;

        warn!(
            player_id,
            kind = %kind,
            suspicion = player.suspicion,
            "behavioral violation recorded"
        );

        if before < threshold && player.suspicion >= threshold {
            let suspicion = player.suspicion;
            self.emit(SecurityEvent::CheatDetected {
                player_id,
                reason: kind,
                suspicion,
            });
        }

        added
    }

    /// Raise a hard violation that was detected outside the guard's own
    /// checks (e.g. a spoofed player id at the transport layer)
    pub fn raise_violation(&self, reason: String) {
        warn!(reason = %reason, "security violation raised");
        self.emit(SecurityEvent::SecurityViolation { reason });
    }

    /// Periodic housekeeping: decay idle suspicion, expire old nonces
    pub fn tick(&mut self) {
        self.tick_at(now_ms());
    }

    fn tick_at(&mut self, now_ms: u64) {
        for player in self.players.values_mut() {
            player.decay(now_ms, self.tuning.suspicion_decay_per_sec);
        }
        self.nonces.sweep(now_ms);
    }

    /// Current suspicion for a player (0 when unknown)
    pub fn suspicion(&self, player_id: u32) -> f32 {
        self.players.get(&player_id).map_or(0.0, |p| p.suspicion)
    }

    /// Recorded violations for a player
    pub fn violations(&self, player_id: u32) -> &[ViolationRecord] {
        self.players
            .get(&player_id)
            .map_or(&[], |p| p.violations.as_slice())
    }

    fn emit(&self, event: SecurityEvent) {
        let _ = self.events_tx.send(event);
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

fn canonical_payload(message_type: &str, nonce: &str, timestamp: i64, data: &Value) -> String {
    // serde_json orders object keys, so this string is canonical
    let data_json = serde_json::to_string(data).unwrap_or_default();
    format!("{}.{}.{}.{}", message_type, nonce, timestamp, data_json)
}

fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    let dz = b[2] - a[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard() -> (IntegrityGuard, mpsc::UnboundedReceiver<SecurityEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let guard = IntegrityGuard::new(b"test-session-secret", SecurityTuning::default(), events_tx);
        (guard, events_rx)
    }

    fn signed_envelope(guard: &IntegrityGuard, nonce: &str, now_ms: u64) -> Envelope {
        let mut envelope = Envelope::new(msg_type::PLAYER_ACTION, json!({"action": "ability"}));
        let timestamp = now_ms as i64;
        envelope.signature =
            Some(guard.sign(&envelope.msg_type, nonce, timestamp, &envelope.data));
        envelope.nonce = Some(nonce.to_string());
        envelope.timestamp = Some(timestamp);
        envelope
    }

    #[test]
    fn sealed_envelope_validates() {
        let (mut guard, _events_rx) = guard();
        let mut envelope = Envelope::new(msg_type::BATTLE_UPDATE, json!({"state": "42/active"}));
        guard.seal(&mut envelope);
        assert!(guard.validate_message(&envelope).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let (mut guard, mut events_rx) = guard();
        let now = 1_000_000;
        let mut envelope = signed_envelope(&guard, "n1", now);
        envelope.data = json!({"action": "ability", "extra": 1});

        assert_eq!(
            guard.validate_message_at(&envelope, now),
            Err(RejectReason::InvalidSignature)
        );
        assert!(matches!(
            events_rx.try_recv(),
            Ok(SecurityEvent::SecurityViolation { .. })
        ));
    }

    #[test]
    fn replayed_nonce_accepted_once() {
        let (mut guard, _events_rx) = guard();
        let now = 1_000_000;
        let envelope = signed_envelope(&guard, "n1", now);

        assert!(guard.validate_message_at(&envelope, now).is_ok());
        assert_eq!(
            guard.validate_message_at(&envelope, now + 5_000),
            Err(RejectReason::ReplayedNonce)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let (mut guard, _events_rx) = guard();
        let sent_at = 1_000_000;
        let envelope = signed_envelope(&guard, "n1", sent_at);

        assert_eq!(
            guard.validate_message_at(&envelope, sent_at + 31_000),
            Err(RejectReason::StaleTimestamp)
        );
    }

    #[test]
    fn unsigned_housekeeping_types_pass_through() {
        let (mut guard, _events_rx) = guard();
        let envelope = Envelope::new(msg_type::PING, json!({"t": 123}));
        assert!(guard.validate_message(&envelope).is_ok());
    }

    #[test]
    fn missing_fields_on_signed_type_are_rejected() {
        let (mut guard, _events_rx) = guard();
        let envelope = Envelope::new(msg_type::PLAYER_ACTION, json!({"action": "ability"}));
        assert_eq!(
            guard.validate_message(&envelope),
            Err(RejectReason::MissingSecurityFields)
        );
    }

    #[test]
    fn action_flood_raises_suspicion() {
        let (mut guard, _events_rx) = guard();
        let now = 10_000;

        let mut delta = 0.0;
        for _ in 0..25 {
            delta += guard.report_action_at(1, &PlayerAction::Ability, now);
        }
        assert!(delta > 0.0);
        assert!(guard.suspicion(1) > 0.0);
        assert!(guard
            .violations(1)
            .iter()
            .any(|v| v.kind == ViolationKind::RateExceeded));
    }

    #[test]
    fn teleport_speed_raises_suspicion() {
        let (mut guard, _events_rx) = guard();
        guard.report_action_at(
            2,
            &PlayerAction::Move {
                position: [0.0, 0.0, 0.0],
            },
            10_000,
        );
        // 100 units in 100 ms: far past any legal speed
        let delta = guard.report_action_at(
            2,
            &PlayerAction::Move {
                position: [100.0, 0.0, 0.0],
            },
            10_100,
        );
        assert!(delta > 0.0);
        assert!(guard
            .violations(2)
            .iter()
            .any(|v| v.kind == ViolationKind::SpeedHack));
    }

    #[test]
    fn sane_movement_adds_no_suspicion() {
        let (mut guard, _events_rx) = guard();
        guard.report_action_at(
            3,
            &PlayerAction::Move {
                position: [0.0, 0.0, 0.0],
            },
            10_000,
        );
        let delta = guard.report_action_at(
            3,
            &PlayerAction::Move {
                position: [1.0, 0.0, 0.0],
            },
            11_000,
        );
        assert_eq!(delta, 0.0);
        assert_eq!(guard.suspicion(3), 0.0);
    }

    #[test]
    fn out_of_range_health_is_immediate_hard_violation() {
        let (mut guard, mut events_rx) = guard();
        let delta =
            guard.report_action_at(4, &PlayerAction::StateReport { health: 250 }, 10_000);

        // Hard violation: reported, not scored
        assert_eq!(delta, 0.0);
        assert!(matches!(
            events_rx.try_recv(),
            Ok(SecurityEvent::SecurityViolation { reason }) if reason == "invalid_state_range"
        ));
    }

    #[test]
    fn suspicion_clamps_at_one_and_decays() {
        let (mut guard, _events_rx) = guard();
        // Hammer the speed check to pile up suspicion
        for i in 0..20u64 {
            let x = if i % 2 == 0 { 0.0 } else { 1000.0 };
            guard.report_action_at(
                5,
                &PlayerAction::Move {
                    position: [x, 0.0, 0.0],
                },
                10_000 + i * 50,
            );
        }
        assert!(guard.suspicion(5) <= 1.0);
        let peak = guard.suspicion(5);
        assert!(peak > 0.5);

        guard.tick_at(40_000);
        let decayed = guard.suspicion(5);
        assert!(decayed < peak);

        guard.tick_at(10_000_000);
        assert_eq!(guard.suspicion(5), 0.0);
    }

    #[test]
    fn crossing_threshold_emits_cheat_detected() {
        let (mut guard, mut events_rx) = guard();
        for i in 0..20u64 {
            let x = if i % 2 == 0 { 0.0 } else { 1000.0 };
            guard.report_action_at(
                6,
                &PlayerAction::Move {
                    position: [x, 0.0, 0.0],
                },
                10_000 + i * 50,
            );
        }

        let mut detected = false;
        while let Ok(event) = events_rx.try_recv() {
            if let SecurityEvent::CheatDetected {
                player_id,
                suspicion,
                ..
            } = event
            {
                assert_eq!(player_id, 6);
                assert!(suspicion >= SecurityTuning::default().suspicion_threshold);
                detected = true;
            }
        }
        assert!(detected);
    }
}
