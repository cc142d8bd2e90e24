//! Per-connection sync session
//!
//! Owns the full sync core for one connected client: delta engines for both
//! directions, the transmission controller, the ping meter and the integrity
//! guard. All methods run on the connection's task; the only suspension
//! points are in the transport layer above.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::security::{IntegrityGuard, PlayerAction, SecurityEvent, SecurityTuning};
use crate::util::time::unix_millis;
use crate::ws::protocol::{msg_type, ActionData, Envelope, PingData};

use super::delta::{DeltaEngine, SyncPayload};
use super::rate::{PingMeter, RateTuning, TransmissionController};
use super::room::{BattleHandle, RoomEvent};

/// How often the session probes the link
const PING_INTERVAL_MS: u64 = 2_000;

/// The sync core for one connected client.
pub struct SyncSession {
    session_id: Uuid,
    player_id: u32,
    battle_id: u32,
    /// Reconstruction cache for states received from this client
    inbound: DeltaEngine,
    /// Diff cache for states sent to this client; strictly separate from
    /// the inbound cache, the two sides track different histories
    outbound: DeltaEngine,
    controller: TransmissionController,
    meter: PingMeter,
    guard: IntegrityGuard,
    /// Latest unsent state per channel; newer states conflate older ones
    /// while the send gate is closed
    pending: HashMap<String, serde_json::Map<String, Value>>,
    last_send: Option<Instant>,
    last_ping: Option<Instant>,
}

impl SyncSession {
    pub fn new(
        session_id: Uuid,
        player_id: u32,
        battle_id: u32,
        secret: &[u8],
        rate_tuning: RateTuning,
        security_tuning: SecurityTuning,
        security_events_tx: tokio::sync::mpsc::UnboundedSender<SecurityEvent>,
    ) -> Self {
        Self {
            session_id,
            player_id,
            battle_id,
            inbound: DeltaEngine::new(),
            outbound: DeltaEngine::new(),
            controller: TransmissionController::new(rate_tuning),
            meter: PingMeter::new(),
            guard: IntegrityGuard::new(secret, security_tuning, security_events_tx),
            pending: HashMap::new(),
            last_send: None,
            last_ping: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn battle_id(&self) -> u32 {
        self.battle_id
    }

    /// Current outbound send rate (Hz)
    pub fn current_rate(&self) -> f32 {
        self.controller.current_rate()
    }

    /// Account raw inbound bytes (called with the frame length)
    pub fn record_received(&mut self, bytes: usize) {
        self.controller.record_received(bytes);
    }

    /// Account raw outbound bytes (called with the frame length)
    pub fn record_sent(&mut self, bytes: usize) {
        self.controller.record_sent(bytes);
    }

    /// Process one inbound envelope, in arrival order.
    ///
    /// Returns immediate replies (e.g. a pong). Rejected or corrupt
    /// messages are dropped here and never halt the session.
    pub fn handle_inbound(&mut self, envelope: Envelope, room: &BattleHandle) -> Vec<Envelope> {
        if self.guard.validate_message(&envelope).is_err() {
            // Guard already raised the violation event
            return Vec::new();
        }

        match envelope.msg_type.as_str() {
            msg_type::PING => match serde_json::from_value::<PingData>(envelope.data.clone()) {
                Ok(ping) => vec![Envelope::new(
                    msg_type::PONG,
                    serde_json::to_value(PingData { t: ping.t }).unwrap_or(Value::Null),
                )],
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "malformed ping");
                    Vec::new()
                }
            },
            msg_type::PONG => {
                if let Ok(pong) = serde_json::from_value::<PingData>(envelope.data.clone()) {
                    let rtt = unix_millis().saturating_sub(pong.t) as f32;
                    self.meter.on_pong(rtt);
                }
                Vec::new()
            }
            msg_type::BATTLE_UPDATE | msg_type::AR_SYNC => {
                self.handle_state(envelope, room);
                Vec::new()
            }
            msg_type::PLAYER_ACTION => {
                self.handle_action(envelope, room);
                Vec::new()
            }
            other => {
                debug!(session_id = %self.session_id, message_type = other, "ignoring message");
                Vec::new()
            }
        }
    }

    fn handle_state(&mut self, envelope: Envelope, room: &BattleHandle) {
        let channel_id = envelope.msg_type.clone();
        let payload = match serde_json::from_value::<SyncPayload>(envelope.data.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    channel = %channel_id,
                    error = %e,
                    "corrupt sync payload, dropping"
                );
                return;
            }
        };

        match self.inbound.reconstruct(&channel_id, &payload) {
            Ok(full) => {
                let timestamp = envelope
                    .timestamp
                    .map(|t| t as u64)
                    .unwrap_or_else(unix_millis);
                room.publish(RoomEvent::State {
                    origin: self.session_id,
                    channel_id,
                    state: full,
                    timestamp,
                });
            }
            Err(e) => {
                // Best-effort no-op: the next full snapshot re-seeds the base
                warn!(session_id = %self.session_id, error = %e, "reconstruction skipped");
            }
        }
    }

    fn handle_action(&mut self, envelope: Envelope, room: &BattleHandle) {
        let action = match serde_json::from_value::<ActionData>(envelope.data.clone()) {
            Ok(action) => action,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "corrupt action payload");
                return;
            }
        };

        let player_id = action.player_id();
        if player_id != self.player_id {
            self.guard.raise_violation(format!(
                "spoofed player id {} from session {}",
                player_id, self.session_id
            ));
            return;
        }

        let behavioral = match &action {
            ActionData::Move { position, .. } => PlayerAction::Move {
                position: *position,
            },
            ActionData::Ability { .. } => PlayerAction::Ability,
            ActionData::StateReport { health, .. } => PlayerAction::StateReport {
                health: *health,
            },
        };

        let suspicion_delta = self.guard.report_action(player_id, &behavioral);
        if suspicion_delta > 0.0 {
            debug!(
                session_id = %self.session_id,
                player_id,
                suspicion_delta,
                "suspicious action scored, still applied"
            );
        }

        // Detect-first policy: the action is relayed regardless
        room.publish(RoomEvent::Action {
            origin: self.session_id,
            data: envelope.data,
        });
    }

    /// React to a room event from another session.
    ///
    /// Relayed actions go out immediately; channel states are conflated
    /// into the pending set and flushed by the next eligible tick.
    pub fn on_room_event(&mut self, event: RoomEvent) -> Vec<Envelope> {
        match event {
            RoomEvent::State {
                origin,
                channel_id,
                state,
                ..
            } => {
                if origin != self.session_id {
                    self.pending.insert(channel_id, state);
                }
                Vec::new()
            }
            RoomEvent::Action { origin, data } => {
                if origin == self.session_id {
                    return Vec::new();
                }
                let mut envelope = Envelope::new(msg_type::PLAYER_ACTION, data);
                self.seal(&mut envelope);
                vec![envelope]
            }
        }
    }

    /// One cadence tick: housekeeping, link probing, rate adjustment and —
    /// when the send gate opens — the pending state flush.
    pub fn tick(&mut self) -> Vec<Envelope> {
        self.guard.tick();
        self.controller.adjust_rate(&self.meter);
        if let Some(stats) = self.controller.poll_epoch(&self.meter) {
            self.meter.roll_window();
            debug!(
                session_id = %self.session_id,
                bandwidth_bps = stats.bandwidth_bytes_per_sec,
                latency_ms = stats.latency_ms,
                packet_loss = stats.packet_loss,
                send_rate = stats.send_rate,
                "epoch statistics"
            );
        }

        let mut out = Vec::new();
        let now = Instant::now();

        let ping_due = self
            .last_ping
            .map_or(true, |t| t.elapsed().as_millis() as u64 >= PING_INTERVAL_MS);
        if ping_due {
            self.last_ping = Some(now);
            self.meter.on_ping_sent();
            out.push(Envelope::new(
                msg_type::PING,
                serde_json::to_value(PingData { t: unix_millis() }).unwrap_or(Value::Null),
            ));
        }

        let send_due = self
            .last_send
            .map_or(true, |t| t.elapsed() >= self.controller.send_interval());
        if send_due && !self.pending.is_empty() {
            self.last_send = Some(now);
            for (channel_id, state) in std::mem::take(&mut self.pending) {
                let payload = self.outbound.optimize(&channel_id, &state);
                let data = match serde_json::to_value(&payload) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(channel = %channel_id, error = %e, "payload serialization failed");
                        continue;
                    }
                };
                let mut envelope = Envelope::new(&channel_id, data);
                self.seal(&mut envelope);
                out.push(envelope);
            }
        }

        out
    }

    /// Stamp session id, nonce, timestamp and signature onto an outbound
    /// envelope
    fn seal(&self, envelope: &mut Envelope) {
        envelope.session_id = Some(self.session_id.to_string());
        self.guard.seal(envelope);
    }

    /// Drop per-channel caches on disconnect
    pub fn forget_channels(&mut self) {
        for channel in [msg_type::BATTLE_UPDATE, msg_type::AR_SYNC] {
            self.inbound.forget_channel(channel);
            self.outbound.forget_channel(channel);
            self.pending.remove(channel);
        }
    }

    /// Current suspicion for a player tracked by this session's guard
    pub fn suspicion(&self, player_id: u32) -> f32 {
        self.guard.suspicion(player_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::delta::battle_state_map;
    use crate::sync::codec::{BattleStatus, BattleUpdate, CharacterState};
    use crate::sync::room::BattleRegistry;
    use serde_json::json;

    fn session(battle_id: u32) -> (SyncSession, tokio::sync::mpsc::UnboundedReceiver<SecurityEvent>) {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let session = SyncSession::new(
            Uuid::new_v4(),
            1,
            battle_id,
            b"secret",
            RateTuning::default(),
            SecurityTuning::default(),
            events_tx,
        );
        (session, events_rx)
    }

    fn signed_state_envelope(session: &SyncSession, payload: &SyncPayload) -> Envelope {
        let mut envelope = Envelope::new(
            msg_type::BATTLE_UPDATE,
            serde_json::to_value(payload).unwrap(),
        );
        session.guard.seal(&mut envelope);
        envelope
    }

    fn update(health: i32) -> BattleUpdate {
        BattleUpdate {
            battle_id: 9,
            status: BattleStatus::Active,
            time_remaining: 30.0,
            characters: vec![CharacterState {
                character_id: 1,
                current_health: health,
                position: [0.0, 0.0, 0.0],
                rotation: [0.0, 0.0, 0.0],
                current_animation: "idle".to_string(),
                status_effects: Vec::new(),
            }],
            custom_data: Default::default(),
        }
    }

    #[test]
    fn validated_state_reaches_the_room() {
        let registry = BattleRegistry::new();
        let room = registry.join(9);
        let mut events_rx = room.subscribe();
        let (mut session, _security_rx) = session(9);

        let state = battle_state_map(&update(80));
        let payload = SyncPayload {
            is_delta: false,
            state: state.clone(),
        };
        let replies = session.handle_inbound(signed_state_envelope(&session, &payload), &room);
        assert!(replies.is_empty());

        match events_rx.try_recv().unwrap() {
            RoomEvent::State { state: got, .. } => assert_eq!(got, state),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unsigned_state_is_dropped() {
        let registry = BattleRegistry::new();
        let room = registry.join(9);
        let mut events_rx = room.subscribe();
        let (mut session, _security_rx) = session(9);

        let payload = SyncPayload {
            is_delta: false,
            state: battle_state_map(&update(80)),
        };
        let envelope = Envelope::new(
            msg_type::BATTLE_UPDATE,
            serde_json::to_value(&payload).unwrap(),
        );
        session.handle_inbound(envelope, &room);
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn delta_without_base_is_a_quiet_no_op() {
        let registry = BattleRegistry::new();
        let room = registry.join(9);
        let mut events_rx = room.subscribe();
        let (mut session, _security_rx) = session(9);

        let payload = SyncPayload {
            is_delta: true,
            state: battle_state_map(&update(80)),
        };
        session.handle_inbound(signed_state_envelope(&session, &payload), &room);
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn peer_state_flushes_as_signed_payload() {
        let (mut session, _security_rx) = session(9);

        let state = battle_state_map(&update(80));
        session.on_room_event(RoomEvent::State {
            origin: Uuid::new_v4(),
            channel_id: msg_type::BATTLE_UPDATE.to_string(),
            state: state.clone(),
            timestamp: 1_000,
        });

        let out = session.tick();
        let state_envelope = out
            .iter()
            .find(|e| e.msg_type == msg_type::BATTLE_UPDATE)
            .expect("pending state flushed");
        assert!(state_envelope.signature.is_some());
        assert!(state_envelope.nonce.is_some());

        let payload: SyncPayload =
            serde_json::from_value(state_envelope.data.clone()).unwrap();
        assert!(!payload.is_delta);
        assert_eq!(payload.state, state);
    }

    #[test]
    fn own_events_are_not_echoed_back() {
        let (mut session, _security_rx) = session(9);
        let own = session.session_id();

        session.on_room_event(RoomEvent::State {
            origin: own,
            channel_id: msg_type::BATTLE_UPDATE.to_string(),
            state: battle_state_map(&update(80)),
            timestamp: 1_000,
        });
        let replies = session.on_room_event(RoomEvent::Action {
            origin: own,
            data: json!({"action": "ability", "player_id": 1, "name": "x"}),
        });

        assert!(replies.is_empty());
        let out = session.tick();
        assert!(out.iter().all(|e| e.msg_type != msg_type::BATTLE_UPDATE));
    }

    #[test]
    fn matching_action_is_relayed() {
        let registry = BattleRegistry::new();
        let room = registry.join(9);
        let mut events_rx = room.subscribe();
        let (mut session, _security_rx) = session(9);

        let mut envelope = Envelope::new(
            msg_type::PLAYER_ACTION,
            json!({"action": "ability", "player_id": 1, "name": "fireball"}),
        );
        session.guard.seal(&mut envelope);
        session.handle_inbound(envelope, &room);

        assert!(matches!(
            events_rx.try_recv(),
            Ok(RoomEvent::Action { .. })
        ));
    }

    #[test]
    fn spoofed_player_id_is_dropped_with_violation() {
        let registry = BattleRegistry::new();
        let room = registry.join(9);
        let mut events_rx = room.subscribe();
        let (mut session, mut security_rx) = session(9);

        let mut envelope = Envelope::new(
            msg_type::PLAYER_ACTION,
            json!({"action": "ability", "player_id": 99, "name": "fireball"}),
        );
        session.guard.seal(&mut envelope);
        session.handle_inbound(envelope, &room);

        assert!(events_rx.try_recv().is_err());
        assert!(matches!(
            security_rx.try_recv(),
            Ok(SecurityEvent::SecurityViolation { .. })
        ));
    }

    #[test]
    fn ping_goes_out_on_first_tick_and_pong_is_answered() {
        let registry = BattleRegistry::new();
        let room = registry.join(9);
        let (mut session, _security_rx) = session(9);

        let out = session.tick();
        assert!(out.iter().any(|e| e.msg_type == msg_type::PING));

        let ping = Envelope::new(msg_type::PING, json!({"t": 123}));
        let replies = session.handle_inbound(ping, &room);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msg_type, msg_type::PONG);
        assert_eq!(replies[0].data, json!({"t": 123}));
    }
}
