//! Battle rooms and the validated-state bus
//!
//! A room is the fan-out point for one battle: validated, reconstructed
//! full states and relayed actions are republished on a broadcast bus, and
//! every other session re-optimizes them against its own channel history
//! before sending. The room also owns the battle's interpolation buffer,
//! which feeds the spectator view endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use super::interpolation::InterpolationBuffer;

/// An event republished to a battle's participants
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A reconstructed full channel state from one session
    State {
        origin: Uuid,
        channel_id: String,
        state: Map<String, Value>,
        timestamp: u64,
    },
    /// A validated player action to relay
    Action {
        origin: Uuid,
        data: Value,
    },
}

/// Handle to a running battle room
#[derive(Clone)]
pub struct BattleHandle {
    pub battle_id: u32,
    pub events_tx: broadcast::Sender<RoomEvent>,
    participant_count: Arc<AtomicUsize>,
    /// Render-only view of the battle, per channel
    view: Arc<RwLock<InterpolationBuffer>>,
}

impl BattleHandle {
    fn new(battle_id: u32) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            battle_id,
            events_tx,
            participant_count: Arc::new(AtomicUsize::new(0)),
            view: Arc::new(RwLock::new(InterpolationBuffer::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events_tx.subscribe()
    }

    pub fn participant_count(&self) -> usize {
        self.participant_count.load(Ordering::Relaxed)
    }

    /// Publish an event to all participants (including the origin, which
    /// filters on its own session id)
    pub fn publish(&self, event: RoomEvent) {
        if let RoomEvent::State {
            channel_id,
            state,
            timestamp,
            ..
        } = &event
        {
            self.view
                .write()
                .store(channel_id, state.clone(), *timestamp as f64);
        }
        let _ = self.events_tx.send(event);
    }

    /// Smoothed render-only state of one channel at `render_time`
    pub fn view_at(&self, channel_id: &str, render_time: f64) -> Option<Map<String, Value>> {
        self.view.read().query(channel_id, render_time)
    }
}

/// Registry of all active battle rooms
pub struct BattleRegistry {
    battles: DashMap<u32, BattleHandle>,
}

impl BattleRegistry {
    pub fn new() -> Self {
        Self {
            battles: DashMap::new(),
        }
    }

    /// Join a battle, creating the room lazily on first use
    pub fn join(&self, battle_id: u32) -> BattleHandle {
        let handle = self
            .battles
            .entry(battle_id)
            .or_insert_with(|| {
                info!(battle_id, "creating battle room");
                BattleHandle::new(battle_id)
            })
            .clone();
        handle.participant_count.fetch_add(1, Ordering::Relaxed);
        handle
    }

    /// Leave a battle; the room is dropped with its last participant
    pub fn leave(&self, battle_id: u32) {
        let remove = if let Some(handle) = self.battles.get(&battle_id) {
            handle.participant_count.fetch_sub(1, Ordering::Relaxed) == 1
        } else {
            false
        };
        if remove {
            info!(battle_id, "last participant left, dropping battle room");
            self.battles.remove(&battle_id);
        }
    }

    pub fn get(&self, battle_id: u32) -> Option<BattleHandle> {
        self.battles.get(&battle_id).map(|h| h.value().clone())
    }

    pub fn active_battles(&self) -> usize {
        self.battles.len()
    }

    pub fn total_participants(&self) -> usize {
        self.battles
            .iter()
            .map(|b| b.value().participant_count())
            .sum()
    }
}

impl Default for BattleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rooms_are_created_lazily_and_dropped_when_empty() {
        let registry = BattleRegistry::new();
        assert_eq!(registry.active_battles(), 0);

        let a = registry.join(7);
        let _b = registry.join(7);
        assert_eq!(registry.active_battles(), 1);
        assert_eq!(a.participant_count(), 2);

        registry.leave(7);
        assert!(registry.get(7).is_some());
        registry.leave(7);
        assert!(registry.get(7).is_none());
    }

    #[test]
    fn published_states_reach_subscribers_and_the_view() {
        let registry = BattleRegistry::new();
        let handle = registry.join(1);
        let mut events_rx = handle.subscribe();

        let state = match json!({"battle": "1/active/10.0"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        handle.publish(RoomEvent::State {
            origin: Uuid::new_v4(),
            channel_id: "battle_update".to_string(),
            state: state.clone(),
            timestamp: 1_000,
        });

        match events_rx.try_recv().unwrap() {
            RoomEvent::State { state: got, .. } => assert_eq!(got, state),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(handle.view_at("battle_update", 2_000.0).unwrap(), state);
    }

    #[tokio::test]
    async fn events_cross_task_boundaries() {
        let registry = BattleRegistry::new();
        let handle = registry.join(2);
        let mut events_rx = handle.subscribe();

        let publisher = handle.clone();
        tokio::spawn(async move {
            publisher.publish(RoomEvent::Action {
                origin: Uuid::new_v4(),
                data: json!({"action": "ability", "player_id": 1, "name": "shield"}),
            });
        });

        match events_rx.recv().await.unwrap() {
            RoomEvent::Action { data, .. } => {
                assert_eq!(data["name"], json!("shield"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
