//! Snapshot interpolation buffer
//!
//! Smooths discretely-received channel states against a caller-supplied
//! render time, masking network jitter and out-of-order arrival. Query
//! output is render-only; it is never fed back as authoritative state.

use std::collections::{HashMap, VecDeque};

use serde_json::{Map, Number, Value};

/// Default per-channel snapshot capacity
pub const DEFAULT_CAPACITY: usize = 10;

/// One buffered snapshot
#[derive(Debug, Clone)]
struct TimedState {
    state: Map<String, Value>,
    timestamp: f64,
}

/// Per-channel bounded ring of timestamped snapshots.
///
/// Entries are kept in arrival order, which after network reordering is not
/// necessarily time order; queries scan rather than binary-search.
#[derive(Debug)]
pub struct InterpolationBuffer {
    channels: HashMap<String, VecDeque<TimedState>>,
    capacity: usize,
}

impl InterpolationBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a snapshot to the channel's ring, evicting the oldest entry
    /// once capacity is exceeded
    pub fn store(&mut self, channel_id: &str, state: Map<String, Value>, timestamp: f64) {
        let ring = self
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(VecDeque::new);
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(TimedState { state, timestamp });
    }

    /// Smoothed state for `render_time`.
    ///
    /// Picks the latest snapshot at or before the render time and the
    /// earliest one after it. With only one side available that snapshot is
    /// returned unmodified (no extrapolation); with both, fields blend
    /// recursively at the normalized position between the two timestamps.
    pub fn query(&self, channel_id: &str, render_time: f64) -> Option<Map<String, Value>> {
        let ring = self.channels.get(channel_id)?;

        let mut before: Option<&TimedState> = None;
        let mut after: Option<&TimedState> = None;
        for entry in ring {
            if entry.timestamp <= render_time {
                if before.map_or(true, |b| entry.timestamp > b.timestamp) {
                    before = Some(entry);
                }
            } else if after.map_or(true, |a| entry.timestamp < a.timestamp) {
                after = Some(entry);
            }
        }

        match (before, after) {
            (None, None) => None,
            (Some(only), None) | (None, Some(only)) => Some(only.state.clone()),
            (Some(before), Some(after)) => {
                let span = after.timestamp - before.timestamp;
                let t = if span > 0.0 {
                    (((render_time - before.timestamp) / span) as f32).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                Some(blend_map(&before.state, &after.state, t))
            }
        }
    }

    /// Number of buffered snapshots for a channel
    pub fn len(&self, channel_id: &str) -> usize {
        self.channels.get(channel_id).map_or(0, VecDeque::len)
    }

    /// Drop a channel's ring (disconnect cleanup)
    pub fn forget_channel(&mut self, channel_id: &str) {
        self.channels.remove(channel_id);
    }
}

impl Default for InterpolationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn blend_map(before: &Map<String, Value>, after: &Map<String, Value>, t: f32) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, after_value) in after {
        let blended = match before.get(key) {
            Some(before_value) => blend_value(before_value, after_value, t),
            None => after_value.clone(),
        };
        out.insert(key.clone(), blended);
    }
    out
}

/// Blend one field: 3-number arrays lerp per axis, 4-number arrays slerp as
/// quaternions, scalars lerp, everything else snaps to the newer value.
fn blend_value(before: &Value, after: &Value, t: f32) -> Value {
    match (before, after) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return after.clone(),
            };
            number_value(a + (b - a) * t as f64)
        }
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            if let (Some(from), Some(to)) = (as_floats(a), as_floats(b)) {
                match from.len() {
                    3 => Value::Array(
                        from.iter()
                            .zip(&to)
                            .map(|(a, b)| number_value(a + (b - a) * t as f64))
                            .collect(),
                    ),
                    4 => {
                        let q = slerp(
                            [from[0], from[1], from[2], from[3]],
                            [to[0], to[1], to[2], to[3]],
                            t as f64,
                        );
                        Value::Array(q.iter().map(|v| number_value(*v)).collect())
                    }
                    _ => after.clone(),
                }
            } else {
                after.clone()
            }
        }
        (Value::Object(a), Value::Object(b)) => Value::Object(blend_map(a, b, t)),
        _ => after.clone(),
    }
}

fn as_floats(values: &[Value]) -> Option<Vec<f64>> {
    values.iter().map(Value::as_f64).collect()
}

fn number_value(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

/// Shortest-path spherical interpolation between two quaternions [x,y,z,w]
fn slerp(a: [f64; 4], mut b: [f64; 4], t: f64) -> [f64; 4] {
    let mut dot: f64 = a.iter().zip(&b).map(|(x, y)| x * y).sum();

    // Take the short way around
    if dot < 0.0 {
        for component in &mut b {
            *component = -*component;
        }
        dot = -dot;
    }

    // Nearly parallel: fall back to normalized lerp
    let (wa, wb) = if dot > 0.9995 {
        (1.0 - t, t)
    } else {
        let theta = dot.clamp(-1.0, 1.0).acos();
        let sin_theta = theta.sin();
        (
            ((1.0 - t) * theta).sin() / sin_theta,
            (t * theta).sin() / sin_theta,
        )
    };

    let mut out = [0.0; 4];
    for i in 0..4 {
        out[i] = a[i] * wa + b[i] * wb;
    }
    let norm = out.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for component in &mut out {
            *component /= norm;
        }
    }
    out
}
