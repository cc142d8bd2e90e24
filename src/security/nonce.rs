//! Single-use nonce registry for replay protection

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

/// Nonce uniqueness window
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(60);

/// Registry of recently-seen nonces.
///
/// Uniqueness is enforced only within the TTL window; an entry older than
/// the TTL is treated as expired even before the next sweep runs.
#[derive(Debug)]
pub struct NonceRegistry {
    seen: HashMap<String, u64>,
    ttl_ms: u64,
}

impl NonceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    /// Record a nonce. Returns false when the nonce was already seen within
    /// the TTL window (a replay); true when it is fresh.
    pub fn observe(&mut self, nonce: &str, now_ms: u64) -> bool {
        match self.seen.get(nonce) {
            Some(&first_seen) if now_ms.saturating_sub(first_seen) < self.ttl_ms => false,
            _ => {
                self.seen.insert(nonce.to_string(), now_ms);
                true
            }
        }
    }

    /// Evict entries older than the TTL
    pub fn sweep(&mut self, now_ms: u64) {
        let ttl_ms = self.ttl_ms;
        self.seen
            .retain(|_, first_seen| now_ms.saturating_sub(*first_seen) < ttl_ms);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Generate a random outbound nonce (128 bits, hex)
pub fn generate() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
