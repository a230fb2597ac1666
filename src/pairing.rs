//! Pairing identifier persistence and connection addressing.
//!
//! Both logical peers are addressed through the same relay session by a
//! stable pairing identifier. The identifier survives restarts through an
//! injected key-value store; the per-connection nonce does not.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use uuid::Uuid;

/// Storage key under which the pairing identifier is kept.
pub const PAIRING_KEY: &str = "syncStageObjectId";

/// Key-value accessor for the persisted pairing identifier.
pub trait PairingStore: Send + Sync + Debug {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// Process-local store. Pairing is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryPairingStore {
    values: Mutex<HashMap<String, String>>,
}

impl PairingStore for MemoryPairingStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
    }
}

/// Returns the stored pairing identifier, generating and storing one if absent.
pub fn pairing_id(store: &dyn PairingStore) -> String {
    if let Some(existing) = store.get(PAIRING_KEY).filter(|id| !id.is_empty()) {
        return existing;
    }
    let generated = Uuid::new_v4().to_string();
    store.set(PAIRING_KEY, &generated);
    generated
}

/// Builds the address for one connection attempt.
///
/// The `websocketId` nonce is regenerated on every call so the relay can tell
/// a reconnect apart from a stale socket it has not yet reaped.
pub fn connection_url(base: &str, pairing_id: &str) -> String {
    let base = base.trim_end();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!(
        "{base}{separator}{PAIRING_KEY}={pairing_id}&websocketId={}",
        Uuid::new_v4()
    )
}
