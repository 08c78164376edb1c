//! Per-user consent event broadcast.
//!
//! The workflow emits a [`ConsentEvent`] on every transition; this hub fans
//! each event out to the owner's subscribers (SSE streams, mostly). Channels
//! are `tokio::sync::broadcast`, so a slow consumer that lags simply misses
//! intermediate events — delivery is at-least-once for live consumers and
//! the ledger remains the source of truth for reconciliation.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::trace;

use hushvault_core::workflow::{ConsentEvent, ConsentNotifier};

/// Buffered events per user channel before laggards start missing them.
const CHANNEL_CAPACITY: usize = 64;

/// Routes consent events to per-user broadcast channels.
pub struct EventHub {
    channels: RwLock<HashMap<String, broadcast::Sender<ConsentEvent>>>,
}

impl EventHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to a user's events, creating the channel if needed.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<ConsentEvent> {
        let mut channels = lock_write(&self.channels);
        channels
            .entry(user_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// How many live subscribers a user currently has.
    pub fn subscriber_count(&self, user_id: &str) -> usize {
        lock_read(&self.channels)
            .get(user_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

impl ConsentNotifier for EventHub {
    fn notify(&self, event: ConsentEvent) {
        let mut channels = lock_write(&self.channels);
        let Some(sender) = channels.get(&event.user_id) else {
            trace!(user_id = %event.user_id, "no subscribers, event dropped");
            return;
        };

        if sender.receiver_count() == 0 {
            // Last subscriber went away; drop the channel instead of
            // buffering into the void.
            channels.remove(&event.user_id);
            return;
        }

        let _ = sender.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub").finish_non_exhaustive()
    }
}

// A poisoned lock means a panic mid-insert; the map itself is still a valid
// HashMap, so continuing with it is sound.
fn lock_read<'a, T>(lock: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_write<'a, T>(lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
