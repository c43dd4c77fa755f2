use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::broadcast;

use crate::models::BroadcastEvent;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_RECENT_CAPACITY: usize = 100;

/// Sink for client-facing notifications. Emitting never fails the caller.
pub trait Broadcaster: Send + Sync {
    fn emit(&self, event: BroadcastEvent);
}

/// In-process fan-out of [`BroadcastEvent`]s with a short replay buffer.
pub struct EventBus {
    sender: broadcast::Sender<BroadcastEvent>,
    recent: Mutex<VecDeque<BroadcastEvent>>,
    recent_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY, DEFAULT_RECENT_CAPACITY)
    }

    pub fn with_capacity(channel_capacity: usize, recent_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            recent: Mutex::new(VecDeque::with_capacity(recent_capacity)),
            recent_capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<BroadcastEvent> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster for EventBus {
    fn emit(&self, event: BroadcastEvent) {
        tracing::debug!(
            event = event.name(),
            request_id = event.request_id(),
            "Broadcasting event"
        );

        {
            let mut recent = self.recent.lock();
            if self.recent_capacity > 0 {
                if recent.len() == self.recent_capacity {
                    recent.pop_front();
                }
                recent.push_back(event.clone());
            }
        }

        // no subscribers is not an error
        let _ = self.sender.send(event);
    }
}
