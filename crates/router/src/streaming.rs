//! Streaming-update coalescing for adapters without draft streams.
//!
//! Rapid partial-response events collapse into at most one outbound send
//! per debounce window per task. A final (non-streaming) update always
//! flushes immediately and can never be overtaken by a stale buffered
//! streaming flush.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

/// What the caller should do with an offered streaming update.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Offer {
    /// The window is open: send the text right away.
    SendNow,
    /// Arm a timer; after `delay`, call [`StreamCoalescer::fire`] with the
    /// given generation and send whatever it returns.
    Arm { delay: Duration, generation: u64 },
    /// A timer is already armed; the buffered text has been replaced.
    Buffered,
}

struct StreamBuffer {
    latest: String,
    armed: Option<u64>,
    last_sent_at: Option<Instant>,
}

/// Per-task debounce buffers.
pub(crate) struct StreamCoalescer {
    debounce: Duration,
    buffers: Mutex<HashMap<String, StreamBuffer>>,
    next_generation: AtomicU64,
}

impl StreamCoalescer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            buffers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Record a streaming update for `task_id` and decide how to deliver it.
    pub fn offer(&self, task_id: &str, text: &str) -> Offer {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = buffers.entry(task_id.to_string()).or_insert(StreamBuffer {
            latest: String::new(),
            armed: None,
            last_sent_at: None,
        });
        buffer.latest = text.to_string();

        if buffer.armed.is_some() {
            return Offer::Buffered;
        }

        let now = Instant::now();
        let elapsed = buffer.last_sent_at.map(|at| now.duration_since(at));
        match elapsed {
            Some(elapsed) if elapsed < self.debounce => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                buffer.armed = Some(generation);
                Offer::Arm {
                    delay: self.debounce - elapsed,
                    generation,
                }
            },
            _ => {
                buffer.last_sent_at = Some(now);
                Offer::SendNow
            },
        }
    }

    /// Timer callback: return the buffered text if this timer is still the
    /// one that was armed (a final update or cancellation wins otherwise).
    pub fn fire(&self, task_id: &str, generation: u64) -> Option<String> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = buffers.get_mut(task_id)?;
        if buffer.armed != Some(generation) {
            return None;
        }
        buffer.armed = None;
        buffer.last_sent_at = Some(Instant::now());
        Some(buffer.latest.clone())
    }

    /// Drop the buffer for a task, disarming any pending timer. Called
    /// before a final update is sent and when a task terminates.
    pub fn cancel(&self, task_id: &str) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.remove(task_id);
    }
}
