//! Typing presence with per-key expiry timers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::models::TypingSignal;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Inactivity after which a typing signal expires
    pub typing_timeout: Duration,
    /// Period of the consistency sweep
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_timeout: Duration::from_millis(3000),
            sweep_interval: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TypingKey {
    user_id: String,
    conversation_id: String,
}

impl TypingKey {
    fn new(user_id: &str, conversation_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
        }
    }
}

struct LiveSignal {
    signal: TypingSignal,
    armed_at: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

struct PresenceInner {
    config: PresenceConfig,
    runtime: Handle,
    signals: Mutex<HashMap<TypingKey, LiveSignal>>,
    generation: AtomicU64,
}

impl PresenceInner {
    /// Timer callback: removes the entry only if it was not re-armed since
    fn expire(&self, key: &TypingKey, generation: u64) {
        let mut signals = self.signals.lock();
        if signals.get(key).map(|s| s.generation) == Some(generation) {
            signals.remove(key);
            log::debug!(
                "Typing expired: user={}, conversation={}",
                key.user_id,
                key.conversation_id
            );
        }
    }

    fn sweep(&self) -> usize {
        let timeout = self.config.typing_timeout;
        let mut signals = self.signals.lock();
        let before = signals.len();
        signals.retain(|_, live| {
            let keep = live.armed_at.elapsed() < timeout;
            if !keep {
                live.timer.abort();
            }
            keep
        });
        before - signals.len()
    }
}

/// Registry of who is typing where.
///
/// Each (user, conversation) pair holds at most one signal and one armed
/// expiry timer. Dropping the registry cancels every timer.
pub struct PresenceRegistry {
    inner: Arc<PresenceInner>,
    sweeper: JoinHandle<()>,
}

impl PresenceRegistry {
    /// Must be called from within a Tokio runtime.
    pub fn new(config: PresenceConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let inner = Arc::new(PresenceInner {
            config,
            runtime,
            signals: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        });

        let sweeper = spawn_sweeper(&inner);

        Ok(Self { inner, sweeper })
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.inner.config
    }

    pub fn start_typing(&self, user_id: &str, display_name: &str, conversation_id: &str) {
        if user_id.is_empty() || display_name.is_empty() || conversation_id.is_empty() {
            log::warn!(
                "Invalid typing parameters: user_id={:?}, display_name={:?}, conversation_id={:?}",
                user_id,
                display_name,
                conversation_id
            );
            return;
        }

        let key = TypingKey::new(user_id, conversation_id);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);

        // Arm and swap under the lock so the old timer is aborted before
        // anyone can observe the new entry.
        let mut signals = self.inner.signals.lock();
        let armed_at = Instant::now();
        let deadline = armed_at + self.inner.config.typing_timeout;
        let timer = self.arm_timer(key.clone(), generation, deadline);
        let live = LiveSignal {
            signal: TypingSignal {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                conversation_id: conversation_id.to_string(),
                started_at: Utc::now(),
            },
            armed_at,
            generation,
            timer,
        };

        if let Some(previous) = signals.insert(key, live) {
            previous.timer.abort();
        }
    }

    pub fn stop_typing(&self, user_id: &str, conversation_id: &str) {
        if user_id.is_empty() || conversation_id.is_empty() {
            return;
        }

        let key = TypingKey::new(user_id, conversation_id);
        if let Some(live) = self.inner.signals.lock().remove(&key) {
            live.timer.abort();
        }
    }

    /// Live signals of a conversation, least recently armed first.
    ///
    /// Entries past the timeout are filtered out even if their timer has
    /// not fired yet.
    pub fn get_typing_users(&self, conversation_id: &str) -> Vec<TypingSignal> {
        if conversation_id.is_empty() {
            return Vec::new();
        }

        let timeout = self.inner.config.typing_timeout;
        let signals = self.inner.signals.lock();
        let mut live: Vec<&LiveSignal> = signals
            .values()
            .filter(|live| live.signal.conversation_id == conversation_id)
            .filter(|live| live.armed_at.elapsed() < timeout)
            .collect();
        live.sort_by(|a, b| {
            a.armed_at
                .cmp(&b.armed_at)
                .then_with(|| a.signal.user_id.cmp(&b.signal.user_id))
        });
        live.into_iter().map(|l| l.signal.clone()).collect()
    }

    pub fn is_typing(&self, user_id: &str, conversation_id: &str) -> bool {
        self.get_typing_users(conversation_id)
            .iter()
            .any(|s| s.user_id == user_id)
    }

    /// Drops every signal of a conversation, e.g. on navigation away
    pub fn clear_conversation(&self, conversation_id: &str) {
        if conversation_id.is_empty() {
            return;
        }

        self.inner.signals.lock().retain(|key, live| {
            let keep = key.conversation_id != conversation_id;
            if !keep {
                live.timer.abort();
            }
            keep
        });
    }

    /// Number of stored signals, expired-but-unswept ones included
    pub fn live_signal_count(&self) -> usize {
        self.inner.signals.lock().len()
    }

    /// Runs the consistency sweep immediately; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep()
    }

    fn arm_timer(&self, key: TypingKey, generation: u64, deadline: Instant) -> JoinHandle<()> {
        let weak: Weak<PresenceInner> = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&key, generation);
            }
        })
    }
}

fn spawn_sweeper(inner: &Arc<PresenceInner>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let period = inner.config.sweep_interval;
    inner.runtime.spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let removed = inner.sweep();
            if removed > 0 {
                log::debug!("Typing sweep removed {} stale signals", removed);
            }
        }
    })
}

impl Drop for PresenceRegistry {
    fn drop(&mut self) {
        self.sweeper.abort();
        for (_, live) in self.inner.signals.lock().drain() {
            live.timer.abort();
        }
    }
}
