//! Call lifecycle: one current-call slot and one incoming-call slot

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::models::{CallSession, CallSnapshot, CallStatus, CallType, IncomingCallOffer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// When set, a connecting call turns active after this delay without
    /// waiting for the signaling acknowledgment.
    pub simulated_handshake: Option<Duration>,
    /// How long an ended call stays visible before the slot is cleared
    pub clear_grace: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            simulated_handshake: None,
            clear_grace: Duration::from_millis(1000),
        }
    }
}

struct Slot {
    session: CallSession,
    clock: Instant,
    timer: Option<JoinHandle<()>>,
}

impl Slot {
    fn new(session: CallSession, timer: Option<JoinHandle<()>>) -> Self {
        Self {
            session,
            clock: Instant::now(),
            timer,
        }
    }

    fn is_live(&self) -> bool {
        self.session.status.is_live()
    }

    fn rearm(&mut self, timer: Option<JoinHandle<()>>) {
        if let Some(old) = std::mem::replace(&mut self.timer, timer) {
            old.abort();
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct CallSlots {
    current: Option<Slot>,
    incoming: Option<CallSession>,
}

impl CallSlots {
    fn has_live_call(&self) -> bool {
        self.current.as_ref().map(Slot::is_live).unwrap_or(false)
    }

    fn live_mut(&mut self) -> Option<&mut Slot> {
        self.current.as_mut().filter(|slot| slot.is_live())
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            current: self.current.as_ref().map(|slot| slot.session.clone()),
            incoming: self.incoming.clone(),
        }
    }
}

struct CallInner {
    config: CallConfig,
    runtime: Handle,
    slots: Mutex<CallSlots>,
    updates: watch::Sender<CallSnapshot>,
}

impl CallInner {
    fn publish(&self, slots: &CallSlots) {
        self.updates.send_replace(slots.snapshot());
    }

    fn activate(&self, call_id: &str) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.current.as_mut() else {
            return false;
        };
        if slot.session.id != call_id || slot.session.status != CallStatus::Connecting {
            return false;
        }

        slot.session.status = CallStatus::Active;
        slot.rearm(None);
        log::info!("Call {} active with {}", call_id, slot.session.counterparty_id);
        self.publish(&slots);
        true
    }

    fn clear_ended(&self, call_id: &str) {
        let mut slots = self.slots.lock();
        let ended = slots
            .current
            .as_ref()
            .map(|slot| slot.session.id == call_id && slot.session.status == CallStatus::Ended)
            .unwrap_or(false);
        if ended {
            slots.current = None;
            log::debug!("Call {} cleared", call_id);
            self.publish(&slots);
        }
    }
}

/// Tracks the current call and a pending inbound offer.
///
/// At most one call is connecting or active at a time. Timer callbacks
/// check the call id and status under the same lock as direct calls, so a
/// stale timer never touches a newer call.
pub struct CallManager {
    inner: Arc<CallInner>,
}

impl CallManager {
    /// Must be called from within a Tokio runtime.
    pub fn new(config: CallConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (updates, _) = watch::channel(CallSnapshot::default());

        Ok(Self {
            inner: Arc::new(CallInner {
                config,
                runtime,
                slots: Mutex::new(CallSlots::default()),
                updates,
            }),
        })
    }

    pub fn start_call(
        &self,
        call_type: CallType,
        counterparty_name: &str,
        counterparty_id: &str,
    ) -> Result<CallSession> {
        let mut slots = self.inner.slots.lock();
        if slots.has_live_call() {
            log::info!("Rejected call to {}: a call is in progress", counterparty_id);
            return Err(Error::CallInProgress);
        }

        if let Some(offer) = slots.incoming.take() {
            log::info!("Dropping ringing call {} for outgoing call", offer.id);
        }

        let session = CallSession {
            id: uuid::Uuid::new_v4().to_string(),
            call_type,
            counterparty_id: counterparty_id.to_string(),
            counterparty_name: counterparty_name.to_string(),
            status: CallStatus::Connecting,
            started_at: Utc::now(),
            duration_secs: None,
            is_muted: false,
            is_video_enabled: call_type == CallType::Video,
            is_screen_sharing: false,
        };

        let timer = self
            .inner
            .config
            .simulated_handshake
            .map(|delay| self.spawn_handshake(session.id.clone(), delay));

        slots.current = Some(Slot::new(session.clone(), timer));
        log::info!("Call {} connecting to {}", session.id, counterparty_id);
        self.inner.publish(&slots);

        Ok(session)
    }

    /// Signaling acknowledgment: the remote side answered our call
    pub fn on_call_answered(&self, call_id: &str) -> bool {
        self.inner.activate(call_id)
    }

    pub fn end_call(&self) -> Option<CallSession> {
        let mut slots = self.inner.slots.lock();
        let ended = self.end_locked(&mut slots);
        if ended.is_some() {
            self.inner.publish(&slots);
        }
        ended
    }

    /// Remote side hung up or withdrew its offer
    pub fn on_remote_hangup(&self, call_id: &str) -> bool {
        let mut slots = self.inner.slots.lock();

        if slots.incoming.as_ref().map(|c| c.id == call_id).unwrap_or(false) {
            slots.incoming = None;
            self.inner.publish(&slots);
            return true;
        }

        let is_current = slots
            .current
            .as_ref()
            .map(|slot| slot.session.id == call_id && slot.is_live())
            .unwrap_or(false);
        if is_current && self.end_locked(&mut slots).is_some() {
            self.inner.publish(&slots);
            return true;
        }

        false
    }

    pub fn toggle_mute(&self) -> Option<bool> {
        self.toggle(|call| &mut call.is_muted)
    }

    pub fn toggle_video(&self) -> Option<bool> {
        self.toggle(|call| &mut call.is_video_enabled)
    }

    pub fn toggle_screen_share(&self) -> Option<bool> {
        self.toggle(|call| &mut call.is_screen_sharing)
    }

    /// Places an inbound offer in the incoming slot as `ringing`
    pub fn receive_incoming(&self, offer: IncomingCallOffer) -> Result<CallSession> {
        let mut slots = self.inner.slots.lock();
        if slots.has_live_call() || slots.incoming.is_some() {
            log::info!(
                "Busy: rejecting incoming call {} from {}",
                offer.call_id,
                offer.counterparty_id
            );
            return Err(Error::CallInProgress);
        }

        let session = CallSession {
            id: offer.call_id,
            call_type: offer.call_type,
            counterparty_id: offer.counterparty_id,
            counterparty_name: offer.counterparty_name,
            status: CallStatus::Ringing,
            started_at: Utc::now(),
            duration_secs: None,
            is_muted: false,
            is_video_enabled: offer.call_type == CallType::Video,
            is_screen_sharing: false,
        };

        slots.incoming = Some(session.clone());
        self.inner.publish(&slots);
        Ok(session)
    }

    pub fn accept_call(&self) -> Option<CallSession> {
        let mut slots = self.inner.slots.lock();
        if slots.has_live_call() {
            return None;
        }

        let mut session = slots.incoming.take()?;
        session.status = CallStatus::Active;
        session.started_at = Utc::now();

        slots.current = Some(Slot::new(session.clone(), None));
        log::info!("Call {} accepted from {}", session.id, session.counterparty_id);
        self.inner.publish(&slots);
        Some(session)
    }

    pub fn reject_call(&self) -> Option<CallSession> {
        let mut slots = self.inner.slots.lock();
        let rejected = slots.incoming.take();
        if rejected.is_some() {
            self.inner.publish(&slots);
        }
        rejected
    }

    pub fn current_call(&self) -> Option<CallSession> {
        self.inner
            .slots
            .lock()
            .current
            .as_ref()
            .map(|slot| slot.session.clone())
    }

    pub fn incoming_call(&self) -> Option<CallSession> {
        self.inner.slots.lock().incoming.clone()
    }

    pub fn is_in_call(&self) -> bool {
        self.current_call()
            .map(|call| call.status == CallStatus::Active)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.slots.lock().snapshot()
    }

    /// Receives every state change, timer-driven ones included
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.updates.subscribe()
    }

    fn end_locked(&self, slots: &mut CallSlots) -> Option<CallSession> {
        let grace = self.inner.config.clear_grace;
        let slot = slots.live_mut()?;

        slot.session.status = CallStatus::Ended;
        slot.session.duration_secs = Some(slot.clock.elapsed().as_secs());
        let call_id = slot.session.id.clone();
        slot.rearm(Some(self.spawn_clear(call_id.clone(), grace)));

        log::info!(
            "Call {} ended after {}s",
            call_id,
            slot.session.duration_secs.unwrap_or_default()
        );
        Some(slot.session.clone())
    }

    fn toggle(&self, field: impl FnOnce(&mut CallSession) -> &mut bool) -> Option<bool> {
        let mut slots = self.inner.slots.lock();
        let slot = slots.live_mut()?;
        let flag = field(&mut slot.session);
        *flag = !*flag;
        let value = *flag;
        self.inner.publish(&slots);
        Some(value)
    }

    fn spawn_handshake(&self, call_id: String, delay: Duration) -> JoinHandle<()> {
        let weak: Weak<CallInner> = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.activate(&call_id);
            }
        })
    }

    fn spawn_clear(&self, call_id: String, grace: Duration) -> JoinHandle<()> {
        let weak: Weak<CallInner> = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                inner.clear_ended(&call_id);
            }
        })
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        let mut slots = self.inner.slots.lock();
        slots.current = None;
        slots.incoming = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated() -> CallManager {
        CallManager::new(CallConfig {
            simulated_handshake: Some(Duration::from_millis(2000)),
            clear_grace: Duration::from_millis(1000),
        })
        .unwrap()
    }

    fn offer(id: &str) -> IncomingCallOffer {
        IncomingCallOffer {
            call_id: id.to_string(),
            call_type: CallType::Audio,
            counterparty_id: "c-id".to_string(),
            counterparty_name: "Carol".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_call_lifecycle() {
        let calls = simulated();
        let call = calls.start_call(CallType::Video, "B", "b-id").unwrap();
        assert_eq!(call.status, CallStatus::Connecting);
        assert!(call.is_video_enabled);
        assert!(!calls.is_in_call());

        tokio::time::sleep(Duration::from_millis(2001)).await;
        assert_eq!(calls.current_call().unwrap().status, CallStatus::Active);
        assert!(calls.is_in_call());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let ended = calls.end_call().unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert_eq!(ended.duration_secs, Some(7));

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(calls.current_call().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let calls = simulated();
        let first = calls.start_call(CallType::Audio, "B", "b-id").unwrap();

        assert!(matches!(
            calls.start_call(CallType::Video, "C", "c-id"),
            Err(Error::CallInProgress)
        ));
        assert_eq!(calls.current_call().unwrap(), first);

        tokio::time::sleep(Duration::from_millis(2001)).await;
        assert!(calls.start_call(CallType::Video, "C", "c-id").is_err());
        assert_eq!(calls.current_call().unwrap().id, first.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_drives_activation_without_simulation() {
        let calls = CallManager::new(CallConfig::default()).unwrap();
        let call = calls.start_call(CallType::Audio, "B", "b-id").unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.current_call().unwrap().status, CallStatus::Connecting);

        assert!(!calls.on_call_answered("other"));
        assert!(calls.on_call_answered(&call.id));
        assert!(!calls.on_call_answered(&call.id));
        assert_eq!(calls.current_call().unwrap().status, CallStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_call_during_grace_is_not_cleared() {
        let calls = simulated();
        calls.start_call(CallType::Audio, "B", "b-id").unwrap();
        calls.end_call().unwrap();

        let next = calls.start_call(CallType::Audio, "C", "c-id").unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(calls.current_call().unwrap().id, next.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_require_a_call() {
        let calls = simulated();
        assert_eq!(calls.toggle_mute(), None);

        calls.start_call(CallType::Audio, "B", "b-id").unwrap();
        assert_eq!(calls.toggle_mute(), Some(true));
        assert_eq!(calls.toggle_mute(), Some(false));
        assert_eq!(calls.toggle_video(), Some(true));
        assert_eq!(calls.toggle_screen_share(), Some(true));

        calls.end_call();
        assert_eq!(calls.toggle_mute(), None);
        assert_eq!(calls.end_call(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_incoming_call() {
        let calls = simulated();
        assert!(calls.accept_call().is_none());

        let ringing = calls.receive_incoming(offer("in-1")).unwrap();
        assert_eq!(ringing.status, CallStatus::Ringing);

        let accepted = calls.accept_call().unwrap();
        assert_eq!(accepted.id, "in-1");
        assert_eq!(accepted.status, CallStatus::Active);
        assert!(calls.incoming_call().is_none());
        assert!(calls.is_in_call());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_incoming_call() {
        let calls = simulated();
        calls.receive_incoming(offer("in-1")).unwrap();

        assert_eq!(calls.reject_call().unwrap().id, "in-1");
        assert!(calls.incoming_call().is_none());
        assert!(calls.current_call().is_none());
        assert!(calls.reject_call().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_while_busy_is_rejected() {
        let calls = simulated();
        calls.start_call(CallType::Audio, "B", "b-id").unwrap();

        assert!(calls.receive_incoming(offer("in-1")).is_err());
        assert!(calls.incoming_call().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_hangup() {
        let calls = simulated();
        calls.receive_incoming(offer("in-1")).unwrap();
        assert!(calls.on_remote_hangup("in-1"));
        assert!(calls.incoming_call().is_none());

        let call = calls.start_call(CallType::Audio, "B", "b-id").unwrap();
        assert!(!calls.on_remote_hangup("unknown"));
        assert!(calls.on_remote_hangup(&call.id));
        assert_eq!(calls.current_call().unwrap().status, CallStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_timer_transitions() {
        let calls = simulated();
        let mut updates = calls.subscribe();
        calls.start_call(CallType::Audio, "B", "b-id").unwrap();
        updates.borrow_and_update();

        updates.changed().await.unwrap();
        let snapshot = updates.borrow_and_update().clone();
        assert_eq!(snapshot.current.unwrap().status, CallStatus::Active);
    }
}
