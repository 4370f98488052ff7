//! Session coordinator: one signed-in user's presence, receipts and calls

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::calls::CallManager;
use crate::error::Result;
use crate::models::{CallSession, CallStatus, IncomingCallOffer, TypingSignal};
use crate::presence::PresenceRegistry;
use crate::receipts::ReadReceiptTracker;
use crate::SessionConfig;

/// Events delivered to the session by the signaling layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    TypingStarted {
        user_id: String,
        display_name: String,
        conversation_id: String,
    },
    TypingStopped {
        user_id: String,
        conversation_id: String,
    },
    MessageReceived {
        conversation_id: String,
        message_id: String,
        sender_id: String,
    },
    IncomingCall(IncomingCallOffer),
    CallAnswered {
        call_id: String,
    },
    RemoteHangup {
        call_id: String,
    },
}

/// What the presentation layer renders for a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationView {
    pub conversation_id: String,
    pub typing_users: Vec<TypingSignal>,
    pub unread_count: usize,
    pub total_unread: usize,
    pub call_status: CallStatus,
    pub current_call: Option<CallSession>,
    pub incoming_call: Option<CallSession>,
}

impl ConversationView {
    /// "Alice is typing", "Alice and Bob are typing", "3 people are typing"
    pub fn typing_summary(&self) -> Option<String> {
        match self.typing_users.as_slice() {
            [] => None,
            [one] => Some(format!("{} is typing", one.display_name)),
            [a, b] => Some(format!("{} and {} are typing", a.display_name, b.display_name)),
            many => Some(format!("{} people are typing", many.len())),
        }
    }
}

pub struct SessionCoordinator {
    user_id: String,
    display_name: String,
    presence: PresenceRegistry,
    receipts: ReadReceiptTracker,
    calls: CallManager,
    open_conversation: Mutex<Option<String>>,
}

impl SessionCoordinator {
    /// Must be called from within a Tokio runtime.
    pub fn new(user_id: &str, display_name: &str, config: SessionConfig) -> Result<Self> {
        Ok(Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            presence: PresenceRegistry::new(config.presence)?,
            receipts: ReadReceiptTracker::new(),
            calls: CallManager::new(config.calls)?,
            open_conversation: Mutex::new(None),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn receipts(&self) -> &ReadReceiptTracker {
        &self.receipts
    }

    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    pub fn open_conversation_id(&self) -> Option<String> {
        self.open_conversation.lock().clone()
    }

    /// Navigates to a conversation: typing state of the previous one is
    /// dropped and everything known in the new one becomes read.
    pub fn open_conversation(&self, conversation_id: &str) {
        let previous = self
            .open_conversation
            .lock()
            .replace(conversation_id.to_string());

        if let Some(previous) = previous.filter(|p| p != conversation_id) {
            self.presence.clear_conversation(&previous);
        }
        self.receipts.mark_conversation_as_read(conversation_id);
    }

    pub fn leave_conversation(&self) {
        if let Some(previous) = self.open_conversation.lock().take() {
            self.presence.clear_conversation(&previous);
        }
    }

    pub fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::TypingStarted {
                user_id,
                display_name,
                conversation_id,
            } => {
                if user_id != self.user_id {
                    self.presence
                        .start_typing(&user_id, &display_name, &conversation_id);
                }
            }

            SessionEvent::TypingStopped {
                user_id,
                conversation_id,
            } => {
                self.presence.stop_typing(&user_id, &conversation_id);
            }

            SessionEvent::MessageReceived {
                conversation_id,
                message_id,
                sender_id,
            } => {
                self.presence.stop_typing(&sender_id, &conversation_id);
                self.receipts.record_message(&conversation_id, &message_id);

                let is_open =
                    self.open_conversation.lock().as_deref() == Some(conversation_id.as_str());
                if sender_id == self.user_id || is_open {
                    self.receipts.mark_as_read(&conversation_id, &message_id);
                }
            }

            SessionEvent::IncomingCall(offer) => {
                if let Err(e) = self.calls.receive_incoming(offer) {
                    log::debug!("Incoming call not shown: {}", e);
                }
            }

            SessionEvent::CallAnswered { call_id } => {
                self.calls.on_call_answered(&call_id);
            }

            SessionEvent::RemoteHangup { call_id } => {
                self.calls.on_remote_hangup(&call_id);
            }
        }
    }

    pub fn conversation_view(&self, conversation_id: &str) -> ConversationView {
        let typing_users = self
            .presence
            .get_typing_users(conversation_id)
            .into_iter()
            .filter(|s| s.user_id != self.user_id)
            .collect();

        let calls = self.calls.snapshot();
        let call_status = calls
            .current
            .as_ref()
            .map(|c| c.status)
            .or_else(|| calls.incoming.as_ref().map(|c| c.status))
            .unwrap_or(CallStatus::Idle);

        ConversationView {
            conversation_id: conversation_id.to_string(),
            typing_users,
            unread_count: self.receipts.get_unread_count(conversation_id),
            total_unread: self.receipts.get_total_unread_count(),
            call_status,
            current_call: calls.current,
            incoming_call: calls.incoming,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::CallType;

    fn session() -> SessionCoordinator {
        SessionCoordinator::new("me", "Me", SessionConfig::default()).unwrap()
    }

    fn typing(user: &str, name: &str, conversation: &str) -> SessionEvent {
        SessionEvent::TypingStarted {
            user_id: user.to_string(),
            display_name: name.to_string(),
            conversation_id: conversation.to_string(),
        }
    }

    fn received(conversation: &str, message: &str, sender: &str) -> SessionEvent {
        SessionEvent::MessageReceived {
            conversation_id: conversation.to_string(),
            message_id: message.to_string(),
            sender_id: sender.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_combines_components() {
        let session = session();
        session.handle_event(typing("u1", "Alice", "c1"));
        session.handle_event(received("c1", "m1", "u2"));
        session.handle_event(received("c2", "m2", "u2"));

        let view = session.conversation_view("c1");
        assert_eq!(view.typing_users.len(), 1);
        assert_eq!(view.typing_summary().as_deref(), Some("Alice is typing"));
        assert_eq!(view.unread_count, 1);
        assert_eq!(view.total_unread, 2);
        assert_eq!(view.call_status, CallStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_clears_typing_and_reads() {
        let session = session();
        session.open_conversation("c1");
        session.handle_event(typing("u1", "Alice", "c1"));
        session.handle_event(received("c2", "m1", "u2"));
        session.handle_event(typing("u2", "Bob", "c2"));

        session.open_conversation("c2");
        assert!(session.conversation_view("c1").typing_users.is_empty());
        assert_eq!(session.conversation_view("c2").unread_count, 0);
        assert_eq!(session.conversation_view("c2").typing_users.len(), 1);

        session.leave_conversation();
        assert!(session.conversation_view("c2").typing_users.is_empty());
        assert_eq!(session.open_conversation_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_in_open_conversation_are_read() {
        let session = session();
        session.open_conversation("c1");
        session.handle_event(received("c1", "m1", "u2"));
        session.handle_event(received("c2", "m2", "me"));

        assert!(session.receipts().is_message_read("c1", "m1"));
        assert!(session.receipts().is_message_read("c2", "m2"));
        assert_eq!(session.receipts().get_total_unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_ends_sender_typing() {
        let session = session();
        session.handle_event(typing("u1", "Alice", "c1"));
        session.handle_event(received("c1", "m1", "u1"));
        assert!(session.conversation_view("c1").typing_summary().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_typing_is_not_shown() {
        let session = session();
        session.handle_event(typing("me", "Me", "c1"));
        assert!(session.conversation_view("c1").typing_users.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_events() {
        let session = session();
        let call = session.calls().start_call(CallType::Video, "B", "b-id").unwrap();
        assert_eq!(session.conversation_view("c1").call_status, CallStatus::Connecting);

        session.handle_event(SessionEvent::CallAnswered {
            call_id: call.id.clone(),
        });
        assert_eq!(session.conversation_view("c1").call_status, CallStatus::Active);

        session.handle_event(SessionEvent::RemoteHangup { call_id: call.id });
        assert_eq!(session.conversation_view("c1").call_status, CallStatus::Ended);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        session.handle_event(SessionEvent::IncomingCall(IncomingCallOffer {
            call_id: "in-1".to_string(),
            call_type: CallType::Audio,
            counterparty_id: "c-id".to_string(),
            counterparty_name: "Carol".to_string(),
        }));
        let view = session.conversation_view("c1");
        assert_eq!(view.call_status, CallStatus::Ringing);
        assert_eq!(view.incoming_call.unwrap().counterparty_name, "Carol");
    }

    #[test]
    fn test_typing_summary_wording() {
        let signal = |name: &str| TypingSignal {
            user_id: name.to_lowercase(),
            display_name: name.to_string(),
            conversation_id: "c1".to_string(),
            started_at: chrono::Utc::now(),
        };
        let mut view = ConversationView {
            conversation_id: "c1".to_string(),
            typing_users: vec![signal("Alice"), signal("Bob")],
            unread_count: 0,
            total_unread: 0,
            call_status: CallStatus::Idle,
            current_call: None,
            incoming_call: None,
        };
        assert_eq!(view.typing_summary().as_deref(), Some("Alice and Bob are typing"));

        view.typing_users.push(signal("Carol"));
        assert_eq!(view.typing_summary().as_deref(), Some("3 people are typing"));
    }
}
