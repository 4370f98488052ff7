//! Read/unread bookkeeping per conversation
//!
//! Unread counts are always derived from the known-message and read sets;
//! nothing is stored as a counter.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use parking_lot::RwLock;

use crate::models::ReadReceipt;

#[derive(Default)]
struct ConversationReads {
    known: BTreeSet<String>,
    receipts: HashMap<String, ReadReceipt>,
}

impl ConversationReads {
    fn mark(&mut self, conversation_id: &str, message_id: &str) -> bool {
        self.known.insert(message_id.to_string());
        if self.receipts.contains_key(message_id) {
            return false;
        }
        self.receipts.insert(
            message_id.to_string(),
            ReadReceipt {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                is_read: true,
                read_at: Utc::now(),
            },
        );
        true
    }

    fn unread(&self) -> usize {
        self.known.len().saturating_sub(self.receipts.len())
    }
}

#[derive(Default)]
pub struct ReadReceiptTracker {
    conversations: RwLock<HashMap<String, ConversationReads>>,
}

impl ReadReceiptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a message as belonging to a conversation
    pub fn record_message(&self, conversation_id: &str, message_id: &str) {
        if conversation_id.is_empty() || message_id.is_empty() {
            return;
        }
        self.conversations
            .write()
            .entry(conversation_id.to_string())
            .or_default()
            .known
            .insert(message_id.to_string());
    }

    pub fn record_messages<I, S>(&self, conversation_id: &str, message_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if conversation_id.is_empty() {
            return;
        }
        let mut conversations = self.conversations.write();
        let reads = conversations.entry(conversation_id.to_string()).or_default();
        for id in message_ids {
            let id = id.as_ref();
            if !id.is_empty() {
                reads.known.insert(id.to_string());
            }
        }
    }

    /// Marks one message read. Returns `false` if it already was.
    pub fn mark_as_read(&self, conversation_id: &str, message_id: &str) -> bool {
        if conversation_id.is_empty() || message_id.is_empty() {
            return false;
        }
        self.conversations
            .write()
            .entry(conversation_id.to_string())
            .or_default()
            .mark(conversation_id, message_id)
    }

    /// Marks every known message of the conversation; returns how many changed
    pub fn mark_conversation_as_read(&self, conversation_id: &str) -> usize {
        let mut conversations = self.conversations.write();
        let Some(reads) = conversations.get_mut(conversation_id) else {
            return 0;
        };

        let unread: Vec<String> = reads
            .known
            .iter()
            .filter(|id| !reads.receipts.contains_key(*id))
            .cloned()
            .collect();
        for id in &unread {
            reads.mark(conversation_id, id);
        }
        unread.len()
    }

    pub fn is_message_read(&self, conversation_id: &str, message_id: &str) -> bool {
        self.conversations
            .read()
            .get(conversation_id)
            .and_then(|reads| reads.receipts.get(message_id))
            .map(|r| r.is_read)
            .unwrap_or(false)
    }

    pub fn receipt(&self, conversation_id: &str, message_id: &str) -> Option<ReadReceipt> {
        self.conversations
            .read()
            .get(conversation_id)
            .and_then(|reads| reads.receipts.get(message_id).cloned())
    }

    pub fn get_unread_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .read()
            .get(conversation_id)
            .map(ConversationReads::unread)
            .unwrap_or(0)
    }

    pub fn get_total_unread_count(&self) -> usize {
        self.conversations
            .read()
            .values()
            .map(ConversationReads::unread)
            .sum()
    }

    pub fn unread_message_ids(&self, conversation_id: &str) -> Vec<String> {
        self.conversations
            .read()
            .get(conversation_id)
            .map(|reads| {
                reads
                    .known
                    .iter()
                    .filter(|id| !reads.receipts.contains_key(*id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
