//! Database rows for Aether Server and their wire conversions

use std::collections::{BTreeMap, BTreeSet};

use aether_core::{
    Attachment, ContainerKind, Conversation, Message, MessageType, SortBy, SortOrder,
    UserProfile, UserStatus,
};
use chrono::{DateTime, Utc};

/// Epoch milliseconds as stored in SQLite
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// ============================================================================
// User Models
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
    pub bio: Option<String>,
    pub avatar: Option<String>,
    pub status: String,
    pub created_at: i64,
}

impl From<UserRow> for UserProfile {
    fn from(user: UserRow) -> Self {
        Self {
            id: user.id,
            email: user.email,
            username: user.username,
            first_name: user.first_name,
            last_name: user.last_name,
            bio: user.bio,
            avatar: user.avatar,
            status: parse_status(&user.status),
            created_at: from_millis(user.created_at),
        }
    }
}

pub fn status_str(status: UserStatus) -> &'static str {
    match status {
        UserStatus::Online => "ONLINE",
        UserStatus::Away => "AWAY",
        UserStatus::Busy => "BUSY",
        UserStatus::Offline => "OFFLINE",
    }
}

fn parse_status(s: &str) -> UserStatus {
    match s {
        "ONLINE" => UserStatus::Online,
        "AWAY" => UserStatus::Away,
        "BUSY" => UserStatus::Busy,
        _ => UserStatus::Offline,
    }
}

/// Fields of a user created by registration
pub struct NewUser<'a> {
    pub email: &'a str,
    pub username: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub password_hash: &'a str,
}

// ============================================================================
// Conversation Models
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContainerRow {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub created_by: String,
    pub created_at: i64,
}

impl ContainerRow {
    pub fn kind(&self) -> ContainerKind {
        self.kind.parse().unwrap_or(ContainerKind::Direct)
    }

    pub fn into_conversation(self, participant_ids: Vec<String>) -> Conversation {
        Conversation {
            kind: self.kind(),
            id: self.id,
            name: self.name,
            participant_ids,
            created_by: self.created_by,
            created_at: from_millis(self.created_at),
        }
    }
}

/// Addresses the messages of one conversation or one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub kind: ContainerKind,
    pub id: String,
}

impl ContainerRef {
    /// Resolves the `conversationId` / `groupId` pair; exactly one must be set
    pub fn from_ids(conversation_id: Option<&str>, group_id: Option<&str>) -> Option<Self> {
        match (non_empty(conversation_id), non_empty(group_id)) {
            (Some(id), None) => Some(Self {
                kind: ContainerKind::Direct,
                id: id.to_string(),
            }),
            (None, Some(id)) => Some(Self {
                kind: ContainerKind::Group,
                id: id.to_string(),
            }),
            _ => None,
        }
    }

    /// Message column holding this container's id
    pub fn column(&self) -> &'static str {
        match self.kind {
            ContainerKind::Direct => "conversation_id",
            ContainerKind::Group => "group_id",
        }
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            ContainerKind::Direct => "Conversation",
            ContainerKind::Group => "Group",
        }
    }
}

// ============================================================================
// Message Models
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub conversation_id: Option<String>,
    pub group_id: Option<String>,
    pub sender_id: String,
    pub content: String,
    pub message_type: String,
    pub attachment: Option<String>,
    pub reply_to_id: Option<String>,
    pub is_pinned: bool,
    pub pinned_by: Option<String>,
    pub pinned_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub edited_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

impl MessageRow {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn container(&self) -> ContainerRef {
        match (&self.conversation_id, &self.group_id) {
            (_, Some(group_id)) => ContainerRef {
                kind: ContainerKind::Group,
                id: group_id.clone(),
            },
            (conversation_id, None) => ContainerRef {
                kind: ContainerKind::Direct,
                id: conversation_id.clone().unwrap_or_default(),
            },
        }
    }

    pub fn into_message(self, reactions: BTreeMap<String, BTreeSet<String>>) -> Message {
        let deleted = self.is_deleted();
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            group_id: self.group_id,
            sender_id: self.sender_id,
            content: self.content,
            message_type: MessageType::from(self.message_type),
            attachment: self
                .attachment
                .and_then(|json| serde_json::from_str::<Attachment>(&json).ok()),
            reply_to_id: self.reply_to_id,
            is_pinned: self.is_pinned,
            pinned_by: self.pinned_by,
            pinned_at: self.pinned_at.map(from_millis),
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            edited_at: self.edited_at.map(from_millis),
            deleted_at: self.deleted_at.map(from_millis),
            reactions: if deleted { BTreeMap::new() } else { reactions },
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReactionRow {
    pub message_id: String,
    pub emoji: String,
    pub user_id: String,
}

/// Groups reaction rows into `message id -> emoji -> users`
pub fn group_reactions(
    rows: Vec<ReactionRow>,
) -> BTreeMap<String, BTreeMap<String, BTreeSet<String>>> {
    let mut grouped: BTreeMap<String, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();
    for row in rows {
        grouped
            .entry(row.message_id)
            .or_default()
            .entry(row.emoji)
            .or_default()
            .insert(row.user_id);
    }
    grouped
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

pub fn sort_column(sort_by: SortBy) -> &'static str {
    match sort_by {
        SortBy::CreatedAt => "created_at",
        SortBy::UpdatedAt => "updated_at",
    }
}

pub fn sort_direction(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_ref_requires_exactly_one_id() {
        assert_eq!(
            ContainerRef::from_ids(Some("c1"), None).map(|c| c.column()),
            Some("conversation_id")
        );
        assert_eq!(
            ContainerRef::from_ids(None, Some("g1")).map(|c| c.column()),
            Some("group_id")
        );
        assert!(ContainerRef::from_ids(Some("c1"), Some("g1")).is_none());
        assert!(ContainerRef::from_ids(None, None).is_none());
        assert!(ContainerRef::from_ids(Some(" "), None).is_none());
    }

    #[test]
    fn test_group_reactions() {
        let row = |m: &str, e: &str, u: &str| ReactionRow {
            message_id: m.to_string(),
            emoji: e.to_string(),
            user_id: u.to_string(),
        };
        let grouped = group_reactions(vec![
            row("m1", "👍", "u2"),
            row("m1", "👍", "u1"),
            row("m1", "🎉", "u1"),
            row("m2", "👍", "u1"),
        ]);

        assert_eq!(grouped["m1"]["👍"].len(), 2);
        assert_eq!(grouped["m1"].len(), 2);
        assert_eq!(grouped["m2"]["👍"].iter().next().map(String::as_str), Some("u1"));
    }

    #[test]
    fn test_millis_conversion() {
        let now = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(now), 1_700_000_000_123);
        assert_eq!(status_str(parse_status("BUSY")), "BUSY");
        assert_eq!(parse_status("nonsense"), UserStatus::Offline);
    }
}
