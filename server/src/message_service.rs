//! Message Service: authorization and rules for message operations
//!
//! Every operation takes the authenticated actor id taken from a verified
//! token. Handlers only translate HTTP to these calls.

use std::sync::Arc;

use aether_core::{
    ContainerKind, Message, MessageQuery, Pagination, ReactionSummary, ReadReceipt,
    SendMessageRequest,
};
use chrono::Utc;

use crate::error::{AppError, Result};
use crate::models::{from_millis, ContainerRef, MessageRow};
use crate::storage::Storage;

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct MessageService {
    storage: Arc<Storage>,
    max_file_size: u64,
}

impl MessageService {
    pub fn new(storage: Arc<Storage>, max_file_size: u64) -> Self {
        Self {
            storage,
            max_file_size,
        }
    }

    pub async fn send_message(&self, req: SendMessageRequest, sender_id: &str) -> Result<Message> {
        let container = resolve_container(req.conversation_id.as_deref(), req.group_id.as_deref())?;
        self.require_participant(&container, sender_id).await?;

        if req.content.trim().is_empty() && req.attachment.is_none() {
            return Err(AppError::Validation(
                "Message content or an attachment is required".to_string(),
            ));
        }

        if let Some(attachment) = &req.attachment {
            if attachment.file_size > self.max_file_size {
                return Err(AppError::Validation(format!(
                    "Attachment exceeds the maximum file size of {} bytes",
                    self.max_file_size
                )));
            }
        }

        if let Some(reply_to_id) = &req.reply_to_id {
            let original = self.storage.get_message(reply_to_id).await?;
            if original.map(|m| m.container()) != Some(container.clone()) {
                return Err(AppError::Validation(
                    "Replied-to message is not in this conversation".to_string(),
                ));
            }
        }

        let now = Utc::now().timestamp_millis();
        let (conversation_id, group_id) = match container.kind {
            ContainerKind::Group => (None, Some(container.id.clone())),
            ContainerKind::Direct => (Some(container.id.clone()), None),
        };
        let row = MessageRow {
            seq: 0,
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            group_id,
            sender_id: sender_id.to_string(),
            content: req.content,
            message_type: req.message_type.unwrap_or_default().as_str().to_string(),
            attachment: req
                .attachment
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(anyhow::Error::from)?,
            reply_to_id: req.reply_to_id,
            is_pinned: false,
            pinned_by: None,
            pinned_at: None,
            created_at: now,
            updated_at: now,
            edited_at: None,
            deleted_at: None,
        };

        self.storage.insert_message(&row).await?;
        tracing::debug!("Message {} sent to {} by {}", row.id, container.id, sender_id);

        Ok(row.into_message(Default::default()))
    }

    pub async fn get_messages(
        &self,
        query: &MessageQuery,
        requester_id: &str,
    ) -> Result<(Vec<Message>, Pagination)> {
        let container =
            resolve_container(query.conversation_id.as_deref(), query.group_id.as_deref())?;
        let (page, limit) = page_params(query)?;
        self.require_participant(&container, requester_id).await?;

        let total = self.storage.count_messages(&container).await?;
        let rows = self
            .storage
            .list_messages(
                &container,
                query.sort_by.unwrap_or_default(),
                query.sort_order.unwrap_or_default(),
                limit,
                Pagination::offset(page, limit),
            )
            .await?;

        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut reactions = self.storage.reactions_for(&ids).await?;
        let messages = rows
            .into_iter()
            .map(|row| {
                let r = reactions.remove(&row.id).unwrap_or_default();
                row.into_message(r)
            })
            .collect();

        Ok((messages, Pagination::new(page, limit, total)))
    }

    pub async fn edit_message(
        &self,
        message_id: &str,
        content: &str,
        actor_id: &str,
    ) -> Result<Message> {
        let row = self.load_live_message(message_id).await?;
        if row.sender_id != actor_id {
            return Err(AppError::Authorization(
                "You can only edit your own messages".to_string(),
            ));
        }

        if content.trim().is_empty() {
            return Err(AppError::Validation("Message content is required".to_string()));
        }

        if !self
            .storage
            .update_message_content(message_id, content, Utc::now().timestamp_millis())
            .await?
        {
            return Err(not_found());
        }
        self.message(message_id).await
    }

    /// Soft delete; deleting an already-deleted message succeeds unchanged
    pub async fn delete_message(&self, message_id: &str, actor_id: &str) -> Result<()> {
        let row = self.load_message(message_id).await?;
        if row.sender_id != actor_id {
            return Err(AppError::Authorization(
                "You can only delete your own messages".to_string(),
            ));
        }

        if !self
            .storage
            .soft_delete_message(message_id, Utc::now().timestamp_millis())
            .await?
        {
            tracing::debug!("Message {} already deleted", message_id);
        }
        Ok(())
    }

    pub async fn add_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<ReactionSummary> {
        let emoji = validate_emoji(emoji)?;
        let row = self.load_live_message(message_id).await?;
        self.require_participant(&row.container(), user_id).await?;

        if !self.storage.add_reaction(message_id, emoji, user_id).await? {
            return Err(not_found());
        }

        let users = self
            .storage
            .message_reactions(message_id)
            .await?
            .remove(emoji)
            .unwrap_or_default();
        Ok(ReactionSummary {
            emoji: emoji.to_string(),
            count: users.len(),
            users: users.into_iter().collect(),
        })
    }

    pub async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let emoji = validate_emoji(emoji)?;
        let row = self.load_message(message_id).await?;
        self.require_participant(&row.container(), user_id).await?;

        self.storage.remove_reaction(message_id, emoji, user_id).await?;
        Ok(())
    }

    pub async fn mark_as_read(&self, message_id: &str, user_id: &str) -> Result<ReadReceipt> {
        let row = self.load_message(message_id).await?;
        let container = row.container();
        self.require_participant(&container, user_id).await?;

        let read_at = self
            .storage
            .mark_read(message_id, user_id, Utc::now().timestamp_millis())
            .await?;

        Ok(ReadReceipt {
            conversation_id: container.id,
            message_id: message_id.to_string(),
            is_read: true,
            read_at: from_millis(read_at),
        })
    }

    /// Idempotent: pinning a pinned message keeps the original pin
    pub async fn pin_message(&self, message_id: &str, actor_id: &str) -> Result<Message> {
        let row = self.load_live_message(message_id).await?;
        self.require_participant(&row.container(), actor_id).await?;

        if self
            .storage
            .set_pin(message_id, actor_id, Utc::now().timestamp_millis())
            .await?
        {
            tracing::info!("Message {} pinned by {}", message_id, actor_id);
        }
        self.message(message_id).await
    }

    pub async fn unpin_message(&self, message_id: &str, actor_id: &str) -> Result<Message> {
        let row = self.load_message(message_id).await?;
        self.require_participant(&row.container(), actor_id).await?;

        if self.storage.clear_pin(message_id).await? {
            tracing::info!("Message {} unpinned by {}", message_id, actor_id);
        }
        self.message(message_id).await
    }

    pub async fn unread_count(&self, query: &MessageQuery, user_id: &str) -> Result<u64> {
        let container =
            resolve_container(query.conversation_id.as_deref(), query.group_id.as_deref())?;
        self.require_participant(&container, user_id).await?;

        Ok(self.storage.count_unread(&container, user_id).await?)
    }

    async fn require_participant(&self, container: &ContainerRef, user_id: &str) -> Result<()> {
        if self
            .storage
            .get_container(&container.id, container.kind)
            .await?
            .is_none()
        {
            return Err(AppError::NotFound(format!("{} not found", container.label())));
        }

        if !self.storage.is_participant(&container.id, user_id).await? {
            return Err(AppError::Authorization(format!(
                "You are not a participant of this {}",
                container.label().to_lowercase()
            )));
        }
        Ok(())
    }

    async fn load_message(&self, message_id: &str) -> Result<MessageRow> {
        self.storage
            .get_message(message_id)
            .await?
            .ok_or_else(not_found)
    }

    async fn load_live_message(&self, message_id: &str) -> Result<MessageRow> {
        let row = self.load_message(message_id).await?;
        if row.is_deleted() {
            return Err(not_found());
        }
        Ok(row)
    }

    async fn message(&self, message_id: &str) -> Result<Message> {
        let row = self.load_message(message_id).await?;
        let reactions = self.storage.message_reactions(message_id).await?;
        Ok(row.into_message(reactions))
    }
}

fn not_found() -> AppError {
    AppError::NotFound("Message not found".to_string())
}

fn resolve_container(
    conversation_id: Option<&str>,
    group_id: Option<&str>,
) -> Result<ContainerRef> {
    ContainerRef::from_ids(conversation_id, group_id).ok_or_else(|| {
        AppError::Validation("Exactly one of conversationId or groupId is required".to_string())
    })
}

fn page_params(query: &MessageQuery) -> Result<(u32, u32)> {
    let page = query.page.unwrap_or(DEFAULT_PAGE);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);

    if page < 1 {
        return Err(AppError::Validation("page must be at least 1".to_string()));
    }
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }
    Ok((page, limit))
}

fn validate_emoji(emoji: &str) -> Result<&str> {
    let emoji = emoji.trim();
    if emoji.is_empty() {
        return Err(AppError::Validation("Emoji is required".to_string()));
    }
    if emoji.chars().count() > 16 {
        return Err(AppError::Validation("Emoji is too long".to_string()));
    }
    Ok(emoji)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_core::{Attachment, MessageType, SortOrder};

    struct Fixture {
        service: MessageService,
        storage: Arc<Storage>,
        conversation: String,
        group: String,
    }

    /// u1 and u2 share a direct conversation; u1, u2 and u3 share a group
    async fn fixture() -> Fixture {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let direct = storage
            .create_container(
                ContainerKind::Direct,
                None,
                "u1",
                &["u1".to_string(), "u2".to_string()],
            )
            .await
            .unwrap();
        let group = storage
            .create_container(
                ContainerKind::Group,
                Some("team"),
                "u1",
                &["u1".to_string(), "u2".to_string(), "u3".to_string()],
            )
            .await
            .unwrap();

        Fixture {
            service: MessageService::new(storage.clone(), 1024),
            storage,
            conversation: direct.id,
            group: group.id,
        }
    }

    fn text(conversation_id: &str, content: &str) -> SendMessageRequest {
        SendMessageRequest {
            content: content.to_string(),
            conversation_id: Some(conversation_id.to_string()),
            ..Default::default()
        }
    }

    fn page(conversation_id: &str, page: u32, limit: u32) -> MessageQuery {
        MessageQuery::conversation(conversation_id).page(page, limit)
    }

    #[tokio::test]
    async fn test_send_keeps_content_verbatim() {
        let f = fixture().await;
        let snippet = "    fn main() {}\n";
        let sent = f
            .service
            .send_message(text(&f.conversation, snippet), "u1")
            .await
            .unwrap();
        assert_eq!(sent.content, snippet);

        let (messages, _) = f
            .service
            .get_messages(&page(&f.conversation, 1, 50), "u2")
            .await
            .unwrap();
        assert_eq!(messages[0].content, snippet);

        let err = f
            .service
            .send_message(text(&f.conversation, "  \n "), "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_send_then_list_sees_message() {
        let f = fixture().await;
        let sent = f.service.send_message(text(&f.conversation, "hi"), "u1").await.unwrap();
        assert_eq!(sent.message_type, MessageType::Text);

        let (messages, pagination) = f
            .service
            .get_messages(&page(&f.conversation, 1, 50), "u2")
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(pagination.total, 1);
        assert_eq!(pagination.total_pages, 1);
        assert!(!pagination.has_next);
        assert!(!pagination.has_prev);
    }

    #[tokio::test]
    async fn test_pagination_boundaries() {
        let f = fixture().await;
        for i in 0..7 {
            f.service
                .send_message(text(&f.conversation, &format!("m{}", i)), "u1")
                .await
                .unwrap();
        }

        let (first, p1) = f.service.get_messages(&page(&f.conversation, 1, 3), "u1").await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(p1.total_pages, 3);
        assert!(p1.has_next && !p1.has_prev);
        assert_eq!(first[0].content, "m6");

        let (last, p3) = f.service.get_messages(&page(&f.conversation, 3, 3), "u1").await.unwrap();
        assert_eq!(last.len(), 1);
        assert!(!p3.has_next && p3.has_prev);
        assert_eq!(last[0].content, "m0");

        let mut asc = page(&f.conversation, 1, 10);
        asc.sort_order = Some(SortOrder::Asc);
        let (all, _) = f.service.get_messages(&asc, "u1").await.unwrap();
        let contents: Vec<&str> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4", "m5", "m6"]);
    }

    #[tokio::test]
    async fn test_invalid_page_params() {
        let f = fixture().await;
        for (p, l) in [(0, 10), (1, 0), (1, 101)] {
            let err = f
                .service
                .get_messages(&page(&f.conversation, p, l), "u1")
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn test_send_validation() {
        let f = fixture().await;

        let err = f.service.send_message(text(&f.conversation, "  "), "u1").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let both = SendMessageRequest {
            group_id: Some(f.group.clone()),
            ..text(&f.conversation, "hi")
        };
        let err = f.service.send_message(both, "u1").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let neither = SendMessageRequest {
            content: "hi".to_string(),
            ..Default::default()
        };
        let err = f.service.send_message(neither, "u1").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = f.service.send_message(text("nope", "hi"), "u1").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = f.service.send_message(text(&f.conversation, "hi"), "u3").await.unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_attachment_rules() {
        let f = fixture().await;
        let attachment = |size| Attachment {
            file_id: "f1".to_string(),
            file_name: "a.png".to_string(),
            file_size: size,
            mime_type: "image/png".to_string(),
        };

        let ok = SendMessageRequest {
            message_type: Some(MessageType::Image),
            attachment: Some(attachment(1024)),
            ..text(&f.conversation, "")
        };
        let sent = f.service.send_message(ok, "u1").await.unwrap();
        assert_eq!(sent.message_type, MessageType::Image);
        assert_eq!(sent.attachment.unwrap().file_size, 1024);

        let too_big = SendMessageRequest {
            attachment: Some(attachment(1025)),
            ..text(&f.conversation, "")
        };
        let err = f.service.send_message(too_big, "u1").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_reply_must_stay_in_container() {
        let f = fixture().await;
        let original = f.service.send_message(text(&f.conversation, "q"), "u1").await.unwrap();

        let reply = SendMessageRequest {
            reply_to_id: Some(original.id.clone()),
            ..text(&f.conversation, "a")
        };
        assert!(f.service.send_message(reply, "u2").await.is_ok());

        let cross = SendMessageRequest {
            content: "a".to_string(),
            group_id: Some(f.group.clone()),
            reply_to_id: Some(original.id),
            ..Default::default()
        };
        let err = f.service.send_message(cross, "u2").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_edit_rules() {
        let f = fixture().await;
        let sent = f.service.send_message(text(&f.conversation, "hi"), "u1").await.unwrap();

        let err = f.service.edit_message(&sent.id, "hey", "u2").await.unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));

        let err = f.service.edit_message(&sent.id, " ", "u1").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let edited = f.service.edit_message(&sent.id, "hey", "u1").await.unwrap();
        assert_eq!(edited.content, "hey");

        let edited = f
            .service
            .edit_message(&sent.id, "    indented\n", "u1")
            .await
            .unwrap();
        assert_eq!(edited.content, "    indented\n");
        assert!(edited.edited_at.is_some());

        f.service.delete_message(&sent.id, "u1").await.unwrap();
        let err = f.service.edit_message(&sent.id, "again", "u1").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = f.service.edit_message("missing", "x", "u1").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent() {
        let f = fixture().await;
        let sent = f.service.send_message(text(&f.conversation, "hi"), "u1").await.unwrap();
        f.service.add_reaction(&sent.id, "u2", "👍").await.unwrap();

        let err = f.service.delete_message(&sent.id, "u2").await.unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));

        f.service.delete_message(&sent.id, "u1").await.unwrap();
        let first = f.storage.get_message(&sent.id).await.unwrap().unwrap().deleted_at;

        f.service.delete_message(&sent.id, "u1").await.unwrap();
        let second = f.storage.get_message(&sent.id).await.unwrap().unwrap().deleted_at;
        assert!(first.is_some());
        assert_eq!(first, second);

        let (messages, pagination) = f
            .service
            .get_messages(&page(&f.conversation, 1, 50), "u1")
            .await
            .unwrap();
        assert_eq!(pagination.total, 1);
        assert!(messages[0].is_deleted());
        assert_eq!(messages[0].content, "");
        assert!(messages[0].reactions.is_empty());
        assert!(messages[0].attachment.is_none());
    }

    #[tokio::test]
    async fn test_reaction_idempotence_and_removal() {
        let f = fixture().await;
        let sent = f.service.send_message(text(&f.conversation, "hi"), "u1").await.unwrap();
        let once = f.service.add_reaction(&sent.id, "u2", "👍").await.unwrap();
        let twice = f.service.add_reaction(&sent.id, "u2", "👍").await.unwrap();
        assert_eq!(once.count, 1);
        assert_eq!(twice.count, 1);

        let both = f.service.add_reaction(&sent.id, "u1", "👍").await.unwrap();
        assert_eq!(both.count, 2);
        assert_eq!(both.users, vec!["u1".to_string(), "u2".to_string()]);

        f.service.remove_reaction(&sent.id, "u1", "👍").await.unwrap();
        f.service.remove_reaction(&sent.id, "u2", "👍").await.unwrap();
        let message = f.service.message(&sent.id).await.unwrap();
        assert!(!message.reactions.contains_key("👍"));
        assert!(message.reaction("👍").is_none());

        let err = f.service.add_reaction(&sent.id, "u3", "👍").await.unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
        let err = f.service.add_reaction(&sent.id, "u2", " ").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_read_receipts_and_unread_count() {
        let f = fixture().await;
        let group = MessageQuery::group(&f.group);
        let mut ids = Vec::new();
        for content in ["a", "b", "c"] {
            let req = SendMessageRequest {
                content: content.to_string(),
                group_id: Some(f.group.clone()),
                ..Default::default()
            };
            ids.push(f.service.send_message(req, "u1").await.unwrap().id);
        }

        assert_eq!(f.service.unread_count(&group, "u2").await.unwrap(), 3);
        assert_eq!(f.service.unread_count(&group, "u1").await.unwrap(), 0);

        let first = f.service.mark_as_read(&ids[0], "u2").await.unwrap();
        let again = f.service.mark_as_read(&ids[0], "u2").await.unwrap();
        assert_eq!(first.read_at, again.read_at);
        assert_eq!(first.conversation_id, f.group);
        assert_eq!(f.service.unread_count(&group, "u2").await.unwrap(), 2);

        f.service.delete_message(&ids[1], "u1").await.unwrap();
        assert_eq!(f.service.unread_count(&group, "u2").await.unwrap(), 1);
        assert_eq!(f.service.unread_count(&group, "u3").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pin_is_idempotent_set() {
        let f = fixture().await;
        let sent = f.service.send_message(text(&f.conversation, "hi"), "u1").await.unwrap();

        let pinned = f.service.pin_message(&sent.id, "u2").await.unwrap();
        assert!(pinned.is_pinned);
        assert_eq!(pinned.pinned_by.as_deref(), Some("u2"));

        let again = f.service.pin_message(&sent.id, "u1").await.unwrap();
        assert!(again.is_pinned);
        assert_eq!(again.pinned_by.as_deref(), Some("u2"));
        assert_eq!(again.pinned_at, pinned.pinned_at);

        let unpinned = f.service.unpin_message(&sent.id, "u1").await.unwrap();
        assert!(!unpinned.is_pinned);
        assert!(unpinned.pinned_by.is_none());
        assert!(!f.service.unpin_message(&sent.id, "u1").await.unwrap().is_pinned);

        let err = f.service.pin_message(&sent.id, "u3").await.unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
    }
}
