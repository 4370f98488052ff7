//! Database storage layer for Aether Server

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use aether_core::{ContainerKind, SortBy, SortOrder};
use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, Pool, QueryBuilder, Sqlite};

use crate::models::*;

const USER_COLUMNS: &str =
    "id, email, username, first_name, last_name, password_hash, bio, avatar, status, created_at";

const MESSAGE_COLUMNS: &str = "seq, id, conversation_id, group_id, sender_id, content, \
     message_type, attachment, reply_to_id, is_pinned, pinned_by, pinned_at, \
     created_at, updated_at, edited_at, deleted_at";

pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Opens `database` (a file path or a `sqlite:` URL), creating it if needed
    pub async fn new(database: &str) -> anyhow::Result<Self> {
        let database_url = if database.starts_with("sqlite:") {
            database.to_string()
        } else {
            if let Some(parent) = Path::new(database).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            format!("sqlite:{}?mode=rwc", database)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Private in-memory database; one pinned connection keeps it alive
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL UNIQUE,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                password_hash TEXT NOT NULL,
                bio TEXT,
                avatar TEXT,
                status TEXT NOT NULL DEFAULT 'OFFLINE',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS revoked_tokens (
                token_hash TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                name TEXT,
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS participants (
                container_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (container_id, user_id),
                FOREIGN KEY (container_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT,
                group_id TEXT,
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL,
                message_type TEXT NOT NULL DEFAULT 'TEXT',
                attachment TEXT,
                reply_to_id TEXT,
                is_pinned INTEGER NOT NULL DEFAULT 0,
                pinned_by TEXT,
                pinned_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                edited_at INTEGER,
                deleted_at INTEGER,
                CHECK ((conversation_id IS NULL) <> (group_id IS NULL))
            );

            CREATE TABLE IF NOT EXISTS message_reactions (
                message_id TEXT NOT NULL,
                emoji TEXT NOT NULL,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, emoji, user_id)
            );

            CREATE TABLE IF NOT EXISTS message_reads (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                read_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_group ON messages(group_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_revoked_expires ON revoked_tokens(expires_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // User Operations
    // ========================================================================

    pub async fn create_user(&self, user: &NewUser<'_>) -> anyhow::Result<UserRow> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT INTO users (id, email, username, first_name, last_name, password_hash,
                                status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'OFFLINE', ?, ?)",
        )
        .bind(&id)
        .bind(user.email)
        .bind(user.username)
        .bind(user.first_name)
        .bind(user.last_name)
        .bind(user.password_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_user(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user {} vanished after insert", id))
    }

    pub async fn get_user(&self, user_id: &str) -> anyhow::Result<Option<UserRow>> {
        let user = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn get_user_by_email(&self, email: &str) -> anyhow::Result<Option<UserRow>> {
        let user = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ? COLLATE NOCASE"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Whether `username` belongs to anyone other than `except_user_id`
    pub async fn username_taken(
        &self,
        username: &str,
        except_user_id: Option<&str>,
    ) -> anyhow::Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM users WHERE username = ? COLLATE NOCASE AND id IS NOT ?",
        )
        .bind(username)
        .bind(except_user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0 > 0)
    }

    /// Users other than `requester_id`, optionally filtered by a name fragment
    pub async fn list_users(
        &self,
        requester_id: &str,
        search: Option<&str>,
    ) -> anyhow::Result<Vec<UserRow>> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", escape_like(s)));

        let users = sqlx::query_as::<_, UserRow>(&format!(
            r"SELECT {USER_COLUMNS} FROM users
             WHERE id <> ?1
               AND (?2 IS NULL
                    OR username LIKE ?2 ESCAPE '\'
                    OR first_name LIKE ?2 ESCAPE '\'
                    OR last_name LIKE ?2 ESCAPE '\')
             ORDER BY username ASC"
        ))
        .bind(requester_id)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    /// Removes the account together with its memberships, reactions and
    /// read marks. Messages it sent stay in their conversations.
    pub async fn delete_user(&self, user_id: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        for table in ["participants", "message_reactions", "message_reads"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE user_id = ?"))
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }

        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_user_profile(
        &self,
        user_id: &str,
        update: &aether_core::UpdateProfileRequest,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users SET
                username = COALESCE(?, username),
                first_name = COALESCE(?, first_name),
                last_name = COALESCE(?, last_name),
                bio = COALESCE(?, bio),
                avatar = COALESCE(?, avatar),
                status = COALESCE(?, status),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(update.username.as_deref())
        .bind(update.first_name.as_deref())
        .bind(update.last_name.as_deref())
        .bind(update.bio.as_deref())
        .bind(update.avatar.as_deref())
        .bind(update.status.map(status_str))
        .bind(Utc::now().timestamp_millis())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_existing_users(&self, user_ids: &[String]) -> anyhow::Result<usize> {
        if user_ids.is_empty() {
            return Ok(0);
        }

        let mut query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM users WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in user_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let count: (i64,) = query.build_query_as().fetch_one(&self.pool).await?;
        Ok(count.0 as usize)
    }

    // ========================================================================
    // Token Revocation
    // ========================================================================

    pub async fn revoke_token(&self, token_hash: &str, expires_at: i64) -> anyhow::Result<()> {
        sqlx::query("INSERT OR IGNORE INTO revoked_tokens (token_hash, expires_at) VALUES (?, ?)")
            .bind(token_hash)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn is_token_revoked(&self, token_hash: &str) -> anyhow::Result<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM revoked_tokens WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0 > 0)
    }

    /// Drops revocation entries whose token has expired anyway
    pub async fn purge_revoked_tokens(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM revoked_tokens WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // Conversation Operations
    // ========================================================================

    /// Creates a container and its participant set atomically
    pub async fn create_container(
        &self,
        kind: ContainerKind,
        name: Option<&str>,
        created_by: &str,
        participant_ids: &[String],
    ) -> anyhow::Result<ContainerRow> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversations (id, kind, name, created_by, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(name)
        .bind(created_by)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for user_id in participant_ids {
            let role = if user_id == created_by { "admin" } else { "member" };
            sqlx::query(
                "INSERT OR IGNORE INTO participants (container_id, user_id, role, joined_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(user_id)
            .bind(role)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(ContainerRow {
            id,
            kind: kind.as_str().to_string(),
            name: name.map(str::to_string),
            created_by: created_by.to_string(),
            created_at: now,
        })
    }

    pub async fn find_direct_conversation(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> anyhow::Result<Option<ContainerRow>> {
        let row = sqlx::query_as::<_, ContainerRow>(
            "SELECT c.id, c.kind, c.name, c.created_by, c.created_at
             FROM conversations c
             JOIN participants pa ON pa.container_id = c.id AND pa.user_id = ?
             JOIN participants pb ON pb.container_id = c.id AND pb.user_id = ?
             WHERE c.kind = 'direct'
             LIMIT 1",
        )
        .bind(user_a)
        .bind(user_b)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get_container(
        &self,
        container_id: &str,
        kind: ContainerKind,
    ) -> anyhow::Result<Option<ContainerRow>> {
        let row = sqlx::query_as::<_, ContainerRow>(
            "SELECT id, kind, name, created_by, created_at
             FROM conversations WHERE id = ? AND kind = ?",
        )
        .bind(container_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list_participants(&self, container_id: &str) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM participants WHERE container_id = ? ORDER BY joined_at, user_id",
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn is_participant(&self, container_id: &str, user_id: &str) -> anyhow::Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM participants WHERE container_id = ? AND user_id = ?",
        )
        .bind(container_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0 > 0)
    }

    pub async fn list_user_containers(&self, user_id: &str) -> anyhow::Result<Vec<ContainerRow>> {
        let rows = sqlx::query_as::<_, ContainerRow>(
            "SELECT c.id, c.kind, c.name, c.created_by, c.created_at
             FROM conversations c
             JOIN participants p ON p.container_id = c.id
             WHERE p.user_id = ?
             ORDER BY c.created_at DESC, c.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ========================================================================
    // Message Operations
    // ========================================================================

    pub async fn insert_message(&self, message: &MessageRow) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO messages
             (id, conversation_id, group_id, sender_id, content, message_type, attachment,
              reply_to_id, is_pinned, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.group_id)
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(&message.attachment)
        .bind(&message.reply_to_id)
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_message(&self, message_id: &str) -> anyhow::Result<Option<MessageRow>> {
        let message = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    /// One page of a container's messages; ties break on insertion order in
    /// the same direction as the sort
    pub async fn list_messages(
        &self,
        container: &ContainerRef,
        sort_by: SortBy,
        sort_order: SortOrder,
        limit: u32,
        offset: u64,
    ) -> anyhow::Result<Vec<MessageRow>> {
        let direction = sort_direction(sort_order);
        let messages = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE {} = ?
             ORDER BY {} {direction}, seq {direction}
             LIMIT ? OFFSET ?",
            container.column(),
            sort_column(sort_by),
        ))
        .bind(&container.id)
        .bind(i64::from(limit))
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    pub async fn count_messages(&self, container: &ContainerRef) -> anyhow::Result<u64> {
        let count: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM messages WHERE {} = ?",
            container.column()
        ))
        .bind(&container.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0 as u64)
    }

    /// Returns `false` when the message is missing or deleted.
    pub async fn update_message_content(
        &self,
        message_id: &str,
        content: &str,
        edited_at: i64,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET content = ?, edited_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(content)
        .bind(edited_at)
        .bind(edited_at)
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Clears content, attachment, pin and reactions in one transaction.
    /// Returns `false` when the message was already deleted.
    pub async fn soft_delete_message(
        &self,
        message_id: &str,
        deleted_at: i64,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE messages SET
                content = '', attachment = NULL,
                is_pinned = 0, pinned_by = NULL, pinned_at = NULL,
                deleted_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(deleted_at)
        .bind(deleted_at)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM message_reactions WHERE message_id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    // ========================================================================
    // Reactions
    // ========================================================================

    /// Idempotent per (message, emoji, user). Only live messages take
    /// reactions; returns `false` when the message is missing or deleted.
    pub async fn add_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_reactions (message_id, emoji, user_id, created_at)
             SELECT ?1, ?2, ?3, ?4
              WHERE EXISTS (SELECT 1 FROM messages WHERE id = ?1 AND deleted_at IS NULL)",
        )
        .bind(message_id)
        .bind(emoji)
        .bind(user_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let live: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM messages WHERE id = ? AND deleted_at IS NULL)",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(live.0)
    }

    pub async fn remove_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = ? AND emoji = ? AND user_id = ?",
        )
        .bind(message_id)
        .bind(emoji)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reactions of many messages in one query
    pub async fn reactions_for(
        &self,
        message_ids: &[String],
    ) -> anyhow::Result<BTreeMap<String, BTreeMap<String, BTreeSet<String>>>> {
        if message_ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT message_id, emoji, user_id FROM message_reactions WHERE message_id IN (",
        );
        let mut separated = query.separated(", ");
        for id in message_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<ReactionRow> = query.build_query_as().fetch_all(&self.pool).await?;
        Ok(group_reactions(rows))
    }

    pub async fn message_reactions(
        &self,
        message_id: &str,
    ) -> anyhow::Result<BTreeMap<String, BTreeSet<String>>> {
        let mut all = self.reactions_for(&[message_id.to_string()]).await?;
        Ok(all.remove(message_id).unwrap_or_default())
    }

    // ========================================================================
    // Read Receipts & Pins
    // ========================================================================

    /// Records a read; the first `read_at` wins. Returns the stored `read_at`.
    pub async fn mark_read(
        &self,
        message_id: &str,
        user_id: &str,
        read_at: i64,
    ) -> anyhow::Result<i64> {
        sqlx::query(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?)",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(read_at)
        .execute(&self.pool)
        .await?;

        let stored: (i64,) =
            sqlx::query_as("SELECT read_at FROM message_reads WHERE message_id = ? AND user_id = ?")
                .bind(message_id)
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(stored.0)
    }

    /// Messages in the container not sent by, not read by the user and not deleted
    pub async fn count_unread(
        &self,
        container: &ContainerRef,
        user_id: &str,
    ) -> anyhow::Result<u64> {
        let count: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM messages m
             WHERE m.{} = ?
               AND m.sender_id <> ?
               AND m.deleted_at IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM message_reads r
                   WHERE r.message_id = m.id AND r.user_id = ?
               )",
            container.column()
        ))
        .bind(&container.id)
        .bind(user_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0 as u64)
    }

    /// Pins a message unless it already is; the original pin is kept
    pub async fn set_pin(
        &self,
        message_id: &str,
        pinned_by: &str,
        pinned_at: i64,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET is_pinned = 1, pinned_by = ?, pinned_at = ?
             WHERE id = ? AND is_pinned = 0 AND deleted_at IS NULL",
        )
        .bind(pinned_by)
        .bind(pinned_at)
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_pin(&self, message_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET is_pinned = 0, pinned_by = NULL, pinned_at = NULL
             WHERE id = ? AND is_pinned = 1",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Makes `%`, `_` and `\\` match literally in a `LIKE ... ESCAPE '\\'` pattern
fn escape_like(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
