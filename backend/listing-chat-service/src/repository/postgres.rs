use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::collections::{BTreeMap, HashMap};
use tokio_postgres::Row;
use tracing::debug;
use uuid::Uuid;

use super::{BlockRepository, ConversationRepository, ListingDirectory, MessageRepository};
use crate::error::{AppError, AppResult};
use crate::models::{
    ActivationState, AppendOutcome, BlockRelation, Conversation, InsertOutcome, Membership,
    Message, MessageCursor, MessageKind, NewConversation, NewMessage, ParticipantPair,
};

const CONVERSATION_COLUMNS: &str =
    "c.id, c.listing_id, c.listing_owner_id, c.activated, c.created_at, c.updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, kind, content, sequence_number, \
     created_at, read_at, correlation_token";

/// PostgreSQL repository for conversations, messages, blocks and the listing projection
#[derive(Clone)]
pub struct PgChatRepository {
    pool: Pool,
}

impl PgChatRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn load_participants(
        &self,
        conversation_ids: &[Uuid],
    ) -> AppResult<HashMap<Uuid, BTreeMap<Uuid, Membership>>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT conversation_id, user_id, hidden_at, joined_at
                FROM conversation_participants
                WHERE conversation_id = ANY($1)
                "#,
                &[&conversation_ids],
            )
            .await
            .map_err(|e| AppError::Database(format!("load participants: {e}")))?;

        let mut by_conversation: HashMap<Uuid, BTreeMap<Uuid, Membership>> = HashMap::new();
        for row in rows {
            let conversation_id: Uuid = row.get("conversation_id");
            let user_id: Uuid = row.get("user_id");
            by_conversation.entry(conversation_id).or_default().insert(
                user_id,
                Membership {
                    user_id,
                    hidden_at: row.get("hidden_at"),
                    joined_at: row.get("joined_at"),
                },
            );
        }
        Ok(by_conversation)
    }

    async fn hydrate(&self, rows: Vec<Row>) -> AppResult<Vec<Conversation>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        let mut participants = self.load_participants(&ids).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id: Uuid = row.get("id");
                let activated: bool = row.get("activated");
                Conversation {
                    id,
                    listing_id: row.get("listing_id"),
                    listing_owner_id: row.get("listing_owner_id"),
                    participants: participants.remove(&id).unwrap_or_default(),
                    activation: ActivationState::from_flag(activated),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                }
            })
            .collect())
    }
}

fn row_to_message(row: &Row) -> AppResult<Message> {
    let kind: String = row.get("kind");
    let kind = MessageKind::from_db(&kind)
        .ok_or_else(|| AppError::Database(format!("unknown message kind: {kind}")))?;

    Ok(Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        kind,
        content: row.get("content"),
        sequence: row.get("sequence_number"),
        created_at: row.get("created_at"),
        read_at: row.get("read_at"),
        correlation_token: row.get("correlation_token"),
    })
}

#[async_trait]
impl ConversationRepository for PgChatRepository {
    async fn find_by_key(
        &self,
        listing_id: Uuid,
        pair: ParticipantPair,
    ) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
                     WHERE c.listing_id = $1 AND c.participant_low = $2 AND c.participant_high = $3"
                ),
                &[&listing_id, &pair.low(), &pair.high()],
            )
            .await
            .map_err(|e| AppError::Database(format!("find_by_key: {e}")))?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    async fn insert(&self, new: &NewConversation) -> AppResult<InsertOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| AppError::Database(format!("tx: {e}")))?;

        let inserted = tx
            .query_opt(
                r#"
                INSERT INTO conversations
                    (id, listing_id, listing_owner_id, participant_low, participant_high)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT ON CONSTRAINT conversations_listing_pair_key DO NOTHING
                RETURNING created_at, updated_at
                "#,
                &[
                    &new.id,
                    &new.listing_id,
                    &new.listing_owner_id,
                    &new.pair.low(),
                    &new.pair.high(),
                ],
            )
            .await
            .map_err(|e| AppError::Database(format!("insert conversation: {e}")))?;

        let Some(row) = inserted else {
            tx.rollback()
                .await
                .map_err(|e| AppError::Database(format!("rollback: {e}")))?;
            debug!(listing_id = %new.listing_id, "conversation insert hit uniqueness constraint");
            return Ok(InsertOutcome::Conflict);
        };
        let created_at: DateTime<Utc> = row.get("created_at");
        let updated_at: DateTime<Utc> = row.get("updated_at");

        tx.execute(
            r#"
            INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
            VALUES ($1, $2, $4), ($1, $3, $4)
            "#,
            &[&new.id, &new.pair.low(), &new.pair.high(), &created_at],
        )
        .await
        .map_err(|e| AppError::Database(format!("insert participants: {e}")))?;

        tx.execute(
            "INSERT INTO conversation_counters (conversation_id) VALUES ($1)",
            &[&new.id],
        )
        .await
        .map_err(|e| AppError::Database(format!("insert counter: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Database(format!("commit: {e}")))?;

        let participants = new
            .pair
            .members()
            .into_iter()
            .map(|user_id| {
                (
                    user_id,
                    Membership {
                        user_id,
                        hidden_at: None,
                        joined_at: created_at,
                    },
                )
            })
            .collect();

        Ok(InsertOutcome::Inserted(Conversation {
            id: new.id,
            listing_id: new.listing_id,
            listing_owner_id: new.listing_owner_id,
            participants,
            activation: ActivationState::Inactive,
            created_at,
            updated_at,
        }))
    }

    async fn get(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = $1"),
                &[&conversation_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("get conversation: {e}")))?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    async fn set_hidden(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        hidden: bool,
    ) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                r#"
                UPDATE conversation_participants
                SET hidden_at = CASE WHEN $3 THEN NOW() ELSE NULL END
                WHERE conversation_id = $1
                  AND user_id = $2
                  AND (hidden_at IS NULL) = $3
                "#,
                &[&conversation_id, &user_id, &hidden],
            )
            .await
            .map_err(|e| AppError::Database(format!("set hidden: {e}")))?;
        Ok(changed > 0)
    }

    async fn touch(&self, conversation_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE conversations SET updated_at = GREATEST(updated_at, $2) WHERE id = $1",
                &[&conversation_id, &at],
            )
            .await
            .map_err(|e| AppError::Database(format!("touch conversation: {e}")))?;
        Ok(())
    }

    async fn activate(&self, conversation_id: Uuid) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let changed = client
            .execute(
                "UPDATE conversations SET activated = TRUE WHERE id = $1 AND activated = FALSE",
                &[&conversation_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("activate conversation: {e}")))?;
        Ok(changed == 1)
    }

    async fn list_visible_for(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<Conversation>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
                     JOIN conversation_participants p ON p.conversation_id = c.id \
                     WHERE p.user_id = $1 AND p.hidden_at IS NULL \
                     ORDER BY c.updated_at DESC, c.id \
                     LIMIT $2"
                ),
                &[&user_id, &limit],
            )
            .await
            .map_err(|e| AppError::Database(format!("list conversations: {e}")))?;

        self.hydrate(rows).await
    }

    async fn visible_ids_for(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT conversation_id
                FROM conversation_participants
                WHERE user_id = $1 AND hidden_at IS NULL
                "#,
                &[&user_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("visible conversation ids: {e}")))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn health_check(&self) -> AppResult<()> {
        let client = self.pool.get().await?;
        client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| AppError::Database(format!("health check: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for PgChatRepository {
    async fn append(&self, new: NewMessage) -> AppResult<AppendOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| AppError::Database(format!("tx: {e}")))?;

        // The counter row lock serializes appends per conversation only.
        tx.query_opt(
            "SELECT 1 FROM conversation_counters WHERE conversation_id = $1 FOR UPDATE",
            &[&new.conversation_id],
        )
        .await
        .map_err(|e| AppError::Database(format!("lock conversation counter: {e}")))?
        .ok_or(AppError::NotFound("conversation"))?;

        if let Some(token) = &new.correlation_token {
            let existing = tx
                .query_opt(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages \
                         WHERE conversation_id = $1 AND sender_id = $2 AND correlation_token = $3"
                    ),
                    &[&new.conversation_id, &new.sender_id, token],
                )
                .await
                .map_err(|e| AppError::Database(format!("find by correlation token: {e}")))?;
            if let Some(row) = existing {
                let message = row_to_message(&row)?;
                tx.commit()
                    .await
                    .map_err(|e| AppError::Database(format!("commit: {e}")))?;
                debug!(
                    conversation_id = %new.conversation_id,
                    message_id = %message.id,
                    "correlation token already stored"
                );
                return Ok(AppendOutcome::Existing(message));
            }
        }

        let row = tx
            .query_one(
                &format!(
                    r#"
                    WITH next AS (
                        UPDATE conversation_counters
                        SET last_seq = last_seq + 1,
                            last_created_at = GREATEST(clock_timestamp(), last_created_at)
                        WHERE conversation_id = $2
                        RETURNING last_seq, last_created_at
                    )
                    INSERT INTO messages (
                        id, conversation_id, sender_id, kind, content,
                        correlation_token, sequence_number, created_at
                    )
                    SELECT $1, $2, $3, $4, $5, $6, next.last_seq, next.last_created_at
                    FROM next
                    RETURNING {MESSAGE_COLUMNS}
                    "#
                ),
                &[
                    &new.id,
                    &new.conversation_id,
                    &new.sender_id,
                    &new.kind.to_db(),
                    &new.content,
                    &new.correlation_token,
                ],
            )
            .await
            .map_err(|e| AppError::Database(format!("insert message: {e}")))?;
        let message = row_to_message(&row)?;

        tx.commit()
            .await
            .map_err(|e| AppError::Database(format!("commit: {e}")))?;
        Ok(AppendOutcome::Appended(message))
    }

    async fn list(
        &self,
        conversation_id: Uuid,
        after: Option<MessageCursor>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let client = self.pool.get().await?;
        let rows = match after {
            Some(cursor) => {
                client
                    .query(
                        &format!(
                            "SELECT {MESSAGE_COLUMNS} FROM messages \
                             WHERE conversation_id = $1 AND (created_at, sequence_number) > ($2, $3) \
                             ORDER BY created_at, sequence_number LIMIT $4"
                        ),
                        &[&conversation_id, &cursor.created_at, &cursor.sequence, &limit],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        &format!(
                            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
                             ORDER BY created_at, sequence_number LIMIT $2"
                        ),
                        &[&conversation_id, &limit],
                    )
                    .await
            }
        }
        .map_err(|e| AppError::Database(format!("list messages: {e}")))?;

        rows.iter().map(row_to_message).collect()
    }

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
                     ORDER BY created_at DESC, sequence_number DESC LIMIT 1"
                ),
                &[&conversation_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("last message: {e}")))?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn unread_ids(&self, conversation_id: Uuid, reader_id: Uuid) -> AppResult<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT id FROM messages
                WHERE conversation_id = $1 AND sender_id <> $2 AND read_at IS NULL
                "#,
                &[&conversation_id, &reader_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("unread ids: {e}")))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn mark_read(&self, message_ids: &[Uuid], at: DateTime<Utc>) -> AppResult<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE messages SET read_at = $2 WHERE id = ANY($1) AND read_at IS NULL",
                &[&message_ids, &at],
            )
            .await
            .map_err(|e| AppError::Database(format!("mark read: {e}")))
    }

    async fn count_unread(&self, reader_id: Uuid, conversation_ids: &[Uuid]) -> AppResult<i64> {
        if conversation_ids.is_empty() {
            return Ok(0);
        }
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) FROM messages
                WHERE conversation_id = ANY($1) AND sender_id <> $2 AND read_at IS NULL
                "#,
                &[&conversation_ids, &reader_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("count unread: {e}")))?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl BlockRepository for PgChatRepository {
    async fn insert(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let inserted = client
            .execute(
                r#"
                INSERT INTO blocks (blocker_id, blocked_id)
                VALUES ($1, $2)
                ON CONFLICT (blocker_id, blocked_id) DO NOTHING
                "#,
                &[&blocker_id, &blocked_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("block_user failed: {e}")))?;
        Ok(inserted > 0)
    }

    async fn delete(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute(
                "DELETE FROM blocks WHERE blocker_id = $1 AND blocked_id = $2",
                &[&blocker_id, &blocked_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("unblock_user failed: {e}")))?;
        Ok(deleted > 0)
    }

    async fn exists(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM blocks WHERE blocker_id = $1 AND blocked_id = $2 LIMIT 1",
                &[&blocker_id, &blocked_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("is_blocked check failed: {e}")))?;
        Ok(row.is_some())
    }

    async fn list_blocked_by(&self, blocker_id: Uuid) -> AppResult<Vec<BlockRelation>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT blocker_id, blocked_id, created_at
                FROM blocks
                WHERE blocker_id = $1
                ORDER BY created_at DESC
                "#,
                &[&blocker_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("get_blocked_users failed: {e}")))?;

        Ok(rows
            .iter()
            .map(|row| BlockRelation {
                blocker_id: row.get("blocker_id"),
                blocked_id: row.get("blocked_id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

#[async_trait]
impl ListingDirectory for PgChatRepository {
    async fn listing_owner(&self, listing_id: Uuid) -> AppResult<Option<Uuid>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT owner_id FROM listings WHERE id = $1", &[&listing_id])
            .await
            .map_err(|e| AppError::Database(format!("listing owner: {e}")))?;
        Ok(row.map(|r| r.get(0)))
    }
}
