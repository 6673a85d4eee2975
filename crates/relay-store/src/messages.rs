use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::collab::{MessageRecord, MessageStore};
use relay_core::ids::{ChannelId, UserId};
use relay_core::RelayError;
use rusqlite::Row;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 200;

const SELECT_COLUMNS: &str = "SELECT message_id, sender_id, receiver_id, content, created_at FROM messages";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let created_at: String = row.get(4)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(MessageRecord {
        message_id: row.get(0)?,
        sender_id: UserId::from_raw(row.get::<_, String>(1)?),
        receiver_id: ChannelId::from_raw(row.get::<_, String>(2)?),
        content: row.get(3)?,
        created_at,
    })
}

/// Chat message rows, one per `message` action.
#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, content), fields(sender_id = %sender_id, receiver_id = %receiver_id))]
    pub fn create(
        &self,
        sender_id: &UserId,
        receiver_id: &ChannelId,
        content: &str,
    ) -> Result<MessageRecord, StoreError> {
        let created_at = Utc::now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (sender_id, receiver_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    sender_id.as_str(),
                    receiver_id.as_str(),
                    content,
                    created_at.to_rfc3339()
                ],
            )?;
            Ok(MessageRecord {
                message_id: conn.last_insert_rowid(),
                sender_id: sender_id.clone(),
                receiver_id: receiver_id.clone(),
                content: content.to_string(),
                created_at,
            })
        })
    }

    /// Latest `limit` messages of a channel (older than `before_id` if given),
    /// returned oldest first.
    #[instrument(skip(self), fields(receiver_id = %receiver_id))]
    pub fn history(
        &self,
        receiver_id: &ChannelId,
        before_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE receiver_id = ?1 AND (?2 IS NULL OR message_id < ?2)
                 ORDER BY message_id DESC LIMIT ?3"
            ))?;
            let mut rows = stmt
                .query_map(
                    rusqlite::params![receiver_id.as_str(), before_id, limit],
                    row_to_record,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    pub fn count_for_channel(&self, receiver_id: &ChannelId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1",
                [receiver_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

#[async_trait]
impl MessageStore for MessageRepo {
    async fn persist_message(
        &self,
        sender_id: &UserId,
        receiver_id: &ChannelId,
        content: &str,
    ) -> Result<MessageRecord, RelayError> {
        Ok(self.create(sender_id, receiver_id, content)?)
    }

    async fn history(
        &self,
        receiver_id: &ChannelId,
        before_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, RelayError> {
        Ok(MessageRepo::history(self, receiver_id, before_id, limit)?)
    }
}
