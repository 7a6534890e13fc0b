//! messages：只追加的聊天记录

use rusqlite::params;

use super::models::{NewMessage, PersistedMessage};
use super::{normalize_channel, Store};
use crate::core::StoreError;

impl Store {
    /// 写入一条消息；传输层消息 ID 重复时不写入，返回 false
    pub async fn log_message(&self, message: &NewMessage) -> Result<bool, StoreError> {
        let mut message = message.clone();
        message.channel = normalize_channel(&message.channel);
        self.pool
            .with_conn(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO messages
                        (channel, author, content, timestamp, is_bot_response, message_id, author_color)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        message.channel,
                        message.author,
                        message.content,
                        message.timestamp,
                        message.is_bot_response,
                        message.message_id,
                        message.author_color,
                    ],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// 某频道最近的 limit 条消息，按时间正序
    pub async fn recent_messages(&self, channel: &str, limit: usize) -> Result<Vec<PersistedMessage>, StoreError> {
        let channel = normalize_channel(channel);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, channel, author, content, timestamp, is_bot_response, message_id, author_color
                     FROM messages WHERE channel = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let mut rows = stmt
                    .query_map(params![channel, limit], |row| {
                        Ok(PersistedMessage {
                            id: row.get(0)?,
                            channel: row.get(1)?,
                            author: row.get(2)?,
                            content: row.get(3)?,
                            timestamp: row.get(4)?,
                            is_bot_response: row.get(5)?,
                            message_id: row.get(6)?,
                            author_color: row.get(7)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.reverse();
                Ok(rows)
            })
            .await
    }

    pub async fn message_count(&self, channel: &str) -> Result<u64, StoreError> {
        let channel = normalize_channel(channel);
        self.pool
            .with_conn(move |conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM messages WHERE channel = ?1", [&channel], |r| r.get(0))?;
                Ok(n.max(0) as u64)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::test_support::temp_store;

    fn message(content: &str, id: Option<&str>) -> NewMessage {
        NewMessage {
            channel: "foo".into(),
            author: "alice".into(),
            content: content.into(),
            timestamp: Utc::now(),
            is_bot_response: false,
            message_id: id.map(str::to_string),
            author_color: Some("#1E90FF".into()),
        }
    }

    #[tokio::test]
    async fn test_duplicate_transport_id_is_ignored() {
        let (_dir, store) = temp_store().await;
        assert!(store.log_message(&message("hi", Some("m-1"))).await.unwrap());
        assert!(!store.log_message(&message("hi again", Some("m-1"))).await.unwrap());
        assert_eq!(store.message_count("foo").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_messages_without_id_always_append() {
        let (_dir, store) = temp_store().await;
        assert!(store.log_message(&message("a", None)).await.unwrap());
        assert!(store.log_message(&message("a", None)).await.unwrap());
        assert_eq!(store.message_count("foo").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_recent_messages_are_chronological() {
        let (_dir, store) = temp_store().await;
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            store
                .log_message(&message(text, Some(&format!("m-{}", i))))
                .await
                .unwrap();
        }
        let recent = store.recent_messages("#FOO", 2).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
        assert_eq!(recent[1].author_color.as_deref(), Some("#1E90FF"));
    }
}
