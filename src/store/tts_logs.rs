//! tts_logs：一条触发消息最多对应一条合成结果

use rusqlite::{params, OptionalExtension};

use super::models::TtsLogEntry;
use super::{normalize_channel, Store};
use crate::core::StoreError;

impl Store {
    /// 写入合成日志；message_id 已存在时不写入，返回 false（重试的完成回调被静默去重）
    pub async fn log_tts(&self, entry: &TtsLogEntry) -> Result<bool, StoreError> {
        let mut entry = entry.clone();
        entry.channel = normalize_channel(&entry.channel);
        self.pool
            .with_conn(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO tts_logs
                        (message_id, channel, timestamp, file_path, voice_preset, message)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        entry.message_id,
                        entry.channel,
                        entry.timestamp,
                        entry.file_path,
                        entry.voice_preset,
                        entry.source_text,
                    ],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn get_tts_log(&self, message_id: &str) -> Result<Option<TtsLogEntry>, StoreError> {
        let message_id = message_id.to_string();
        self.pool
            .with_conn(move |conn| {
                let entry = conn
                    .query_row(
                        "SELECT message_id, channel, timestamp, file_path, voice_preset, message
                         FROM tts_logs WHERE message_id = ?1",
                        [&message_id],
                        |row| {
                            Ok(TtsLogEntry {
                                message_id: row.get(0)?,
                                channel: row.get(1)?,
                                timestamp: row.get(2)?,
                                file_path: row.get(3)?,
                                voice_preset: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                                source_text: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                            })
                        },
                    )
                    .optional()?;
                Ok(entry)
            })
            .await
    }

    /// 某频道最近的合成记录，新的在前
    pub async fn tts_history(&self, channel: &str, limit: usize) -> Result<Vec<TtsLogEntry>, StoreError> {
        let channel = normalize_channel(channel);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT message_id, channel, timestamp, file_path, voice_preset, message
                     FROM tts_logs WHERE channel = ?1 ORDER BY timestamp DESC LIMIT ?2",
                )?;
                let entries = stmt
                    .query_map(params![channel, limit], |row| {
                        Ok(TtsLogEntry {
                            message_id: row.get(0)?,
                            channel: row.get(1)?,
                            timestamp: row.get(2)?,
                            file_path: row.get(3)?,
                            voice_preset: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                            source_text: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::test_support::temp_store;

    fn entry(path: &str) -> TtsLogEntry {
        TtsLogEntry {
            message_id: "m-42".into(),
            channel: "foo".into(),
            timestamp: Utc::now(),
            file_path: path.into(),
            voice_preset: "v2/en_speaker_6".into(),
            source_text: "hello there".into(),
        }
    }

    #[tokio::test]
    async fn test_same_message_id_yields_one_row() {
        let (_dir, store) = temp_store().await;
        assert!(store.log_tts(&entry("audio/foo/m-42.wav")).await.unwrap());
        assert!(!store.log_tts(&entry("audio/foo/m-42-retry.wav")).await.unwrap());

        let history = store.tts_history("foo", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].file_path, "audio/foo/m-42.wav");
        assert_eq!(
            store.get_tts_log("m-42").await.unwrap().unwrap().source_text,
            "hello there"
        );
    }
}
