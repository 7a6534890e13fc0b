//! bot_status 键值、心跳记录与 cache_build_times

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::models::Heartbeat;
use super::Store;
use crate::core::StoreError;

const HEARTBEAT_KEY: &str = "heartbeat";

impl Store {
    pub async fn set_status(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO bot_status (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![key, value, Utc::now()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_status(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.pool
            .with_conn(move |conn| {
                let value = conn
                    .query_row("SELECT value FROM bot_status WHERE key = ?1", [&key], |r| r.get(0))
                    .optional()?;
                Ok(value)
            })
            .await
    }

    /// 覆盖写入心跳（单条逻辑记录）
    pub async fn write_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), StoreError> {
        let json = serde_json::to_string(heartbeat)?;
        self.set_status(HEARTBEAT_KEY, &json).await
    }

    pub async fn read_heartbeat(&self) -> Result<Option<Heartbeat>, StoreError> {
        match self.get_status(HEARTBEAT_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// 记录文本模型的构建时间
    pub async fn record_cache_build(
        &self,
        model_key: &str,
        built_at: DateTime<Utc>,
        line_count: usize,
    ) -> Result<(), StoreError> {
        let model_key = model_key.to_string();
        let line_count = i64::try_from(line_count).unwrap_or(i64::MAX);
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO cache_build_times (model_key, built_at, line_count) VALUES (?1, ?2, ?3)
                     ON CONFLICT(model_key) DO UPDATE SET built_at = excluded.built_at, line_count = excluded.line_count",
                    params![model_key, built_at, line_count],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn cache_build_time(&self, model_key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let model_key = model_key.to_string();
        self.pool
            .with_conn(move |conn| {
                let built = conn
                    .query_row(
                        "SELECT built_at FROM cache_build_times WHERE model_key = ?1",
                        [&model_key],
                        |r| r.get(0),
                    )
                    .optional()?;
                Ok(built)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;

    #[tokio::test]
    async fn test_heartbeat_is_overwritten() {
        let (_dir, store) = temp_store().await;
        assert!(store.read_heartbeat().await.unwrap().is_none());

        let mut hb = Heartbeat {
            last_heartbeat: Utc::now(),
            nickname: "parrotbot".into(),
            connected_channels: vec!["foo".into()],
            uptime_secs: 1,
            pid: 4242,
        };
        store.write_heartbeat(&hb).await.unwrap();
        hb.uptime_secs = 11;
        hb.connected_channels.push("bar".into());
        store.write_heartbeat(&hb).await.unwrap();

        assert_eq!(store.read_heartbeat().await.unwrap(), Some(hb));
    }

    #[tokio::test]
    async fn test_cache_build_time_upsert() {
        let (_dir, store) = temp_store().await;
        let t1 = Utc::now();
        store.record_cache_build("general", t1, 10).await.unwrap();
        let t2 = t1 + chrono::Duration::seconds(5);
        store.record_cache_build("general", t2, 12).await.unwrap();
        assert_eq!(store.cache_build_time("general").await.unwrap(), Some(t2));
        assert!(store.cache_build_time("foo").await.unwrap().is_none());
    }
}
