//! channel_configs / trusted_users

use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{ChannelConfig, ChannelSummary};
use super::Store;
use crate::core::StoreError;

const CONFIG_COLUMNS: &str = "channel_name, join_channel, tts_enabled, voice_enabled, voice_preset,
    synthesis_model, lines_between_messages, time_between_messages, use_general_model,
    ignored_users, currently_connected, response_threshold";

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<(ChannelConfig, String)> {
    let ignored_raw: String = row.get(9)?;
    let config = ChannelConfig {
        name: row.get(0)?,
        desired_join: row.get(1)?,
        tts_enabled: row.get(2)?,
        voice_enabled: row.get(3)?,
        voice_preset: row.get(4)?,
        synthesis_model: row.get(5)?,
        lines_between_messages: row.get::<_, i64>(6)?.max(0) as u32,
        time_between_messages: row.get::<_, i64>(7)?.max(0) as u64,
        use_general_text_model: row.get(8)?,
        trusted_users: BTreeSet::new(),
        ignored_users: BTreeSet::new(),
        currently_connected: row.get(10)?,
        response_threshold: row.get::<_, i64>(11)?.max(0) as u32,
    };
    Ok((config, ignored_raw))
}

fn parse_user_list(raw: &str) -> BTreeSet<String> {
    serde_json::from_str::<Vec<String>>(raw)
        .unwrap_or_else(|_| raw.split(',').map(str::to_string).collect())
        .into_iter()
        .map(|u| u.trim().to_lowercase())
        .filter(|u| !u.is_empty())
        .collect()
}

fn load_trusted(conn: &Connection, channel: &str) -> Result<BTreeSet<String>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT username FROM trusted_users WHERE channel_name = ?1 ORDER BY username")?;
    let users = stmt
        .query_map([channel], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(users)
}

fn load_config(conn: &Connection, channel: &str) -> Result<Option<ChannelConfig>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM channel_configs WHERE channel_name = ?1", CONFIG_COLUMNS),
            [channel],
            config_from_row,
        )
        .optional()?;
    match row {
        Some((mut config, ignored_raw)) => {
            config.ignored_users = parse_user_list(&ignored_raw);
            config.trusted_users = load_trusted(conn, channel)?;
            Ok(Some(config))
        }
        None => Ok(None),
    }
}

fn insert_default(conn: &Connection, channel: &str) -> Result<bool, StoreError> {
    let defaults = ChannelConfig::with_defaults(channel);
    let now = Utc::now();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO channel_configs (
            channel_name, join_channel, tts_enabled, voice_enabled, lines_between_messages,
            time_between_messages, use_general_model, ignored_users, currently_connected,
            response_threshold, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '[]', 0, ?8, ?9, ?9)",
        params![
            channel,
            defaults.desired_join,
            defaults.tts_enabled,
            defaults.voice_enabled,
            defaults.lines_between_messages,
            defaults.time_between_messages as i64,
            defaults.use_general_text_model,
            defaults.response_threshold,
            now,
        ],
    )?;
    Ok(inserted > 0)
}

/// 频道名统一为小写、去掉前导 #
pub fn normalize_channel(name: &str) -> String {
    name.trim().trim_start_matches('#').to_lowercase()
}

impl Store {
    pub async fn get_channel_config(&self, channel: &str) -> Result<Option<ChannelConfig>, StoreError> {
        let channel = normalize_channel(channel);
        self.pool.with_conn(move |conn| load_config(conn, &channel)).await
    }

    /// 读取配置，不存在时插入默认行（配置缺失的自愈路径）
    pub async fn ensure_channel(&self, channel: &str) -> Result<ChannelConfig, StoreError> {
        let channel = normalize_channel(channel);
        self.pool
            .with_conn(move |conn| {
                if insert_default(conn, &channel)? {
                    tracing::info!(channel = %channel, "Inserted default channel config");
                }
                load_config(conn, &channel)?.ok_or(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
            })
            .await
    }

    /// 期望加入的频道集合
    pub async fn desired_channels(&self) -> Result<BTreeSet<String>, StoreError> {
        self.pool
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT channel_name FROM channel_configs WHERE join_channel = 1 ORDER BY channel_name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<BTreeSet<_>, _>>()?;
                Ok(names)
            })
            .await
    }

    pub async fn set_currently_connected(&self, channel: &str, connected: bool) -> Result<(), StoreError> {
        let channel = normalize_channel(channel);
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE channel_configs SET currently_connected = ?2, updated_at = ?3 WHERE channel_name = ?1",
                    params![channel, connected, Utc::now()],
                )?;
                Ok(())
            })
            .await
    }

    /// 启动时清空所有连接标记：运行时状态从零重建，只有确认的 join 才能再置位
    pub async fn clear_connected_flags(&self) -> Result<usize, StoreError> {
        self.pool
            .with_conn(|conn| {
                let n = conn.execute(
                    "UPDATE channel_configs SET currently_connected = 0 WHERE currently_connected != 0",
                    [],
                )?;
                Ok(n)
            })
            .await
    }

    /// 设置期望加入标记；行不存在时先插入默认配置
    pub async fn set_desired_join(&self, channel: &str, join: bool) -> Result<(), StoreError> {
        let channel = normalize_channel(channel);
        self.pool
            .with_conn(move |conn| {
                insert_default(conn, &channel)?;
                conn.execute(
                    "UPDATE channel_configs SET join_channel = ?2, updated_at = ?3 WHERE channel_name = ?1",
                    params![channel, join, Utc::now()],
                )?;
                Ok(())
            })
            .await
    }

    /// 管理端直接写入整份配置（含受信任用户）
    pub async fn upsert_channel_config(&self, config: &ChannelConfig) -> Result<(), StoreError> {
        let mut config = config.clone();
        config.name = normalize_channel(&config.name);
        self.pool
            .with_tx(move |tx| {
                let ignored: Vec<&String> = config.ignored_users.iter().collect();
                let ignored = serde_json::to_string(&ignored)?;
                let now = Utc::now();
                tx.execute(
                    "INSERT INTO channel_configs (
                        channel_name, join_channel, tts_enabled, voice_enabled, voice_preset,
                        synthesis_model, lines_between_messages, time_between_messages,
                        use_general_model, ignored_users, currently_connected, response_threshold,
                        created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?12)
                    ON CONFLICT(channel_name) DO UPDATE SET
                        join_channel = excluded.join_channel,
                        tts_enabled = excluded.tts_enabled,
                        voice_enabled = excluded.voice_enabled,
                        voice_preset = excluded.voice_preset,
                        synthesis_model = excluded.synthesis_model,
                        lines_between_messages = excluded.lines_between_messages,
                        time_between_messages = excluded.time_between_messages,
                        use_general_model = excluded.use_general_model,
                        ignored_users = excluded.ignored_users,
                        response_threshold = excluded.response_threshold,
                        updated_at = excluded.updated_at",
                    params![
                        config.name,
                        config.desired_join,
                        config.tts_enabled,
                        config.voice_enabled,
                        config.voice_preset,
                        config.synthesis_model,
                        config.lines_between_messages,
                        config.time_between_messages as i64,
                        config.use_general_text_model,
                        ignored,
                        config.response_threshold,
                        now,
                    ],
                )?;
                tx.execute("DELETE FROM trusted_users WHERE channel_name = ?1", [&config.name])?;
                for user in &config.trusted_users {
                    tx.execute(
                        "INSERT OR IGNORE INTO trusted_users (channel_name, username, added_at) VALUES (?1, ?2, ?3)",
                        params![config.name, user.to_lowercase(), now],
                    )?;
                }
                Ok(())
            })
            .await
    }

    pub async fn add_trusted_user(&self, channel: &str, user: &str) -> Result<bool, StoreError> {
        let channel = normalize_channel(channel);
        let user = user.trim().to_lowercase();
        self.pool
            .with_conn(move |conn| {
                insert_default(conn, &channel)?;
                let n = conn.execute(
                    "INSERT OR IGNORE INTO trusted_users (channel_name, username, added_at) VALUES (?1, ?2, ?3)",
                    params![channel, user, Utc::now()],
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn remove_trusted_user(&self, channel: &str, user: &str) -> Result<bool, StoreError> {
        let channel = normalize_channel(channel);
        let user = user.trim().to_lowercase();
        self.pool
            .with_conn(move |conn| {
                let n = conn.execute(
                    "DELETE FROM trusted_users WHERE channel_name = ?1 AND username = ?2",
                    params![channel, user],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// 管理端频道列表：配置 + 消息数 + 最后一条消息时间
    pub async fn channel_summaries(&self) -> Result<Vec<ChannelSummary>, StoreError> {
        self.pool
            .with_conn(|conn| {
                let names = {
                    let mut stmt =
                        conn.prepare("SELECT channel_name FROM channel_configs ORDER BY channel_name")?;
                    let names = stmt
                        .query_map([], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    names
                };
                let mut summaries = Vec::with_capacity(names.len());
                for name in names {
                    let Some(config) = load_config(conn, &name)? else {
                        continue;
                    };
                    let (count, last): (i64, Option<chrono::DateTime<Utc>>) = conn.query_row(
                        "SELECT COUNT(*), MAX(timestamp) FROM messages WHERE channel = ?1",
                        [&name],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )?;
                    summaries.push(ChannelSummary {
                        config,
                        message_count: count.max(0) as u64,
                        last_message_at: last,
                    });
                }
                Ok(summaries)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;

    #[tokio::test]
    async fn test_ensure_channel_inserts_default_once() {
        let (_dir, store) = temp_store().await;
        assert!(store.get_channel_config("foo").await.unwrap().is_none());

        let cfg = store.ensure_channel("#Foo").await.unwrap();
        assert_eq!(cfg.name, "foo");
        assert!(cfg.desired_join);
        assert_eq!(cfg.lines_between_messages, 100);

        let again = store.ensure_channel("foo").await.unwrap();
        assert_eq!(cfg, again);
    }

    #[tokio::test]
    async fn test_upsert_round_trips_user_sets() {
        let (_dir, store) = temp_store().await;
        let mut cfg = ChannelConfig::with_defaults("foo");
        cfg.lines_between_messages = 3;
        cfg.time_between_messages = 30;
        cfg.tts_enabled = true;
        cfg.voice_preset = Some("v2/en_speaker_1".into());
        cfg.trusted_users.insert("alice".into());
        cfg.ignored_users.insert("nightbot".into());
        store.upsert_channel_config(&cfg).await.unwrap();

        let loaded = store.get_channel_config("foo").await.unwrap().unwrap();
        assert_eq!(loaded, cfg);

        cfg.trusted_users.clear();
        store.upsert_channel_config(&cfg).await.unwrap();
        let loaded = store.get_channel_config("foo").await.unwrap().unwrap();
        assert!(loaded.trusted_users.is_empty());
    }

    #[tokio::test]
    async fn test_desired_channels_follow_join_flag() {
        let (_dir, store) = temp_store().await;
        store.ensure_channel("a").await.unwrap();
        store.ensure_channel("b").await.unwrap();
        store.set_desired_join("b", false).await.unwrap();
        store.set_desired_join("c", true).await.unwrap();

        let desired: Vec<_> = store.desired_channels().await.unwrap().into_iter().collect();
        assert_eq!(desired, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_clear_connected_flags() {
        let (_dir, store) = temp_store().await;
        store.ensure_channel("a").await.unwrap();
        store.set_currently_connected("a", true).await.unwrap();
        assert_eq!(store.clear_connected_flags().await.unwrap(), 1);
        assert!(!store.get_channel_config("a").await.unwrap().unwrap().currently_connected);
    }

    #[tokio::test]
    async fn test_trusted_user_management() {
        let (_dir, store) = temp_store().await;
        assert!(store.add_trusted_user("foo", "Alice").await.unwrap());
        assert!(!store.add_trusted_user("foo", "alice").await.unwrap());
        let cfg = store.get_channel_config("foo").await.unwrap().unwrap();
        assert!(cfg.is_trusted("ALICE"));
        assert!(store.remove_trusted_user("foo", "alice").await.unwrap());
    }

    #[test]
    fn test_parse_user_list_accepts_legacy_csv() {
        let users = parse_user_list("Nightbot, streamelements");
        assert!(users.contains("nightbot"));
        assert!(users.contains("streamelements"));
    }
}
