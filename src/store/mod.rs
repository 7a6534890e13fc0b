//! 持久化存储适配层
//!
//! 机器人进程与管理端进程共享同一个 SQLite 库。Store 是对连接池的薄封装：
//! 每个操作借出一个连接、在阻塞线程中执行、作用域结束即归还。
//!
//! 按表拆分：
//! - **channels**: channel_configs / trusted_users
//! - **messages**: 只追加的聊天记录（传输层消息 ID 唯一）
//! - **tts_logs**: 语音合成日志（message_id 主键）
//! - **status**: bot_status 键值与心跳、cache_build_times
//! - **commands**: 持久命令队列

mod channels;
mod commands;
mod messages;
pub mod models;
pub mod pool;
pub mod schema;
mod status;
mod tts_logs;

use crate::config::StoreSection;
use crate::core::StoreError;

pub use channels::normalize_channel;
pub use models::{
    ChannelConfig, ChannelSummary, CommandQueueEntry, Heartbeat, NewMessage, PersistedMessage,
    TtsLogEntry,
};
pub use pool::{PoolConfig, SqlitePool};

/// 共享存储，可廉价克隆
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// 打开连接池并执行增量迁移
    pub async fn open(config: PoolConfig) -> Result<Self, StoreError> {
        let pool = SqlitePool::open(config).await?;
        let added = pool.with_conn(schema::migrate).await?;
        if added > 0 {
            tracing::info!("Schema migration added {} columns", added);
        }
        Ok(Self { pool })
    }

    pub async fn from_config(section: &StoreSection) -> Result<Self, StoreError> {
        let mut config = PoolConfig::new(&section.path);
        config.size = section.pool_size;
        config.acquire_timeout = std::time::Duration::from_secs(section.acquire_timeout_secs.max(1));
        config.busy_timeout = std::time::Duration::from_millis(section.busy_timeout_ms);
        Self::open(config).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use tempfile::TempDir;

    use super::*;

    /// 临时目录中的 Store；TempDir 需由调用方持有
    pub async fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let mut config = PoolConfig::new(dir.path().join("parrot.db"));
        config.size = 2;
        let store = Store::open(config).await.unwrap();
        (dir, store)
    }
}
