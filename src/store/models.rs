//! 存储层的数据模型（两个进程共享的持久结构）

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 频道配置（持久化，按名称为键；只停用不删除）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// 期望加入
    pub desired_join: bool,
    pub tts_enabled: bool,
    pub voice_enabled: bool,
    pub voice_preset: Option<String>,
    pub synthesis_model: Option<String>,
    /// 每隔多少行回复一次，0 表示关闭按行触发
    pub lines_between_messages: u32,
    /// 每隔多少秒回复一次，0 表示关闭按时间触发
    pub time_between_messages: u64,
    pub use_general_text_model: bool,
    pub trusted_users: BTreeSet<String>,
    pub ignored_users: BTreeSet<String>,
    /// 观测值：上次确认的连接状态
    pub currently_connected: bool,
    /// 生成句子的最少词数，0 表示不检查
    pub response_threshold: u32,
}

impl ChannelConfig {
    /// 首次对账或管理端操作时插入的默认配置
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desired_join: true,
            tts_enabled: false,
            voice_enabled: false,
            voice_preset: None,
            synthesis_model: None,
            lines_between_messages: 100,
            time_between_messages: 0,
            use_general_text_model: true,
            trusted_users: BTreeSet::new(),
            ignored_users: BTreeSet::new(),
            currently_connected: false,
            response_threshold: 0,
        }
    }

    pub fn is_ignored(&self, user: &str) -> bool {
        self.ignored_users.iter().any(|u| u.eq_ignore_ascii_case(user))
    }

    /// 受信任用户；频道主（与频道同名的用户）总是受信任
    pub fn is_trusted(&self, user: &str) -> bool {
        user.eq_ignore_ascii_case(&self.name)
            || self.trusted_users.iter().any(|u| u.eq_ignore_ascii_case(user))
    }
}

/// 待写入的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub channel: String,
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_bot_response: bool,
    /// 传输层消息 ID，存在时唯一，用于幂等写入
    pub message_id: Option<String>,
    pub author_color: Option<String>,
}

/// 已持久化的消息（只追加）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub id: i64,
    pub channel: String,
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_bot_response: bool,
    pub message_id: Option<String>,
    pub author_color: Option<String>,
}

/// 语音合成日志：message_id 为主键，一条触发消息最多一条音频
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtsLogEntry {
    pub message_id: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub file_path: String,
    pub voice_preset: String,
    pub source_text: String,
}

/// 心跳记录：单条逻辑记录，每次覆盖，同时镜像到文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub last_heartbeat: DateTime<Utc>,
    pub nickname: String,
    pub connected_channels: Vec<String>,
    pub uptime_secs: u64,
    pub pid: u32,
}

/// 持久命令队列中的一项（至少一次投递）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandQueueEntry {
    pub id: i64,
    pub request_id: Option<String>,
    pub command: String,
    pub created_at: DateTime<Utc>,
    pub executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// 管理端频道概览
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub config: ChannelConfig,
    pub message_count: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_is_always_trusted() {
        let cfg = ChannelConfig::with_defaults("foo");
        assert!(cfg.is_trusted("Foo"));
        assert!(!cfg.is_trusted("bar"));
    }

    #[test]
    fn test_ignored_users_case_insensitive() {
        let mut cfg = ChannelConfig::with_defaults("foo");
        cfg.ignored_users.insert("NightBot".into());
        assert!(cfg.is_ignored("nightbot"));
    }
}
