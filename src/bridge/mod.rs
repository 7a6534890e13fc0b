//! 跨进程命令桥
//!
//! 机器人进程与管理端进程不共享内存，只共享 SQLite 与磁盘文件：
//! - **heartbeat**: 心跳同时写文件与 bot_status 表，任一介质可用即可判断存活
//! - **mailbox**: 管理端写请求文件，机器人轮询执行，成功删除、失败改名为 `.error`
//! - **command_queue**: 同一请求也写入持久队列（至少一次），按 request_id 去重
//! - **admin**: 管理端使用的客户端

pub mod admin;
pub mod heartbeat;
pub mod mailbox;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::BotError;

pub use admin::AdminClient;
pub use heartbeat::{HeartbeatEmitter, Liveness, LivenessProbe};
pub use mailbox::{CommandBridge, PollReport, RESTART_REQUEST_FILE};

/// 需要在机器人进程内执行的动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BotCommand {
    Join {
        channel: String,
    },
    Leave {
        channel: String,
    },
    Send {
        channel: String,
        text: String,
    },
    /// 合成一段语音，voice 覆盖频道音色
    Speak {
        channel: String,
        text: String,
        #[serde(default)]
        voice: Option<String>,
    },
    RestartTask {
        task: String,
    },
    /// 重新读取频道配置并清空缓存的计数器
    RefreshChannel {
        channel: String,
    },
}

impl BotCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BotCommand::Join { .. } => "join",
            BotCommand::Leave { .. } => "leave",
            BotCommand::Send { .. } => "send",
            BotCommand::Speak { .. } => "speak",
            BotCommand::RestartTask { .. } => "restart_task",
            BotCommand::RefreshChannel { .. } => "refresh_channel",
        }
    }
}

/// 请求文件与队列行共用的结构
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub request_id: String,
    #[serde(flatten)]
    pub command: BotCommand,
    pub created_at: DateTime<Utc>,
}

impl CommandRequest {
    pub fn new(command: BotCommand) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            command,
            created_at: Utc::now(),
        }
    }
}

/// 命令执行方（机器人运行时实现）
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// 执行命令，返回一句结果描述
    async fn execute(&self, command: &BotCommand) -> Result<String, BotError>;
}
