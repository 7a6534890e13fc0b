//! 管理端客户端
//!
//! 管理端进程通过它观察存活、读取概览与历史、直接写频道配置，
//! 以及向机器人进程下发必须在机器人内部执行的命令（请求文件 + 持久队列双通道）。

use std::path::{Path, PathBuf};

use tokio::fs;

use super::heartbeat::{Liveness, LivenessProbe};
use super::mailbox::{TaskRestartRequest, RESTART_REQUEST_FILE};
use super::{BotCommand, CommandRequest};
use crate::config::AppConfig;
use crate::core::{BridgeError, StoreError};
use crate::store::{ChannelConfig, ChannelSummary, PersistedMessage, Store, TtsLogEntry};

pub struct AdminClient {
    store: Store,
    mailbox_dir: PathBuf,
    probe: LivenessProbe,
}

impl AdminClient {
    pub fn new(store: Store, config: &AppConfig) -> Self {
        Self {
            probe: LivenessProbe::new(
                &config.paths.heartbeat_file,
                store.clone(),
                config.scheduler.staleness_window(),
            ),
            mailbox_dir: config.paths.mailbox_dir.clone(),
            store,
        }
    }

    pub async fn from_config(config: &AppConfig) -> Result<Self, StoreError> {
        let store = Store::from_config(&config.store).await?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn liveness(&self) -> Liveness {
        self.probe.check().await
    }

    /// 下发命令：写请求文件并入队；两条通道都失败才返回错误
    pub async fn issue(&self, command: BotCommand) -> Result<CommandRequest, BridgeError> {
        let request = CommandRequest::new(command);
        let json = serde_json::to_string(&request)?;

        let file_result = write_atomic(&self.mailbox_dir, &format!("{}.json", request.request_id), &json).await;
        let queue_result = self.store.enqueue_command(&request.request_id, &json).await;

        match (file_result, queue_result) {
            (Err(file_err), Err(queue_err)) => {
                tracing::error!("Command queue write failed: {}", queue_err);
                return Err(file_err.into());
            }
            (Err(e), Ok(_)) => tracing::warn!("Request file write failed, relying on queue: {}", e),
            (Ok(_), Err(e)) => tracing::warn!("Command queue write failed, relying on file: {}", e),
            (Ok(_), Ok(_)) => {}
        }
        tracing::info!(request_id = %request.request_id, action = request.command.name(), "Command issued");
        Ok(request)
    }

    /// 写任务重启请求文件
    pub async fn request_task_restart(&self, task: &str) -> Result<PathBuf, BridgeError> {
        let json = serde_json::to_string(&TaskRestartRequest { task: task.to_string() })?;
        let path = write_atomic(&self.mailbox_dir, RESTART_REQUEST_FILE, &json).await?;
        Ok(path)
    }

    pub async fn channel_summaries(&self) -> Result<Vec<ChannelSummary>, StoreError> {
        self.store.channel_summaries().await
    }

    pub async fn history(&self, channel: &str, limit: usize) -> Result<Vec<PersistedMessage>, StoreError> {
        self.store.recent_messages(channel, limit).await
    }

    pub async fn tts_history(&self, channel: &str, limit: usize) -> Result<Vec<TtsLogEntry>, StoreError> {
        self.store.tts_history(channel, limit).await
    }

    pub async fn channel_config(&self, channel: &str) -> Result<ChannelConfig, StoreError> {
        self.store.ensure_channel(channel).await
    }

    /// 直接写频道配置；机器人下一次处理消息时读到新值，计数器可通过 refresh_channel 清空
    pub async fn configure(&self, config: &ChannelConfig) -> Result<(), StoreError> {
        self.store.upsert_channel_config(config).await
    }

    pub async fn trust(&self, channel: &str, user: &str) -> Result<bool, StoreError> {
        self.store.add_trusted_user(channel, user).await
    }

    pub async fn untrust(&self, channel: &str, user: &str) -> Result<bool, StoreError> {
        self.store.remove_trusted_user(channel, user).await
    }
}

/// 临时文件 + rename，轮询方只会看到完整的 `.json`
async fn write_atomic(dir: &Path, name: &str, content: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir).await?;
    let target = dir.join(name);
    let tmp = dir.join(format!(".{}.tmp", name));
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, &target).await?;
    Ok(target)
}
