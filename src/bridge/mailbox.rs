//! 请求邮箱与持久命令队列的轮询
//!
//! 邮箱目录中每个 `*.json` 是一个请求：执行成功删除，执行失败或无法解析则改名为 `<name>.error` 隔离，
//! 不会被后续轮询再次处理。`task_restart_request.json` 是单独的重启请求（`{"task": "..."}`）。
//! 随后处理 command_queue 中未执行的行；最近执行过的 request_id 保存在有界 LRU 中，
//! 同一请求经文件与队列两条路径到达时只执行一次。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use super::{BotCommand, CommandHandler, CommandRequest};
use crate::cache::BoundedCache;
use crate::core::BridgeError;
use crate::store::Store;

pub const RESTART_REQUEST_FILE: &str = "task_restart_request.json";

const ERROR_SUFFIX: &str = "error";
const EXECUTED_ID_CAPACITY: usize = 1024;
const QUEUE_BATCH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRestartRequest {
    pub task: String,
}

/// 一次轮询的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub executed: usize,
    pub failed: usize,
    pub quarantined: usize,
    pub duplicates: usize,
}

impl PollReport {
    pub fn is_empty(&self) -> bool {
        *self == PollReport::default()
    }
}

pub struct CommandBridge {
    mailbox_dir: PathBuf,
    store: Store,
    executed: BoundedCache<String, ()>,
}

impl CommandBridge {
    pub fn new(mailbox_dir: impl AsRef<Path>, store: Store) -> Self {
        Self {
            mailbox_dir: mailbox_dir.as_ref().to_path_buf(),
            store,
            executed: BoundedCache::new(EXECUTED_ID_CAPACITY),
        }
    }

    pub fn mailbox_dir(&self) -> &Path {
        &self.mailbox_dir
    }

    /// 先处理邮箱文件，再处理持久队列
    pub async fn poll(&self, handler: &dyn CommandHandler) -> Result<PollReport, BridgeError> {
        let mut report = PollReport::default();
        self.poll_mailbox(handler, &mut report).await?;
        self.poll_queue(handler, &mut report).await?;
        if !report.is_empty() {
            tracing::info!(
                executed = report.executed,
                failed = report.failed,
                quarantined = report.quarantined,
                duplicates = report.duplicates,
                "Command poll finished"
            );
        }
        Ok(report)
    }

    async fn pending_files(&self) -> Result<Vec<PathBuf>, BridgeError> {
        if !fs::try_exists(&self.mailbox_dir).await? {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.mailbox_dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && entry.file_type().await?.is_file() {
                let modified = entry.metadata().await?.modified()?;
                files.push((modified, path));
            }
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    async fn poll_mailbox(&self, handler: &dyn CommandHandler, report: &mut PollReport) -> Result<(), BridgeError> {
        for path in self.pending_files().await? {
            let raw = match fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(file = %path.display(), "Cannot read request file: {}", e);
                    continue;
                }
            };

            let is_restart = path.file_name().is_some_and(|n| n == RESTART_REQUEST_FILE);
            let parsed = if is_restart {
                serde_json::from_str::<TaskRestartRequest>(&raw).map(|r| (None, BotCommand::RestartTask { task: r.task }))
            } else {
                serde_json::from_str::<CommandRequest>(&raw).map(|r| (Some(r.request_id), r.command))
            };

            let (request_id, command) = match parsed {
                Ok(parsed) => parsed,
                Err(e) => {
                    let err = BridgeError::MalformedRequest {
                        file: path.display().to_string(),
                        reason: e.to_string(),
                    };
                    tracing::warn!("{}", err);
                    if let Err(e) = quarantine(&path).await {
                        tracing::error!(file = %path.display(), "Cannot quarantine malformed request: {}", e);
                    }
                    report.quarantined += 1;
                    continue;
                }
            };

            if let Some(id) = &request_id {
                if self.executed.contains(id) {
                    tracing::debug!(request_id = %id, "Request already executed, removing file");
                    retire(&path).await;
                    report.duplicates += 1;
                    continue;
                }
            }

            match handler.execute(&command).await {
                Ok(summary) => {
                    tracing::info!(action = command.name(), request_id = ?request_id, "{}", summary);
                    self.record_executed(request_id.as_deref(), None).await;
                    report.executed += 1;
                    retire(&path).await;
                }
                Err(e) => {
                    tracing::warn!(action = command.name(), request_id = ?request_id, "Command failed: {}", e);
                    self.record_executed(request_id.as_deref(), Some(&e.to_string())).await;
                    report.failed += 1;
                    if let Err(e) = quarantine(&path).await {
                        tracing::error!(file = %path.display(), "Cannot quarantine failed request: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn poll_queue(&self, handler: &dyn CommandHandler, report: &mut PollReport) -> Result<(), BridgeError> {
        for entry in self.store.pending_commands(QUEUE_BATCH).await? {
            if entry.request_id.as_ref().is_some_and(|id| self.executed.contains(id)) {
                self.store.mark_command_executed(entry.id, None).await?;
                report.duplicates += 1;
                continue;
            }

            let request: CommandRequest = match serde_json::from_str(&entry.command) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(queue_id = entry.id, "Malformed queued command: {}", e);
                    self.store
                        .mark_command_executed(entry.id, Some(&format!("malformed: {}", e)))
                        .await?;
                    report.quarantined += 1;
                    continue;
                }
            };

            let error = match handler.execute(&request.command).await {
                Ok(summary) => {
                    tracing::info!(action = request.command.name(), request_id = %request.request_id, "{}", summary);
                    report.executed += 1;
                    None
                }
                Err(e) => {
                    tracing::warn!(action = request.command.name(), request_id = %request.request_id, "Queued command failed: {}", e);
                    report.failed += 1;
                    Some(e.to_string())
                }
            };
            self.executed.insert(request.request_id, ());
            self.store.mark_command_executed(entry.id, error.as_deref()).await?;
        }
        Ok(())
    }

    /// 文件路径执行过的请求：记入 LRU，并在队列中标记同一 request_id
    async fn record_executed(&self, request_id: Option<&str>, error: Option<&str>) {
        let Some(id) = request_id else { return };
        self.executed.insert(id.to_string(), ());
        if let Err(e) = self.store.mark_request_executed(id, error).await {
            tracing::warn!(request_id = %id, "Failed to mark queued command executed: {}", e);
        }
    }
}

/// 删除已执行的请求文件；删不掉就改名隔离，两者都失败只记日志
async fn retire(path: &Path) {
    let Err(e) = fs::remove_file(path).await else {
        return;
    };
    tracing::warn!(file = %path.display(), "Cannot remove executed request, quarantining: {}", e);
    if let Err(e) = quarantine(path).await {
        tracing::error!(file = %path.display(), "Cannot quarantine executed request: {}", e);
    }
}

/// 改名为 `<name>.error`；同名隔离文件已存在时覆盖
async fn quarantine(path: &Path) -> Result<(), BridgeError> {
    let mut target = path.as_os_str().to_owned();
    target.push(".");
    target.push(ERROR_SUFFIX);
    fs::rename(path, PathBuf::from(target)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::core::{BotError, TransportError};
    use crate::store::test_support::temp_store;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<BotCommand>>,
    }

    #[async_trait]
    impl CommandHandler for RecordingHandler {
        async fn execute(&self, command: &BotCommand) -> Result<String, BotError> {
            self.seen.lock().unwrap().push(command.clone());
            match command {
                BotCommand::Join { channel } if channel == "bad" => Err(TransportError::Join {
                    channel: channel.clone(),
                    reason: "refused".into(),
                }
                .into()),
                _ => Ok(format!("{} done", command.name())),
            }
        }
    }

    fn write_request(dir: &Path, request: &CommandRequest) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(format!("{}.json", request.request_id));
        std::fs::write(&path, serde_json::to_string(request).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_well_formed_request_is_removed() {
        let (_db, store) = temp_store().await;
        let dir = TempDir::new().unwrap();
        let bridge = CommandBridge::new(dir.path(), store);
        let handler = RecordingHandler::default();

        let path = write_request(dir.path(), &CommandRequest::new(BotCommand::Join { channel: "foo".into() }));
        let report = bridge.poll(&handler).await.unwrap();
        assert_eq!(report.executed, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_malformed_request_is_quarantined_once() {
        let (_db, store) = temp_store().await;
        let dir = TempDir::new().unwrap();
        let bridge = CommandBridge::new(dir.path(), store);
        let handler = RecordingHandler::default();

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let report = bridge.poll(&handler).await.unwrap();
        assert_eq!(report.quarantined, 1);
        assert!(!path.exists());
        assert!(dir.path().join("broken.json.error").exists());

        let report = bridge.poll(&handler).await.unwrap();
        assert!(report.is_empty());
        assert!(handler.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_command_is_renamed() {
        let (_db, store) = temp_store().await;
        let dir = TempDir::new().unwrap();
        let bridge = CommandBridge::new(dir.path(), store);
        let handler = RecordingHandler::default();

        let req = CommandRequest::new(BotCommand::Join { channel: "bad".into() });
        let path = write_request(dir.path(), &req);
        let report = bridge.poll(&handler).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(!path.exists());
        assert!(dir.path().join(format!("{}.json.error", req.request_id)).exists());
    }

    /// 执行时把请求文件换成同名目录，使随后的删除失败
    struct FileSwappingHandler {
        path: PathBuf,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl CommandHandler for FileSwappingHandler {
        async fn execute(&self, command: &BotCommand) -> Result<String, BotError> {
            *self.calls.lock().unwrap() += 1;
            if self.path.is_file() {
                std::fs::remove_file(&self.path).unwrap();
                std::fs::create_dir(&self.path).unwrap();
            }
            Ok(format!("{} done", command.name()))
        }
    }

    #[tokio::test]
    async fn test_unremovable_request_is_not_executed_again() {
        let (_db, store) = temp_store().await;
        let dir = TempDir::new().unwrap();
        let bridge = CommandBridge::new(dir.path(), store);

        let req = CommandRequest::new(BotCommand::Send {
            channel: "foo".into(),
            text: "only once".into(),
        });
        let path = write_request(dir.path(), &req);
        let handler = FileSwappingHandler {
            path: path.clone(),
            calls: Mutex::new(0),
        };

        let report = bridge.poll(&handler).await.unwrap();
        assert_eq!(report.executed, 1);
        assert!(!path.exists());
        assert!(dir.path().join(format!("{}.json.error", req.request_id)).exists());

        // 同一请求文件再次出现在邮箱里
        write_request(dir.path(), &req);
        let report = bridge.poll(&handler).await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.executed, 0);
        assert_eq!(*handler.calls.lock().unwrap(), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_request_on_both_channels_runs_once() {
        let (_db, store) = temp_store().await;
        let dir = TempDir::new().unwrap();
        let bridge = CommandBridge::new(dir.path(), store.clone());
        let handler = RecordingHandler::default();

        let req = CommandRequest::new(BotCommand::Send {
            channel: "foo".into(),
            text: "hi".into(),
        });
        store
            .enqueue_command(&req.request_id, &serde_json::to_string(&req).unwrap())
            .await
            .unwrap();
        write_request(dir.path(), &req);

        bridge.poll(&handler).await.unwrap();
        bridge.poll(&handler).await.unwrap();
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
        assert!(store.pending_commands(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_only_delivery() {
        let (_db, store) = temp_store().await;
        let dir = TempDir::new().unwrap();
        let bridge = CommandBridge::new(dir.path().join("missing"), store.clone());
        let handler = RecordingHandler::default();

        let req = CommandRequest::new(BotCommand::RefreshChannel { channel: "foo".into() });
        store
            .enqueue_command(&req.request_id, &serde_json::to_string(&req).unwrap())
            .await
            .unwrap();
        store.enqueue_command("junk", "not a command").await.unwrap();

        let report = bridge.poll(&handler).await.unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(report.quarantined, 1);
        assert!(store.pending_commands(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_request_file() {
        let (_db, store) = temp_store().await;
        let dir = TempDir::new().unwrap();
        let bridge = CommandBridge::new(dir.path(), store);
        let handler = RecordingHandler::default();

        let path = dir.path().join(RESTART_REQUEST_FILE);
        std::fs::write(&path, r#"{"task":"heartbeat"}"#).unwrap();
        bridge.poll(&handler).await.unwrap();
        assert!(!path.exists());
        assert_eq!(
            handler.seen.lock().unwrap()[0],
            BotCommand::RestartTask { task: "heartbeat".into() }
        );
    }
}
