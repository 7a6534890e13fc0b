//! 心跳：固定间隔写入文件（原子替换）与 bot_status 表
//!
//! 观察方只看时间戳：最近一次心跳在过期窗口内即为存活，不诊断原因。

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;

use crate::core::BridgeError;
use crate::store::{Heartbeat, Store};

pub struct HeartbeatEmitter {
    file: PathBuf,
    store: Store,
    nickname: String,
    started: Instant,
}

impl HeartbeatEmitter {
    pub fn new(file: impl AsRef<Path>, store: Store, nickname: impl Into<String>) -> Self {
        Self {
            file: file.as_ref().to_path_buf(),
            store,
            nickname: nickname.into(),
            started: Instant::now(),
        }
    }

    /// 写一次心跳；两个介质都失败才返回错误
    pub async fn emit(&self, connected_channels: Vec<String>) -> Result<Heartbeat, BridgeError> {
        let heartbeat = Heartbeat {
            last_heartbeat: Utc::now(),
            nickname: self.nickname.clone(),
            connected_channels,
            uptime_secs: self.started.elapsed().as_secs(),
            pid: std::process::id(),
        };

        let file_result = write_heartbeat_file(&self.file, &heartbeat).await;
        let store_result = self.store.write_heartbeat(&heartbeat).await;

        match (file_result, store_result) {
            (Ok(()), Ok(())) => {}
            (Err(file_err), Err(store_err)) => {
                tracing::error!("Heartbeat store write failed: {}", store_err);
                return Err(file_err.into());
            }
            (Err(e), Ok(())) => tracing::warn!(file = %self.file.display(), "Heartbeat file write failed: {}", e),
            (Ok(()), Err(e)) => tracing::warn!("Heartbeat store write failed: {}", e),
        }
        tracing::debug!(channels = heartbeat.connected_channels.len(), "Heartbeat emitted");
        Ok(heartbeat)
    }
}

/// 先写临时文件再 rename，读方不会看到半截 JSON
pub async fn write_heartbeat_file(path: &Path, heartbeat: &Heartbeat) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(heartbeat)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await
}

pub async fn read_heartbeat_file(path: &Path) -> Option<Heartbeat> {
    let raw = fs::read(path).await.ok()?;
    serde_json::from_slice(&raw).ok()
}

/// 存活判断结果
#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    pub live: bool,
    pub last: Option<Heartbeat>,
}

pub fn is_live_at(heartbeat: &Heartbeat, now: DateTime<Utc>, window: Duration) -> bool {
    match (now - heartbeat.last_heartbeat).to_std() {
        Ok(age) => age <= window,
        // 时间戳在未来（时钟偏差）也算存活
        Err(_) => true,
    }
}

pub struct LivenessProbe {
    file: PathBuf,
    store: Store,
    window: Duration,
}

impl LivenessProbe {
    pub fn new(file: impl AsRef<Path>, store: Store, window: Duration) -> Self {
        Self {
            file: file.as_ref().to_path_buf(),
            store,
            window,
        }
    }

    /// 两个介质取较新的一条
    pub async fn check(&self) -> Liveness {
        let from_file = read_heartbeat_file(&self.file).await;
        let from_store = match self.store.read_heartbeat().await {
            Ok(hb) => hb,
            Err(e) => {
                tracing::debug!("Heartbeat store read failed: {}", e);
                None
            }
        };

        let last = match (from_file, from_store) {
            (Some(a), Some(b)) => Some(if a.last_heartbeat >= b.last_heartbeat { a } else { b }),
            (a, b) => a.or(b),
        };
        let live = last
            .as_ref()
            .is_some_and(|hb| is_live_at(hb, Utc::now(), self.window));
        Liveness { live, last }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::store::test_support::temp_store;

    #[tokio::test]
    async fn test_emit_writes_both_media() {
        let (_db, store) = temp_store().await;
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("heartbeat.json");
        let emitter = HeartbeatEmitter::new(&file, store.clone(), "parrotbot");

        emitter.emit(vec!["foo".into()]).await.unwrap();
        let from_file = read_heartbeat_file(&file).await.unwrap();
        assert_eq!(from_file.connected_channels, vec!["foo".to_string()]);
        assert_eq!(store.read_heartbeat().await.unwrap().unwrap(), from_file);
    }

    #[tokio::test]
    async fn test_liveness_follows_staleness_window() {
        let (_db, store) = temp_store().await;
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("heartbeat.json");
        let emitter = HeartbeatEmitter::new(&file, store.clone(), "parrotbot");
        let window = Duration::from_secs(30);
        let probe = LivenessProbe::new(&file, store.clone(), window);

        assert!(!probe.check().await.live);
        for _ in 0..3 {
            emitter.emit(Vec::new()).await.unwrap();
            assert!(probe.check().await.live);
        }

        // 停止发射超过窗口：两种介质里都只剩过期心跳
        let mut stale = probe.check().await.last.unwrap();
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(61);
        write_heartbeat_file(&file, &stale).await.unwrap();
        store.write_heartbeat(&stale).await.unwrap();
        let liveness = probe.check().await;
        assert!(!liveness.live);
        assert_eq!(liveness.last.unwrap(), stale);
    }

    #[tokio::test]
    async fn test_one_medium_is_enough() {
        let (_db, store) = temp_store().await;
        let dir = TempDir::new().unwrap();
        let emitter = HeartbeatEmitter::new(dir.path().join("heartbeat.json"), store.clone(), "parrotbot");
        emitter.emit(Vec::new()).await.unwrap();

        let probe = LivenessProbe::new(dir.path().join("missing.json"), store, Duration::from_secs(30));
        assert!(probe.check().await.live);
    }

    #[test]
    fn test_is_live_at_boundaries() {
        let hb = Heartbeat {
            last_heartbeat: Utc::now(),
            nickname: "parrotbot".into(),
            connected_channels: Vec::new(),
            uptime_secs: 0,
            pid: 1,
        };
        let window = Duration::from_secs(30);
        assert!(is_live_at(&hb, hb.last_heartbeat + chrono::Duration::seconds(29), window));
        assert!(!is_live_at(&hb, hb.last_heartbeat + chrono::Duration::seconds(31), window));
    }
}
