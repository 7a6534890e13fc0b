//! 频道生命周期：期望状态与实际连接状态的对账
//!
//! 每一轮：D = 存储中期望加入的频道，A = 状态管理器中已确认连接的频道，对 D∖A 并发 join。
//! 失败只记日志，留给下一轮；对账从不自动离开频道，离开只走管理端命令。
//! 同一频道上的 join / leave 由按频道的锁串行化，防止对账与管理端命令重复 join。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;

use crate::core::{BotError, ChannelStateManager, KeyedLocks, TransportError};
use crate::store::{normalize_channel, Store};
use crate::transport::ChatTransport;

/// 一次对账的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub desired: usize,
    pub already_connected: usize,
    pub joined: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn attempted(&self) -> usize {
        self.joined.len() + self.failed.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left,
    NotJoined,
}

pub struct ChannelLifecycle {
    store: Store,
    state: Arc<ChannelStateManager>,
    transport: Arc<dyn ChatTransport>,
    locks: KeyedLocks,
    operation_timeout: Duration,
}

impl ChannelLifecycle {
    pub fn new(
        store: Store,
        state: Arc<ChannelStateManager>,
        transport: Arc<dyn ChatTransport>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            state,
            transport,
            locks: KeyedLocks::new(),
            operation_timeout,
        }
    }

    /// 对账一轮；存储读取失败时整轮失败，由周期任务下一轮重试
    pub async fn reconcile(&self) -> Result<ReconcileReport, BotError> {
        let desired = self.store.desired_channels().await?;
        let actual = self.state.snapshot_connected().await;
        let missing: Vec<String> = desired.difference(&actual).cloned().collect();

        let mut report = ReconcileReport {
            desired: desired.len(),
            already_connected: desired.len() - missing.len(),
            ..Default::default()
        };
        if missing.is_empty() {
            tracing::debug!(desired = report.desired, "Reconcile: all desired channels connected");
            return Ok(report);
        }

        let results = join_all(missing.iter().map(|channel| self.join_locked(channel))).await;
        for (channel, result) in missing.into_iter().zip(results) {
            match result {
                Ok(JoinOutcome::Joined) => report.joined.push(channel),
                Ok(JoinOutcome::AlreadyJoined) => report.already_connected += 1,
                Err(e) => {
                    tracing::warn!(channel = %channel, "Join failed, deferring to next pass: {}", e);
                    report.failed.push((channel, e.to_string()));
                }
            }
        }

        tracing::info!(
            desired = report.desired,
            joined = report.joined.len(),
            failed = report.failed.len(),
            "Reconcile pass finished"
        );
        Ok(report)
    }

    /// 管理端 join：记录期望状态后立即加入
    pub async fn join_channel(&self, channel: &str) -> Result<JoinOutcome, BotError> {
        let channel = normalize_channel(channel);
        self.store.set_desired_join(&channel, true).await?;
        self.join_locked(&channel).await
    }

    /// 管理端 leave：这是离开频道的唯一途径
    pub async fn leave_channel(&self, channel: &str) -> Result<LeaveOutcome, BotError> {
        let channel = normalize_channel(channel);
        self.store.set_desired_join(&channel, false).await?;

        let _guard = self.locks.acquire(&channel).await;
        let connected = self.state.get(&channel).await.is_some_and(|s| s.connected);
        if !connected {
            return Ok(LeaveOutcome::NotJoined);
        }

        self.with_timeout(format!("leave #{}", channel), self.transport.leave(&channel))
            .await?;
        self.state.set_connected(&channel, false).await;
        self.persist_connected(&channel, false).await;
        tracing::info!(channel = %channel, "Left channel");
        Ok(LeaveOutcome::Left)
    }

    /// 服务器侧离开（被踢等）：只清除连接状态，下一轮对账会重新加入
    pub async fn mark_parted(&self, channel: &str) {
        let channel = normalize_channel(channel);
        let _guard = self.locks.acquire(&channel).await;
        self.state.set_connected(&channel, false).await;
        self.persist_connected(&channel, false).await;
        tracing::warn!(channel = %channel, "Parted by server, will rejoin on next reconcile");
    }

    /// 传输层重连：之前的 join 全部失效
    pub async fn mark_all_disconnected(&self) {
        self.state.mark_all_disconnected().await;
        if let Err(e) = self.store.clear_connected_flags().await {
            tracing::warn!("Failed to clear connected flags: {}", e);
        }
    }

    async fn join_locked(&self, channel: &str) -> Result<JoinOutcome, BotError> {
        let _guard = self.locks.acquire(channel).await;
        if self.state.get(channel).await.is_some_and(|s| s.connected) {
            return Ok(JoinOutcome::AlreadyJoined);
        }

        // 未配置的频道先插入默认配置
        self.store.ensure_channel(channel).await?;

        self.with_timeout(format!("join #{}", channel), self.transport.join(channel))
            .await?;
        self.state.set_connected(channel, true).await;
        self.persist_connected(channel, true).await;
        tracing::info!(channel = %channel, "Joined channel");
        Ok(JoinOutcome::Joined)
    }

    async fn with_timeout<F>(&self, what: String, op: F) -> Result<(), TransportError>
    where
        F: std::future::Future<Output = Result<(), TransportError>>,
    {
        match tokio::time::timeout(self.operation_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(what)),
        }
    }

    /// 连接标记写入失败不影响已确认的运行时状态
    async fn persist_connected(&self, channel: &str, connected: bool) {
        if let Err(e) = self.store.set_currently_connected(channel, connected).await {
            tracing::warn!(channel = %channel, "Failed to persist connection flag: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use crate::transport::mock::TransportCall;
    use crate::transport::MockTransport;

    async fn setup() -> (tempfile::TempDir, Store, Arc<MockTransport>, ChannelLifecycle) {
        let (dir, store) = temp_store().await;
        let transport = Arc::new(MockTransport::new());
        let lifecycle = ChannelLifecycle::new(
            store.clone(),
            Arc::new(ChannelStateManager::new()),
            transport.clone(),
            Duration::from_secs(2),
        );
        (dir, store, transport, lifecycle)
    }

    #[tokio::test]
    async fn test_second_pass_issues_no_transport_calls() {
        let (_dir, store, transport, lifecycle) = setup().await;
        store.set_desired_join("foo", true).await.unwrap();
        store.set_desired_join("bar", true).await.unwrap();

        let first = lifecycle.reconcile().await.unwrap();
        assert_eq!(first.joined, vec!["bar".to_string(), "foo".to_string()]);
        assert!(store.get_channel_config("foo").await.unwrap().unwrap().currently_connected);

        transport.clear_calls();
        let second = lifecycle.reconcile().await.unwrap();
        assert_eq!(second.attempted(), 0);
        assert_eq!(second.already_connected, 2);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_join_is_retried_next_pass() {
        let (_dir, store, transport, lifecycle) = setup().await;
        store.set_desired_join("foo", true).await.unwrap();
        transport.fail_joins_for("foo", true);

        let report = lifecycle.reconcile().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(!store.get_channel_config("foo").await.unwrap().unwrap().currently_connected);

        transport.fail_joins_for("foo", false);
        let report = lifecycle.reconcile().await.unwrap();
        assert_eq!(report.joined, vec!["foo".to_string()]);
        assert_eq!(transport.join_count("foo"), 2);
    }

    #[tokio::test]
    async fn test_concurrent_joins_of_same_channel_hit_transport_once() {
        let (_dir, _store, transport, lifecycle) = setup().await;
        transport.set_join_delay(Some(Duration::from_millis(50)));

        let (a, b) = tokio::join!(lifecycle.join_channel("#Foo"), lifecycle.join_channel("foo"));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == JoinOutcome::AlreadyJoined);
        assert_eq!(outcomes, vec![JoinOutcome::Joined, JoinOutcome::AlreadyJoined]);
        assert_eq!(transport.join_count("foo"), 1);
    }

    #[tokio::test]
    async fn test_reconcile_never_leaves() {
        let (_dir, store, transport, lifecycle) = setup().await;
        lifecycle.join_channel("foo").await.unwrap();
        store.set_desired_join("foo", false).await.unwrap();

        lifecycle.reconcile().await.unwrap();
        assert!(!transport.calls().iter().any(|c| matches!(c, TransportCall::Leave(_))));
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (_dir, store, transport, lifecycle) = setup().await;
        lifecycle.join_channel("foo").await.unwrap();

        assert_eq!(lifecycle.leave_channel("foo").await.unwrap(), LeaveOutcome::Left);
        assert_eq!(lifecycle.leave_channel("foo").await.unwrap(), LeaveOutcome::NotJoined);
        let cfg = store.get_channel_config("foo").await.unwrap().unwrap();
        assert!(!cfg.desired_join);
        assert!(!cfg.currently_connected);
        assert_eq!(
            transport.calls().iter().filter(|c| matches!(c, TransportCall::Leave(_))).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_parted_channel_is_rejoined() {
        let (_dir, store, transport, lifecycle) = setup().await;
        store.set_desired_join("foo", true).await.unwrap();
        lifecycle.reconcile().await.unwrap();

        lifecycle.mark_parted("foo").await;
        let report = lifecycle.reconcile().await.unwrap();
        assert_eq!(report.joined, vec!["foo".to_string()]);
        assert_eq!(transport.join_count("foo"), 2);
    }
}
