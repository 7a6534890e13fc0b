//! 优雅关闭
//!
//! Ctrl+C、SIGTERM、传输层永久断开都汇到同一个 token；周期任务、事件循环和合成队列
//! 监听它的子 token。只记录第一个关闭原因，后来的请求只是重复取消。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 进程级关闭信号
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 传输层永久断开等致命错误
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 请求关闭；返回这次调用是否第一个触发关闭
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        let first = {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        };
        self.token.cancel();
        first
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 第一个关闭原因；尚未关闭时为 None
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, stopping bot runtime");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping bot runtime");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_manager_is_running() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        assert_eq!(manager.reason(), None);
    }

    #[test]
    fn test_shutdown_cancels_child_tokens() {
        let manager = ShutdownManager::new();
        let child = manager.token().child_token();
        assert!(manager.shutdown(ShutdownReason::UserInitiated));
        assert!(manager.is_shutdown());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let clone = manager.clone();
        assert!(clone.shutdown(ShutdownReason::FatalError("transport gone".into())));
        assert!(!manager.shutdown(ShutdownReason::Signal));
        assert_eq!(
            manager.reason(),
            Some(ShutdownReason::FatalError("transport gone".into()))
        );
    }
}
