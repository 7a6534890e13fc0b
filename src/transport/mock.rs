//! Mock 传输（用于测试，无需网络）
//!
//! 记录每一次 join / leave / send 调用，可配置某些频道 join 失败，可手动注入入站事件。

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChatTransport, IncomingMessage, TransportEvent};
use crate::core::TransportError;

/// 一次传输层调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Join(String),
    Leave(String),
    Send { channel: String, text: String },
}

#[derive(Debug, Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    failing_joins: Mutex<HashSet<String>>,
    fail_sends: Mutex<bool>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    join_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::Send { channel, text } => Some((channel, text)),
                _ => None,
            })
            .collect()
    }

    pub fn join_count(&self, channel: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, TransportCall::Join(ch) if ch == channel))
            .count()
    }

    pub fn fail_joins_for(&self, channel: &str, fail: bool) {
        let mut failing = self.failing_joins.lock().unwrap_or_else(|p| p.into_inner());
        if fail {
            failing.insert(channel.to_string());
        } else {
            failing.remove(channel);
        }
    }

    pub fn fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }

    /// join 人为变慢，用于并发测试
    pub fn set_join_delay(&self, delay: Option<Duration>) {
        *self.join_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    /// 注入一个入站事件；尚未 connect 时返回 false
    pub fn inject(&self, event: TransportEvent) -> bool {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn inject_message(&self, message: IncomingMessage) -> bool {
        self.inject(TransportEvent::Message(message))
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(call);
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), TransportError> {
        *self.events.lock().unwrap_or_else(|p| p.into_inner()) = Some(events);
        Ok(())
    }

    async fn join(&self, channel: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Join(channel.to_string()));
        let delay = *self.join_delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_joins.lock().unwrap_or_else(|p| p.into_inner()).contains(channel) {
            return Err(TransportError::Join {
                channel: channel.to_string(),
                reason: "mock failure".to_string(),
            });
        }
        Ok(())
    }

    async fn leave(&self, channel: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Leave(channel.to_string()));
        Ok(())
    }

    async fn send(&self, channel: &str, text: &str) -> Result<(), TransportError> {
        if *self.fail_sends.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(TransportError::Send {
                channel: channel.to_string(),
                reason: "mock failure".to_string(),
            });
        }
        self.record(TransportCall::Send {
            channel: channel.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}
