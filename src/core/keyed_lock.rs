//! 按键加锁：同一频道上的操作串行，不同频道之间互不阻塞

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// 每个键一把 tokio Mutex；外层 std Mutex 只在查表时短暂持有
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// 获取键对应的锁；guard 释放即解锁
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.lock_for(key).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.acquire("foo").await;

        let locks2 = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire("foo").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("b"))
            .await
            .expect("different keys must not contend");
    }
}
