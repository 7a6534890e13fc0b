//! 有界 LRU 缓存
//!
//! 派生值（用户颜色、编译后的文本模型、已加载的语音模型）都放在各自的 BoundedCache 里，
//! 每个缓存一把窄锁，锁内不做 I/O、不 await，也从不与合成全局锁嵌套。

pub mod colors;

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

pub use colors::ColorCache;

/// 线程安全的 LRU：哈希表 + 访问顺序链表（lru crate）
pub struct BoundedCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    /// capacity 为 0 时按 1 处理
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<K, V>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 命中时刷新访问顺序
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    /// 插入并返回被淘汰的条目（容量已满时为最久未使用的那一个）
    pub fn insert(&self, key: K, value: V) -> Option<(K, V)> {
        self.lock().push(key, value)
    }

    /// 不存在时用 make 计算并插入；make 在锁内执行，只能是廉价的纯计算
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        self.lock().get_or_insert(key, make).clone()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().pop(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
