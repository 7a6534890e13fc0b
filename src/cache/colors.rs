//! 用户颜色分配
//!
//! 传输层没有给出颜色时，按小写用户名的哈希从固定调色板中取色，同一用户始终同色。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::BoundedCache;

const PALETTE: &[&str] = &[
    "#FF0000", "#0000FF", "#008000", "#B22222", "#FF7F50", "#9ACD32", "#FF4500", "#2E8B57",
    "#DAA520", "#D2691E", "#5F9EA0", "#1E90FF", "#FF69B4", "#8A2BE2", "#00FF7F",
];

/// 用户名 -> 颜色 的 LRU 缓存
pub struct ColorCache {
    cache: BoundedCache<String, String>,
}

impl ColorCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: BoundedCache::new(capacity),
        }
    }

    /// 传输层给出的颜色优先，并刷新缓存
    pub fn color_for(&self, user: &str, provided: Option<&str>) -> String {
        let key = user.to_lowercase();
        match provided.map(str::trim).filter(|c| is_hex_color(c)) {
            Some(color) => {
                let color = color.to_uppercase();
                self.cache.insert(key, color.clone());
                color
            }
            None => self.cache.get_or_insert_with(key.clone(), || palette_color(&key)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn is_hex_color(raw: &str) -> bool {
    raw.len() == 7 && raw.starts_with('#') && raw[1..].chars().all(|c| c.is_ascii_hexdigit())
}

fn palette_color(user: &str) -> String {
    let mut hasher = DefaultHasher::new();
    user.hash(&mut hasher);
    let idx = (hasher.finish() % PALETTE.len() as u64) as usize;
    PALETTE[idx].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assigned_color_is_stable() {
        let colors = ColorCache::new(8);
        let first = colors.color_for("Alice", None);
        assert_eq!(colors.color_for("alice", None), first);
        assert!(PALETTE.contains(&first.as_str()));
    }

    #[test]
    fn test_provided_color_wins() {
        let colors = ColorCache::new(8);
        assert_eq!(colors.color_for("bob", Some("#00ff00")), "#00FF00");
        assert_eq!(colors.color_for("bob", None), "#00FF00");
        assert!(PALETTE.contains(&colors.color_for("carol", Some("not-a-color")).as_str()));
    }

    #[test]
    fn test_cache_is_bounded() {
        let colors = ColorCache::new(2);
        for user in ["a", "b", "c", "d"] {
            colors.color_for(user, None);
        }
        assert_eq!(colors.len(), 2);
    }
}
