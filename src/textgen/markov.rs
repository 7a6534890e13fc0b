//! 马尔可夫链文本生成
//!
//! 训练数据是 transcripts/<channel>.txt（每行一条聊天消息）。通用模型合并目录下所有转录文件。
//! 编译好的模型放在有界 LRU 中；转录文件比模型新、且模型已超过最小重建间隔时才重建，
//! 构建时间写入 cache_build_times。
//! 读文件、编译、随机游走都在阻塞线程中执行。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::IndexedRandom;
use rand::Rng;

use super::{ModelSelector, TextGenerator};
use crate::cache::BoundedCache;
use crate::config::AppConfig;
use crate::core::GenerationError;
use crate::store::Store;

/// 已编译的链：长度为 order 的前缀 -> 可能的下一个词（空串表示句尾）
#[derive(Debug)]
pub struct MarkovModel {
    order: usize,
    chain: HashMap<Vec<String>, Vec<String>>,
    starts: Vec<Vec<String>>,
    line_count: usize,
}

impl MarkovModel {
    pub fn build<'a>(lines: impl IntoIterator<Item = &'a str>, order: usize) -> Self {
        let order = order.max(1);
        let mut chain: HashMap<Vec<String>, Vec<String>> = HashMap::new();
        let mut starts = Vec::new();
        let mut line_count = 0;

        for line in lines {
            let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if words.len() < order {
                continue;
            }
            line_count += 1;
            starts.push(words[..order].to_vec());
            for i in 0..=words.len() - order {
                let state = words[i..i + order].to_vec();
                let next = words.get(i + order).cloned().unwrap_or_default();
                chain.entry(state).or_default().push(next);
            }
        }

        Self {
            order,
            chain,
            starts,
            line_count,
        }
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// 随机游走出一句话，最多 max_words 个词
    pub fn walk<R: Rng + ?Sized>(&self, max_words: usize, rng: &mut R) -> Option<String> {
        let mut words = self.starts.choose(rng)?.clone();
        while words.len() < max_words.max(self.order) {
            let state = &words[words.len() - self.order..];
            let Some(next) = self.chain.get(state).and_then(|nexts| nexts.choose(rng)) else {
                break;
            };
            if next.is_empty() {
                break;
            }
            words.push(next.clone());
        }
        Some(words.join(" "))
    }
}

struct CachedModel {
    model: MarkovModel,
    /// 构建时训练数据的最新修改时间
    source_mtime: SystemTime,
    built_at: Instant,
}

impl CachedModel {
    fn is_fresh(&self, newest: SystemTime, rebuild_interval: Duration) -> bool {
        self.source_mtime >= newest || self.built_at.elapsed() < rebuild_interval
    }
}

struct Inner {
    transcripts_dir: PathBuf,
    state_size: usize,
    max_words: usize,
    rebuild_interval: Duration,
    models: BoundedCache<ModelSelector, Arc<CachedModel>>,
}

impl Inner {
    fn sources(&self, selector: &ModelSelector) -> std::io::Result<Vec<PathBuf>> {
        match selector {
            ModelSelector::Channel(name) => {
                let path = self.transcripts_dir.join(format!("{}.txt", name));
                Ok(if path.is_file() { vec![path] } else { Vec::new() })
            }
            ModelSelector::General => {
                if !self.transcripts_dir.is_dir() {
                    return Ok(Vec::new());
                }
                let mut paths = Vec::new();
                for entry in std::fs::read_dir(&self.transcripts_dir)? {
                    let path = entry?.path();
                    if path.extension().is_some_and(|ext| ext == "txt") {
                        paths.push(path);
                    }
                }
                paths.sort();
                Ok(paths)
            }
        }
    }

    /// 返回模型以及它是否是本次新构建的
    fn model_for(&self, selector: &ModelSelector) -> std::io::Result<Option<(Arc<CachedModel>, bool)>> {
        let sources = self.sources(selector)?;
        if sources.is_empty() {
            return Ok(None);
        }
        let newest = latest_mtime(&sources)?;

        if let Some(cached) = self.models.get(selector) {
            if cached.is_fresh(newest, self.rebuild_interval) {
                return Ok(Some((cached, false)));
            }
        }

        let mut text = String::new();
        for path in &sources {
            text.push_str(&std::fs::read_to_string(path)?);
            text.push('\n');
        }
        let model = MarkovModel::build(text.lines(), self.state_size);
        let cached = Arc::new(CachedModel {
            model,
            source_mtime: newest,
            built_at: Instant::now(),
        });
        if let Some((evicted, _)) = self.models.insert(selector.clone(), Arc::clone(&cached)) {
            if &evicted != selector {
                tracing::debug!(model = %evicted, "Evicted text model from cache");
            }
        }
        Ok(Some((cached, true)))
    }
}

fn latest_mtime(paths: &[PathBuf]) -> std::io::Result<SystemTime> {
    let mut newest = SystemTime::UNIX_EPOCH;
    for path in paths {
        newest = newest.max(std::fs::metadata(path)?.modified()?);
    }
    Ok(newest)
}

pub struct MarkovGenerator {
    inner: Arc<Inner>,
    timeout: Duration,
    store: Option<Store>,
}

impl MarkovGenerator {
    pub fn new(transcripts_dir: impl AsRef<Path>, state_size: usize, max_words: usize, cache_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                transcripts_dir: transcripts_dir.as_ref().to_path_buf(),
                state_size,
                max_words,
                rebuild_interval: Duration::ZERO,
                models: BoundedCache::new(cache_capacity),
            }),
            timeout: Duration::from_secs(20),
            store: None,
        }
    }

    /// 转录变化后，模型至少保留多久才重建；默认 0（只看 mtime）
    pub fn with_rebuild_interval(mut self, interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.rebuild_interval = interval;
        }
        self
    }

    pub fn from_config(config: &AppConfig, store: Store) -> Self {
        let mut generator = Self::new(
            &config.paths.transcripts_dir,
            config.textgen.state_size,
            config.textgen.max_words,
            config.textgen.model_cache_capacity,
        )
        .with_rebuild_interval(config.textgen.rebuild_interval());
        generator.timeout = config.textgen.timeout();
        generator.store = Some(store);
        generator
    }

    pub fn cached_models(&self) -> usize {
        self.inner.models.len()
    }
}

#[async_trait]
impl TextGenerator for MarkovGenerator {
    async fn generate(&self, selector: &ModelSelector) -> Result<Option<String>, GenerationError> {
        let inner = Arc::clone(&self.inner);
        let key = selector.clone();
        let task = tokio::task::spawn_blocking(move || -> std::io::Result<Option<(Option<String>, Option<usize>)>> {
            let Some((cached, rebuilt)) = inner.model_for(&key)? else {
                return Ok(None);
            };
            let sentence = cached.model.walk(inner.max_words, &mut rand::rng());
            Ok(Some((sentence, rebuilt.then(|| cached.model.line_count()))))
        });

        let outcome = tokio::time::timeout(self.timeout, task)
            .await
            .map_err(|_| GenerationError::Timeout(self.timeout))?
            .map_err(|e| GenerationError::ModelUnavailable(format!("generator task failed: {}", e)))??;

        let Some((sentence, rebuilt_lines)) = outcome else {
            tracing::debug!(model = %selector, "No transcript available yet");
            return Ok(None);
        };

        if let (Some(lines), Some(store)) = (rebuilt_lines, &self.store) {
            tracing::info!(model = %selector, lines, "Rebuilt text model");
            if let Err(e) = store.record_cache_build(&selector.cache_key(), Utc::now(), lines).await {
                tracing::warn!(model = %selector, "Failed to record cache build time: {}", e);
            }
        }
        Ok(sentence)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_walk_only_uses_observed_transitions() {
        let model = MarkovModel::build(["the cat sat on the mat", "the dog sat down"], 1);
        assert_eq!(model.line_count(), 2);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let sentence = model.walk(10, &mut rng).unwrap();
            assert!(sentence.starts_with("the"));
            assert!(sentence.split_whitespace().count() <= 10);
        }
    }

    #[test]
    fn test_short_lines_are_skipped() {
        let model = MarkovModel::build(["hi", ""], 2);
        assert!(model.is_empty());
        assert!(model.walk(10, &mut StdRng::seed_from_u64(1)).is_none());
    }

    #[tokio::test]
    async fn test_missing_transcript_is_no_result() {
        let dir = TempDir::new().unwrap();
        let generator = MarkovGenerator::new(dir.path(), 2, 20, 4);
        let out = generator.generate(&ModelSelector::Channel("foo".into())).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_models_are_cached_and_bounded() {
        let dir = TempDir::new().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(format!("{}.txt", name)), "one two three four\n").unwrap();
        }
        let generator = MarkovGenerator::new(dir.path(), 1, 20, 2);
        for name in ["a", "b", "c"] {
            let out = generator.generate(&ModelSelector::Channel(name.into())).await.unwrap();
            assert_eq!(out.as_deref(), Some("one two three four"));
        }
        assert_eq!(generator.cached_models(), 2);

        let general = generator.generate(&ModelSelector::General).await.unwrap();
        assert_eq!(general.as_deref(), Some("one two three four"));
    }

    #[tokio::test]
    async fn test_rebuild_is_recorded() {
        let (_db_dir, store) = crate::store::test_support::temp_store().await;
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("foo.txt"), "hello there friend\n").unwrap();

        let mut generator = MarkovGenerator::new(dir.path(), 1, 20, 2);
        generator.store = Some(store.clone());
        generator.generate(&ModelSelector::Channel("foo".into())).await.unwrap();
        assert!(store.cache_build_time("channel:foo").await.unwrap().is_some());
    }

    fn append_line(path: &Path, line: &str) {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        writeln!(file, "{}", line).unwrap();
        let bumped = SystemTime::now() + Duration::from_secs(5);
        file.set_modified(bumped).unwrap();
    }

    #[test]
    fn test_consecutive_responses_reuse_cached_model() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("foo.txt");
        std::fs::write(&transcript, "one two three four\n").unwrap();
        let generator = MarkovGenerator::new(dir.path(), 1, 20, 4).with_rebuild_interval(Duration::from_secs(300));

        let (_, rebuilt) = generator.inner.model_for(&ModelSelector::General).unwrap().unwrap();
        assert!(rebuilt);

        let mut rebuilds = 0;
        for i in 0..5 {
            append_line(&transcript, &format!("line number {}", i));
            let (_, rebuilt) = generator.inner.model_for(&ModelSelector::General).unwrap().unwrap();
            rebuilds += usize::from(rebuilt);
        }
        assert_eq!(rebuilds, 0);
    }

    #[test]
    fn test_stale_model_rebuilt_after_interval() {
        let dir = TempDir::new().unwrap();
        let transcript = dir.path().join("foo.txt");
        std::fs::write(&transcript, "one two three four\n").unwrap();
        let generator = MarkovGenerator::new(dir.path(), 1, 20, 4);
        let selector = ModelSelector::Channel("foo".into());

        generator.inner.model_for(&selector).unwrap().unwrap();
        let (_, rebuilt) = generator.inner.model_for(&selector).unwrap().unwrap();
        assert!(!rebuilt);

        append_line(&transcript, "five six seven");
        let (cached, rebuilt) = generator.inner.model_for(&selector).unwrap().unwrap();
        assert!(rebuilt);
        assert_eq!(cached.model.line_count(), 2);
    }
}
