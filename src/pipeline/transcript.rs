//! 聊天转录文件：transcripts/<channel>.txt，只追加，每行一条消息，作为文本模型的训练数据

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, channel: &str) -> PathBuf {
        self.dir.join(format!("{}.txt", channel))
    }

    /// 追加一行；换行折叠为空格，空内容跳过
    pub async fn append(&self, channel: &str, content: &str) -> std::io::Result<()> {
        let line = content.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).await?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(channel))
            .await?;
        file.write_all(format!("{}\n", line).as_bytes()).await
    }
}
