use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;

/// Best-effort destination for rendered plan progress and final results.
#[async_trait]
pub trait DurableSink: Send + Sync {
    async fn persist(&self, text: &str) -> anyhow::Result<()>;
}

/// Discards everything.
pub struct NullSink;

#[async_trait]
impl DurableSink for NullSink {
    async fn persist(&self, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Rewrites one file (typically `todo.md`) with the latest text.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DurableSink for FileSink {
    async fn persist(&self, text: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        atomic_write(&self.path, text).await
    }
}

async fn atomic_write(path: &Path, content: &str) -> anyhow::Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .await
        .with_context(|| format!("failed to write temp file {}", temp_path.display()))?;
    fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_sink_replaces_previous_content() {
        let dir = tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("nested").join("todo.md"));
        sink.persist("first").await.unwrap();
        sink.persist("second").await.unwrap();
        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content, "second");
        assert!(!sink.path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn file_sink_reports_unwritable_target() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let sink = FileSink::new(blocker.join("todo.md"));
        assert!(sink.persist("text").await.is_err());
    }
}
