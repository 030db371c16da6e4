//! JSON-lines copy of the audit trail for log shippers.
//!
//! The store remains the source of truth; the mirror is best effort and a
//! failed mirror write is logged, never propagated.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::AuditRecord;

/// Append-only audit file. Writes are serialized through a
/// `tokio::sync::Mutex` so the mirror can be shared across tasks.
pub struct JsonlMirror {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl JsonlMirror {
    /// Open (or create) the mirror file at `path` in append mode.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create audit mirror directory: {}", parent.display()))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open audit mirror: {}", path.display()))?;

        debug!(path = %path.display(), "audit mirror opened");

        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("failed to serialize audit record")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write audit mirror: {}", self.path.display()))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush audit mirror: {}", self.path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditKind;

    #[tokio::test]
    async fn test_mirror_appends_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/audit.jsonl");

        {
            let mirror = JsonlMirror::open(path.clone()).await.unwrap();
            mirror
                .append(&AuditRecord::new(AuditKind::Transition).with_payload(serde_json::json!({"to": "diagnosing"})))
                .await
                .unwrap();
        }
        // Reopening must not truncate.
        let mirror = JsonlMirror::open(path.clone()).await.unwrap();
        mirror.append(&AuditRecord::new(AuditKind::Decision)).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);
        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.kind, AuditKind::Transition);
        assert_eq!(first.payload["to"], "diagnosing");
    }
}
