//! Observation sources for the daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{normalize_snapshot, ObservationSource, RawEvent};

/// Tails a JSON-lines file of [`RawEvent`]s. Each poll returns the complete
/// lines appended since the previous one; a trailing partial line is left
/// for the next poll. A file that shrank is read again from the start.
pub struct JsonlFeed {
    path: PathBuf,
    offset: Mutex<u64>,
}

impl JsonlFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl ObservationSource for JsonlFeed {
    async fn poll(&self) -> Result<Vec<RawEvent>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open {}", self.path.display()))
            }
        };

        let mut offset = self.offset.lock().await;
        let len = file.metadata().await?.len();
        if len < *offset {
            warn!(path = %self.path.display(), "observation file shrank, reading from the start");
            *offset = 0;
        }
        file.seek(std::io::SeekFrom::Start(*offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        *offset += end as u64 + 1;

        let mut events = Vec::new();
        for (i, line) in String::from_utf8_lossy(&buf[..end]).lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<RawEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(path = %self.path.display(), line = i + 1, error = %e, "skipping malformed event"),
            }
        }
        debug!(path = %self.path.display(), events = events.len(), "read observation file");
        Ok(events)
    }
}

/// Polls an HTTP endpoint that serves metrics-generator snapshots.
pub struct SnapshotFeed {
    client: reqwest::Client,
    url: String,
}

impl SnapshotFeed {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build snapshot HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl ObservationSource for SnapshotFeed {
    async fn poll(&self) -> Result<Vec<RawEvent>> {
        let snapshot: serde_json::Value = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {}", self.url))?
            .error_for_status()?
            .json()
            .await
            .context("snapshot is not JSON")?;
        Ok(normalize_snapshot(&snapshot, &self.url)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn line(entity: &str, value: f64) -> String {
        format!(
            r#"{{"kind":"metric","entity":"{entity}","name":"cpu","value":{value},"timestamp":"2026-01-01T00:00:00Z","source":"agent"}}"#
        )
    }

    #[tokio::test]
    async fn test_jsonl_feed_returns_only_new_complete_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let feed = JsonlFeed::new(&path);
        assert!(feed.poll().await.unwrap().is_empty());

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", line("a", 1.0)).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, "{}", line("b", 2.0)).unwrap();
        write!(file, "{}", &line("c", 3.0)[..20]).unwrap();
        file.flush().unwrap();

        let events = feed.poll().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(feed.poll().await.unwrap().is_empty());

        writeln!(file, "{}", &line("c", 3.0)[20..]).unwrap();
        file.flush().unwrap();
        let events = feed.poll().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RawEvent::Metric { entity, .. } if entity == "c"));
    }

    #[tokio::test]
    async fn test_jsonl_feed_rereads_truncated_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, format!("{}\n{}\n", line("a", 1.0), line("b", 2.0))).unwrap();
        let feed = JsonlFeed::new(&path);
        assert_eq!(feed.poll().await.unwrap().len(), 2);

        std::fs::write(&path, format!("{}\n", line("z", 9.0))).unwrap();
        assert_eq!(feed.poll().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_feed_unreachable_is_error() {
        let feed = SnapshotFeed::new("http://127.0.0.1:9/metrics", Duration::from_millis(500)).unwrap();
        assert!(feed.poll().await.is_err());
    }
}
