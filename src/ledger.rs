use std::io::SeekFrom;
use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tokio::sync::Mutex;

use crate::formats::UsageRecord;
use crate::store::safe_component;

/// Append-only record of admission attempts. Records are never updated or
/// deleted; all queries are counts.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn append(&self, record: &UsageRecord) -> anyhow::Result<()>;

    /// Records for `(user_id, endpoint)` with `timestamp >= since`, regardless of outcome.
    async fn count_since(
        &self,
        user_id: &str,
        endpoint: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Successful records for `(user_id, endpoint)` over all time.
    async fn count_successes(&self, user_id: &str, endpoint: &str) -> anyhow::Result<u64>;
}

/// One JSONL file per user under `<base_dir>/usage/`.
#[derive(Debug)]
pub struct LocalFsUsageLedger {
    base_dir: PathBuf,
    append_lock: Mutex<()>,
}

impl LocalFsUsageLedger {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            append_lock: Mutex::new(()),
        }
    }

    fn usage_dir(&self) -> PathBuf {
        self.base_dir.join("usage")
    }

    fn user_path(&self, user_id: &str) -> anyhow::Result<PathBuf> {
        let user_id = safe_component(user_id)?;
        Ok(self.usage_dir().join(format!("{user_id}.jsonl")))
    }

    async fn read_records(&self, user_id: &str) -> anyhow::Result<Vec<UsageRecord>> {
        let path = self.user_path(user_id)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read usage: {}", path.display()));
            }
        };

        // A crash mid-append can leave a torn line; it must not hide the rest.
        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(
                        user_id,
                        line_no = idx + 1,
                        ?err,
                        "skipping unreadable usage record"
                    );
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl UsageLedger for LocalFsUsageLedger {
    async fn append(&self, record: &UsageRecord) -> anyhow::Result<()> {
        let path = self.user_path(&record.user_id)?;
        let mut line = serde_json::to_string(record).context("serialize usage record")?;
        line.push('\n');

        let _guard = self.append_lock.lock().await;
        fs::create_dir_all(self.usage_dir())
            .await
            .with_context(|| format!("create usage dir: {}", self.usage_dir().display()))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open usage: {}", path.display()))?;
        if ends_mid_line(&mut file)
            .await
            .with_context(|| format!("inspect usage: {}", path.display()))?
        {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("append usage: {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flush usage: {}", path.display()))?;
        Ok(())
    }

    async fn count_since(
        &self,
        user_id: &str,
        endpoint: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let records = self.read_records(user_id).await?;
        Ok(records
            .iter()
            .filter(|r| r.endpoint == endpoint && r.timestamp >= since)
            .count() as u64)
    }

    async fn count_successes(&self, user_id: &str, endpoint: &str) -> anyhow::Result<u64> {
        let records = self.read_records(user_id).await?;
        Ok(records
            .iter()
            .filter(|r| r.endpoint == endpoint && r.success)
            .count() as u64)
    }
}

/// True when the file is non-empty and its last byte is not a newline.
async fn ends_mid_line(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}
