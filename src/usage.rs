use std::{
    collections::{HashMap, VecDeque},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{io::AsyncWriteExt, sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{DAY_MS, error::RelayError, now_millis};

/// Default analytics window and retention horizon.
pub const DEFAULT_WINDOW_MS: i64 = 7 * DAY_MS;

const SHARD_HEADER: &str = "startTime,endTime";
const SHARD_EXTENSION: &str = "csv";
const NULL_END: &str = "null";

/// One request interval. `end_time` is `None` when the request never
/// completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub start_time: i64,
    pub end_time: Option<i64>,
}

impl UsageRecord {
    fn to_line(self) -> String {
        match self.end_time {
            Some(end) => format!("{},{end}\n", self.start_time),
            None => format!("{},{NULL_END}\n", self.start_time),
        }
    }

    fn parse_line(line: &str) -> Option<Self> {
        let (start, end) = line.trim().split_once(',')?;
        let start_time = start.trim().parse().ok()?;
        let end_time = match end.trim() {
            NULL_END => None,
            value => Some(value.parse().ok()?),
        };
        Some(Self {
            start_time,
            end_time,
        })
    }
}

/// File stem of the shard holding a secret's records.
pub fn shard_key(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[derive(Debug, Default)]
struct Shard {
    // Records within the retention horizon in append order; `None` until
    // first read.
    recent: Option<VecDeque<UsageRecord>>,
}

/// Append-only per-secret usage log, one CSV shard per secret.
#[derive(Debug)]
pub struct UsageLog {
    dir: PathBuf,
    retention_ms: i64,
    shards: std::sync::Mutex<HashMap<String, Arc<Mutex<Shard>>>>,
}

impl UsageLog {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RelayError> {
        Self::with_retention(dir, DEFAULT_WINDOW_MS).await
    }

    pub async fn with_retention(
        dir: impl Into<PathBuf>,
        retention_ms: i64,
    ) -> Result<Self, RelayError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            retention_ms,
            shards: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    fn shard_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{SHARD_EXTENSION}"))
    }

    fn shard(&self, key: &str) -> Arc<Mutex<Shard>> {
        let mut shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        shards.entry(key.to_owned()).or_default().clone()
    }

    /// Appends one record to the secret's shard.
    pub async fn record(
        &self,
        secret: &str,
        start_time: i64,
        end_time: Option<i64>,
    ) -> Result<(), RelayError> {
        let key = shard_key(secret);
        let record = UsageRecord {
            start_time,
            end_time,
        };

        let shard = self.shard(&key);
        let mut shard = shard.lock().await;

        if let Err(err) = append_record(&self.shard_path(&key), record).await {
            warn!(shard = %key, error = %err, "failed to append usage record");
            return Err(err.into());
        }

        if let Some(recent) = shard.recent.as_mut() {
            let cutoff = now_millis() - self.retention_ms;
            recent.push_back(record);
            // amortized trim; stragglers behind the front go on the next prune
            while recent.front().is_some_and(|r| r.start_time < cutoff) {
                recent.pop_front();
            }
        }
        Ok(())
    }

    /// Durable records with `start <= start_time <= end`; unbounded sides are
    /// open.
    pub async fn query(
        &self,
        secret: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<UsageRecord>, RelayError> {
        let key = shard_key(secret);
        let shard = self.shard(&key);
        let _shard = shard.lock().await;

        let records = read_records(&self.shard_path(&key)).await?;
        Ok(records
            .into_iter()
            .filter(|r| start.is_none_or(|s| r.start_time >= s))
            .filter(|r| end.is_none_or(|e| r.start_time <= e))
            .collect())
    }

    /// Records that started within the last `window_ms` milliseconds.
    pub async fn query_last_window(
        &self,
        secret: &str,
        window_ms: i64,
    ) -> Result<Vec<UsageRecord>, RelayError> {
        self.window_at(secret, window_ms, now_millis()).await
    }

    async fn window_at(
        &self,
        secret: &str,
        window_ms: i64,
        now: i64,
    ) -> Result<Vec<UsageRecord>, RelayError> {
        let cutoff = now - window_ms;
        if window_ms > self.retention_ms {
            return self.query(secret, Some(cutoff), None).await;
        }

        let key = shard_key(secret);
        let shard = self.shard(&key);
        let mut shard = shard.lock().await;

        if shard.recent.is_none() {
            let horizon = now - self.retention_ms;
            let loaded: VecDeque<_> = read_records(&self.shard_path(&key))
                .await?
                .into_iter()
                .filter(|r| r.start_time >= horizon)
                .collect();
            debug!(shard = %key, count = loaded.len(), "loaded usage window");
            shard.recent = Some(loaded);
        }

        let recent = shard.recent.get_or_insert_with(VecDeque::new);
        Ok(recent
            .iter()
            .filter(|r| r.start_time >= cutoff)
            .copied()
            .collect())
    }

    /// Drops every record of the secret that started before `now - window_ms`.
    /// Returns the number of records removed.
    pub async fn prune(&self, secret: &str, window_ms: i64) -> Result<usize, RelayError> {
        self.prune_shard(&shard_key(secret), now_millis() - window_ms)
            .await
    }

    async fn prune_shard(&self, key: &str, cutoff: i64) -> Result<usize, RelayError> {
        let shard = self.shard(key);
        let mut shard = shard.lock().await;

        let path = self.shard_path(key);
        let records = read_records(&path).await?;
        let total = records.len();
        let kept: Vec<_> = records
            .into_iter()
            .filter(|r| r.start_time >= cutoff)
            .collect();
        let removed = total - kept.len();

        if removed > 0 {
            rewrite_records(&path, &kept).await?;
        }
        if let Some(recent) = shard.recent.as_mut() {
            recent.retain(|r| r.start_time >= cutoff);
        }
        Ok(removed)
    }

    /// Prunes every shard in the log directory. A shard that fails is logged
    /// and left for the next pass.
    pub async fn prune_all(&self, window_ms: i64) -> Result<usize, RelayError> {
        let cutoff = now_millis() - window_ms;
        let mut removed = 0;

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SHARD_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            match self.prune_shard(key, cutoff).await {
                Ok(count) => removed += count,
                Err(err) => warn!(shard = %key, error = %err, "failed to prune usage shard"),
            }
        }

        if removed > 0 {
            info!(removed, "pruned expired usage records");
        }
        Ok(removed)
    }

    pub fn spawn_retention(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(err) = self.prune_all(self.retention_ms).await {
                    warn!(error = %err, "usage retention pass failed");
                }
            }
        })
    }
}

async fn append_record(path: &Path, record: UsageRecord) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    let mut chunk = String::new();
    if file.metadata().await?.len() == 0 {
        chunk.push_str(SHARD_HEADER);
        chunk.push('\n');
    }
    chunk.push_str(&record.to_line());

    file.write_all(chunk.as_bytes()).await?;
    file.flush().await
}

async fn read_records(path: &Path) -> Result<Vec<UsageRecord>, RelayError> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    // lines are decoded one by one so a corrupt line only costs itself
    let mut records = Vec::new();
    for (idx, raw) in content.split(|b| *b == b'\n').enumerate() {
        let Ok(line) = std::str::from_utf8(raw) else {
            warn!(path = %path.display(), line = idx + 1, "skipping non-utf8 usage line");
            continue;
        };
        if line.trim().is_empty() || (idx == 0 && line.trim() == SHARD_HEADER) {
            continue;
        }
        match UsageRecord::parse_line(line) {
            Some(record) => records.push(record),
            None => warn!(path = %path.display(), line = idx + 1, "skipping malformed usage line"),
        }
    }
    Ok(records)
}

async fn rewrite_records(path: &Path, records: &[UsageRecord]) -> std::io::Result<()> {
    let mut content = String::with_capacity(SHARD_HEADER.len() + 1 + records.len() * 28);
    content.push_str(SHARD_HEADER);
    content.push('\n');
    for record in records {
        content.push_str(&record.to_line());
    }

    let tmp = path.with_extension(format!("{SHARD_EXTENSION}.tmp"));
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "sk-usage-test";

    async fn open_log(dir: &tempfile::TempDir) -> UsageLog {
        UsageLog::open(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn query_filters_by_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;

        log.record(SECRET, 100, Some(150)).await.unwrap();
        log.record(SECRET, 200, None).await.unwrap();
        log.record(SECRET, 300, Some(310)).await.unwrap();

        let all = log.query(SECRET, None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(
            all[1],
            UsageRecord {
                start_time: 200,
                end_time: None
            }
        );

        let middle = log.query(SECRET, Some(150), Some(300)).await.unwrap();
        let starts: Vec<_> = middle.iter().map(|r| r.start_time).collect();
        assert_eq!(starts, vec![200, 300]);

        let from = log.query(SECRET, Some(201), None).await.unwrap();
        assert_eq!(from.len(), 1);

        let until = log.query(SECRET, None, Some(99)).await.unwrap();
        assert!(until.is_empty());

        assert!(log.query("sk-other", None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_window_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let now = now_millis();

        log.record(SECRET, now - 8 * DAY_MS, Some(now - 8 * DAY_MS + 5))
            .await
            .unwrap();
        log.record(SECRET, now - 7 * DAY_MS, None).await.unwrap();
        log.record(SECRET, now - 6 * DAY_MS, Some(now - 6 * DAY_MS + 5))
            .await
            .unwrap();

        let window = log.window_at(SECRET, DEFAULT_WINDOW_MS, now).await.unwrap();
        let starts: Vec<_> = window.iter().map(|r| r.start_time).collect();
        assert_eq!(starts, vec![now - 7 * DAY_MS, now - 6 * DAY_MS]);

        // Wider than retention: served from disk.
        let wide = log.window_at(SECRET, 30 * DAY_MS, now).await.unwrap();
        assert_eq!(wide.len(), 3);
    }

    #[tokio::test]
    async fn loaded_window_sees_later_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let now = now_millis();

        log.record(SECRET, now - 1_000, Some(now - 900)).await.unwrap();
        assert_eq!(
            log.query_last_window(SECRET, DEFAULT_WINDOW_MS)
                .await
                .unwrap()
                .len(),
            1
        );

        log.record(SECRET, now - 500, None).await.unwrap();
        let window = log
            .query_last_window(SECRET, DEFAULT_WINDOW_MS)
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[1].end_time, None);
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_retained() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(open_log(&dir).await);

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move { log.record(SECRET, 1_000 + i, Some(2_000 + i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut starts: Vec<_> = log
            .query(SECRET, None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.start_time)
            .collect();
        starts.sort_unstable();
        assert_eq!(starts, (1_000..1_050).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn prune_rewrites_shard_and_window() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let now = now_millis();

        log.record(SECRET, now - 3 * DAY_MS, None).await.unwrap();
        log.record(SECRET, now - DAY_MS, Some(now - DAY_MS + 10))
            .await
            .unwrap();
        assert_eq!(
            log.query_last_window(SECRET, DEFAULT_WINDOW_MS)
                .await
                .unwrap()
                .len(),
            2
        );

        let removed = log.prune(SECRET, 2 * DAY_MS).await.unwrap();
        assert_eq!(removed, 1);

        let durable = log.query(SECRET, None, None).await.unwrap();
        assert_eq!(durable.len(), 1);
        assert_eq!(durable[0].start_time, now - DAY_MS);
        assert_eq!(
            log.query_last_window(SECRET, DEFAULT_WINDOW_MS)
                .await
                .unwrap(),
            durable
        );

        let content = std::fs::read_to_string(dir.path().join(format!("{}.csv", shard_key(SECRET))))
            .unwrap();
        assert!(content.starts_with("startTime,endTime\n"));
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn prune_all_covers_every_shard() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let now = now_millis();

        log.record("sk-a", now - 10 * DAY_MS, None).await.unwrap();
        log.record("sk-b", now - 9 * DAY_MS, None).await.unwrap();
        log.record("sk-b", now, None).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let removed = log.prune_all(DEFAULT_WINDOW_MS).await.unwrap();
        assert_eq!(removed, 2);
        assert!(log.query("sk-a", None, None).await.unwrap().is_empty());
        assert_eq!(log.query("sk-b", None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn records_survive_reopen_and_skip_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(&dir).await;
            log.record(SECRET, 10, Some(20)).await.unwrap();
            log.record(SECRET, 30, None).await.unwrap();
        }

        let path = dir.path().join(format!("{}.csv", shard_key(SECRET)));
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("garbage\n");
        std::fs::write(&path, content).unwrap();

        let reopened = open_log(&dir).await;
        let records = reopened.query(SECRET, None, None).await.unwrap();
        assert_eq!(
            records,
            vec![
                UsageRecord {
                    start_time: 10,
                    end_time: Some(20)
                },
                UsageRecord {
                    start_time: 30,
                    end_time: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_hide_the_rest_of_the_shard() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let now = now_millis();
        log.record(SECRET, now - 2_000, Some(now - 1_900)).await.unwrap();

        let path = dir.path().join(format!("{}.csv", shard_key(SECRET)));
        let mut content = std::fs::read(&path).unwrap();
        content.extend_from_slice(b"\xff\xfe,\xc3\n");
        std::fs::write(&path, content).unwrap();
        log.record(SECRET, now - 1_000, None).await.unwrap();

        let starts: Vec<_> = log
            .query(SECRET, None, None)
            .await
            .unwrap()
            .iter()
            .map(|r| r.start_time)
            .collect();
        assert_eq!(starts, vec![now - 2_000, now - 1_000]);
        assert_eq!(
            log.query_last_window(SECRET, DEFAULT_WINDOW_MS)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn appends_trim_expired_records_from_the_loaded_window() {
        let dir = tempfile::tempdir().unwrap();
        let log = UsageLog::with_retention(dir.path(), DAY_MS).await.unwrap();
        let now = now_millis();

        // load the window, then append an already expired record followed by a fresh one
        assert!(log.query_last_window(SECRET, DAY_MS).await.unwrap().is_empty());
        log.record(SECRET, now - 2 * DAY_MS, None).await.unwrap();
        log.record(SECRET, now - 1_000, Some(now)).await.unwrap();

        {
            let shard = log.shard(&shard_key(SECRET));
            let shard = shard.lock().await;
            let recent = shard.recent.as_ref().unwrap();
            assert_eq!(recent.len(), 1);
            assert_eq!(recent.front().map(|r| r.start_time), Some(now - 1_000));
        }

        // the shard on disk keeps both until a prune
        assert_eq!(log.query(SECRET, None, None).await.unwrap().len(), 2);
        assert_eq!(log.query_last_window(SECRET, DAY_MS).await.unwrap().len(), 1);
    }

    #[test]
    fn shard_key_is_sha256_hex() {
        assert_eq!(
            shard_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn record_serializes_in_camel_case() {
        let json = serde_json::to_value(UsageRecord {
            start_time: 1,
            end_time: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"startTime": 1, "endTime": null}));
    }
}
