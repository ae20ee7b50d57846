use std::{
    collections::HashMap,
    path::Path,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::RelayError;

pub const DEFAULT_LOCK_ATTEMPTS: u32 = 10;
pub const DEFAULT_LOCK_BACKOFF: Duration = Duration::from_millis(100);

const SECRET_PREFIX: &str = "sk-";
const TOKEN_BYTES: usize = 32;

// SQLite primary result codes for a database held by another connection.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// A durable binding between an owner and the secret issued to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub id: String,
    pub owner_label: String,
    pub secret: String,
    pub created_at: DateTime<Utc>,
}

/// Read-side copy of the `api_keys` table, in insertion order, as of
/// `revision`.
#[derive(Debug, Default)]
struct Mirror {
    revision: i64,
    records: Vec<KeyRecord>,
    by_secret: HashMap<String, usize>,
}

impl Mirror {
    fn from_records(revision: i64, records: Vec<KeyRecord>) -> Self {
        let mut mirror = Self {
            revision,
            records,
            by_secret: HashMap::new(),
        };
        mirror.reindex();
        mirror
    }

    fn reindex(&mut self) {
        self.by_secret = self
            .records
            .iter()
            .enumerate()
            .map(|(idx, record)| (record.secret.clone(), idx))
            .collect();
    }

    fn push(&mut self, record: KeyRecord) {
        self.by_secret
            .insert(record.secret.clone(), self.records.len());
        self.records.push(record);
    }

    fn remove(&mut self, id: &str) {
        if let Some(pos) = self.records.iter().position(|r| r.id == id) {
            self.records.remove(pos);
            self.reindex();
        }
    }

    fn by_secret(&self, secret: &str) -> Option<&KeyRecord> {
        self.by_secret
            .get(secret)
            .and_then(|idx| self.records.get(*idx))
    }
}

/// API-key store backed by SQLite.
///
/// SQLite's file lock is the cross-process mutex for mutations. A write first
/// takes it with `BEGIN IMMEDIATE` on a dedicated connection; only that
/// statement is retried, with a fixed backoff, and the write fails with
/// [`RelayError::LockTimeout`] once the attempts run out. Nothing else runs
/// until the lock is held.
///
/// Reads are served from an in-memory mirror. Every committed mutation bumps
/// a revision counter stored next to the keys, and a read reloads the mirror
/// when the stored revision has moved past it, so commits made by other
/// processes are picked up.
#[derive(Debug)]
pub struct KeyStore {
    pool: SqlitePool,
    mirror: RwLock<Mirror>,
    write_lock: Mutex<()>,
    lock_attempts: u32,
    lock_backoff: Duration,
}

impl KeyStore {
    pub async fn open(database_path: &str) -> Result<Self, RelayError> {
        Self::open_with(database_path, DEFAULT_LOCK_ATTEMPTS, DEFAULT_LOCK_BACKOFF).await
    }

    pub async fn open_with(
        database_path: &str,
        lock_attempts: u32,
        lock_backoff: Duration,
    ) -> Result<Self, RelayError> {
        if let Some(parent) = Path::new(database_path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::ZERO);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            mirror: RwLock::new(Mirror::default()),
            write_lock: Mutex::new(()),
            lock_attempts: lock_attempts.max(1),
            lock_backoff,
        };

        let mut conn = store.begin_immediate().await?;
        let outcome = initialize_schema(&mut conn).await;
        finish_write(conn, outcome).await?;

        store.reload().await?;
        Ok(store)
    }

    /// Replaces the mirror with the committed contents of the database.
    pub async fn reload(&self) -> Result<(), RelayError> {
        let mut tx = self.pool.begin().await?;
        let revision = stored_revision(&mut tx).await?;
        let rows = sqlx::query(
            r#"
            SELECT id, owner_label, secret, created_at
            FROM api_keys
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        tx.rollback().await?;

        let records = rows
            .into_iter()
            .map(|row| -> Result<KeyRecord, sqlx::Error> {
                let created_at: i64 = row.try_get("created_at")?;
                Ok(KeyRecord {
                    id: row.try_get("id")?,
                    owner_label: row.try_get("owner_label")?,
                    secret: row.try_get("secret")?,
                    created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(revision, count = records.len(), "loaded api keys");
        let mut mirror = self.mirror_mut();
        // a concurrent local commit may already have moved the mirror ahead
        if revision >= mirror.revision {
            *mirror = Mirror::from_records(revision, records);
        }
        Ok(())
    }

    pub async fn create(&self, owner_label: &str) -> Result<KeyRecord, RelayError> {
        let label = owner_label.trim();
        if label.is_empty() {
            return Err(RelayError::InvalidInput("ownerLabel is required".to_owned()));
        }

        let _guard = self.write_lock.lock().await;
        let mut conn = self.begin_immediate().await?;
        let outcome = insert_record(&mut conn, label).await;
        let (revision, record) = finish_write(conn, outcome).await?;

        self.apply_commit(revision, |mirror| mirror.push(record.clone()))
            .await;
        info!(key_id = %record.id, owner = %record.owner_label, "created api key");
        Ok(record)
    }

    pub async fn list(&self) -> Vec<KeyRecord> {
        self.refresh().await;
        self.mirror().records.clone()
    }

    pub async fn get_by_owner(&self, owner_label: &str) -> Option<KeyRecord> {
        let label = owner_label.trim();
        self.refresh().await;
        self.mirror()
            .records
            .iter()
            .find(|r| r.owner_label == label)
            .cloned()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<KeyRecord> {
        self.refresh().await;
        self.mirror().records.iter().find(|r| r.id == id).cloned()
    }

    pub async fn validate(&self, secret: &str) -> Option<KeyRecord> {
        self.refresh().await;
        self.mirror().by_secret(secret).cloned()
    }

    pub async fn delete(&self, id: &str) -> Result<(), RelayError> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.begin_immediate().await?;
        let outcome = delete_record(&mut conn, id).await;
        let Some(revision) = finish_write(conn, outcome).await? else {
            return Err(RelayError::NotFound("API key not found".to_owned()));
        };

        self.apply_commit(revision, |mirror| mirror.remove(id)).await;
        info!(key_id = %id, "deleted api key");
        Ok(())
    }

    /// Reloads the mirror if another connection committed since it was
    /// loaded. On a read failure the current mirror keeps serving.
    async fn refresh(&self) {
        if let Err(err) = self.refresh_if_stale().await {
            warn!(error = %err, "could not check key store for external changes");
        }
    }

    async fn refresh_if_stale(&self) -> Result<(), RelayError> {
        let revision = sqlx::query_scalar::<_, i64>(
            "SELECT revision FROM key_revision WHERE id = 0",
        )
        .fetch_one(&self.pool)
        .await?;

        let known = self.mirror().revision;
        if revision != known {
            debug!(known, revision, "key store changed externally");
            self.reload().await?;
        }
        Ok(())
    }

    /// Moves the mirror to `revision` after a local commit.
    async fn apply_commit(&self, revision: i64, change: impl FnOnce(&mut Mirror)) {
        {
            let mut mirror = self.mirror_mut();
            if mirror.revision >= revision {
                return;
            }
            if mirror.revision == revision - 1 {
                change(&mut mirror);
                mirror.revision = revision;
                return;
            }
        }

        // other writers committed in between
        if let Err(err) = self.reload().await {
            warn!(error = %err, "failed to reload api keys after commit");
        }
    }

    /// Takes SQLite's write lock with `BEGIN IMMEDIATE`, retrying only that
    /// statement. A connection whose `BEGIN` failed is closed, never reused.
    async fn begin_immediate(&self) -> Result<PoolConnection<Sqlite>, RelayError> {
        for attempt in 1..=self.lock_attempts {
            let mut conn = self.pool.acquire().await?;
            let began = sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await;
            match began {
                Ok(_) => return Ok(conn),
                Err(err) => {
                    discard(conn).await;
                    if !is_lock_contention(&err) {
                        return Err(err.into());
                    }
                    debug!(attempt, "key store locked by another writer");
                    if attempt < self.lock_attempts {
                        tokio::time::sleep(self.lock_backoff).await;
                    }
                }
            }
        }

        Err(RelayError::LockTimeout {
            attempts: self.lock_attempts,
        })
    }

    fn mirror(&self) -> RwLockReadGuard<'_, Mirror> {
        self.mirror.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn mirror_mut(&self) -> RwLockWriteGuard<'_, Mirror> {
        self.mirror.write().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn initialize_schema(conn: &mut SqliteConnection) -> Result<(), RelayError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            owner_label TEXT NOT NULL UNIQUE,
            secret TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retired_secrets (
            secret TEXT PRIMARY KEY,
            retired_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS key_revision (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            revision INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO key_revision (id, revision) VALUES (0, 0)")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Inserts a fresh record for `label`. Must run with the write lock held.
async fn insert_record(
    conn: &mut SqliteConnection,
    label: &str,
) -> Result<(i64, KeyRecord), RelayError> {
    loop {
        let record = KeyRecord {
            id: random_hex(TOKEN_BYTES),
            owner_label: label.to_owned(),
            secret: format!("{SECRET_PREFIX}{}", random_hex(TOKEN_BYTES)),
            created_at: truncated_now(),
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO api_keys (id, owner_label, secret, created_at)
            SELECT ?, ?, ?, ?
            WHERE NOT EXISTS (SELECT 1 FROM retired_secrets WHERE secret = ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.owner_label)
        .bind(&record.secret)
        .bind(record.created_at.timestamp_millis())
        .bind(&record.secret)
        .execute(&mut *conn)
        .await;

        match inserted {
            Ok(done) if done.rows_affected() == 1 => {
                let revision = bump_revision(conn).await?;
                return Ok((revision, record));
            }
            // collided with a retired secret
            Ok(_) => continue,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                if db.message().contains("owner_label") {
                    return Err(owner_conflict());
                }
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Removes the row and retires its secret. `None` when no row matched.
async fn delete_record(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<i64>, RelayError> {
    let secret = sqlx::query_scalar::<_, String>(
        "DELETE FROM api_keys WHERE id = ? RETURNING secret",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(secret) = secret else {
        return Ok(None);
    };

    sqlx::query("INSERT OR IGNORE INTO retired_secrets (secret, retired_at) VALUES (?, ?)")
        .bind(&secret)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *conn)
        .await?;

    Ok(Some(bump_revision(conn).await?))
}

async fn bump_revision(conn: &mut SqliteConnection) -> Result<i64, RelayError> {
    let revision = sqlx::query_scalar::<_, i64>(
        "UPDATE key_revision SET revision = revision + 1 WHERE id = 0 RETURNING revision",
    )
    .fetch_one(&mut *conn)
    .await?;
    Ok(revision)
}

async fn stored_revision(conn: &mut SqliteConnection) -> Result<i64, RelayError> {
    let revision = sqlx::query_scalar::<_, i64>("SELECT revision FROM key_revision WHERE id = 0")
        .fetch_one(&mut *conn)
        .await?;
    Ok(revision)
}

/// Commits the transaction opened by [`KeyStore::begin_immediate`] when
/// `outcome` is `Ok`, rolls it back otherwise.
async fn finish_write<T>(
    mut conn: PoolConnection<Sqlite>,
    outcome: Result<T, RelayError>,
) -> Result<T, RelayError> {
    let end = if outcome.is_ok() { "COMMIT" } else { "ROLLBACK" };
    let ended = sqlx::query(end).execute(&mut *conn).await;
    if let Err(err) = ended {
        // closing the connection abandons whatever is still open on it
        discard(conn).await;
        return Err(outcome.err().unwrap_or_else(|| err.into()));
    }
    outcome
}

async fn discard(conn: PoolConnection<Sqlite>) {
    if let Err(err) = conn.close().await {
        debug!(error = %err, "failed to close key store connection");
    }
}

fn owner_conflict() -> RelayError {
    RelayError::Conflict("API key already exists for this owner".to_owned())
}

fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

// Millisecond precision, matching what the database stores.
fn truncated_now() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or_default()
}
