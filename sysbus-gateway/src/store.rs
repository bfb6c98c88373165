//! Persistent register store.
//!
//! A mirror of the device's register space plus the writes that have not
//! reached the bus yet, kept in memory for reads and in SQLite for restarts.
//! Every mutation is committed to the database while the store lock is
//! held, and the in-memory entry only changes once the commit succeeded.
//!
//! Pending writes go through three states:
//!
//! ```text
//! set_pending        take_dirty          confirm_written
//!  ──────────► Dirty ──────────► InFlight ───────────────► Clean
//!                ▲                   │
//!                └───── mark_failed ─┘
//! ```
//!
//! In-flight entries are persisted as dirty, so a crash between taking a
//! write and confirming it re-sends the write after restart.

use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Space;
use crate::error::StoreError;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS registers (
    space TEXT NOT NULL,
    address INTEGER NOT NULL,
    value INTEGER NOT NULL DEFAULT 0,
    dirty INTEGER NOT NULL DEFAULT 0,
    last_synced_at INTEGER,
    PRIMARY KEY (space, address)
)";

/// Delivery state of a register's local value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Value came from the bus (or was confirmed written).
    #[default]
    Clean,
    /// Written through the API, waiting for the reconciler.
    Dirty,
    /// Handed to the reconciler, not confirmed yet.
    InFlight,
}

/// One register as the store sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreEntry {
    pub space: Space,
    pub address: u16,
    pub value: u16,
    pub state: SyncState,
    /// Last poll or confirmed write (millis since epoch).
    pub last_synced_at: Option<i64>,
    #[serde(skip)]
    revision: u64,
}

impl StoreEntry {
    /// Entry for a register that was never populated.
    pub fn unpopulated(space: Space, address: u16) -> Self {
        Self {
            space,
            address,
            value: 0,
            state: SyncState::Clean,
            last_synced_at: None,
            revision: 0,
        }
    }

    /// Whether the value has not been confirmed on the bus.
    pub fn is_pending(&self) -> bool {
        self.state != SyncState::Clean
    }
}

/// A write handed out by [`RegisterStore::take_dirty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub space: Space,
    pub address: u16,
    pub value: u16,
    pub revision: u64,
}

struct Inner {
    entries: BTreeMap<(Space, u16), StoreEntry>,
    revision: u64,
}

/// SQLite-backed register store.
pub struct RegisterStore {
    pool: SqlitePool,
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl RegisterStore {
    /// Open (or create) the store at `path`, making sure a row exists for
    /// every key. Existing rows keep their value and dirty flag.
    pub async fn open(path: impl AsRef<Path>, keys: &[(Space, u16)]) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // All writes are serialized by the store lock
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        let mut tx = pool.begin().await?;
        for (space, address) in keys {
            sqlx::query("INSERT OR IGNORE INTO registers (space, address) VALUES (?, ?)")
                .bind(space.as_str())
                .bind(i64::from(*address))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let entries = load(&pool).await?;
        let dirty = entries.values().filter(|e| e.is_pending()).count();
        info!(
            path = %path.display(),
            registers = entries.len(),
            dirty,
            "Register store opened"
        );

        Ok(Self {
            pool,
            inner: Mutex::new(Inner {
                entries,
                revision: 0,
            }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last known value, zero if the register was never populated.
    pub async fn get(&self, space: Space, address: u16) -> u16 {
        self.entry(space, address)
            .await
            .map(|e| e.value)
            .unwrap_or_default()
    }

    pub async fn entry(&self, space: Space, address: u16) -> Option<StoreEntry> {
        self.inner.lock().await.entries.get(&(space, address)).cloned()
    }

    /// Every entry, ordered by space and address.
    pub async fn snapshot(&self) -> Vec<StoreEntry> {
        self.inner.lock().await.entries.values().cloned().collect()
    }

    /// Record a value the API wants written to the bus. Only holding
    /// registers are writable; the caller checks.
    pub async fn set_pending(&self, space: Space, address: u16, value: u16) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        sqlx::query(
            "INSERT INTO registers (space, address, value, dirty) VALUES (?, ?, ?, 1)
             ON CONFLICT (space, address) DO UPDATE SET value = excluded.value, dirty = 1",
        )
        .bind(space.as_str())
        .bind(i64::from(address))
        .bind(i64::from(value))
        .execute(&self.pool)
        .await?;

        inner.revision += 1;
        let revision = inner.revision;
        let entry = inner
            .entries
            .entry((space, address))
            .or_insert_with(|| StoreEntry::unpopulated(space, address));
        entry.value = value;
        entry.state = SyncState::Dirty;
        entry.revision = revision;

        debug!(%space, address, value, "Write queued");
        Ok(())
    }

    /// Store one polled value. Returns `false` when the register holds a
    /// pending write, which a poll never overwrites.
    pub async fn apply_polled(&self, space: Space, address: u16, value: u16) -> Result<bool, StoreError> {
        Ok(self.apply_polled_range(space, address, &[value]).await? == 1)
    }

    /// Store the result of one range read in a single transaction. Returns
    /// the number of registers updated.
    pub async fn apply_polled_range(
        &self,
        space: Space,
        start: u16,
        values: &[u16],
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = chrono::Utc::now().timestamp_millis();

        let updates: Vec<(u16, u16)> = values
            .iter()
            .enumerate()
            .map(|(offset, value)| (start.wrapping_add(offset as u16), *value))
            .filter(|(address, _)| {
                inner
                    .entries
                    .get(&(space, *address))
                    .is_none_or(|e| !e.is_pending())
            })
            .collect();

        if updates.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for (address, value) in &updates {
            sqlx::query(
                "INSERT INTO registers (space, address, value, dirty, last_synced_at)
                 VALUES (?, ?, ?, 0, ?)
                 ON CONFLICT (space, address)
                 DO UPDATE SET value = excluded.value, last_synced_at = excluded.last_synced_at",
            )
            .bind(space.as_str())
            .bind(i64::from(*address))
            .bind(i64::from(*value))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        for (address, value) in &updates {
            let entry = inner
                .entries
                .entry((space, *address))
                .or_insert_with(|| StoreEntry::unpopulated(space, *address));
            entry.value = *value;
            entry.last_synced_at = Some(now);
        }

        Ok(updates.len())
    }

    /// Hand every dirty entry to the caller, marking it in flight.
    pub async fn take_dirty(&self) -> Vec<PendingWrite> {
        let mut inner = self.inner.lock().await;

        inner
            .entries
            .values_mut()
            .filter(|e| e.state == SyncState::Dirty)
            .map(|e| {
                e.state = SyncState::InFlight;
                PendingWrite {
                    space: e.space,
                    address: e.address,
                    value: e.value,
                    revision: e.revision,
                }
            })
            .collect()
    }

    /// Clear the dirty flag after the bus acknowledged `write`. Returns
    /// `false` if a newer value was queued meanwhile; that one stays dirty.
    pub async fn confirm_written(&self, write: &PendingWrite) -> Result<bool, StoreError> {
        self.clear(write, true).await
    }

    /// Drop a pending write without sending it.
    pub async fn discard(&self, write: &PendingWrite) -> Result<bool, StoreError> {
        self.clear(write, false).await
    }

    /// Return a write that could not be delivered to the dirty set.
    pub async fn mark_failed(&self, write: &PendingWrite) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&(write.space, write.address)) {
            if entry.state == SyncState::InFlight && entry.revision == write.revision {
                entry.state = SyncState::Dirty;
            }
        }
    }

    async fn clear(&self, write: &PendingWrite, synced: bool) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;

        let current = inner
            .entries
            .get(&(write.space, write.address))
            .is_some_and(|e| e.state == SyncState::InFlight && e.revision == write.revision);
        if !current {
            return Ok(false);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let query = if synced {
            sqlx::query(
                "UPDATE registers SET dirty = 0, last_synced_at = ? WHERE space = ? AND address = ?",
            )
            .bind(now)
        } else {
            sqlx::query("UPDATE registers SET dirty = 0 WHERE space = ? AND address = ?")
        };
        query
            .bind(write.space.as_str())
            .bind(i64::from(write.address))
            .execute(&self.pool)
            .await?;

        if let Some(entry) = inner.entries.get_mut(&(write.space, write.address)) {
            entry.state = SyncState::Clean;
            if synced {
                entry.last_synced_at = Some(now);
            }
        }

        Ok(true)
    }

    /// Close the database.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn load(pool: &SqlitePool) -> Result<BTreeMap<(Space, u16), StoreEntry>, StoreError> {
    let rows = sqlx::query("SELECT space, address, value, dirty, last_synced_at FROM registers")
        .fetch_all(pool)
        .await?;

    let mut entries = BTreeMap::new();
    for row in rows {
        let space: String = row.try_get("space")?;
        let address: i64 = row.try_get("address")?;
        let value: i64 = row.try_get("value")?;
        let dirty: bool = row.try_get("dirty")?;
        let last_synced_at: Option<i64> = row.try_get("last_synced_at")?;

        let (Ok(space), Ok(address), Ok(value)) = (
            space.parse::<Space>(),
            u16::try_from(address),
            u16::try_from(value),
        ) else {
            warn!(%space, address, value, "Skipping unreadable register row");
            continue;
        };

        entries.insert(
            (space, address),
            StoreEntry {
                space,
                address,
                value,
                state: if dirty {
                    SyncState::Dirty
                } else {
                    SyncState::Clean
                },
                last_synced_at,
                revision: 0,
            },
        );
    }

    Ok(entries)
}
