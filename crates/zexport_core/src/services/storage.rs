//! Durable snapshot storage.
//!
//! Snapshots are rows in a SQLite database plus one timestamped dump file
//! each. A single-row `latest` table points at the most recently committed
//! snapshot, and a canonical current file in the data directory always holds
//! that snapshot's rendered text.
//!
//! # Data Directory Layout
//!
//! - `zexport.db` - snapshots, latest pointer, migrations
//! - `dumps/` - one `<prefix>-<timestamp>-<id>.txt` per snapshot
//! - `current.txt` (configurable) - rendered latest snapshot
//! - `logs/` - rotating log files
//!
//! # Default Locations
//!
//! - **macOS**: `~/Library/Application Support/zexport`
//! - **Windows**: `%APPDATA%\zexport`
//! - **Linux**: `~/.local/share/zexport`
//! - **Debug builds**: `./zexport_data` in current directory

use crate::error::ZexportError;
use crate::models::{render_records, ExportOptions, Record, Snapshot, SnapshotDraft, SnapshotMeta};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Subdirectory holding the timestamped dump files.
pub const DUMPS_DIR: &str = "dumps";

/// SQLite database file name.
pub const DATABASE_FILE: &str = "zexport.db";

/// Get the default data directory.
///
/// Returns `./zexport_data` in debug builds and the platform data directory
/// otherwise.
pub fn default_data_dir() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from("./zexport_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| d.join("zexport"))
            .unwrap_or_else(|| PathBuf::from("./zexport_data"))
    }
}

/// Initialize the data directory, creating it if needed.
pub fn init_data_dir(path: &Path) -> Result<(), ZexportError> {
    if path.exists() {
        if !path.is_dir() {
            return Err(ZexportError::storage(
                format!("Data path exists but is not a directory: {}", path.display()),
                Some("Select a different location or remove the existing file"),
            ));
        }
        return Ok(());
    }

    fs::create_dir_all(path).map_err(|e| {
        ZexportError::storage(
            format!("Failed to create data directory '{}': {}", path.display(), e),
            Some("Check permissions or select a different location"),
        )
    })?;

    tracing::info!(path = %path.display(), "Created data directory");
    Ok(())
}

/// Write `content` to `target` so readers see either the old or the new file.
///
/// Writes and syncs a sibling temp file, then renames it over the target.
pub fn atomic_write(target: &Path, content: &[u8]) -> Result<(), ZexportError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = target.with_extension("tmp");
    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(ZexportError::storage_with_source(
            format!("Failed to write '{}'", target.display()),
            e,
        ));
    }
    Ok(())
}

/// SQLite-backed append-only snapshot store.
///
/// Thread-safe via internal Mutex. All methods block; call them from the
/// blocking thread pool when on the async runtime.
pub struct SnapshotStore {
    /// Thread-safe SQLite connection
    connection: Mutex<Connection>,
    /// Data directory path
    data_dir: PathBuf,
    /// Canonical latest file
    current_file: PathBuf,
    /// Dump file name prefix
    dump_prefix: String,
}

impl SnapshotStore {
    /// Open or create the store in the given data directory.
    pub fn open(data_dir: PathBuf, options: &ExportOptions) -> Result<Self, ZexportError> {
        init_data_dir(&data_dir)?;
        let db_path = data_dir.join(DATABASE_FILE);
        Self::open_with_path(db_path, data_dir, options)
    }

    /// Open the store with a specific database path.
    pub fn open_with_path(
        db_path: PathBuf,
        data_dir: PathBuf,
        options: &ExportOptions,
    ) -> Result<Self, ZexportError> {
        let connection = Connection::open(&db_path).map_err(|e| {
            ZexportError::storage(
                format!("Failed to open database '{}': {}", db_path.display(), e),
                Some("The database file may be corrupted. Move it aside to start fresh."),
            )
        })?;

        Self::configure_connection(&connection)?;

        let store = Self {
            connection: Mutex::new(connection),
            current_file: data_dir.join(&options.current_file_name),
            dump_prefix: options.dump_prefix.clone(),
            data_dir,
        };

        store.run_migrations()?;
        store.reconcile_current_file()?;

        tracing::info!(path = %db_path.display(), "Snapshot store opened");
        Ok(store)
    }

    fn configure_connection(conn: &Connection) -> Result<(), ZexportError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            ",
        )
        .map_err(|e| ZexportError::storage(format!("Failed to configure database: {e}"), None))
    }

    fn run_migrations(&self) -> Result<(), ZexportError> {
        let conn = self.connection.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                domain TEXT NOT NULL,
                step INTEGER NOT NULL,
                migration TEXT NOT NULL,
                PRIMARY KEY(domain, step)
            ) STRICT",
            [],
        )
        .map_err(|e| {
            ZexportError::storage(format!("Failed to create migrations table: {e}"), None)
        })?;

        Self::migrate_schema(&conn)
    }

    fn migrate_schema(conn: &Connection) -> Result<(), ZexportError> {
        const DOMAIN: &str = "snapshots";

        let current_step: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(step), 0) FROM migrations WHERE domain = ?",
                [DOMAIN],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_step < 1 {
            conn.execute_batch(
                "
                CREATE TABLE snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at TEXT NOT NULL,
                    record_count INTEGER NOT NULL,
                    file_name TEXT NOT NULL,
                    records_json TEXT NOT NULL
                ) STRICT;

                CREATE TABLE latest (
                    slot INTEGER PRIMARY KEY CHECK (slot = 1),
                    snapshot_id INTEGER NOT NULL,
                    updated_at TEXT NOT NULL,
                    FOREIGN KEY(snapshot_id) REFERENCES snapshots(id)
                ) STRICT;
                ",
            )
            .map_err(|e| ZexportError::storage(format!("Migration 1 failed: {e}"), None))?;

            conn.execute(
                "INSERT INTO migrations (domain, step, migration) VALUES (?, 1, 'initial_schema')",
                [DOMAIN],
            )
            .map_err(|e| ZexportError::storage(format!("Failed to record migration: {e}"), None))?;

            tracing::info!("Applied migration 1: initial_schema");
        }

        Ok(())
    }

    /// Get the canonical latest file path.
    pub fn current_file_path(&self) -> &Path {
        &self.current_file
    }

    /// Get the path of a snapshot's dump file.
    pub fn dump_path(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(DUMPS_DIR).join(file_name)
    }

    // ========== Write Path ==========

    /// Durably append a snapshot without making it the latest.
    pub fn append(&self, draft: &SnapshotDraft) -> Result<Snapshot, ZexportError> {
        let mut conn = self.connection.lock();
        self.append_locked(&mut conn, draft)
    }

    /// Repoint "latest" at an appended snapshot.
    pub fn set_latest(&self, id: i64) -> Result<(), ZexportError> {
        let mut conn = self.connection.lock();
        self.set_latest_locked(&mut conn, id)
    }

    /// Append a snapshot and make it the latest.
    pub fn commit(&self, draft: &SnapshotDraft) -> Result<Snapshot, ZexportError> {
        let mut conn = self.connection.lock();
        let snapshot = self.append_locked(&mut conn, draft)?;
        self.set_latest_locked(&mut conn, snapshot.id)?;

        tracing::info!(
            snapshot_id = snapshot.id,
            count = snapshot.record_count(),
            file = %snapshot.file_name,
            "Snapshot committed"
        );
        Ok(snapshot)
    }

    fn append_locked(
        &self,
        conn: &mut Connection,
        draft: &SnapshotDraft,
    ) -> Result<Snapshot, ZexportError> {
        let records_json = serde_json::to_string(&draft.records)?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO snapshots (created_at, record_count, file_name, records_json)
             VALUES (?1, ?2, '', ?3)",
            params![draft.created_at.to_rfc3339(), draft.record_count() as i64, records_json],
        )
        .map_err(|e| ZexportError::storage(format!("Failed to append snapshot: {e}"), None))?;

        let id = tx.last_insert_rowid();
        let file_name = self.dump_file_name(draft.created_at, id);
        tx.execute("UPDATE snapshots SET file_name = ?1 WHERE id = ?2", params![file_name, id])?;

        atomic_write(&self.dump_path(&file_name), render_records(&draft.records).as_bytes())?;

        tx.commit()
            .map_err(|e| ZexportError::storage(format!("Failed to commit snapshot: {e}"), None))?;

        tracing::debug!(snapshot_id = id, file = %file_name, "Snapshot appended");

        Ok(Snapshot {
            id,
            created_at: draft.created_at,
            file_name,
            records: draft.records.clone(),
        })
    }

    fn set_latest_locked(&self, conn: &mut Connection, id: i64) -> Result<(), ZexportError> {
        let tx = conn.transaction()?;

        let snapshot = Self::load_snapshot(&tx, id)?.ok_or_else(|| {
            ZexportError::storage(format!("Snapshot {id} does not exist"), None)
        })?;

        tx.execute(
            "INSERT INTO latest (slot, snapshot_id, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(slot) DO UPDATE SET
                snapshot_id = excluded.snapshot_id,
                updated_at = excluded.updated_at",
            params![id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| ZexportError::storage(format!("Failed to update latest: {e}"), None))?;

        atomic_write(&self.current_file, snapshot.content().as_bytes())?;

        tx.commit()
            .map_err(|e| ZexportError::storage(format!("Failed to commit latest: {e}"), None))?;

        tracing::debug!(snapshot_id = id, "Latest snapshot updated");
        Ok(())
    }

    /// Rewrite the current file from the latest pointer if they disagree.
    fn reconcile_current_file(&self) -> Result<(), ZexportError> {
        let latest = self.read_latest()?;

        match latest {
            Some(snapshot) => {
                let content = snapshot.content();
                let on_disk = fs::read(&self.current_file).ok();
                if on_disk.as_deref() != Some(content.as_bytes()) {
                    tracing::warn!(
                        snapshot_id = snapshot.id,
                        path = %self.current_file.display(),
                        "Current file out of date, rewriting from latest snapshot"
                    );
                    atomic_write(&self.current_file, content.as_bytes())?;
                }
            }
            None if self.current_file.exists() => {
                tracing::warn!(
                    path = %self.current_file.display(),
                    "Removing current file with no committed snapshot"
                );
                fs::remove_file(&self.current_file)?;
            }
            None => {}
        }

        Ok(())
    }

    // ========== Read Path ==========

    /// Load the most recently committed snapshot.
    pub fn read_latest(&self) -> Result<Option<Snapshot>, ZexportError> {
        let conn = self.connection.lock();
        match Self::latest_id_locked(&conn)? {
            Some(id) => Self::load_snapshot(&conn, id),
            None => Ok(None),
        }
    }

    /// Get the id of the latest snapshot.
    pub fn latest_id(&self) -> Result<Option<i64>, ZexportError> {
        let conn = self.connection.lock();
        Self::latest_id_locked(&conn)
    }

    /// Load a snapshot by id.
    pub fn get(&self, id: i64) -> Result<Option<Snapshot>, ZexportError> {
        let conn = self.connection.lock();
        Self::load_snapshot(&conn, id)
    }

    /// List snapshot metadata, newest first.
    pub fn list(&self, limit: usize) -> Result<Vec<SnapshotMeta>, ZexportError> {
        let conn = self.connection.lock();

        let mut stmt = conn.prepare(
            "SELECT id, created_at, file_name, record_count
             FROM snapshots
             ORDER BY id DESC
             LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (id, created_at, file_name, record_count) = row?;
            snapshots.push(SnapshotMeta {
                id,
                created_at: parse_timestamp(&created_at)?,
                file_name,
                record_count: record_count as usize,
            });
        }
        Ok(snapshots)
    }

    fn latest_id_locked(conn: &Connection) -> Result<Option<i64>, ZexportError> {
        conn.query_row("SELECT snapshot_id FROM latest WHERE slot = 1", [], |row| row.get(0))
            .optional()
            .map_err(ZexportError::from)
    }

    fn load_snapshot(conn: &Connection, id: i64) -> Result<Option<Snapshot>, ZexportError> {
        let row = conn
            .query_row(
                "SELECT id, created_at, file_name, records_json FROM snapshots WHERE id = ?",
                [id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, created_at, file_name, records_json)) = row else {
            return Ok(None);
        };

        let records: Vec<Record> = serde_json::from_str(&records_json)?;
        Ok(Some(Snapshot { id, created_at: parse_timestamp(&created_at)?, file_name, records }))
    }

    fn dump_file_name(&self, created_at: DateTime<Utc>, id: i64) -> String {
        let stamp = created_at.format("%Y-%m-%d_%H-%M-%S");
        if self.dump_prefix.is_empty() {
            format!("{stamp}-{id}.txt")
        } else {
            format!("{}-{stamp}-{id}.txt", self.dump_prefix)
        }
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ZexportError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ZexportError::storage(format!("Invalid timestamp '{value}': {e}"), None))
}
