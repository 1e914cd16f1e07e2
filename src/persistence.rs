//! Durable storage for the sealed chain.
//!
//! Every backend rewrites the whole chain on each save, so a save costs
//! O(chain length). An append-only segment log would remove that cost.

use crate::blockchain::Block;
use crate::config::{StorageBackend, StorageConfig};
use crate::error::{ChainError, Result};
use rusqlite::{params, Connection, ErrorCode};
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::warn;

/// Abstraction for persistence backends.
pub trait Persistence: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet;
    /// `Err(ChainError::CorruptPersistedChain)` when the stored content cannot be read back.
    fn load(&self) -> Result<Option<Vec<Block>>>;

    /// Overwrite the store with `blocks`. Failures are `PersistenceWriteFailure`.
    fn save(&self, blocks: &[Block]) -> Result<()>;

    /// Move unreadable content out of the way before it is overwritten.
    /// Returns where it went, if anywhere. Earlier quarantines are never
    /// overwritten.
    fn quarantine(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Human-readable location for log lines.
    fn describe(&self) -> String;
}

/// Open the backend selected in the configuration.
pub fn open_backend(config: &StorageConfig) -> Result<Box<dyn Persistence>> {
    Ok(match config.backend {
        StorageBackend::Json => Box::new(JsonFilePersistence::new(&config.path)),
        StorageBackend::Sqlite => Box::new(SqlitePersistence::open(&config.path)?),
        StorageBackend::Memory => Box::new(InMemoryPersistence::new()),
    })
}

/// UTC time down to the microsecond, used to name quarantined content.
fn quarantine_stamp() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%S%6fZ").to_string()
}

/// `<path>.corrupt-<stamp>`, with a counter appended if that name is taken.
fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = quarantine_stamp();
    let mut attempt = 0u32;
    loop {
        let mut name = path.as_os_str().to_os_string();
        name.push(".corrupt-");
        name.push(&stamp);
        if attempt > 0 {
            name.push(format!("-{}", attempt));
        }
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            return candidate;
        }
        attempt += 1;
    }
}

/// The chain as one pretty-printed JSON array, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        JsonFilePersistence {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn encode(blocks: &[Block]) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        blocks.serialize(&mut serializer)?;
        buf.push(b'\n');
        Ok(buf)
    }

    /// Write to a sibling temp file, fsync, then rename over the target so a
    /// crash leaves either the old or the new chain, never a torn one.
    fn write_atomically(&self, blocks: &[Block]) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let bytes = Self::encode(blocks)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl Persistence for JsonFilePersistence {
    fn load(&self) -> Result<Option<Vec<Block>>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice::<Vec<Block>>(&bytes)
            .map(Some)
            .map_err(|e| {
                ChainError::CorruptPersistedChain(format!("{}: {}", self.path.display(), e))
            })
    }

    fn save(&self, blocks: &[Block]) -> Result<()> {
        self.write_atomically(blocks).map_err(|e| {
            ChainError::PersistenceWriteFailure(format!(
                "Failed to write {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn quarantine(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let target = quarantine_path(&self.path);
        fs::rename(&self.path, &target)?;
        Ok(Some(target.display().to_string()))
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

fn is_not_a_database(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::NotADatabase)
}

/// SQLite-backed store: one row per block holding its JSON record.
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
    path: String,
    /// Set when the file exists but is not an SQLite database.
    unreadable: Mutex<Option<String>>,
}

impl SqlitePersistence {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        let unreadable = match Self::create_schema(&conn) {
            Ok(()) => None,
            Err(e) if is_not_a_database(&e) => {
                warn!(path, error = %e, "chain store is not an SQLite database");
                Some(e.to_string())
            }
            Err(e) => {
                return Err(ChainError::DatabaseError(format!(
                    "Failed to create blocks table: {}",
                    e
                )))
            }
        };

        Ok(SqlitePersistence {
            conn: Mutex::new(conn),
            path: path.to_string(),
            unreadable: Mutex::new(unreadable),
        })
    }

    fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                idx INTEGER PRIMARY KEY,
                hash TEXT NOT NULL,
                record TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    fn lock_unreadable(&self) -> Result<MutexGuard<'_, Option<String>>> {
        self.unreadable
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    fn write_all(&self, blocks: &[Block]) -> Result<()> {
        let conn_guard = self.lock()?;
        let tx = conn_guard.unchecked_transaction()?;

        tx.execute("DELETE FROM blocks", [])?;
        for block in blocks {
            let record = serde_json::to_string(block)?;
            tx.execute(
                "INSERT INTO blocks (idx, hash, record) VALUES (?1, ?2, ?3)",
                params![block.index as i64, block.hash()?, record],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Move the whole file aside and start an empty database in its place.
    fn quarantine_file(&self, conn_guard: &mut Connection) -> Result<String> {
        // Close the handle on the unreadable file before renaming it.
        *conn_guard = Connection::open_in_memory()?;
        let target = quarantine_path(Path::new(&self.path));
        fs::rename(&self.path, &target)?;

        *conn_guard = Connection::open(&self.path)?;
        Self::create_schema(conn_guard)?;
        Ok(target.display().to_string())
    }

    /// Rename the blocks table to a fresh `blocks_corrupt_<stamp>` table.
    fn quarantine_table(&self, conn: &Connection) -> Result<String> {
        let stamp = quarantine_stamp();
        let mut table = format!("blocks_corrupt_{}", stamp);
        let mut attempt = 0u32;
        while conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get::<_, i64>(0),
        )? > 0
        {
            attempt += 1;
            table = format!("blocks_corrupt_{}_{}", stamp, attempt);
        }

        conn.execute_batch(&format!("ALTER TABLE blocks RENAME TO {};", table))?;
        Self::create_schema(conn)?;
        Ok(format!("{}#{}", self.path, table))
    }
}

impl Persistence for SqlitePersistence {
    fn load(&self) -> Result<Option<Vec<Block>>> {
        if let Some(reason) = self.lock_unreadable()?.as_ref() {
            return Err(ChainError::CorruptPersistedChain(format!("{}: {}", self.path, reason)));
        }

        let conn_guard = self.lock()?;
        let mut stmt = conn_guard
            .prepare("SELECT idx, hash, record FROM blocks ORDER BY idx ASC")
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                let idx: i64 = row.get(0)?;
                let hash: String = row.get(1)?;
                let record: String = row.get(2)?;
                Ok((idx, hash, record))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query blocks: {}", e)))?;

        let mut blocks = Vec::new();
        for row in rows {
            let (idx, stored_hash, record) = row.map_err(|e| {
                ChainError::CorruptPersistedChain(format!("Failed to read row: {}", e))
            })?;
            let block: Block = serde_json::from_str(&record).map_err(|e| {
                ChainError::CorruptPersistedChain(format!("Block row {} is unreadable: {}", idx, e))
            })?;
            if block.hash()? != stored_hash {
                return Err(ChainError::CorruptPersistedChain(format!(
                    "Block row {} does not match its stored hash",
                    idx
                )));
            }
            blocks.push(block);
        }

        if blocks.is_empty() {
            Ok(None)
        } else {
            Ok(Some(blocks))
        }
    }

    fn save(&self, blocks: &[Block]) -> Result<()> {
        self.write_all(blocks)
            .map_err(|e| ChainError::PersistenceWriteFailure(format!("{}: {}", self.path, e)))
    }

    fn quarantine(&self) -> Result<Option<String>> {
        let mut conn_guard = self.lock()?;
        let mut unreadable = self.lock_unreadable()?;
        let place = if unreadable.is_some() {
            let place = self.quarantine_file(&mut conn_guard)?;
            *unreadable = None;
            place
        } else {
            self.quarantine_table(&conn_guard)?
        };
        Ok(Some(place))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    blocks: Arc<Mutex<Option<Vec<Block>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// What a reload would see right now.
    pub fn snapshot(&self) -> Option<Vec<Block>> {
        self.blocks.lock().ok().and_then(|blocks| blocks.clone())
    }
}

impl Persistence for InMemoryPersistence {
    fn load(&self) -> Result<Option<Vec<Block>>> {
        let blocks = self
            .blocks
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))?;
        Ok(blocks.clone())
    }

    fn save(&self, blocks: &[Block]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChainError::PersistenceWriteFailure(
                "in-memory store is refusing writes".to_string(),
            ));
        }
        let mut stored = self
            .blocks
            .lock()
            .map_err(|_| ChainError::PersistenceWriteFailure("Mutex poisoned".to_string()))?;
        *stored = Some(blocks.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
