//! On-disk storage for one backend instance.
//!
//! Every index lives in its own SQLite file under the instance directory so
//! that each pipeline thread owns the files it writes. Writers batch their
//! statements into transactions and commit every [`BATCH_SIZE`] operations.

pub mod entryrdn;
pub mod id2entry;
pub mod index;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::{ImportError, Result};

/// Default timeout for SQLite busy handler (in seconds).
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

/// Operations per write transaction.
pub const BATCH_SIZE: usize = 2_000;

pub const ID2ENTRY: &str = "id2entry";
/// Primary store being rewritten into the RDN form.
pub const ID2ENTRY_REWRITE: &str = "id2entry.rewrite";
pub const PARENTID: &str = "parentid";
pub const ANCESTORID: &str = "ancestorid";
pub const ENTRYRDN: &str = "entryrdn";
pub const ENTRYDN: &str = "entrydn";
pub const VLV_PREFIX: &str = "vlv#";

/// Open a connection with the import pragmas.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS))?;
    // WAL plus relaxed sync: the import rebuilds everything on failure anyway
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -16000;
        PRAGMA temp_store = MEMORY;
        "#,
    )?;
    Ok(conn)
}

/// Transaction batching for a single-writer connection.
#[derive(Debug, Default)]
pub(crate) struct WriteBatch {
    pending: usize,
}

impl WriteBatch {
    /// Count one write, opening a transaction first if none is open.
    pub fn touch(&mut self, conn: &Connection) -> Result<()> {
        if self.pending == 0 {
            conn.execute_batch("BEGIN")?;
        }
        self.pending += 1;
        if self.pending >= BATCH_SIZE {
            self.commit(conn)?;
        }
        Ok(())
    }

    pub fn commit(&mut self, conn: &Connection) -> Result<()> {
        if self.pending > 0 {
            self.pending = 0;
            conn.execute_batch("COMMIT")
                .map_err(|e| ImportError::from_write(e, "commit"))?;
        }
        Ok(())
    }
}

/// File-system layout of one backend instance.
#[derive(Debug, Clone)]
pub struct Instance {
    name: String,
    dir: PathBuf,
}

/// Held while a job owns the instance; removes the lock file on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Instance {
    pub fn new(db_dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            dir: db_dir.join(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.join(format!("{}.db", ID2ENTRY)).exists()
    }

    fn lock_path(&self) -> PathBuf {
        let parent = self.dir.parent().unwrap_or(Path::new("."));
        parent.join(format!("{}.lock", self.name))
    }

    /// Claim the instance for a job. Fails with [`ImportError::Busy`] when another job holds it.
    pub fn lock(&self) -> Result<InstanceLock> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(InstanceLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ImportError::Busy(self.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete and recreate the instance directory.
    pub fn reset(&self) -> Result<()> {
        self.remove()?;
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Delete the instance directory and everything in it.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the database file for an index.
    pub fn path_for(&self, index: &str) -> PathBuf {
        let file: String = index
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '#' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.db", file.to_lowercase()))
    }

    /// Delete an index file (and its WAL side files).
    pub fn remove_index(&self, index: &str) -> Result<()> {
        let path = self.path_for(index);
        for suffix in ["", "-wal", "-shm"] {
            let mut p = path.clone().into_os_string();
            p.push(suffix);
            match fs::remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Replace one index file with another, used when a rewritten primary store is swapped in.
    pub fn replace_index(&self, index: &str, from: &Path) -> Result<()> {
        self.remove_index(index)?;
        fs::rename(from, self.path_for(index))?;
        Ok(())
    }
}
