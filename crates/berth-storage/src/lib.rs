use std::error::Error;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use berth_domain::{BackupRecord, Host, Job, JobKind, Site, StatusEvent};
use fs2::FileExt;

pub mod json;
pub mod object;
pub mod sqlite;

pub use json::JsonFileStorage;
pub use object::{DirObjectStore, ObjectAcl, ObjectMeta, ObjectStore};
pub use sqlite::SqliteStorage;

#[derive(Debug)]
pub enum StorageError {
    IoError { message: String },
    ParseError { message: String },
    NotFound { key: String },
    Duplicate { key: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::IoError { message } => write!(f, "io error: {}", message),
            StorageError::ParseError { message } => write!(f, "parse error: {}", message),
            StorageError::NotFound { key } => write!(f, "not found: {}", key),
            StorageError::Duplicate { key } => write!(f, "duplicate: {}", key),
        }
    }
}

impl Error for StorageError {}

/// Document store for sites, hosts, jobs and backup records.
///
/// Read-after-write per record; `with_site_lock` is the `for_update`
/// primitive that serializes join evaluation for one site across
/// processes. Only the pipeline executor and the reconciler write
/// `Site::status`.
pub trait DocumentStore: Send + Sync {
    fn get_site(&self, name: &str) -> Result<Site, StorageError>;
    fn put_site(&self, site: &Site) -> Result<(), StorageError>;
    fn delete_site(&self, name: &str) -> Result<(), StorageError>;
    fn list_sites(&self) -> Result<Vec<Site>, StorageError>;
    /// Rename a site document and repoint every dependent record.
    fn rename_site(&self, old: &str, new: &str) -> Result<(), StorageError>;

    fn get_host(&self, id: &str) -> Result<Host, StorageError>;
    fn put_host(&self, host: &Host) -> Result<(), StorageError>;
    fn delete_host(&self, id: &str) -> Result<(), StorageError>;
    fn list_hosts(&self) -> Result<Vec<Host>, StorageError>;

    fn get_job(&self, id: &str) -> Result<Job, StorageError>;
    fn put_job(&self, job: &Job) -> Result<(), StorageError>;
    fn jobs_for_site(&self, site: &str) -> Result<Vec<Job>, StorageError>;
    /// Most recently started job of one kind for a site; how the
    /// reconciler re-reads the sibling's current truth.
    fn latest_job(&self, site: &str, kind: JobKind) -> Result<Option<Job>, StorageError>;

    fn get_backup(&self, id: &str) -> Result<BackupRecord, StorageError>;
    fn put_backup(&self, backup: &BackupRecord) -> Result<(), StorageError>;
    fn backups_for_site(&self, site: &str) -> Result<Vec<BackupRecord>, StorageError>;
    fn delete_backups_for_site(&self, site: &str) -> Result<(), StorageError>;
    fn backup_for_job(&self, job_id: &str) -> Result<Option<BackupRecord>, StorageError>;

    fn with_site_lock(
        &self,
        site: &str,
        f: &mut dyn FnMut() -> Result<(), StorageError>,
    ) -> Result<(), StorageError>;
}

/// Receives one event per resolved site status transition.
pub trait StatusEventSink: Send + Sync {
    fn site_status_changed(&self, event: &StatusEvent) -> Result<(), StorageError>;
}

/// Sink for contexts that have nowhere to deliver events (dry runs, tests).
pub struct NullEventSink;

impl StatusEventSink for NullEventSink {
    fn site_status_changed(&self, _event: &StatusEvent) -> Result<(), StorageError> {
        Ok(())
    }
}

pub(crate) fn with_keyed_lock<T>(
    lock_dir: &Path,
    key: &str,
    action: &mut dyn FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    std::fs::create_dir_all(lock_dir).map_err(|e| StorageError::IoError {
        message: format!("failed to create lock dir {}: {}", lock_dir.display(), e),
    })?;
    let lock_path = lock_dir.join(format!(".{}.lock", sanitize_key(key)));
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| StorageError::IoError {
            message: format!("failed to open lock file {}: {}", lock_path.display(), e),
        })?;

    lock_file.lock_exclusive().map_err(|e| StorageError::IoError {
        message: format!("failed to lock {} exclusively: {}", lock_path.display(), e),
    })?;

    let result = action();
    let _ = lock_file.unlock();
    result
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// Document store and event sink rolled together, the way both backends
/// ship them.
pub trait StorageBackend: Send + Sync {
    fn store(&self) -> &dyn DocumentStore;
    fn sink(&self) -> &dyn StatusEventSink;
}

impl StorageBackend for JsonFileStorage {
    fn store(&self) -> &dyn DocumentStore {
        self
    }

    fn sink(&self) -> &dyn StatusEventSink {
        self
    }
}

impl StorageBackend for SqliteStorage {
    fn store(&self) -> &dyn DocumentStore {
        self
    }

    fn sink(&self) -> &dyn StatusEventSink {
        self
    }
}

pub fn create_storage_backend() -> Box<dyn StorageBackend> {
    use std::env;
    let base_path = if let Ok(custom) = env::var("BERTH_HOME") {
        PathBuf::from(custom)
    } else {
        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".berth")
    };

    let backend = env::var("BERTH_STORAGE_BACKEND")
        .unwrap_or_else(|_| "json".to_string())
        .to_lowercase();
    if backend == "sqlite" {
        let db_path = env::var("BERTH_STORAGE_SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_path.join("berth.db"));
        Box::new(SqliteStorage::new(db_path))
    } else {
        Box::new(JsonFileStorage::new(base_path))
    }
}
