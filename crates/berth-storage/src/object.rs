use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectAcl {
    Private,
    PublicRead,
}

impl ObjectAcl {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectAcl::Private => "private",
            ObjectAcl::PublicRead => "public-read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: u64,
}

/// Offsite artifact storage. `put` takes the ACL up front so a caller can
/// stage a download window (public-read, then revert to private) without a
/// separate round trip.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, body: &[u8], acl: ObjectAcl) -> Result<(), StorageError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError>;
    fn set_acl(&self, key: &str, acl: ObjectAcl) -> Result<(), StorageError>;
    fn public_url(&self, key: &str) -> String;
}

/// Directory-backed object store for local and offline setups. ACLs are
/// tracked in a sidecar tree; they only gain meaning once artifacts are
/// mirrored to a remote store.
pub struct DirObjectStore {
    base: PathBuf,
}

impl DirObjectStore {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.base.join(key))
    }

    fn acl_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.base.join(".acl").join(key))
    }

    fn collect(&self, dir: &Path, prefix: &str, out: &mut Vec<ObjectMeta>) -> Result<(), StorageError> {
        let entries = fs::read_dir(dir).map_err(|e| StorageError::IoError {
            message: format!("failed to read {}: {}", dir.display(), e),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::IoError {
                message: format!("failed to read object entry: {}", e),
            })?;
            let path = entry.path();
            let name = match path.file_name().and_then(|v| v.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if path.is_dir() {
                if name == ".acl" {
                    continue;
                }
                self.collect(&path, prefix, out)?;
                continue;
            }
            let relative = match path.strip_prefix(&self.base) {
                Ok(relative) => relative.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if !relative.starts_with(prefix) {
                continue;
            }
            let metadata = entry.metadata().map_err(|e| StorageError::IoError {
                message: format!("failed to stat {}: {}", path.display(), e),
            })?;
            let last_modified = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            out.push(ObjectMeta {
                key: relative,
                size: metadata.len(),
                last_modified,
            });
        }
        Ok(())
    }
}

impl ObjectStore for DirObjectStore {
    fn put(&self, key: &str, body: &[u8], acl: ObjectAcl) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::IoError {
                message: format!("failed to create object dir: {}", e),
            })?;
        }
        fs::write(&path, body).map_err(|e| StorageError::IoError {
            message: format!("failed to write object {}: {}", path.display(), e),
        })?;
        self.set_acl(key, acl)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(key)?;
        if !path.exists() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        fs::read(&path).map_err(|e| StorageError::IoError {
            message: format!("failed to read object {}: {}", path.display(), e),
        })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        if !path.exists() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        fs::remove_file(&path).map_err(|e| StorageError::IoError {
            message: format!("failed to delete object {}: {}", path.display(), e),
        })?;
        if let Ok(acl_path) = self.acl_path(key) {
            let _ = fs::remove_file(acl_path);
        }
        Ok(())
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        self.collect(&self.base.clone(), prefix, &mut out)?;
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn set_acl(&self, key: &str, acl: ObjectAcl) -> Result<(), StorageError> {
        if !self.object_path(key)?.exists() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        let path = self.acl_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::IoError {
                message: format!("failed to create acl dir: {}", e),
            })?;
        }
        fs::write(&path, acl.as_str()).map_err(|e| StorageError::IoError {
            message: format!("failed to record acl for {key}: {}", e),
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!("file://{}", self.base.join(key).display())
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') {
        return Err(StorageError::IoError {
            message: format!("invalid object key: {key}"),
        });
    }
    if key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(StorageError::IoError {
            message: format!("invalid object key: {key}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, DirObjectStore) {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = DirObjectStore::new(temp_dir.path().to_path_buf());
        (temp_dir, store)
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let (_guard, store) = store();
        store
            .put("one.example.com/a.sql.gz", b"dump", ObjectAcl::Private)
            .expect("put");
        assert_eq!(store.get("one.example.com/a.sql.gz").expect("get"), b"dump");

        store.delete("one.example.com/a.sql.gz").expect("delete");
        assert!(matches!(
            store.get("one.example.com/a.sql.gz"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn listing_is_scoped_to_prefix() {
        let (_guard, store) = store();
        store
            .put("one.example.com/a.sql.gz", b"a", ObjectAcl::Private)
            .expect("put");
        store
            .put("one.example.com/b.tar", b"b", ObjectAcl::Private)
            .expect("put");
        store
            .put("two.example.com/c.tar", b"c", ObjectAcl::Private)
            .expect("put");

        let listed = store.list_prefix("one.example.com/").expect("list");
        let keys: Vec<&str> = listed.iter().map(|meta| meta.key.as_str()).collect();
        assert_eq!(keys, vec!["one.example.com/a.sql.gz", "one.example.com/b.tar"]);
    }

    #[test]
    fn acl_updates_are_visible_on_disk() {
        let (dir, store) = store();
        store
            .put("one.example.com/a.sql.gz", b"a", ObjectAcl::Private)
            .expect("put");
        store
            .set_acl("one.example.com/a.sql.gz", ObjectAcl::PublicRead)
            .expect("set acl");
        let recorded = std::fs::read_to_string(
            dir.path().join(".acl").join("one.example.com/a.sql.gz"),
        )
        .expect("acl file");
        assert_eq!(recorded, "public-read");
    }

    #[test]
    fn rejects_traversal_keys() {
        let (_guard, store) = store();
        assert!(store.put("../escape", b"x", ObjectAcl::Private).is_err());
        assert!(store.get("/absolute").is_err());
    }
}
