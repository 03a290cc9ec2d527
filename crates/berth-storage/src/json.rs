use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use berth_domain::{BackupRecord, Host, Job, JobKind, Site, StatusEvent};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{with_keyed_lock, DocumentStore, StatusEventSink, StorageError};

/// File-backed store: one json document per site/job/backup, a single
/// hosts file, and a rotated jsonl event log.
pub struct JsonFileStorage {
    base_path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn hosts_path(&self) -> PathBuf {
        self.base_path.join("hosts.json")
    }

    fn sites_dir(&self) -> PathBuf {
        self.base_path.join("sites")
    }

    fn jobs_dir(&self) -> PathBuf {
        self.base_path.join("jobs")
    }

    fn backups_dir(&self) -> PathBuf {
        self.base_path.join("backups")
    }

    fn events_path(&self) -> PathBuf {
        self.base_path.join("events.jsonl")
    }

    fn lock_dir(&self) -> PathBuf {
        self.base_path.join(".locks")
    }

    fn ensure_dir(&self, dir: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(dir).map_err(|e| StorageError::IoError {
            message: format!("failed to create directory {}: {}", dir.display(), e),
        })
    }

    fn read_doc<T: DeserializeOwned>(&self, path: &Path, key: &str) -> Result<T, StorageError> {
        if !path.exists() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        let content = fs::read_to_string(path).map_err(|e| StorageError::IoError {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| StorageError::ParseError {
            message: format!("failed to parse {}: {}", path.display(), e),
        })
    }

    fn write_doc<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent)?;
        }
        let content = serde_json::to_string_pretty(value).map_err(|e| StorageError::ParseError {
            message: format!("failed to serialize document: {}", e),
        })?;

        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp_file = File::create(&tmp_path).map_err(|e| StorageError::IoError {
                message: format!("failed to create temp file: {}", e),
            })?;
            tmp_file
                .write_all(content.as_bytes())
                .map_err(|e| StorageError::IoError {
                    message: format!("failed to write temp file: {}", e),
                })?;
            tmp_file.sync_all().ok();
        }

        if path.exists() {
            let _ = fs::remove_file(path);
        }
        fs::rename(&tmp_path, path).map_err(|e| StorageError::IoError {
            message: format!("failed to replace {}: {}", path.display(), e),
        })
    }

    fn read_dir_docs<T: DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>, StorageError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut docs = Vec::new();
        let entries = fs::read_dir(dir).map_err(|e| StorageError::IoError {
            message: format!("failed to read {}: {}", dir.display(), e),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::IoError {
                message: format!("failed to read directory entry: {}", e),
            })?;
            let path = entry.path();
            if path.extension().and_then(|v| v.to_str()) != Some("json") {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|v| v.to_str())
                .unwrap_or("document")
                .to_string();
            docs.push(self.read_doc(&path, &name)?);
        }
        Ok(docs)
    }

    fn max_jsonl_bytes(&self) -> u64 {
        env::var("BERTH_STORAGE_MAX_JSONL_BYTES")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(20 * 1024 * 1024)
    }

    fn archive_compress(&self) -> bool {
        match env::var("BERTH_STORAGE_ARCHIVE_COMPRESS") {
            Ok(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes"),
            Err(_) => true,
        }
    }

    fn max_archive_files(&self) -> usize {
        env::var("BERTH_STORAGE_ARCHIVE_MAX_FILES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(10)
    }

    fn archive_dir(&self) -> PathBuf {
        if let Ok(path) = env::var("BERTH_STORAGE_ARCHIVE_DIR") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
        self.base_path.join("archive")
    }

    fn rotate_jsonl_if_needed(&self, path: &Path, prefix: &str) -> Result<(), StorageError> {
        let max_bytes = self.max_jsonl_bytes();
        if max_bytes == 0 {
            return Ok(());
        }

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(StorageError::IoError {
                    message: format!("failed to stat {}: {}", path.display(), err),
                })
            }
        };

        if metadata.len() < max_bytes {
            return Ok(());
        }

        let archive_dir = self.archive_dir();
        self.ensure_dir(&archive_dir)?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let archive_path = archive_dir.join(format!("{}-{}.jsonl", prefix, timestamp));

        fs::rename(path, &archive_path).map_err(|e| StorageError::IoError {
            message: format!("failed to rotate {}: {}", path.display(), e),
        })?;

        if self.archive_compress() {
            self.compress_archive(&archive_path)?;
        }

        self.prune_archives(&archive_dir, prefix)?;
        Ok(())
    }

    fn compress_archive(&self, path: &Path) -> Result<(), StorageError> {
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("archive.jsonl");
        let gz_path = path.with_file_name(format!("{}.gz", file_name));

        let mut input = File::open(path).map_err(|e| StorageError::IoError {
            message: format!("failed to open archive {}: {}", path.display(), e),
        })?;
        let output = File::create(&gz_path).map_err(|e| StorageError::IoError {
            message: format!("failed to create gzip {}: {}", gz_path.display(), e),
        })?;
        let mut encoder = GzEncoder::new(output, Compression::default());
        std::io::copy(&mut input, &mut encoder).map_err(|e| StorageError::IoError {
            message: format!("failed to compress archive: {}", e),
        })?;
        encoder.finish().map_err(|e| StorageError::IoError {
            message: format!("failed to finalize gzip: {}", e),
        })?;

        fs::remove_file(path).map_err(|e| StorageError::IoError {
            message: format!("failed to remove uncompressed archive: {}", e),
        })?;
        Ok(())
    }

    fn prune_archives(&self, archive_dir: &Path, prefix: &str) -> Result<(), StorageError> {
        let max_files = self.max_archive_files();
        if max_files == 0 {
            return Ok(());
        }

        let mut entries = Vec::new();
        let dir = fs::read_dir(archive_dir).map_err(|e| StorageError::IoError {
            message: format!("failed to read archive dir {}: {}", archive_dir.display(), e),
        })?;
        for entry in dir {
            let entry = entry.map_err(|e| StorageError::IoError {
                message: format!("failed to read archive entry: {}", e),
            })?;
            let path = entry.path();
            let name = match path.file_name().and_then(|v| v.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !name.starts_with(prefix) || !name.contains(".jsonl") {
                continue;
            }
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            entries.push((mtime, path));
        }

        if entries.len() <= max_files {
            return Ok(());
        }

        entries.sort_by_key(|(mtime, _)| *mtime);
        let remove_count = entries.len().saturating_sub(max_files);
        for (_, path) in entries.into_iter().take(remove_count) {
            let _ = fs::remove_file(path);
        }

        Ok(())
    }

    fn load_hosts(&self) -> Result<Vec<Host>, StorageError> {
        let path = self.hosts_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).map_err(|e| StorageError::IoError {
            message: format!("failed to read hosts file: {}", e),
        })?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| StorageError::ParseError {
            message: format!("failed to parse hosts: {}", e),
        })
    }

    fn save_hosts(&self, hosts: &[Host]) -> Result<(), StorageError> {
        self.ensure_dir(&self.base_path)?;
        self.write_doc(&self.hosts_path(), &hosts.to_vec())
    }

    pub fn list_status_events(&self) -> Result<Vec<StatusEvent>, StorageError> {
        let path = self.events_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).map_err(|e| StorageError::IoError {
            message: format!("failed to read events file: {}", e),
        })?;
        let mut events = Vec::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event: StatusEvent =
                serde_json::from_str(trimmed).map_err(|e| StorageError::ParseError {
                    message: format!("failed to parse event: {}", e),
                })?;
            events.push(event);
        }
        Ok(events)
    }
}

impl DocumentStore for JsonFileStorage {
    fn get_site(&self, name: &str) -> Result<Site, StorageError> {
        self.read_doc(&self.sites_dir().join(format!("{name}.json")), name)
    }

    fn put_site(&self, site: &Site) -> Result<(), StorageError> {
        self.write_doc(&self.sites_dir().join(format!("{}.json", site.name)), site)
    }

    fn delete_site(&self, name: &str) -> Result<(), StorageError> {
        let path = self.sites_dir().join(format!("{name}.json"));
        if !path.exists() {
            return Err(StorageError::NotFound {
                key: name.to_string(),
            });
        }
        fs::remove_file(&path).map_err(|e| StorageError::IoError {
            message: format!("failed to delete {}: {}", path.display(), e),
        })
    }

    fn list_sites(&self) -> Result<Vec<Site>, StorageError> {
        let mut sites: Vec<Site> = self.read_dir_docs(&self.sites_dir())?;
        sites.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sites)
    }

    fn rename_site(&self, old: &str, new: &str) -> Result<(), StorageError> {
        if self.sites_dir().join(format!("{new}.json")).exists() {
            return Err(StorageError::Duplicate {
                key: new.to_string(),
            });
        }
        let mut site = self.get_site(old)?;
        site.name = new.to_string();
        self.put_site(&site)?;
        self.delete_site(old)?;

        for mut job in self.jobs_for_site(old)? {
            job.site = new.to_string();
            self.put_job(&job)?;
        }
        for mut backup in self.backups_for_site(old)? {
            backup.site = new.to_string();
            self.put_backup(&backup)?;
        }
        Ok(())
    }

    fn get_host(&self, id: &str) -> Result<Host, StorageError> {
        self.load_hosts()?
            .into_iter()
            .find(|host| host.id == id)
            .ok_or_else(|| StorageError::NotFound {
                key: id.to_string(),
            })
    }

    fn put_host(&self, host: &Host) -> Result<(), StorageError> {
        let mut hosts = self.load_hosts()?;
        match hosts.iter_mut().find(|existing| existing.id == host.id) {
            Some(existing) => *existing = host.clone(),
            None => hosts.push(host.clone()),
        }
        self.save_hosts(&hosts)
    }

    fn delete_host(&self, id: &str) -> Result<(), StorageError> {
        let mut hosts = self.load_hosts()?;
        let before = hosts.len();
        hosts.retain(|host| host.id != id);
        if hosts.len() == before {
            return Err(StorageError::NotFound {
                key: id.to_string(),
            });
        }
        self.save_hosts(&hosts)
    }

    fn list_hosts(&self) -> Result<Vec<Host>, StorageError> {
        self.load_hosts()
    }

    fn get_job(&self, id: &str) -> Result<Job, StorageError> {
        self.read_doc(&self.jobs_dir().join(format!("{id}.json")), id)
    }

    fn put_job(&self, job: &Job) -> Result<(), StorageError> {
        self.write_doc(&self.jobs_dir().join(format!("{}.json", job.id)), job)
    }

    fn jobs_for_site(&self, site: &str) -> Result<Vec<Job>, StorageError> {
        let mut jobs: Vec<Job> = self.read_dir_docs(&self.jobs_dir())?;
        jobs.retain(|job| job.site == site);
        jobs.sort_by_key(|job| job.started_at);
        Ok(jobs)
    }

    fn latest_job(&self, site: &str, kind: JobKind) -> Result<Option<Job>, StorageError> {
        Ok(self
            .jobs_for_site(site)?
            .into_iter()
            .filter(|job| job.kind == kind)
            .max_by_key(|job| job.started_at))
    }

    fn get_backup(&self, id: &str) -> Result<BackupRecord, StorageError> {
        self.read_doc(&self.backups_dir().join(format!("{id}.json")), id)
    }

    fn put_backup(&self, backup: &BackupRecord) -> Result<(), StorageError> {
        self.write_doc(
            &self.backups_dir().join(format!("{}.json", backup.id)),
            backup,
        )
    }

    fn backups_for_site(&self, site: &str) -> Result<Vec<BackupRecord>, StorageError> {
        let mut backups: Vec<BackupRecord> = self.read_dir_docs(&self.backups_dir())?;
        backups.retain(|backup| backup.site == site);
        backups.sort_by_key(|backup| backup.created_at);
        Ok(backups)
    }

    fn delete_backups_for_site(&self, site: &str) -> Result<(), StorageError> {
        for backup in self.backups_for_site(site)? {
            let path = self.backups_dir().join(format!("{}.json", backup.id));
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    fn backup_for_job(&self, job_id: &str) -> Result<Option<BackupRecord>, StorageError> {
        let backups: Vec<BackupRecord> = self.read_dir_docs(&self.backups_dir())?;
        Ok(backups
            .into_iter()
            .find(|backup| backup.job.as_deref() == Some(job_id)))
    }

    fn with_site_lock(
        &self,
        site: &str,
        f: &mut dyn FnMut() -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        with_keyed_lock(&self.lock_dir(), site, f)
    }
}

impl StatusEventSink for JsonFileStorage {
    fn site_status_changed(&self, event: &StatusEvent) -> Result<(), StorageError> {
        self.ensure_dir(&self.base_path)?;
        let path = self.events_path();
        self.rotate_jsonl_if_needed(&path, "events")?;
        let line = serde_json::to_string(event).map_err(|e| StorageError::ParseError {
            message: format!("failed to serialize event: {}", e),
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::IoError {
                message: format!("failed to open events file: {}", e),
            })?;

        writeln!(file, "{}", line).map_err(|e| StorageError::IoError {
            message: format!("failed to write event: {}", e),
        })?;
        file.sync_all().ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_domain::{JobStatus, SiteStatus};
    use tempfile::TempDir;

    fn storage() -> (TempDir, JsonFileStorage) {
        let temp_dir = TempDir::new().expect("temp dir");
        let storage = JsonFileStorage::new(temp_dir.path().to_path_buf());
        (temp_dir, storage)
    }

    #[test]
    fn stores_and_reads_sites() {
        let (_guard, storage) = storage();
        let site = Site::new("one.example.com", "bench-1", "proxy-1", 100);
        storage.put_site(&site).expect("put site");

        let loaded = storage.get_site("one.example.com").expect("get site");
        assert_eq!(loaded, site);
        assert!(matches!(
            storage.get_site("missing.example.com"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn rename_repoints_dependent_records() {
        let (_guard, storage) = storage();
        let site = Site::new("old.example.com", "bench-1", "proxy-1", 100);
        storage.put_site(&site).expect("put site");

        let job = Job::new(berth_domain::JobKind::Rename, "old.example.com", "bench-1", 200);
        storage.put_job(&job).expect("put job");
        let backup = BackupRecord::new("old.example.com", false, 300);
        storage.put_backup(&backup).expect("put backup");

        storage
            .rename_site("old.example.com", "new.example.com")
            .expect("rename");

        assert!(matches!(
            storage.get_site("old.example.com"),
            Err(StorageError::NotFound { .. })
        ));
        assert_eq!(storage.get_site("new.example.com").expect("site").name, "new.example.com");
        assert_eq!(storage.jobs_for_site("new.example.com").expect("jobs").len(), 1);
        assert_eq!(
            storage
                .backups_for_site("new.example.com")
                .expect("backups")
                .len(),
            1
        );
    }

    #[test]
    fn rename_refuses_existing_target() {
        let (_guard, storage) = storage();
        storage
            .put_site(&Site::new("a.example.com", "bench-1", "proxy-1", 100))
            .expect("put");
        storage
            .put_site(&Site::new("b.example.com", "bench-1", "proxy-1", 100))
            .expect("put");
        assert!(matches!(
            storage.rename_site("a.example.com", "b.example.com"),
            Err(StorageError::Duplicate { .. })
        ));
    }

    #[test]
    fn latest_job_picks_most_recent_of_kind() {
        let (_guard, storage) = storage();
        let mut early = Job::new(berth_domain::JobKind::Provision, "one.example.com", "bench-1", 100);
        early.status = JobStatus::Failure;
        let late = Job::new(berth_domain::JobKind::Provision, "one.example.com", "bench-1", 200);
        storage.put_job(&early).expect("put");
        storage.put_job(&late).expect("put");

        let found = storage
            .latest_job("one.example.com", berth_domain::JobKind::Provision)
            .expect("query")
            .expect("job present");
        assert_eq!(found.started_at, 200);

        let none = storage
            .latest_job("one.example.com", berth_domain::JobKind::Archive)
            .expect("query");
        assert!(none.is_none());
    }

    #[test]
    fn appends_status_events() {
        let (_guard, storage) = storage();
        let event = StatusEvent {
            site: "one.example.com".to_string(),
            from: SiteStatus::Pending,
            to: SiteStatus::Active,
            job: None,
            recorded_at: 100,
        };
        storage.site_status_changed(&event).expect("append");
        storage.site_status_changed(&event).expect("append");
        let events = storage.list_status_events().expect("list");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], event);
    }

    #[test]
    fn site_lock_allows_nested_store_access() {
        let (_guard, storage) = storage();
        let site = Site::new("one.example.com", "bench-1", "proxy-1", 100);
        storage.put_site(&site).expect("put site");

        let mut observed = None;
        storage
            .with_site_lock("one.example.com", &mut || {
                observed = Some(storage.get_site("one.example.com")?.status);
                Ok(())
            })
            .expect("locked section");
        assert_eq!(observed, Some(SiteStatus::Pending));
    }
}
