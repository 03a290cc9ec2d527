use std::path::PathBuf;

use berth_domain::{BackupRecord, Host, Job, JobKind, Site, StatusEvent};
use rusqlite::{params, Connection};

use crate::{with_keyed_lock, DocumentStore, StatusEventSink, StorageError};

/// SQLite-backed store. Records are kept as json payloads with a few
/// indexed columns for the queries the reconciler needs.
pub struct SqliteStorage {
    db_path: PathBuf,
}

impl SqliteStorage {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn connection(&self) -> Result<Connection, StorageError> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::IoError {
                message: format!("failed to create sqlite directory: {}", e),
            })?;
        }
        let conn = Connection::open(&self.db_path).map_err(|e| StorageError::IoError {
            message: format!("failed to open sqlite db: {}", e),
        })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sites (name TEXT PRIMARY KEY, payload TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS hosts (id TEXT PRIMARY KEY, payload TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS jobs (
                 id TEXT PRIMARY KEY,
                 site TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 started_at INTEGER NOT NULL,
                 payload TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS backups (
                 id TEXT PRIMARY KEY,
                 site TEXT NOT NULL,
                 job TEXT,
                 created_at INTEGER NOT NULL,
                 payload TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS events (id INTEGER PRIMARY KEY AUTOINCREMENT, payload TEXT NOT NULL);
             CREATE INDEX IF NOT EXISTS idx_jobs_site_kind ON jobs (site, kind, started_at);
             CREATE INDEX IF NOT EXISTS idx_backups_site ON backups (site);",
        )
        .map_err(|e| StorageError::IoError {
            message: format!("failed to initialize sqlite schema: {}", e),
        })?;
        Ok(conn)
    }

    fn lock_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .map(|parent| parent.join(".locks"))
            .unwrap_or_else(|| PathBuf::from(".locks"))
    }

    fn query_payloads<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<T>, StorageError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql).map_err(|e| StorageError::IoError {
            message: format!("failed to prepare query: {}", e),
        })?;
        let rows = stmt
            .query_map(args, |row| row.get::<_, String>(0))
            .map_err(|e| StorageError::IoError {
                message: format!("failed to run query: {}", e),
            })?;
        let mut values = Vec::new();
        for row in rows {
            let payload = row.map_err(|e| StorageError::IoError {
                message: format!("failed to read row: {}", e),
            })?;
            let value: T =
                serde_json::from_str(&payload).map_err(|e| StorageError::ParseError {
                    message: format!("failed to parse payload: {}", e),
                })?;
            values.push(value);
        }
        Ok(values)
    }

    fn one_payload<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
        key: &str,
    ) -> Result<T, StorageError> {
        self.query_payloads(sql, args)?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn to_payload<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
        serde_json::to_string(value).map_err(|e| StorageError::ParseError {
            message: format!("failed to serialize payload: {}", e),
        })
    }

    pub fn list_status_events(&self) -> Result<Vec<StatusEvent>, StorageError> {
        self.query_payloads("SELECT payload FROM events ORDER BY id", &[])
    }
}

impl DocumentStore for SqliteStorage {
    fn get_site(&self, name: &str) -> Result<Site, StorageError> {
        self.one_payload(
            "SELECT payload FROM sites WHERE name = ?1",
            &[&name],
            name,
        )
    }

    fn put_site(&self, site: &Site) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let payload = Self::to_payload(site)?;
        conn.execute(
            "INSERT INTO sites (name, payload) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET payload = excluded.payload",
            params![site.name, payload],
        )
        .map_err(|e| StorageError::IoError {
            message: format!("failed to upsert site: {}", e),
        })?;
        Ok(())
    }

    fn delete_site(&self, name: &str) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let deleted = conn
            .execute("DELETE FROM sites WHERE name = ?1", params![name])
            .map_err(|e| StorageError::IoError {
                message: format!("failed to delete site: {}", e),
            })?;
        if deleted == 0 {
            return Err(StorageError::NotFound {
                key: name.to_string(),
            });
        }
        Ok(())
    }

    fn list_sites(&self) -> Result<Vec<Site>, StorageError> {
        self.query_payloads("SELECT payload FROM sites ORDER BY name", &[])
    }

    fn rename_site(&self, old: &str, new: &str) -> Result<(), StorageError> {
        let mut site = self.get_site(old)?;
        site.name = new.to_string();
        let site_payload = Self::to_payload(&site)?;

        let mut conn = self.connection()?;
        let tx = conn.transaction().map_err(|e| StorageError::IoError {
            message: format!("failed to start transaction: {}", e),
        })?;

        let existing: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM sites WHERE name = ?1",
                params![new],
                |row| row.get(0),
            )
            .map_err(|e| StorageError::IoError {
                message: format!("failed to check rename target: {}", e),
            })?;
        if existing > 0 {
            return Err(StorageError::Duplicate {
                key: new.to_string(),
            });
        }

        tx.execute("DELETE FROM sites WHERE name = ?1", params![old])
            .map_err(|e| StorageError::IoError {
                message: format!("failed to remove renamed site: {}", e),
            })?;
        tx.execute(
            "INSERT INTO sites (name, payload) VALUES (?1, ?2)",
            params![new, site_payload],
        )
        .map_err(|e| StorageError::IoError {
            message: format!("failed to insert renamed site: {}", e),
        })?;

        // Dependent records keep working under the new identifier.
        rewrite_site_column(&tx, "jobs", old, new)?;
        rewrite_site_column(&tx, "backups", old, new)?;

        tx.commit().map_err(|e| StorageError::IoError {
            message: format!("failed to commit rename: {}", e),
        })
    }

    fn get_host(&self, id: &str) -> Result<Host, StorageError> {
        self.one_payload("SELECT payload FROM hosts WHERE id = ?1", &[&id], id)
    }

    fn put_host(&self, host: &Host) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let payload = Self::to_payload(host)?;
        conn.execute(
            "INSERT INTO hosts (id, payload) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
            params![host.id, payload],
        )
        .map_err(|e| StorageError::IoError {
            message: format!("failed to upsert host: {}", e),
        })?;
        Ok(())
    }

    fn delete_host(&self, id: &str) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let deleted = conn
            .execute("DELETE FROM hosts WHERE id = ?1", params![id])
            .map_err(|e| StorageError::IoError {
                message: format!("failed to delete host: {}", e),
            })?;
        if deleted == 0 {
            return Err(StorageError::NotFound {
                key: id.to_string(),
            });
        }
        Ok(())
    }

    fn list_hosts(&self) -> Result<Vec<Host>, StorageError> {
        self.query_payloads("SELECT payload FROM hosts ORDER BY id", &[])
    }

    fn get_job(&self, id: &str) -> Result<Job, StorageError> {
        self.one_payload("SELECT payload FROM jobs WHERE id = ?1", &[&id], id)
    }

    fn put_job(&self, job: &Job) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let payload = Self::to_payload(job)?;
        conn.execute(
            "INSERT INTO jobs (id, site, kind, started_at, payload) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 site = excluded.site,
                 kind = excluded.kind,
                 started_at = excluded.started_at,
                 payload = excluded.payload",
            params![job.id, job.site, job.kind.as_str(), job.started_at as i64, payload],
        )
        .map_err(|e| StorageError::IoError {
            message: format!("failed to upsert job: {}", e),
        })?;
        Ok(())
    }

    fn jobs_for_site(&self, site: &str) -> Result<Vec<Job>, StorageError> {
        self.query_payloads(
            "SELECT payload FROM jobs WHERE site = ?1 ORDER BY started_at",
            &[&site],
        )
    }

    fn latest_job(&self, site: &str, kind: JobKind) -> Result<Option<Job>, StorageError> {
        let jobs: Vec<Job> = self.query_payloads(
            "SELECT payload FROM jobs WHERE site = ?1 AND kind = ?2
             ORDER BY started_at DESC LIMIT 1",
            &[&site, &kind.as_str()],
        )?;
        Ok(jobs.into_iter().next())
    }

    fn get_backup(&self, id: &str) -> Result<BackupRecord, StorageError> {
        self.one_payload("SELECT payload FROM backups WHERE id = ?1", &[&id], id)
    }

    fn put_backup(&self, backup: &BackupRecord) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let payload = Self::to_payload(backup)?;
        conn.execute(
            "INSERT INTO backups (id, site, job, created_at, payload) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 site = excluded.site,
                 job = excluded.job,
                 created_at = excluded.created_at,
                 payload = excluded.payload",
            params![
                backup.id,
                backup.site,
                backup.job,
                backup.created_at as i64,
                payload
            ],
        )
        .map_err(|e| StorageError::IoError {
            message: format!("failed to upsert backup: {}", e),
        })?;
        Ok(())
    }

    fn backups_for_site(&self, site: &str) -> Result<Vec<BackupRecord>, StorageError> {
        self.query_payloads(
            "SELECT payload FROM backups WHERE site = ?1 ORDER BY created_at",
            &[&site],
        )
    }

    fn delete_backups_for_site(&self, site: &str) -> Result<(), StorageError> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM backups WHERE site = ?1", params![site])
            .map_err(|e| StorageError::IoError {
                message: format!("failed to delete backups: {}", e),
            })?;
        Ok(())
    }

    fn backup_for_job(&self, job_id: &str) -> Result<Option<BackupRecord>, StorageError> {
        let backups: Vec<BackupRecord> = self.query_payloads(
            "SELECT payload FROM backups WHERE job = ?1 LIMIT 1",
            &[&job_id],
        )?;
        Ok(backups.into_iter().next())
    }

    fn with_site_lock(
        &self,
        site: &str,
        f: &mut dyn FnMut() -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        with_keyed_lock(&self.lock_dir(), site, f)
    }
}

fn rewrite_site_column(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    old: &str,
    new: &str,
) -> Result<(), StorageError> {
    let mut stmt = tx
        .prepare(&format!(
            "SELECT id, payload FROM {table} WHERE site = ?1"
        ))
        .map_err(|e| StorageError::IoError {
            message: format!("failed to prepare {table} rewrite: {}", e),
        })?;
    let rows = stmt
        .query_map(params![old], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| StorageError::IoError {
            message: format!("failed to query {table}: {}", e),
        })?;

    let mut updates = Vec::new();
    for row in rows {
        let (id, payload) = row.map_err(|e| StorageError::IoError {
            message: format!("failed to read {table} row: {}", e),
        })?;
        let mut value: serde_json::Value =
            serde_json::from_str(&payload).map_err(|e| StorageError::ParseError {
                message: format!("failed to parse {table} payload: {}", e),
            })?;
        value["site"] = serde_json::Value::String(new.to_string());
        let rewritten = value.to_string();
        updates.push((id, rewritten));
    }
    drop(stmt);

    for (id, payload) in updates {
        tx.execute(
            &format!("UPDATE {table} SET site = ?1, payload = ?2 WHERE id = ?3"),
            params![new, payload, id],
        )
        .map_err(|e| StorageError::IoError {
            message: format!("failed to rewrite {table} row: {}", e),
        })?;
    }
    Ok(())
}

impl StatusEventSink for SqliteStorage {
    fn site_status_changed(&self, event: &StatusEvent) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let payload = Self::to_payload(event)?;
        conn.execute("INSERT INTO events (payload) VALUES (?1)", params![payload])
            .map_err(|e| StorageError::IoError {
                message: format!("failed to insert event: {}", e),
            })?;
        Ok(())
    }
}
