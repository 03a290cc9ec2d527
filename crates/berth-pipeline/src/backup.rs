//! Take-backup flow: run the remote backup, parse the reported artifacts,
//! stage them into offsite object storage and bound the retained count.

use std::time::Instant;

use berth_domain::{
    cap_duration_secs, steps, unix_now, ArtifactClass, BackupArtifact, BackupRecord, Host, Job,
    JobKind, JobStatus, Site, Step, StepStatus,
};
use berth_reconcile::JobReconciler;
use berth_ssh::RemoteSession;
use berth_storage::{DocumentStore, ObjectAcl, ObjectStore, StatusEventSink};

use crate::{catalog, run_step, target_from_host, PipelineError, SessionFactory, StepSpec};

/// A second backup for the same site within this window is refused while an
/// earlier one is still pending.
const BACKUP_THROTTLE_SECS: u64 = 2 * 3600;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub with_files: bool,
    pub max_per_class: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            with_files: false,
            max_per_class: 7,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub entries: Vec<(ArtifactClass, ReportedArtifact)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedArtifact {
    pub path: String,
    pub size: String,
}

/// Parse the remote backup tool's report, lines shaped like
/// `Database : ./one.example.com/private/backups/<file> 24.4MiB`.
pub fn parse_backup_report(output: &str) -> BackupReport {
    let mut report = BackupReport::default();
    for line in output.lines() {
        let (label, rest) = match line.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };
        let class = match label.trim().to_lowercase().as_str() {
            "database" => ArtifactClass::Database,
            "config" => ArtifactClass::Config,
            "public" => ArtifactClass::PublicFiles,
            "private" => ArtifactClass::PrivateFiles,
            _ => continue,
        };
        let mut fields = rest.split_whitespace();
        let path = match fields.next() {
            Some(path) => path.to_string(),
            None => continue,
        };
        let size = fields.next().unwrap_or("0B").to_string();
        report.entries.push((class, ReportedArtifact { path, size }));
    }
    report
}

/// Backup reports reference files relative to the bench's sites directory;
/// absolute paths pass through untouched.
pub fn resolve_artifact_path(bench_dir: &str, reported: &str) -> String {
    if reported.starts_with('/') {
        return reported.to_string();
    }
    format!("{}/sites/{}", bench_dir, reported.trim_start_matches("./"))
}

pub fn offsite_key(site: &str, file_name: &str) -> String {
    format!("{site}/{file_name}")
}

/// Run the full take-backup pipeline for one site. The site's lifecycle
/// status is never touched; the outcome lands on the backup record.
pub fn run_backup(
    store: &dyn DocumentStore,
    sink: &dyn StatusEventSink,
    factory: &dyn SessionFactory,
    objects: &dyn ObjectStore,
    site: &Site,
    bench: &Host,
    options: &BackupOptions,
) -> Result<BackupRecord, PipelineError> {
    catalog::validate_site_name(&site.name)?;
    catalog::validate_bench(bench)?;
    let reconciler = JobReconciler::new(store, sink);
    if let Some(existing) = reconciler.find_conflicting_job(&site.name, JobKind::TakeBackup)? {
        return Err(PipelineError::Conflict {
            message: format!(
                "site {} already has unfinished {} job {}",
                site.name, existing.kind, existing.id
            ),
        });
    }

    let now = unix_now();
    let pending = store
        .backups_for_site(&site.name)?
        .iter()
        .filter(|backup| {
            matches!(backup.status, JobStatus::Pending | JobStatus::Running)
                && backup.created_at + BACKUP_THROTTLE_SECS > now
        })
        .count();
    if pending > 0 {
        return Err(PipelineError::Conflict {
            message: format!("too many pending backups for {}", site.name),
        });
    }

    let mut record = BackupRecord::new(&site.name, options.with_files, now);
    let mut job = Job::new(JobKind::TakeBackup, &site.name, &bench.id, now);
    job.steps = vec![
        Step::pending(steps::TAKE_BACKUP),
        Step::pending(steps::UPLOAD_OFFSITE),
    ];
    job.status = JobStatus::Running;
    record.job = Some(job.id.clone());
    record.status = JobStatus::Running;
    store.put_job(&job)?;
    store.put_backup(&record)?;

    let session = match factory.open(&target_from_host(bench)) {
        Ok(session) => session,
        Err(err) => {
            job.status = JobStatus::Failure;
            job.error = Some(format!("connection: {err}"));
            job.finished_at = Some(unix_now());
            store.put_job(&job)?;
            record.status = JobStatus::Failure;
            store.put_backup(&record)?;
            return Ok(record);
        }
    };

    let with_files = if options.with_files {
        " --with-files --compress"
    } else {
        ""
    };
    let take_spec = StepSpec::new(
        steps::TAKE_BACKUP,
        [format!(
            "cd -- {} && {} --site {} backup{}",
            bench.bench_dir, bench.bench_bin, site.name, with_files
        )],
    );

    job.steps[0].status = StepStatus::Running;
    store.put_job(&job)?;
    let take = run_step(session.as_ref(), &take_spec, bench.environment);
    let take_succeeded = take.status == StepStatus::Success;
    let report = if take_succeeded {
        parse_backup_report(&take.output)
    } else {
        BackupReport::default()
    };
    job.steps[0] = take;
    store.put_job(&job)?;

    if take_succeeded {
        job.steps[1].status = StepStatus::Running;
        store.put_job(&job)?;
        job.steps[1] = upload_offsite(
            session.as_ref(),
            objects,
            &site.name,
            &bench.bench_dir,
            &report,
            &mut record,
            options.max_per_class,
        );
    } else {
        job.steps[1] = Step::skipped(steps::UPLOAD_OFFSITE);
    }
    store.put_job(&job)?;
    session.close();

    job.status = job.derived_status();
    let finished_at = unix_now();
    job.finished_at = Some(finished_at);
    job.duration_secs = cap_duration_secs(finished_at.saturating_sub(now));
    store.put_job(&job)?;

    record.status = if job.status == JobStatus::Success {
        JobStatus::Success
    } else {
        JobStatus::Failure
    };
    store.put_backup(&record)?;
    reconciler.process_job_update(&job)?;
    store.get_backup(&record.id).map_err(PipelineError::from)
}

fn upload_offsite(
    session: &dyn RemoteSession,
    objects: &dyn ObjectStore,
    site: &str,
    bench_dir: &str,
    report: &BackupReport,
    record: &mut BackupRecord,
    max_per_class: usize,
) -> Step {
    let started = Instant::now();
    let mut output = String::new();
    let mut error = String::new();
    let mut failed = false;

    for (class, reported) in &report.entries {
        let path = resolve_artifact_path(bench_dir, &reported.path);
        if let Err(err) = catalog::validate_unix_path("artifact path", &path) {
            error.push_str(&format!("refusing artifact path {path}: {err}\n"));
            failed = true;
            break;
        }
        let file_name = path.rsplit('/').next().unwrap_or(&path).to_string();
        let bytes = match session.fetch(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                error.push_str(&format!("failed to stage {path}: {err}\n"));
                failed = true;
                break;
            }
        };
        let key = offsite_key(site, &file_name);
        if let Err(err) = objects.put(&key, &bytes, ObjectAcl::Private) {
            error.push_str(&format!("failed to upload {key}: {err}\n"));
            failed = true;
            break;
        }
        output.push_str(&format!("uploaded {key}\n"));
        let artifact = BackupArtifact {
            file_name,
            size: reported.size.clone(),
            url: Some(objects.public_url(&key)),
            remote_key: Some(key),
        };
        match class {
            ArtifactClass::Database => record.database = Some(artifact),
            ArtifactClass::Config => record.config = Some(artifact),
            ArtifactClass::PublicFiles => record.public = Some(artifact),
            ArtifactClass::PrivateFiles => record.private = Some(artifact),
        }
    }

    if !failed {
        record.offsite = true;
        // Best-effort eviction: a failed delete is noted and retried by the
        // next backup cycle.
        match berth_retention::enforce(
            objects,
            &format!("{site}/"),
            &ArtifactClass::ALL,
            max_per_class,
        ) {
            Ok(report) => {
                for key in report.deleted {
                    output.push_str(&format!("evicted {key}\n"));
                }
                for (key, reason) in report.failed {
                    output.push_str(&format!("eviction failed for {key}: {reason}\n"));
                }
            }
            Err(err) => {
                output.push_str(&format!("retention sweep failed: {err}\n"));
            }
        }
    }

    Step {
        name: steps::UPLOAD_OFFSITE.to_string(),
        status: if failed {
            StepStatus::Failure
        } else {
            StepStatus::Success
        },
        output,
        error,
        duration_secs: cap_duration_secs(started.elapsed().as_secs()),
    }
}
