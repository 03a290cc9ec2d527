//! Restore flow: stage backup artifacts onto the bench host over plain
//! HTTP behind a deliberately time-boxed public-read window, then restore.

use berth_domain::{
    cap_duration_secs, steps, unix_now, BackupArtifact, BackupRecord, Host, Job, JobKind,
    JobStatus, Site, SiteStatus, Step, StepStatus,
};
use berth_reconcile::JobReconciler;
use berth_storage::{DocumentStore, ObjectAcl, ObjectStore, StatusEventSink};

use crate::{
    catalog, run_step, target_from_host, FailureSignal, PipelineError, SessionFactory, StepSpec,
};

pub fn run_restore(
    store: &dyn DocumentStore,
    sink: &dyn StatusEventSink,
    factory: &dyn SessionFactory,
    objects: &dyn ObjectStore,
    site: &Site,
    bench: &Host,
    backup: &BackupRecord,
    admin_password: &str,
) -> Result<Job, PipelineError> {
    catalog::validate_site_name(&site.name)?;
    catalog::validate_bench(bench)?;
    catalog::validate_secret("admin password", admin_password)?;

    let database = backup
        .database
        .as_ref()
        .ok_or_else(|| PipelineError::InvalidDefinition {
            message: format!("backup {} has no database artifact", backup.id),
        })?;

    let reconciler = JobReconciler::new(store, sink);
    if let Some(existing) = reconciler.find_conflicting_job(&site.name, JobKind::RestoreBackup)? {
        return Err(PipelineError::Conflict {
            message: format!(
                "site {} already has unfinished {} job {}",
                site.name, existing.kind, existing.id
            ),
        });
    }

    let artifacts: Vec<&BackupArtifact> = [
        Some(database),
        backup.config.as_ref(),
        backup.public.as_ref(),
        backup.private.as_ref(),
    ]
    .into_iter()
    .flatten()
    .collect();

    let d = &bench.bench_dir;
    let b = &bench.bench_bin;
    let s = &site.name;

    let mut download_commands = Vec::new();
    let mut staged_keys = Vec::new();
    for artifact in &artifacts {
        let url = artifact
            .url
            .as_deref()
            .ok_or_else(|| PipelineError::InvalidDefinition {
                message: format!("artifact {} has no download url", artifact.file_name),
            })?;
        catalog::validate_url("backup url", url)?;
        download_commands.push(format!("cd -- {d} && wget -q -- {url}"));
        if let Some(key) = artifact.remote_key.as_deref() {
            staged_keys.push(key.to_string());
        }
    }

    let mut restore_command = format!(
        "cd -- {d} && {b} --site {s} restore --admin-password {admin_password} --force"
    );
    if let Some(public) = backup.public.as_ref() {
        restore_command.push_str(&format!(" --with-public-files {}", public.file_name));
    }
    if let Some(private) = backup.private.as_ref() {
        restore_command.push_str(&format!(" --with-private-files {}", private.file_name));
    }
    restore_command.push_str(&format!(" {}", database.file_name));

    let restore_spec = StepSpec::new(
        steps::RESTORE_BACKUP,
        [
            restore_command,
            format!("cd -- {d} && {b} --site {s} set-admin-password {admin_password}"),
        ],
    )
    .signal(FailureSignal::ExitCode);

    let started_at = unix_now();
    let mut job = Job::new(JobKind::RestoreBackup, s, &bench.id, started_at);
    job.data = serde_json::json!({ "backup": backup.id });
    job.steps = vec![
        Step::pending(steps::DOWNLOAD_BACKUP),
        Step::pending(steps::RESTORE_BACKUP),
    ];
    job.status = JobStatus::Running;
    store.put_job(&job)?;

    let session = match factory.open(&target_from_host(bench)) {
        Ok(session) => session,
        Err(err) => {
            job.status = JobStatus::Failure;
            job.error = Some(format!("connection: {err}"));
            job.finished_at = Some(unix_now());
            store.put_job(&job)?;
            let site_name = s.clone();
            let job_id = job.id.clone();
            store.with_site_lock(&site_name, &mut || {
                JobReconciler::new(store, sink).apply_site_status(
                    &site_name,
                    SiteStatus::Broken,
                    Some(&job_id),
                )?;
                Ok(())
            })?;
            return Ok(job);
        }
    };

    job.steps[0].status = StepStatus::Running;
    store.put_job(&job)?;
    job.steps[0] = download_with_public_window(
        session.as_ref(),
        objects,
        &staged_keys,
        &StepSpec::new(steps::DOWNLOAD_BACKUP, download_commands),
        bench,
    );
    store.put_job(&job)?;

    if job.steps[0].status == StepStatus::Success {
        job.steps[1].status = StepStatus::Running;
        store.put_job(&job)?;
        job.steps[1] = run_step(session.as_ref(), &restore_spec, bench.environment);
    } else {
        job.steps[1] = Step::skipped(steps::RESTORE_BACKUP);
    }
    store.put_job(&job)?;
    session.close();

    job.status = job.derived_status();
    let finished_at = unix_now();
    job.finished_at = Some(finished_at);
    job.duration_secs = cap_duration_secs(finished_at.saturating_sub(started_at));
    store.put_job(&job)?;

    reconciler.process_job_update(&job)?;
    Ok(job)
}

/// Widen the staged artifacts to public-read so the bench host can fetch
/// them over plain HTTP, run the download step, then revert every key to
/// private no matter how the step went. A revert failure fails the step:
/// leaving artifacts world-readable is not an acceptable outcome.
fn download_with_public_window(
    session: &dyn berth_ssh::RemoteSession,
    objects: &dyn ObjectStore,
    keys: &[String],
    spec: &StepSpec,
    bench: &Host,
) -> Step {
    let mut widened = Vec::new();
    for key in keys {
        match objects.set_acl(key, ObjectAcl::PublicRead) {
            Ok(()) => widened.push(key.clone()),
            Err(err) => {
                // Could not open the window; put back whatever we widened
                // and fail the step without touching the session.
                let mut error = format!("failed to widen acl for {key}: {err}\n");
                revert_acls(objects, &widened, &mut error);
                return Step {
                    name: spec.name.clone(),
                    status: StepStatus::Failure,
                    output: String::new(),
                    error,
                    duration_secs: 0,
                };
            }
        }
    }

    let mut step = run_step(session, spec, bench.environment);

    let mut revert_errors = String::new();
    revert_acls(objects, &widened, &mut revert_errors);
    if !revert_errors.is_empty() {
        step.error.push_str(&revert_errors);
        step.status = StepStatus::Failure;
    }
    step
}

fn revert_acls(objects: &dyn ObjectStore, keys: &[String], errors: &mut String) {
    for key in keys {
        if let Err(err) = objects.set_acl(key, ObjectAcl::Private) {
            errors.push_str(&format!("failed to revert acl for {key}: {err}\n"));
        }
    }
}
