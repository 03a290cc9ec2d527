use berth_domain::{
    steps, Job, JobKind, JobStatus, SiteStatus, StatusEvent, StepStatus,
};
use berth_storage::{DocumentStore, StatusEventSink, StorageError};

/// Joins the outcome of remote jobs back into site lifecycle state.
///
/// Paired operations (provision, rename, archive) complete as two jobs on
/// two hosts in no particular order, possibly with duplicated completion
/// notifications. Every rule re-reads current truth under the site lock and
/// writes only when the computed status differs from the stored one, so
/// redelivery is a no-op rather than a double side effect.
pub struct JobReconciler<'a> {
    store: &'a dyn DocumentStore,
    sink: &'a dyn StatusEventSink,
}

/// Inputs to a paired join: a job's decisive step folded together with the
/// job-level delivery outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinSignal {
    Success,
    Failure,
    Skipped,
    DeliveryFailure,
    Running,
    Pending,
}

fn join_signal(job: &Job, step_name: &str) -> JoinSignal {
    if job.status == JobStatus::DeliveryFailure {
        return JoinSignal::DeliveryFailure;
    }
    match job.step_status(step_name) {
        Some(StepStatus::Success) => JoinSignal::Success,
        Some(StepStatus::Skipped) => JoinSignal::Skipped,
        Some(StepStatus::Failure) => JoinSignal::Failure,
        Some(StepStatus::Running) => JoinSignal::Running,
        Some(StepStatus::Pending) | None => JoinSignal::Pending,
    }
}

/// The step whose status decides a paired job's half of the join.
fn decisive_step(kind: JobKind) -> Option<&'static str> {
    match kind {
        JobKind::Archive => Some(steps::ARCHIVE_SITE),
        JobKind::RemoveUpstream => Some(steps::REMOVE_SITE_FROM_UPSTREAM),
        JobKind::Rename => Some(steps::RENAME_SITE),
        JobKind::RenameUpstream => Some(steps::RENAME_SITE_ON_UPSTREAM),
        _ => None,
    }
}

impl<'a> JobReconciler<'a> {
    pub fn new(store: &'a dyn DocumentStore, sink: &'a dyn StatusEventSink) -> Self {
        Self { store, sink }
    }

    /// Entry point for a job completion notification. Dispatches to the
    /// operation family's rule; safe to call any number of times for the
    /// same job.
    pub fn process_job_update(&self, job: &Job) -> Result<(), StorageError> {
        match job.kind {
            JobKind::Provision | JobKind::RegisterUpstream => self.provision_join(job),
            JobKind::Archive | JobKind::RemoveUpstream => self.archive_join(job),
            JobKind::Rename | JobKind::RenameUpstream => self.rename_join(job),
            JobKind::Update => self.update_rule(job),
            JobKind::RestoreBackup | JobKind::Reinstall => self.restore_rule(job),
            JobKind::MoveToBench => self.move_rule(job),
            JobKind::TakeBackup => self.backup_rule(job),
        }
    }

    /// Scheduler timeout ceiling: an unfinished job is flipped to
    /// DeliveryFailure and fed through the same join logic as any other
    /// terminal outcome.
    pub fn mark_delivery_failure(&self, job_id: &str) -> Result<Job, StorageError> {
        let mut job = self.store.get_job(job_id)?;
        if !job.status.is_terminal() {
            job.status = JobStatus::DeliveryFailure;
            job.finished_at = Some(berth_domain::unix_now());
            self.store.put_job(&job)?;
        }
        self.process_job_update(&job)?;
        Ok(job)
    }

    /// Admission check for new pipelines: a site must not have two
    /// conflicting pipelines in flight.
    pub fn find_conflicting_job(
        &self,
        site: &str,
        kind: JobKind,
    ) -> Result<Option<Job>, StorageError> {
        let jobs = self.store.jobs_for_site(site)?;
        Ok(jobs
            .into_iter()
            .find(|job| !job.status.is_terminal() && job.kind.conflicts_with(kind)))
    }

    /// Write the computed status if it differs from the stored one, emitting
    /// exactly one event per actual transition. Caller must hold the site
    /// lock.
    pub fn apply_site_status(
        &self,
        site_name: &str,
        updated: SiteStatus,
        job_id: Option<&str>,
    ) -> Result<bool, StorageError> {
        let mut site = self.store.get_site(site_name)?;
        if site.status == updated {
            return Ok(false);
        }
        let previous = site.status;
        site.status = updated;
        self.store.put_site(&site)?;
        self.sink.site_status_changed(&StatusEvent {
            site: site_name.to_string(),
            from: previous,
            to: updated,
            job: job_id.map(|id| id.to_string()),
            recorded_at: berth_domain::unix_now(),
        })?;
        Ok(true)
    }

    fn provision_join(&self, job: &Job) -> Result<(), StorageError> {
        let sibling_kind = match job.kind.sibling() {
            Some(kind) => kind,
            None => return Ok(()),
        };
        let site_name = job.site.clone();
        let job_id = job.id.clone();
        self.store.with_site_lock(&site_name, &mut || {
            // Re-read both halves; a duplicate notification re-derives the
            // same answer instead of double counting.
            let first = self.store.get_job(&job_id)?.status;
            let second = self
                .store
                .latest_job(&site_name, sibling_kind)?
                .map(|sibling| sibling.status);

            let failed = |status: JobStatus| {
                matches!(status, JobStatus::Failure | JobStatus::DeliveryFailure)
            };
            let updated = if first == JobStatus::Success && second == Some(JobStatus::Success) {
                SiteStatus::Active
            } else if failed(first) || second.map(failed).unwrap_or(false) {
                SiteStatus::Broken
            } else if first == JobStatus::Running || second == Some(JobStatus::Running) {
                SiteStatus::Installing
            } else {
                SiteStatus::Pending
            };

            self.apply_site_status(&site_name, updated, Some(&job_id))?;
            Ok(())
        })
    }

    fn archive_join(&self, job: &Job) -> Result<(), StorageError> {
        let sibling_kind = match job.kind.sibling() {
            Some(kind) => kind,
            None => return Ok(()),
        };
        let site_name = job.site.clone();
        let job_id = job.id.clone();
        self.store.with_site_lock(&site_name, &mut || {
            let this = self.store.get_job(&job_id)?;
            let other = match self.store.latest_job(&site_name, sibling_kind)? {
                Some(other) => other,
                // The other delivery already resolved the archive and the
                // dependent records are gone. Nothing left to do.
                None => return Ok(()),
            };

            let first = decisive_signal(&this);
            let second = decisive_signal(&other);

            use JoinSignal::*;
            let updated = match (first, second) {
                (Success | Skipped, Success | Skipped) => SiteStatus::Archived,
                _ if first == Failure || second == Failure => SiteStatus::Broken,
                (DeliveryFailure, DeliveryFailure) => SiteStatus::Active,
                _ if first == DeliveryFailure || second == DeliveryFailure => SiteStatus::Broken,
                _ => SiteStatus::Pending,
            };

            let mut site = self.store.get_site(&site_name)?;
            if site.status == updated {
                return Ok(());
            }
            let previous = site.status;
            site.status = updated;
            site.archive_failed = updated != SiteStatus::Archived;
            if updated == SiteStatus::Archived {
                // Irreversible cleanup, gated on the resolved transition so
                // it runs exactly once: release the served name and drop
                // dependent records.
                site.host_name = None;
            }
            self.store.put_site(&site)?;
            self.sink.site_status_changed(&StatusEvent {
                site: site_name.clone(),
                from: previous,
                to: updated,
                job: Some(job_id.clone()),
                recorded_at: berth_domain::unix_now(),
            })?;
            if updated == SiteStatus::Archived {
                self.store.delete_backups_for_site(&site_name)?;
            }
            Ok(())
        })
    }

    fn rename_join(&self, job: &Job) -> Result<(), StorageError> {
        let sibling_kind = match job.kind.sibling() {
            Some(kind) => kind,
            None => return Ok(()),
        };
        let site_name = job.site.clone();
        let job_id = job.id.clone();
        self.store.with_site_lock(&site_name, &mut || {
            let this = match self.store.get_job(&job_id) {
                Ok(this) => this,
                Err(StorageError::NotFound { .. }) => return Ok(()),
                Err(err) => return Err(err),
            };
            let other = match self.store.latest_job(&site_name, sibling_kind)? {
                Some(other) => other,
                // No sibling under this name means the other delivery beat
                // us to the rename and the records moved with it.
                None => return Ok(()),
            };

            let first = decisive_signal(&this);
            let second = decisive_signal(&other);

            use JoinSignal::*;
            let (updated, apply_rename) = match (first, second) {
                (Success, Success) => (SiteStatus::Active, true),
                _ if first == Failure || second == Failure => (SiteStatus::Broken, false),
                (DeliveryFailure, DeliveryFailure) => (SiteStatus::Active, false),
                _ if first == DeliveryFailure || second == DeliveryFailure => {
                    (SiteStatus::Broken, false)
                }
                _ if first == Running || second == Running => (SiteStatus::Updating, false),
                _ => (SiteStatus::Pending, false),
            };

            let mut effective_site = site_name.clone();
            if apply_rename {
                if let Some(renamed) = self.apply_rename(&this)? {
                    effective_site = renamed;
                }
            }
            self.apply_site_status(&effective_site, updated, Some(&job_id))?;
            Ok(())
        })
    }

    /// Perform the stored-record half of a rename. Guarded so a redelivered
    /// completion does not rename twice: once the identifier matches the
    /// requested name there is nothing to do.
    fn apply_rename(&self, job: &Job) -> Result<Option<String>, StorageError> {
        let new_name = job
            .data_str("new_name")
            .ok_or_else(|| StorageError::ParseError {
                message: format!("rename job {} has no new_name", job.id),
            })?
            .to_string();
        if new_name == job.site {
            return Ok(None);
        }

        let mut site = self.store.get_site(&job.site)?;
        if site.host_name.as_deref() == Some(job.site.as_str()) {
            site.host_name = Some(new_name.clone());
            self.store.put_site(&site)?;
        }
        self.store.rename_site(&job.site, &new_name)?;
        Ok(Some(new_name))
    }

    fn update_rule(&self, job: &Job) -> Result<(), StorageError> {
        let site_name = job.site.clone();
        let job_id = job.id.clone();
        let status = job.status;
        self.store.with_site_lock(&site_name, &mut || {
            let updated = match status {
                JobStatus::Pending => SiteStatus::Pending,
                JobStatus::Running => SiteStatus::Updating,
                JobStatus::Success => SiteStatus::Active,
                JobStatus::Failure => SiteStatus::Broken,
                JobStatus::DeliveryFailure => SiteStatus::Active,
                JobStatus::Skipped => return Ok(()),
            };
            if updated == SiteStatus::Active {
                let site = self.store.get_site(&site_name)?;
                if site.status_before_update.is_some() {
                    self.reset_previous_status(&site_name, &job_id)?;
                    return Ok(());
                }
            }
            self.apply_site_status(&site_name, updated, Some(&job_id))?;
            Ok(())
        })
    }

    fn restore_rule(&self, job: &Job) -> Result<(), StorageError> {
        let site_name = job.site.clone();
        let job_id = job.id.clone();
        let status = job.status;
        self.store.with_site_lock(&site_name, &mut || {
            let updated = match status {
                JobStatus::Pending => SiteStatus::Pending,
                JobStatus::Running => SiteStatus::Installing,
                JobStatus::Success => SiteStatus::Active,
                JobStatus::Failure => SiteStatus::Broken,
                JobStatus::DeliveryFailure => SiteStatus::Active,
                JobStatus::Skipped => return Ok(()),
            };
            self.apply_site_status(&site_name, updated, Some(&job_id))?;
            Ok(())
        })
    }

    fn move_rule(&self, job: &Job) -> Result<(), StorageError> {
        let site_name = job.site.clone();
        let job_id = job.id.clone();
        let status = job.status;
        let moved = job.step_status(steps::MOVE_SITE) == Some(StepStatus::Success);
        let target = job.data_str("target").map(|value| value.to_string());
        self.store.with_site_lock(&site_name, &mut || {
            if matches!(status, JobStatus::Success | JobStatus::Failure) && moved {
                if let Some(ref target) = target {
                    let mut site = self.store.get_site(&site_name)?;
                    if site.bench_host != *target {
                        site.bench_host = target.clone();
                        self.store.put_site(&site)?;
                    }
                }
            }
            let updated = match status {
                JobStatus::Pending => Some(SiteStatus::Pending),
                JobStatus::Running => Some(SiteStatus::Updating),
                JobStatus::Failure => Some(SiteStatus::Broken),
                _ => None,
            };
            match updated {
                Some(updated) => {
                    self.apply_site_status(&site_name, updated, Some(&job_id))?;
                }
                None if status == JobStatus::Success => {
                    self.reset_previous_status(&site_name, &job_id)?;
                }
                None => {}
            }
            Ok(())
        })
    }

    fn backup_rule(&self, job: &Job) -> Result<(), StorageError> {
        let mut backup = match self.store.backup_for_job(&job.id)? {
            Some(backup) => backup,
            None => return Ok(()),
        };
        // A backup that could not even be dispatched failed, as far as the
        // record is concerned.
        let status = if job.status == JobStatus::DeliveryFailure {
            JobStatus::Failure
        } else {
            job.status
        };
        if backup.status != status {
            backup.status = status;
            self.store.put_backup(&backup)?;
        }
        Ok(())
    }

    /// Put the site back into whatever state it held before a maintenance
    /// pipeline started. Caller must hold the site lock.
    fn reset_previous_status(&self, site_name: &str, job_id: &str) -> Result<(), StorageError> {
        let mut site = self.store.get_site(site_name)?;
        let previous = match site.status_before_update.take() {
            Some(previous) => previous,
            None => return Ok(()),
        };
        if site.status != previous {
            let from = site.status;
            site.status = previous;
            self.store.put_site(&site)?;
            self.sink.site_status_changed(&StatusEvent {
                site: site_name.to_string(),
                from,
                to: previous,
                job: Some(job_id.to_string()),
                recorded_at: berth_domain::unix_now(),
            })?;
        } else {
            self.store.put_site(&site)?;
        }
        Ok(())
    }
}

fn decisive_signal(job: &Job) -> JoinSignal {
    match decisive_step(job.kind) {
        Some(step_name) => join_signal(job, step_name),
        None => JoinSignal::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_domain::{BackupRecord, Site, Step};
    use berth_storage::JsonFileStorage;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingSink {
        events: Mutex<Vec<StatusEvent>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<StatusEvent> {
            self.events.lock().expect("events lock").clone()
        }
    }

    impl StatusEventSink for RecordingSink {
        fn site_status_changed(&self, event: &StatusEvent) -> Result<(), StorageError> {
            self.events.lock().expect("events lock").push(event.clone());
            Ok(())
        }
    }

    fn fixture() -> (TempDir, JsonFileStorage, RecordingSink) {
        let temp_dir = TempDir::new().expect("temp dir");
        let storage = JsonFileStorage::new(temp_dir.path().to_path_buf());
        (temp_dir, storage, RecordingSink::new())
    }

    fn site_with_status(storage: &JsonFileStorage, status: SiteStatus) -> Site {
        let mut site = Site::new("one.example.com", "bench-1", "proxy-1", 100);
        site.status = status;
        storage.put_site(&site).expect("put site");
        site
    }

    fn finished_job(
        storage: &JsonFileStorage,
        kind: JobKind,
        status: JobStatus,
        started_at: u64,
    ) -> Job {
        let mut job = Job::new(kind, "one.example.com", "host-1", started_at);
        job.status = status;
        job.finished_at = Some(started_at + 1);
        storage.put_job(&job).expect("put job");
        job
    }

    fn stepped_job(
        storage: &JsonFileStorage,
        kind: JobKind,
        job_status: JobStatus,
        step_name: &str,
        step_status: StepStatus,
        started_at: u64,
    ) -> Job {
        let mut job = Job::new(kind, "one.example.com", "host-1", started_at);
        job.status = job_status;
        job.finished_at = Some(started_at + 1);
        job.steps = vec![Step {
            status: step_status,
            ..Step::pending(step_name)
        }];
        storage.put_job(&job).expect("put job");
        job
    }

    #[test]
    fn provision_pair_success_activates_site() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Installing);
        let bench = finished_job(&storage, JobKind::Provision, JobStatus::Success, 200);
        finished_job(&storage, JobKind::RegisterUpstream, JobStatus::Success, 201);

        JobReconciler::new(&storage, &sink)
            .process_job_update(&bench)
            .expect("reconcile");

        assert_eq!(
            storage.get_site("one.example.com").expect("site").status,
            SiteStatus::Active
        );
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn provision_join_is_order_independent() {
        for flip in [false, true] {
            let (_guard, storage, sink) = fixture();
            site_with_status(&storage, SiteStatus::Installing);
            let bench = finished_job(&storage, JobKind::Provision, JobStatus::Success, 200);
            let proxy = finished_job(&storage, JobKind::RegisterUpstream, JobStatus::Success, 201);

            let reconciler = JobReconciler::new(&storage, &sink);
            let (first, second) = if flip { (&proxy, &bench) } else { (&bench, &proxy) };
            reconciler.process_job_update(first).expect("first");
            reconciler.process_job_update(second).expect("second");

            assert_eq!(
                storage.get_site("one.example.com").expect("site").status,
                SiteStatus::Active
            );
        }
    }

    #[test]
    fn duplicate_delivery_writes_once() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Installing);
        let bench = finished_job(&storage, JobKind::Provision, JobStatus::Success, 200);
        finished_job(&storage, JobKind::RegisterUpstream, JobStatus::Success, 201);

        let reconciler = JobReconciler::new(&storage, &sink);
        reconciler.process_job_update(&bench).expect("first delivery");
        reconciler.process_job_update(&bench).expect("second delivery");

        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn provision_failure_breaks_site() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Installing);
        let bench = finished_job(&storage, JobKind::Provision, JobStatus::Failure, 200);
        finished_job(&storage, JobKind::RegisterUpstream, JobStatus::Success, 201);

        JobReconciler::new(&storage, &sink)
            .process_job_update(&bench)
            .expect("reconcile");

        assert_eq!(
            storage.get_site("one.example.com").expect("site").status,
            SiteStatus::Broken
        );
    }

    #[test]
    fn provision_waits_while_sibling_runs() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Pending);
        let bench = finished_job(&storage, JobKind::Provision, JobStatus::Success, 200);
        finished_job(&storage, JobKind::RegisterUpstream, JobStatus::Running, 201);

        JobReconciler::new(&storage, &sink)
            .process_job_update(&bench)
            .expect("reconcile");

        assert_eq!(
            storage.get_site("one.example.com").expect("site").status,
            SiteStatus::Installing
        );
    }

    #[test]
    fn archive_success_and_skip_both_archive() {
        let combos = [
            (StepStatus::Success, StepStatus::Success),
            (StepStatus::Skipped, StepStatus::Skipped),
            (StepStatus::Success, StepStatus::Skipped),
        ];
        for (first, second) in combos {
            let (_guard, storage, sink) = fixture();
            site_with_status(&storage, SiteStatus::Active);
            storage
                .put_backup(&BackupRecord::new("one.example.com", false, 150))
                .expect("put backup");
            let bench = stepped_job(
                &storage,
                JobKind::Archive,
                JobStatus::Success,
                steps::ARCHIVE_SITE,
                first,
                200,
            );
            stepped_job(
                &storage,
                JobKind::RemoveUpstream,
                JobStatus::Success,
                steps::REMOVE_SITE_FROM_UPSTREAM,
                second,
                201,
            );

            JobReconciler::new(&storage, &sink)
                .process_job_update(&bench)
                .expect("reconcile");

            let site = storage.get_site("one.example.com").expect("site");
            assert_eq!(site.status, SiteStatus::Archived);
            assert!(!site.archive_failed);
            assert_eq!(site.host_name, None);
            assert!(storage
                .backups_for_site("one.example.com")
                .expect("backups")
                .is_empty());
        }
    }

    #[test]
    fn archive_cleanup_runs_once_under_redelivery() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Active);
        let bench = stepped_job(
            &storage,
            JobKind::Archive,
            JobStatus::Success,
            steps::ARCHIVE_SITE,
            StepStatus::Success,
            200,
        );
        stepped_job(
            &storage,
            JobKind::RemoveUpstream,
            JobStatus::Success,
            steps::REMOVE_SITE_FROM_UPSTREAM,
            StepStatus::Success,
            201,
        );

        let reconciler = JobReconciler::new(&storage, &sink);
        reconciler.process_job_update(&bench).expect("first");
        reconciler.process_job_update(&bench).expect("redelivery");

        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn archive_delivery_failure_pair_reverts_to_active() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Pending);
        let bench = stepped_job(
            &storage,
            JobKind::Archive,
            JobStatus::DeliveryFailure,
            steps::ARCHIVE_SITE,
            StepStatus::Pending,
            200,
        );
        stepped_job(
            &storage,
            JobKind::RemoveUpstream,
            JobStatus::DeliveryFailure,
            steps::REMOVE_SITE_FROM_UPSTREAM,
            StepStatus::Pending,
            201,
        );

        JobReconciler::new(&storage, &sink)
            .process_job_update(&bench)
            .expect("reconcile");

        let site = storage.get_site("one.example.com").expect("site");
        assert_eq!(site.status, SiteStatus::Active);
        assert!(site.archive_failed);
    }

    #[test]
    fn archive_one_delivery_failure_breaks_site() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Active);
        let bench = stepped_job(
            &storage,
            JobKind::Archive,
            JobStatus::Success,
            steps::ARCHIVE_SITE,
            StepStatus::Success,
            200,
        );
        stepped_job(
            &storage,
            JobKind::RemoveUpstream,
            JobStatus::DeliveryFailure,
            steps::REMOVE_SITE_FROM_UPSTREAM,
            StepStatus::Pending,
            201,
        );

        JobReconciler::new(&storage, &sink)
            .process_job_update(&bench)
            .expect("reconcile");

        assert_eq!(
            storage.get_site("one.example.com").expect("site").status,
            SiteStatus::Broken
        );
    }

    #[test]
    fn rename_pair_success_renames_records() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Updating);
        let mut bench = stepped_job(
            &storage,
            JobKind::Rename,
            JobStatus::Success,
            steps::RENAME_SITE,
            StepStatus::Success,
            200,
        );
        bench.data = serde_json::json!({ "new_name": "two.example.com" });
        storage.put_job(&bench).expect("put job");
        stepped_job(
            &storage,
            JobKind::RenameUpstream,
            JobStatus::Success,
            steps::RENAME_SITE_ON_UPSTREAM,
            StepStatus::Success,
            201,
        );

        JobReconciler::new(&storage, &sink)
            .process_job_update(&bench)
            .expect("reconcile");

        assert!(matches!(
            storage.get_site("one.example.com"),
            Err(StorageError::NotFound { .. })
        ));
        let renamed = storage.get_site("two.example.com").expect("renamed site");
        assert_eq!(renamed.status, SiteStatus::Active);
        assert_eq!(renamed.host_name.as_deref(), Some("two.example.com"));
    }

    #[test]
    fn rename_with_delivery_failure_leaves_name_unchanged() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Updating);
        let mut bench = stepped_job(
            &storage,
            JobKind::Rename,
            JobStatus::Success,
            steps::RENAME_SITE,
            StepStatus::Success,
            200,
        );
        bench.data = serde_json::json!({ "new_name": "two.example.com" });
        storage.put_job(&bench).expect("put job");
        stepped_job(
            &storage,
            JobKind::RenameUpstream,
            JobStatus::DeliveryFailure,
            steps::RENAME_SITE_ON_UPSTREAM,
            StepStatus::Pending,
            201,
        );

        JobReconciler::new(&storage, &sink)
            .process_job_update(&bench)
            .expect("reconcile");

        let site = storage.get_site("one.example.com").expect("site");
        assert_eq!(site.status, SiteStatus::Broken);
        assert!(matches!(
            storage.get_site("two.example.com"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn rename_redelivery_is_idempotent() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Updating);
        let mut bench = stepped_job(
            &storage,
            JobKind::Rename,
            JobStatus::Success,
            steps::RENAME_SITE,
            StepStatus::Success,
            200,
        );
        bench.data = serde_json::json!({ "new_name": "two.example.com" });
        storage.put_job(&bench).expect("put job");
        let mut proxy = stepped_job(
            &storage,
            JobKind::RenameUpstream,
            JobStatus::Success,
            steps::RENAME_SITE_ON_UPSTREAM,
            StepStatus::Success,
            201,
        );
        proxy.data = serde_json::json!({ "new_name": "two.example.com" });
        storage.put_job(&proxy).expect("put job");

        let reconciler = JobReconciler::new(&storage, &sink);
        reconciler.process_job_update(&bench).expect("first");
        // Redelivery after the rename: the job records now live under the
        // new site name, so the stale notification finds no sibling to join
        // against and does nothing.
        reconciler.process_job_update(&bench).expect("redelivery");

        assert_eq!(
            storage.get_site("two.example.com").expect("site").status,
            SiteStatus::Active
        );
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn update_success_restores_previous_status() {
        let (_guard, storage, sink) = fixture();
        let mut site = Site::new("one.example.com", "bench-1", "proxy-1", 100);
        site.status = SiteStatus::Updating;
        site.status_before_update = Some(SiteStatus::Inactive);
        storage.put_site(&site).expect("put site");
        let job = finished_job(&storage, JobKind::Update, JobStatus::Success, 200);

        JobReconciler::new(&storage, &sink)
            .process_job_update(&job)
            .expect("reconcile");

        let site = storage.get_site("one.example.com").expect("site");
        assert_eq!(site.status, SiteStatus::Inactive);
        assert_eq!(site.status_before_update, None);
    }

    #[test]
    fn update_failure_breaks_site() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Updating);
        let job = finished_job(&storage, JobKind::Update, JobStatus::Failure, 200);

        JobReconciler::new(&storage, &sink)
            .process_job_update(&job)
            .expect("reconcile");

        assert_eq!(
            storage.get_site("one.example.com").expect("site").status,
            SiteStatus::Broken
        );
    }

    #[test]
    fn restore_delivery_failure_reverts_to_active() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Installing);
        let job = finished_job(&storage, JobKind::RestoreBackup, JobStatus::DeliveryFailure, 200);

        JobReconciler::new(&storage, &sink)
            .process_job_update(&job)
            .expect("reconcile");

        assert_eq!(
            storage.get_site("one.example.com").expect("site").status,
            SiteStatus::Active
        );
    }

    #[test]
    fn move_success_repoints_bench_and_restores_status() {
        let (_guard, storage, sink) = fixture();
        let mut site = Site::new("one.example.com", "bench-1", "proxy-1", 100);
        site.status = SiteStatus::Updating;
        site.status_before_update = Some(SiteStatus::Active);
        storage.put_site(&site).expect("put site");

        let mut job = Job::new(JobKind::MoveToBench, "one.example.com", "bench-1", 200);
        job.status = JobStatus::Success;
        job.steps = vec![Step {
            status: StepStatus::Success,
            ..Step::pending(steps::MOVE_SITE)
        }];
        job.data = serde_json::json!({ "target": "bench-2" });
        storage.put_job(&job).expect("put job");

        JobReconciler::new(&storage, &sink)
            .process_job_update(&job)
            .expect("reconcile");

        let site = storage.get_site("one.example.com").expect("site");
        assert_eq!(site.bench_host, "bench-2");
        assert_eq!(site.status, SiteStatus::Active);
    }

    #[test]
    fn backup_job_updates_record_and_collapses_delivery_failure() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Active);
        let mut job = Job::new(JobKind::TakeBackup, "one.example.com", "bench-1", 200);
        job.status = JobStatus::DeliveryFailure;
        storage.put_job(&job).expect("put job");
        let mut backup = BackupRecord::new("one.example.com", false, 200);
        backup.job = Some(job.id.clone());
        storage.put_backup(&backup).expect("put backup");

        JobReconciler::new(&storage, &sink)
            .process_job_update(&job)
            .expect("reconcile");

        let stored = storage.get_backup(&backup.id).expect("backup");
        assert_eq!(stored.status, JobStatus::Failure);
        // Backups never touch site status.
        assert_eq!(
            storage.get_site("one.example.com").expect("site").status,
            SiteStatus::Active
        );
    }

    #[test]
    fn mark_delivery_failure_feeds_join() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Installing);
        let bench = finished_job(&storage, JobKind::Provision, JobStatus::Success, 200);
        let mut proxy = Job::new(JobKind::RegisterUpstream, "one.example.com", "proxy-1", 201);
        proxy.status = JobStatus::Running;
        storage.put_job(&proxy).expect("put job");

        let reconciler = JobReconciler::new(&storage, &sink);
        reconciler.process_job_update(&bench).expect("bench done");
        assert_eq!(
            storage.get_site("one.example.com").expect("site").status,
            SiteStatus::Installing
        );

        reconciler
            .mark_delivery_failure(&proxy.id)
            .expect("timeout marking");

        assert_eq!(
            storage.get_job(&proxy.id).expect("job").status,
            JobStatus::DeliveryFailure
        );
        assert_eq!(
            storage.get_site("one.example.com").expect("site").status,
            SiteStatus::Broken
        );
    }

    #[test]
    fn conflicting_job_detection() {
        let (_guard, storage, sink) = fixture();
        site_with_status(&storage, SiteStatus::Active);
        let mut running = Job::new(JobKind::Update, "one.example.com", "bench-1", 200);
        running.status = JobStatus::Running;
        storage.put_job(&running).expect("put job");

        let reconciler = JobReconciler::new(&storage, &sink);
        let conflict = reconciler
            .find_conflicting_job("one.example.com", JobKind::RestoreBackup)
            .expect("query");
        assert!(conflict.is_some());

        let no_conflict = reconciler
            .find_conflicting_job("one.example.com", JobKind::TakeBackup)
            .expect("query");
        assert!(no_conflict.is_none());
    }
}
