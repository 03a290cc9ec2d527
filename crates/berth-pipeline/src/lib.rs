use std::time::Instant;

use berth_domain::{
    cap_duration_secs, unix_now, Environment, Host, Job, JobStatus, Site, SiteStatus, Step,
    StepStatus,
};
use berth_reconcile::JobReconciler;
use berth_ssh::{ProcessSshSession, RemoteSession, SshConfig, SshError, SshTarget};
use berth_storage::{DocumentStore, StatusEventSink, StorageError};

pub mod backup;
pub mod catalog;
pub mod restore;

#[derive(Debug)]
pub enum PipelineError {
    InvalidDefinition { message: String },
    Conflict { message: String },
    Storage(StorageError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::InvalidDefinition { message } => {
                write!(f, "invalid pipeline definition: {message}")
            }
            PipelineError::Conflict { message } => write!(f, "conflicting job: {message}"),
            PipelineError::Storage(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        PipelineError::Storage(err)
    }
}

/// Which captured signal decides that a step failed. A non-zero exit of the
/// halting command always fails the step; bench tooling additionally
/// reports problems on stderr while exiting zero, so those steps watch
/// stderr instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    ExitCode,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipWhen {
    Never,
    InProduction,
    OutsideProduction,
}

impl SkipWhen {
    pub fn matches(self, environment: Environment) -> bool {
        match self {
            SkipWhen::Never => false,
            SkipWhen::InProduction => environment == Environment::Prod,
            SkipWhen::OutsideProduction => environment != Environment::Prod,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub commands: Vec<String>,
    pub skip_when: SkipWhen,
    pub signal: FailureSignal,
    /// A failed fatal step halts the pipeline; the remaining steps are
    /// recorded as Skipped.
    pub fatal: bool,
}

impl StepSpec {
    pub fn new<I, S>(name: &str, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            commands: commands.into_iter().map(Into::into).collect(),
            skip_when: SkipWhen::Never,
            signal: FailureSignal::ExitCode,
            fatal: true,
        }
    }

    pub fn signal(mut self, signal: FailureSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn skip_when(mut self, skip_when: SkipWhen) -> Self {
        self.skip_when = skip_when;
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.fatal = false;
        self
    }
}

/// Named, ordered step catalog for one operation kind. Step order is fixed;
/// the executor never reorders or parallelizes.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub kind: berth_domain::JobKind,
    pub steps: Vec<StepSpec>,
    pub data: serde_json::Value,
}

impl PipelineDefinition {
    pub fn new(kind: berth_domain::JobKind, steps: Vec<StepSpec>) -> Self {
        Self {
            kind,
            steps,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

pub fn target_from_host(host: &Host) -> SshTarget {
    SshTarget {
        host: host.address.clone(),
        user: host.user.clone(),
        port: host.port,
        identity_file: host.identity_file.as_ref().map(|path| path.into()),
    }
}

/// Opens sessions on demand so the executor can be driven by mocks in tests
/// and by real ssh everywhere else.
pub trait SessionFactory: Send + Sync {
    fn open(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, SshError>;
}

pub struct ProcessSessionFactory {
    config: SshConfig,
}

impl ProcessSessionFactory {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

impl Default for ProcessSessionFactory {
    fn default() -> Self {
        Self::new(SshConfig::default())
    }
}

impl SessionFactory for ProcessSessionFactory {
    fn open(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, SshError> {
        Ok(Box::new(ProcessSshSession::open(
            target.clone(),
            self.config.clone(),
        )?))
    }
}

/// Run one step: evaluate the skip predicate without touching the session,
/// otherwise execute the commands in order and stop at the first non-zero
/// exit. Output and stderr are concatenated across the commands actually
/// run; duration is wall clock, capped.
pub fn run_step(
    session: &dyn RemoteSession,
    spec: &StepSpec,
    environment: Environment,
) -> Step {
    if spec.skip_when.matches(environment) {
        return Step::skipped(&spec.name);
    }

    let started = Instant::now();
    let mut output = String::new();
    let mut error = String::new();
    let mut halted_exit = 0;

    for (index, command) in spec.commands.iter().enumerate() {
        match session.execute(command) {
            Ok(result) => {
                output.push_str(&result.stdout);
                error.push_str(&result.stderr);
                if result.exit_code != 0 {
                    halted_exit = result.exit_code;
                    error.push_str(&format!(
                        "command {} exited with status {}\n",
                        index + 1,
                        result.exit_code
                    ));
                    break;
                }
            }
            Err(err) => {
                // Losing the transport mid-step fails the step like any
                // other halting condition; the caller sees why in the
                // captured error text.
                error.push_str(&err.to_string());
                error.push('\n');
                halted_exit = -1;
                break;
            }
        }
    }

    let failed = halted_exit != 0
        || (spec.signal == FailureSignal::Stderr && !error.trim().is_empty());

    Step {
        name: spec.name.clone(),
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

/// Drives one pipeline definition against one host and rolls the outcome
/// into the job record and the site's lifecycle state.
pub struct PipelineExecutor<'a> {
    store: &'a dyn DocumentStore,
    sink: &'a dyn StatusEventSink,
    factory: &'a dyn SessionFactory,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        sink: &'a dyn StatusEventSink,
        factory: &'a dyn SessionFactory,
    ) -> Self {
        Self {
            store,
            sink,
            factory,
        }
    }

    fn reconciler(&self) -> JobReconciler<'a> {
        JobReconciler::new(self.store, self.sink)
    }

    /// Refuse to start when a conflicting pipeline for the same site is
    /// still in flight; callers serialize per site through this check.
    pub fn admit(&self, site: &Site, kind: berth_domain::JobKind) -> Result<(), PipelineError> {
        if let Some(existing) = self.reconciler().find_conflicting_job(&site.name, kind)? {
            return Err(PipelineError::Conflict {
                message: format!(
                    "site {} already has unfinished {} job {}",
                    site.name, existing.kind, existing.id
                ),
            });
        }
        Ok(())
    }

    pub fn execute(
        &self,
        site: &Site,
        host: &Host,
        definition: &PipelineDefinition,
    ) -> Result<Job, PipelineError> {
        let started_at = unix_now();
        let mut job = Job::new(definition.kind, &site.name, &host.id, started_at);
        job.data = definition.data.clone();
        job.steps = definition
            .steps
            .iter()
            .map(|spec| Step::pending(&spec.name))
            .collect();
        job.status = JobStatus::Running;
        self.store.put_job(&job)?;

        let session = match self.factory.open(&target_from_host(host)) {
            Ok(session) => session,
            Err(err) => {
                // Transport never came up: no steps attempted, the job
                // fails with the connection condition recorded and the
                // site is broken outright.
                job.status = JobStatus::Failure;
                job.error = Some(format!("connection: {err}"));
                job.finished_at = Some(unix_now());
                self.store.put_job(&job)?;
                let site_name = site.name.clone();
                let job_id = job.id.clone();
                self.store.with_site_lock(&site_name, &mut || {
                    self.reconciler()
                        .apply_site_status(&site_name, SiteStatus::Broken, Some(&job_id))?;
                    Ok(())
                })?;
                return Ok(job);
            }
        };

        let mut halted = false;
        for (index, spec) in definition.steps.iter().enumerate() {
            if halted {
                job.steps[index] = Step::skipped(&spec.name);
                self.store.put_job(&job)?;
                continue;
            }
            job.steps[index].status = StepStatus::Running;
            self.store.put_job(&job)?;

            let step = run_step(session.as_ref(), spec, host.environment);
            if step.status == StepStatus::Failure && spec.fatal {
                halted = true;
            }
            job.steps[index] = step;
            self.store.put_job(&job)?;
        }
        session.close();

        job.status = job.derived_status();
        let finished_at = unix_now();
        job.finished_at = Some(finished_at);
        job.duration_secs = cap_duration_secs(finished_at.saturating_sub(started_at));
        self.store.put_job(&job)?;

        self.reconciler().process_job_update(&job)?;
        Ok(job)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use berth_ssh::{CommandResult, RemoteSession, SshError, SshTarget};
    use berth_storage::{StatusEventSink, StorageError};

    /// Scripted session: unknown commands succeed with empty output so
    /// catalogs stay exercisable without enumerating every command.
    pub struct MockSession {
        pub responses: HashMap<String, Result<CommandResult, SshError>>,
        pub files: HashMap<String, Vec<u8>>,
        pub commands: Arc<Mutex<Vec<String>>>,
        pub closed: Arc<Mutex<u32>>,
    }

    impl MockSession {
        pub fn new() -> Self {
            Self {
                responses: HashMap::new(),
                files: HashMap::new(),
                commands: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(Mutex::new(0)),
            }
        }

        pub fn respond(mut self, command: &str, result: Result<CommandResult, SshError>) -> Self {
            self.responses.insert(command.to_string(), result);
            self
        }

        pub fn with_file(mut self, path: &str, body: &[u8]) -> Self {
            self.files.insert(path.to_string(), body.to_vec());
            self
        }
    }

    pub fn ok_result(stdout: &str) -> Result<CommandResult, SshError> {
        Ok(CommandResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    pub fn failed_result(exit_code: i32, stderr: &str) -> Result<CommandResult, SshError> {
        Ok(CommandResult {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        })
    }

    impl RemoteSession for MockSession {
        fn execute(&self, command: &str) -> Result<CommandResult, SshError> {
            self.commands
                .lock()
                .expect("commands lock")
                .push(command.to_string());
            self.responses
                .get(command)
                .cloned()
                .unwrap_or_else(|| ok_result(""))
        }

        fn fetch(&self, path: &str) -> Result<Vec<u8>, SshError> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| SshError::Command {
                    exit_code: 1,
                    stderr: format!("cat: {path}: No such file or directory"),
                })
        }

        fn close(&self) {
            *self.closed.lock().expect("closed lock") += 1;
        }
    }

    pub struct MockSessionFactory {
        pub session: Mutex<Option<MockSession>>,
        pub fail_connection: bool,
    }

    impl MockSessionFactory {
        pub fn with_session(session: MockSession) -> Self {
            Self {
                session: Mutex::new(Some(session)),
                fail_connection: false,
            }
        }

        pub fn refusing_connections() -> Self {
            Self {
                session: Mutex::new(None),
                fail_connection: true,
            }
        }
    }

    impl super::SessionFactory for MockSessionFactory {
        fn open(&self, _target: &SshTarget) -> Result<Box<dyn RemoteSession>, SshError> {
            if self.fail_connection {
                return Err(SshError::Connection {
                    message: "host unreachable".to_string(),
                });
            }
            let session = self
                .session
                .lock()
                .expect("session lock")
                .take()
                .expect("factory already consumed");
            Ok(Box::new(session))
        }
    }

    pub struct RecordingSink {
        pub events: Mutex<Vec<berth_domain::StatusEvent>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }
    }

    impl StatusEventSink for RecordingSink {
        fn site_status_changed(
            &self,
            event: &berth_domain::StatusEvent,
        ) -> Result<(), StorageError> {
            self.events.lock().expect("events lock").push(event.clone());
            Ok(())
        }
    }
}
