use serde::{Deserialize, Serialize};

pub mod steps;

/// Wall-clock durations recorded on jobs and steps are capped so that a
/// skewed remote clock can never persist an absurd value.
pub const MAX_TRACKED_DURATION_SECS: u64 = 23 * 3600 + 59 * 60 + 59;

pub fn cap_duration_secs(secs: u64) -> u64 {
    secs.min(MAX_TRACKED_DURATION_SECS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Test,
    Staging,
    Prod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub address: String,
    pub environment: Environment,
    pub labels: Vec<String>,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub identity_file: Option<String>,
    #[serde(default = "default_bench_dir")]
    pub bench_dir: String,
    #[serde(default = "default_bench_bin")]
    pub bench_bin: String,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_bench_dir() -> String {
    "/srv/bench".to_string()
}

fn default_bench_bin() -> String {
    "/usr/local/bin/bench".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteStatus {
    Pending,
    Installing,
    Updating,
    Active,
    Inactive,
    Broken,
    Archived,
    Suspended,
}

impl SiteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SiteStatus::Pending => "Pending",
            SiteStatus::Installing => "Installing",
            SiteStatus::Updating => "Updating",
            SiteStatus::Active => "Active",
            SiteStatus::Inactive => "Inactive",
            SiteStatus::Broken => "Broken",
            SiteStatus::Archived => "Archived",
            SiteStatus::Suspended => "Suspended",
        }
    }
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    /// Host name the site is served under; released when the site is archived.
    pub host_name: Option<String>,
    pub bench_host: String,
    pub upstream_host: String,
    pub status: SiteStatus,
    /// Remembered across maintenance pipelines so a successful run can
    /// restore whatever the site was doing before.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status_before_update: Option<SiteStatus>,
    #[serde(default)]
    pub archive_failed: bool,
    pub created_at: u64,
}

impl Site {
    pub fn new(name: &str, bench_host: &str, upstream_host: &str, created_at: u64) -> Self {
        Self {
            name: name.to_string(),
            host_name: Some(name.to_string()),
            bench_host: bench_host.to_string(),
            upstream_host: upstream_host.to_string(),
            status: SiteStatus::Pending,
            status_before_update: None,
            archive_failed: false,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure,
    DeliveryFailure,
    Skipped,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Success => "Success",
            JobStatus::Failure => "Failure",
            JobStatus::DeliveryFailure => "Delivery Failure",
            JobStatus::Skipped => "Skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::DeliveryFailure | JobStatus::Skipped
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failure,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "Pending",
            StepStatus::Running => "Running",
            StepStatus::Success => "Success",
            StepStatus::Failure => "Failure",
            StepStatus::Skipped => "Skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    Provision,
    RegisterUpstream,
    Update,
    TakeBackup,
    RestoreBackup,
    Reinstall,
    Rename,
    RenameUpstream,
    Archive,
    RemoveUpstream,
    MoveToBench,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Provision => "Provision",
            JobKind::RegisterUpstream => "Register Upstream",
            JobKind::Update => "Update",
            JobKind::TakeBackup => "Take Backup",
            JobKind::RestoreBackup => "Restore Backup",
            JobKind::Reinstall => "Reinstall",
            JobKind::Rename => "Rename",
            JobKind::RenameUpstream => "Rename Upstream",
            JobKind::Archive => "Archive",
            JobKind::RemoveUpstream => "Remove Upstream",
            JobKind::MoveToBench => "Move To Bench",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            JobKind::Provision => "provision",
            JobKind::RegisterUpstream => "register-upstream",
            JobKind::Update => "update",
            JobKind::TakeBackup => "take-backup",
            JobKind::RestoreBackup => "restore-backup",
            JobKind::Reinstall => "reinstall",
            JobKind::Rename => "rename",
            JobKind::RenameUpstream => "rename-upstream",
            JobKind::Archive => "archive",
            JobKind::RemoveUpstream => "remove-upstream",
            JobKind::MoveToBench => "move-to-bench",
        }
    }

    /// The other half of a paired operation, when this kind has one. Both
    /// jobs must reach a terminal status before the site transition resolves.
    pub fn sibling(self) -> Option<JobKind> {
        match self {
            JobKind::Provision => Some(JobKind::RegisterUpstream),
            JobKind::RegisterUpstream => Some(JobKind::Provision),
            JobKind::Rename => Some(JobKind::RenameUpstream),
            JobKind::RenameUpstream => Some(JobKind::Rename),
            JobKind::Archive => Some(JobKind::RemoveUpstream),
            JobKind::RemoveUpstream => Some(JobKind::Archive),
            _ => None,
        }
    }

    /// Kinds that rewrite site state on the bench and must not overlap for
    /// the same site. Upstream-side jobs ride along with their sibling and
    /// backups are throttled separately.
    pub fn is_exclusive(self) -> bool {
        matches!(
            self,
            JobKind::Provision
                | JobKind::Update
                | JobKind::RestoreBackup
                | JobKind::Reinstall
                | JobKind::Rename
                | JobKind::Archive
                | JobKind::MoveToBench
        )
    }

    pub fn conflicts_with(self, other: JobKind) -> bool {
        if self.is_exclusive() && other.is_exclusive() {
            return true;
        }
        matches!(
            (self, other),
            (JobKind::TakeBackup, JobKind::TakeBackup)
                | (JobKind::TakeBackup, JobKind::RestoreBackup)
                | (JobKind::RestoreBackup, JobKind::TakeBackup)
        )
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub duration_secs: u64,
}

impl Step {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            output: String::new(),
            error: String::new(),
            duration_secs: 0,
        }
    }

    pub fn skipped(name: &str) -> Self {
        Self {
            status: StepStatus::Skipped,
            ..Self::pending(name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub site: String,
    pub host: String,
    pub status: JobStatus,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<u64>,
    #[serde(default)]
    pub duration_secs: u64,
    pub steps: Vec<Step>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Operation payload, e.g. the new name for a rename or the target
    /// bench for a move.
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub data: serde_json::Value,
}

impl Job {
    pub fn new(kind: JobKind, site: &str, host: &str, started_at: u64) -> Self {
        Self {
            id: format!("{}-{}-{}", kind.slug(), site, started_at),
            kind,
            site: site.to_string(),
            host: host.to_string(),
            status: JobStatus::Pending,
            started_at,
            finished_at: None,
            duration_secs: 0,
            steps: Vec::new(),
            error: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.steps
            .iter()
            .find(|step| step.name == name)
            .map(|step| step.status)
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|value| value.as_str())
    }

    /// Job status per the aggregate rule: Success iff every step is Success
    /// or Skipped, Failure as soon as any step failed, otherwise whatever
    /// phase the run is in.
    pub fn derived_status(&self) -> JobStatus {
        if self.steps.iter().any(|step| step.status == StepStatus::Failure) {
            return JobStatus::Failure;
        }
        if self
            .steps
            .iter()
            .all(|step| matches!(step.status, StepStatus::Success | StepStatus::Skipped))
        {
            return JobStatus::Success;
        }
        if self.steps.iter().any(|step| step.status == StepStatus::Running) {
            return JobStatus::Running;
        }
        JobStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactClass {
    Database,
    Config,
    PublicFiles,
    PrivateFiles,
}

impl ArtifactClass {
    pub const ALL: [ArtifactClass; 4] = [
        ArtifactClass::Database,
        ArtifactClass::Config,
        ArtifactClass::PublicFiles,
        ArtifactClass::PrivateFiles,
    ];

    /// Stable token embedded in offsite artifact names.
    pub fn token(self) -> &'static str {
        match self {
            ArtifactClass::Database => "database",
            ArtifactClass::Config => "site_config_backup",
            ArtifactClass::PublicFiles => "files",
            ArtifactClass::PrivateFiles => "private-files",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "database" => Some(ArtifactClass::Database),
            "site_config_backup" => Some(ArtifactClass::Config),
            "files" => Some(ArtifactClass::PublicFiles),
            "private-files" => Some(ArtifactClass::PrivateFiles),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub file_name: String,
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remote_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub site: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job: Option<String>,
    pub status: JobStatus,
    pub with_files: bool,
    #[serde(default)]
    pub offsite: bool,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub database: Option<BackupArtifact>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config: Option<BackupArtifact>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub public: Option<BackupArtifact>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub private: Option<BackupArtifact>,
}

impl BackupRecord {
    pub fn new(site: &str, with_files: bool, created_at: u64) -> Self {
        Self {
            id: format!("backup-{}-{}", site, created_at),
            site: site.to_string(),
            job: None,
            status: JobStatus::Pending,
            with_files,
            offsite: false,
            created_at,
            database: None,
            config: None,
            public: None,
            private: None,
        }
    }

    pub fn artifact(&self, class: ArtifactClass) -> Option<&BackupArtifact> {
        match class {
            ArtifactClass::Database => self.database.as_ref(),
            ArtifactClass::Config => self.config.as_ref(),
            ArtifactClass::PublicFiles => self.public.as_ref(),
            ArtifactClass::PrivateFiles => self.private.as_ref(),
        }
    }
}

/// One record per resolved site status transition; what the webhook
/// collaborator ultimately receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub site: String,
    pub from: SiteStatus,
    pub to: SiteStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job: Option<String>,
    pub recorded_at: u64,
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
