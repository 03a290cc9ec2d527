use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// How long an idle control master is kept alive after the last command.
    pub control_persist: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
            control_persist: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshError {
    Connection { message: String },
    Command { exit_code: i32, stderr: String },
    Timeout { message: String },
}

impl std::fmt::Display for SshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshError::Connection { message } => write!(f, "ssh connection error: {message}"),
            SshError::Command { exit_code, stderr } => {
                write!(f, "ssh command failed (exit {exit_code}): {stderr}")
            }
            SshError::Timeout { message } => write!(f, "ssh command timeout: {message}"),
        }
    }
}

impl std::error::Error for SshError {}

/// One authenticated command channel to a single host.
///
/// Completed commands always resolve to `Ok` with their exit code captured;
/// `Err` is reserved for transport-level conditions (unreachable host, auth
/// failure, timeout). Callers own retry policy — nothing here retries.
pub trait RemoteSession: Send + Sync {
    fn execute(&self, command: &str) -> Result<CommandResult, SshError>;

    /// Raw bytes of a remote file, for staging artifacts into object storage.
    fn fetch(&self, path: &str) -> Result<Vec<u8>, SshError>;

    /// Tear the channel down. Safe to call more than once and on a session
    /// whose transport already died.
    fn close(&self);
}

fn control_base_dir() -> PathBuf {
    if let Ok(path) = std::env::var("BERTH_SSH_CONTROL_DIR") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    #[cfg(unix)]
    {
        PathBuf::from("/tmp/berth-ssh")
    }
    #[cfg(not(unix))]
    {
        std::env::temp_dir().join("berth-ssh")
    }
}

pub fn control_path_for_target(base_dir: &PathBuf, target: &SshTarget) -> PathBuf {
    let local_user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let connection_id = format!(
        "{}:{}@{}:{}",
        local_user, target.user, target.host, target.port
    );
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    connection_id.hash(&mut hasher);
    base_dir.join(format!("berth-ssh-{:x}", hasher.finish()))
}

/// Session backed by the system `ssh` binary with a ControlMaster socket:
/// `open` establishes the master, every `execute` multiplexes over it,
/// `close` asks the master to exit.
#[derive(Debug)]
pub struct ProcessSshSession {
    target: SshTarget,
    config: SshConfig,
    control_path: PathBuf,
    closed: AtomicBool,
}

impl ProcessSshSession {
    pub fn open(target: SshTarget, config: SshConfig) -> Result<Self, SshError> {
        let base_dir = control_base_dir();
        std::fs::create_dir_all(&base_dir).map_err(|err| SshError::Connection {
            message: format!("failed to create control dir {}: {err}", base_dir.display()),
        })?;
        let control_path = control_path_for_target(&base_dir, &target);

        let session = Self {
            target,
            config,
            control_path,
            closed: AtomicBool::new(false),
        };
        if !session.control_master_active() {
            session.spawn_control_master()?;
        }
        Ok(session)
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }

    fn apply_ssh_options(&self, cmd: &mut Command) {
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs()
            ))
            .arg("-p")
            .arg(self.target.port.to_string());
        if let Some(ref identity) = self.target.identity_file {
            cmd.arg("-i").arg(identity);
        }
        if let Some(path) = self.control_path.to_str() {
            cmd.arg("-o")
                .arg("ControlMaster=auto")
                .arg("-o")
                .arg(format!(
                    "ControlPersist={}s",
                    self.config.control_persist.as_secs()
                ))
                .arg("-o")
                .arg(format!("ControlPath={}", path));
        }
    }

    fn control_master_active(&self) -> bool {
        if !self.control_path.exists() {
            return false;
        }
        let mut cmd = Command::new("ssh");
        self.apply_ssh_options(&mut cmd);
        cmd.arg("-O").arg("check").arg(self.destination());
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        cmd.status().map(|status| status.success()).unwrap_or(false)
    }

    fn spawn_control_master(&self) -> Result<(), SshError> {
        let mut cmd = Command::new("ssh");
        self.apply_ssh_options(&mut cmd);
        cmd.arg("-o")
            .arg("ControlMaster=yes")
            .arg("-N")
            .arg("-f")
            .arg(self.destination());

        let output = cmd.output().map_err(|err| SshError::Connection {
            message: format!("failed to launch control master: {err}"),
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(SshError::Connection {
            message: if stderr.trim().is_empty() {
                "failed to establish ssh control master".to_string()
            } else {
                format!("failed to establish ssh control master: {}", stderr.trim())
            },
        })
    }

    fn run_with_timeout(&self, mut cmd: Command) -> Result<Output, SshError> {
        let timeout = self.config.command_timeout;
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let output = cmd.output();
            let _ = tx.send(output);
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(output)) => {
                let _ = handle.join();
                Ok(output)
            }
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(SshError::Connection {
                    message: format!("failed to launch ssh: {err}"),
                })
            }
            Err(_) => Err(SshError::Timeout {
                message: format!(
                    "command execution timeout after {} seconds",
                    timeout.as_secs()
                ),
            }),
        }
    }

    fn remote_command(&self, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        self.apply_ssh_options(&mut cmd);
        cmd.arg(self.destination()).arg(command);
        cmd
    }
}

impl RemoteSession for ProcessSshSession {
    fn execute(&self, command: &str) -> Result<CommandResult, SshError> {
        let output = self.run_with_timeout(self.remote_command(command))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        // ssh reserves 255 for transport failures; anything else is the
        // remote command's own exit status and is data, not an error.
        if exit_code == 255 {
            let message = if stderr.trim().is_empty() {
                "ssh connection failed".to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(SshError::Connection { message });
        }

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>, SshError> {
        let output = self.run_with_timeout(self.remote_command(&format!("cat -- {path}")))?;
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == 255 {
            return Err(SshError::Connection {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if exit_code != 0 {
            return Err(SshError::Command {
                exit_code,
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut cmd = Command::new("ssh");
        self.apply_ssh_options(&mut cmd);
        cmd.arg("-O").arg("exit").arg(self.destination());
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let _ = cmd.status();
    }
}

impl Drop for ProcessSshSession {
    fn drop(&mut self) {
        self.close();
    }
}
