//! Build process execution
//!
//! The generated script is fed to `bash -s` on stdin, either inside a
//! container or directly on the host. Output is read line by line and handed
//! to the [`OutputMarshaller`].

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Sandbox;
use crate::error::{AgentError, AgentResult, IoResultExt};
use crate::marshal::OutputMarshaller;

/// Where the checkout is mounted inside the container
pub const CONTAINER_BUILD_DIR: &str = "/build";

/// Where the cache root is mounted inside the container
pub const CONTAINER_CACHE_DIR: &str = "/cache";

/// Environment variable pointing build steps at the cache root
pub const CACHE_DIR_ENV: &str = "KILN_CACHE_DIR";

const READER_GRACE: Duration = Duration::from_secs(5);

/// A host directory exposed to the build container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    fn volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything needed to start one build
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub script: String,
    pub checkout: PathBuf,
    pub image: String,
    pub cache_root: Option<PathBuf>,
    pub mounts: Vec<Mount>,
}

/// How the build process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub exit_code: Option<i32>,
}

impl BuildOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawns and supervises the build process
#[derive(Debug, Clone)]
pub struct BuildRunner {
    runtime: String,
    sandbox: Sandbox,
    timeout: Duration,
}

impl BuildRunner {
    pub fn new(runtime: impl Into<String>, sandbox: Sandbox, timeout: Duration) -> Self {
        Self {
            runtime: runtime.into(),
            sandbox,
            timeout,
        }
    }

    /// Directory the generated script should `cd` into
    pub fn build_dir(&self, plan_checkout: &std::path::Path) -> String {
        match self.sandbox {
            Sandbox::Container => CONTAINER_BUILD_DIR.to_string(),
            Sandbox::Host => plan_checkout.display().to_string(),
        }
    }

    /// Run the build to completion, streaming its output through `marshaller`
    pub async fn run(
        &self,
        plan: &BuildPlan,
        marshaller: &OutputMarshaller,
    ) -> AgentResult<BuildOutcome> {
        self.prepare_dirs(plan).await?;

        let container_name = format!("kiln-{}", uuid::Uuid::new_v4().simple());
        let mut command = match self.sandbox {
            Sandbox::Container => self.container_command(plan, &container_name),
            Sandbox::Host => self.host_command(plan),
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(sandbox = ?self.sandbox, image = %plan.image, "Starting build process");
        let mut child = command
            .spawn()
            .map_err(|e| AgentError::io("failed to start build process", e))?;
        marshaller.process_started();

        let writer = child.stdin.take().map(|mut stdin| {
            let script = plan.script.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(script.as_bytes()).await {
                    debug!("Build process closed stdin early: {}", e);
                }
                // Dropping stdin sends EOF so `bash -s` exits after the last step
                drop(stdin);
            })
        });

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, marshaller.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, marshaller.clone()));
        }

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let status: Option<ExitStatus> = match waited {
            Ok(status) => Some(status.map_err(|e| AgentError::io("failed to wait for build", e))?),
            Err(_) => {
                warn!(timeout = ?self.timeout, "Build timed out, killing");
                match self.sandbox {
                    Sandbox::Container => self.kill_container(&container_name).await,
                    Sandbox::Host => {
                        if let Some(pid) = child.id() {
                            kill_process_group(pid).await;
                        }
                    }
                }
                if let Err(e) = child.start_kill() {
                    debug!("Build process already gone: {}", e);
                }
                if let Err(e) = child.wait().await {
                    debug!("Failed to reap killed build process: {}", e);
                }
                None
            }
        };

        for mut reader in readers {
            if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
                warn!("Build output still open after exit, abandoning reader");
                reader.abort();
            }
        }
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                debug!("Script writer task failed: {}", e);
            }
        }
        marshaller.finish();

        let Some(status) = status else {
            return Err(AgentError::Timeout {
                what: "build".to_string(),
                after: self.timeout,
            });
        };

        let outcome = BuildOutcome {
            exit_code: status.code(),
        };
        if outcome.success() {
            info!("Build process exited successfully");
        } else {
            info!(code = ?outcome.exit_code, "Build process exited with failure");
        }
        Ok(outcome)
    }

    // Bind mounts need their host side to exist
    async fn prepare_dirs(&self, plan: &BuildPlan) -> AgentResult<()> {
        let dirs = plan
            .cache_root
            .iter()
            .chain(plan.mounts.iter().map(|m| &m.host));
        for dir in dirs {
            tokio::fs::create_dir_all(dir)
                .await
                .with_path("create", dir)?;
        }
        Ok(())
    }

    fn container_command(&self, plan: &BuildPlan, name: &str) -> Command {
        let mut command = Command::new(&self.runtime);
        command
            .args(["run", "--rm", "-i", "--init", "--name", name])
            .arg("-v")
            .arg(format!("{}:{}", plan.checkout.display(), CONTAINER_BUILD_DIR));

        if let Some(root) = &plan.cache_root {
            command
                .arg("-v")
                .arg(format!("{}:{}", root.display(), CONTAINER_CACHE_DIR))
                .arg("-e")
                .arg(format!("{}={}", CACHE_DIR_ENV, CONTAINER_CACHE_DIR));
        }
        for mount in &plan.mounts {
            command.arg("-v").arg(mount.volume_arg());
        }

        command
            .args(["-w", CONTAINER_BUILD_DIR])
            .arg(&plan.image)
            .args(["bash", "-s"]);
        command
    }

    fn host_command(&self, plan: &BuildPlan) -> Command {
        if !plan.mounts.is_empty() {
            warn!(
                count = plan.mounts.len(),
                "Shared and system caches are not mounted when running on the host"
            );
        }

        let mut command = Command::new("bash");
        command.arg("-s").current_dir(&plan.checkout).process_group(0);
        if let Some(root) = &plan.cache_root {
            command.env(CACHE_DIR_ENV, root);
        }
        command
    }

    async fn kill_container(&self, name: &str) {
        match Command::new(&self.runtime)
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => debug!(container = name, "Container killed"),
            Ok(status) => warn!(container = name, code = ?status.code(), "Container kill failed"),
            Err(e) => warn!(container = name, "Failed to run `{} kill`: {}", self.runtime, e),
        }
    }
}

// The host build leads its own process group, so this also reaches
// processes the steps left running.
async fn kill_process_group(pid: u32) {
    let group = format!("-{}", pid);
    match Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => debug!(pid, "Build process group killed"),
        Ok(status) => warn!(pid, code = ?status.code(), "Failed to kill build process group"),
        Err(e) => warn!(pid, "Failed to run `kill`: {}", e),
    }
}

fn spawn_reader<R>(stream: R, marshaller: OutputMarshaller) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => marshaller.handle_line(&String::from_utf8_lossy(&buf)),
                Err(e) => {
                    warn!("Error reading build output: {}", e);
                    break;
                }
            }
        }
    })
}
