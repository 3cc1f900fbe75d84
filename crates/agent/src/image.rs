//! Build image provisioning
//!
//! Image archives are cached on disk between runs, but the container
//! runtime's own image store is not assumed to survive, so the archive is
//! loaded on every run.

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{AgentError, AgentResult, IoResultExt};

/// Outcome of provisioning an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Cached,
    Downloaded { bytes: u64 },
}

/// Downloads image archives and loads them into the container runtime
#[derive(Debug, Clone)]
pub struct ImageProvisioner {
    client: reqwest::Client,
    runtime: String,
}

impl ImageProvisioner {
    pub fn new(runtime: impl Into<String>) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            runtime: runtime.into(),
        })
    }

    /// Make sure `name` is loaded into the runtime, downloading it from `download_url` if needed
    pub async fn ensure_image(
        &self,
        name: &str,
        download_url: &str,
        local_cache_path: &Path,
    ) -> AgentResult<ImageSource> {
        let source = if tokio::fs::try_exists(local_cache_path)
            .await
            .with_path("inspect", local_cache_path)?
        {
            info!(image = name, "Using cached image archive {}", local_cache_path.display());
            ImageSource::Cached
        } else {
            let bytes = self.download(download_url, local_cache_path).await?;
            ImageSource::Downloaded { bytes }
        };

        self.load(local_cache_path).await?;
        info!(image = name, "Image loaded into {}", self.runtime);
        Ok(source)
    }

    async fn download(&self, url: &str, dest: &Path) -> AgentResult<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_path("create", parent)?;
        }

        info!("Downloading image archive from {}", url);
        let mut response = self.client.get(url).send().await?.error_for_status()?;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = dest.with_file_name(format!("{}.{}.part", file_name, uuid::Uuid::new_v4()));

        let result = async {
            let mut file = tokio::fs::File::create(&partial)
                .await
                .with_path("create", &partial)?;
            let mut written = 0u64;
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await.with_path("write", &partial)?;
                written += chunk.len() as u64;
            }
            file.flush().await.with_path("flush", &partial)?;
            Ok::<_, AgentError>(written)
        }
        .await;

        match result {
            Ok(written) => {
                tokio::fs::rename(&partial, dest)
                    .await
                    .with_path("move image archive to", dest)?;
                debug!(bytes = written, "Image archive saved to {}", dest.display());
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn load(&self, archive: &Path) -> AgentResult<()> {
        let output = Command::new(&self.runtime)
            .arg("load")
            .arg("-i")
            .arg(archive)
            .output()
            .await
            .map_err(|e| AgentError::io(format!("failed to run `{} load`", self.runtime), e))?;

        if !output.status.success() {
            return Err(AgentError::CommandFailed {
                command: format!("{} load -i {}", self.runtime, archive.display()),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        debug!(
            "{} load: {}",
            self.runtime,
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }
}
