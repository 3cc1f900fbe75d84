//! Build cache resolution
//!
//! Caches live under `<cache base>/<safe|unsafe>/`, so builds from forks can
//! never read or poison caches used by trusted builds. A cache root that does
//! not exist yet is warm-started from the first existing `loadFrom` candidate.

use std::path::{Component, Path, PathBuf};

use kiln_common::config::expand_template;
use kiln_common::CacheConfig;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::TrustLevel;
use crate::error::{AgentError, AgentResult, IoResultExt};

/// Resolves and warm-starts per-branch cache directories
#[derive(Debug, Clone)]
pub struct CacheManager {
    base: PathBuf,
}

/// Where a warm start came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSource {
    /// The cache root already existed
    Existing,
    /// Copied from this candidate
    CopiedFrom(PathBuf),
    /// No candidate existed; the build starts cold
    Cold,
}

/// Outcome of resolving a cache root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCache {
    pub root: PathBuf,
    pub source: CacheSource,
}

impl CacheManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Root of the partition for a trust level
    pub fn partition(&self, trust: TrustLevel) -> PathBuf {
        self.base.join(trust.dir_name())
    }

    /// Host directory backing a named shared cache
    pub fn shared_dir(&self, trust: TrustLevel, name: &str) -> AgentResult<PathBuf> {
        Ok(self.partition(trust).join("shared").join(relative(name)?))
    }

    /// Host directory backing a named system cache
    pub fn system_dir(&self, trust: TrustLevel, name: &str) -> AgentResult<PathBuf> {
        Ok(self.partition(trust).join("system").join(relative(name)?))
    }

    /// Resolve the cache root for `branch`, warm-starting it if it is missing
    ///
    /// Returns `None` when the configuration has no `writeTo` template.
    /// Blocking; run it off the async runtime.
    pub fn resolve_cache_root(
        &self,
        cache: &CacheConfig,
        trust: TrustLevel,
        branch: &str,
    ) -> AgentResult<Option<ResolvedCache>> {
        let Some(write_to) = cache.write_to.as_deref() else {
            debug!("No cache configured");
            return Ok(None);
        };

        let partition = self.partition(trust);
        let root = partition.join(relative(&expand_template(write_to, branch))?);

        if root.is_dir() {
            info!("Using existing cache at {}", root.display());
            return Ok(Some(ResolvedCache {
                root,
                source: CacheSource::Existing,
            }));
        }

        for template in &cache.load_from {
            let candidate = partition.join(relative(&expand_template(template, branch))?);
            if !candidate.is_dir() {
                debug!("Cache candidate {} does not exist", candidate.display());
                continue;
            }

            info!(
                "Warm-starting cache {} from {}",
                root.display(),
                candidate.display()
            );
            copy_into_place(&candidate, &root)?;
            return Ok(Some(ResolvedCache {
                root,
                source: CacheSource::CopiedFrom(candidate),
            }));
        }

        info!("No cache found for {}, starting cold", root.display());
        Ok(Some(ResolvedCache {
            root,
            source: CacheSource::Cold,
        }))
    }
}

/// Validate that a resolved template stays inside its partition
fn relative(path: &str) -> AgentResult<PathBuf> {
    let candidate = Path::new(path);
    if path.trim().is_empty() {
        return Err(AgentError::invalid_cache_path(path, "path is empty"));
    }

    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(AgentError::invalid_cache_path(path, "`..` is not allowed"))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(AgentError::invalid_cache_path(path, "path must be relative"))
            }
        }
    }

    Ok(candidate.to_path_buf())
}

// Copies into a sibling staging directory first so an interrupted copy never
// leaves a partial cache at `dest`.
fn copy_into_place(source: &Path, dest: &Path) -> AgentResult<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| AgentError::invalid_cache_path(dest.display().to_string(), "no parent"))?;
    std::fs::create_dir_all(parent).with_path("create", parent)?;

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{}.{}.partial", file_name, uuid::Uuid::new_v4()));

    if let Err(e) = copy_tree(source, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }
    std::fs::rename(&staging, dest).with_path("move cache into", dest)
}

fn copy_tree(source: &Path, dest: &Path) -> AgentResult<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.to_path_buf());
            AgentError::io_path("read", &path, e.into())
        })?;

        let relative = entry
            .path()
            .strip_prefix(source)
            .unwrap_or_else(|_| entry.path());
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target).with_path("create", &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path()).with_path("read link", entry.path())?;
            std::os::unix::fs::symlink(&link, &target).with_path("create link", &target)?;
        } else {
            std::fs::copy(entry.path(), &target).with_path("copy", &target)?;
        }
    }
    Ok(())
}
