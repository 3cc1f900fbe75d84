//! Repository synchronization
//!
//! Brings a local checkout to an exact commit. Pull request refs are fetched
//! into a local `pr/<number>` branch; branches and tags are fetched as-is.
//! The checkout is forced and untracked or ignored files are removed, so the
//! result does not depend on what a previous build left behind.

use std::path::Path;

use git2::build::CheckoutBuilder;
use git2::{AutotagOption, FetchOptions, Oid, RemoteCallbacks, Repository};
use tracing::{debug, info};

use crate::error::AgentResult;

const REMOTE_NAME: &str = "origin";

/// The kind of ref that triggered a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefKind {
    /// `refs/pull/<number>/head` or `refs/pull/<number>/merge`
    PullRequest { number: u64, head: bool },
    Branch(String),
    Tag(String),
}

/// A parsed remote ref
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    refname: String,
    kind: RefKind,
}

// `refs/pull/<number>/<head|merge>`
fn parse_pull_request(refname: &str) -> Option<RefKind> {
    let (number, side) = refname.strip_prefix("refs/pull/")?.split_once('/')?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let head = match side {
        "head" => true,
        "merge" => false,
        _ => return None,
    };
    Some(RefKind::PullRequest {
        number: number.parse().ok()?,
        head,
    })
}

impl RemoteRef {
    /// Parse a ref. Bare names are treated as branch names.
    pub fn parse(refname: &str) -> Self {
        let refname = refname.trim();

        if let Some(kind) = parse_pull_request(refname) {
            return Self {
                refname: refname.to_string(),
                kind,
            };
        }

        if let Some(tag) = refname.strip_prefix("refs/tags/") {
            return Self {
                refname: refname.to_string(),
                kind: RefKind::Tag(tag.to_string()),
            };
        }

        let branch = refname.strip_prefix("refs/heads/").unwrap_or(refname);
        Self {
            refname: format!("refs/heads/{}", branch),
            kind: RefKind::Branch(branch.to_string()),
        }
    }

    pub fn refname(&self) -> &str {
        &self.refname
    }

    pub fn kind(&self) -> &RefKind {
        &self.kind
    }

    pub fn is_pull_request(&self) -> bool {
        matches!(self.kind, RefKind::PullRequest { .. })
    }

    /// The branch name the build is attributed to
    pub fn branch_name(&self) -> String {
        match &self.kind {
            RefKind::PullRequest { number, head: true } => format!("pr/{}", number),
            RefKind::PullRequest { number, head: false } => format!("pr/{}-merge", number),
            RefKind::Branch(name) | RefKind::Tag(name) => name.clone(),
        }
    }

    /// Branch name made safe for use as a single path component
    pub fn cache_key(&self) -> String {
        self.branch_name().replace(['/', '\\'], "_")
    }

    /// Refspec used to fetch this ref
    pub fn fetch_refspec(&self) -> String {
        match &self.kind {
            RefKind::PullRequest { .. } => {
                format!("+{}:refs/heads/{}", self.refname, self.branch_name())
            }
            RefKind::Branch(name) => {
                format!("+{}:refs/remotes/{}/{}", self.refname, REMOTE_NAME, name)
            }
            RefKind::Tag(_) => format!("+{}:{}", self.refname, self.refname),
        }
    }
}

/// Keeps a local checkout in sync with the remote repository
#[derive(Debug, Clone)]
pub struct RepoSynchronizer {
    clone_url: String,
}

impl RepoSynchronizer {
    pub fn new(clone_url: impl Into<String>) -> Self {
        Self {
            clone_url: clone_url.into(),
        }
    }

    /// Fetch `remote_ref` and force the working tree in `folder` to `commit`
    ///
    /// Blocking; run it off the async runtime.
    pub fn sync_to(&self, folder: &Path, remote_ref: &RemoteRef, commit: &str) -> AgentResult<()> {
        let repo = self.open_or_init(folder)?;
        self.fetch(&repo, remote_ref)?;

        let oid = Oid::from_str(commit.trim())?;
        let target = repo.find_commit(oid)?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true).remove_ignored(true);
        repo.checkout_tree(target.as_object(), Some(&mut checkout))?;
        repo.set_head_detached(oid)?;

        info!(
            folder = %folder.display(),
            commit = %oid,
            "Checked out {}",
            remote_ref.refname()
        );
        Ok(())
    }

    fn open_or_init(&self, folder: &Path) -> AgentResult<Repository> {
        match Repository::open(folder) {
            Ok(repo) => {
                debug!("Reusing checkout at {}", folder.display());
                Ok(repo)
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => {
                info!("Initializing checkout at {}", folder.display());
                Ok(Repository::init(folder)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn fetch(&self, repo: &Repository, remote_ref: &RemoteRef) -> AgentResult<()> {
        match repo.find_remote(REMOTE_NAME) {
            Ok(remote) if remote.url() == Some(self.clone_url.as_str()) => {}
            Ok(_) => repo.remote_set_url(REMOTE_NAME, &self.clone_url)?,
            Err(_) => {
                repo.remote(REMOTE_NAME, &self.clone_url)?;
            }
        }
        let mut remote = repo.find_remote(REMOTE_NAME)?;

        let mut callbacks = RemoteCallbacks::new();
        callbacks.transfer_progress(|progress| {
            if progress.received_objects() == progress.total_objects() {
                debug!(
                    objects = progress.total_objects(),
                    bytes = progress.received_bytes(),
                    "Fetch transfer complete"
                );
            }
            true
        });

        let mut options = FetchOptions::new();
        options
            .remote_callbacks(callbacks)
            .download_tags(AutotagOption::None);

        let refspec = remote_ref.fetch_refspec();
        info!(refspec = %refspec, "Fetching from {}", self.clone_url);
        remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;
        Ok(())
    }
}
