use chrono::{TimeZone, Utc};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{BranchType, Cred, FetchOptions, Oid, RemoteCallbacks, Repository, ResetType, Sort};
use std::path::{Path, PathBuf};

use crate::config::MonitorConfig;
use crate::error::{HistoryError, SetupError, SyncError};
use crate::models::CommitInfo;

/// Read-only view of commit history for tracked files.
pub trait CommitSource {
    /// Hashes of the commits that touched `path`, newest first.
    fn log_for(&self, path: &str) -> Result<Vec<String>, HistoryError>;

    /// File text at `commit`, or `None` if it did not exist there.
    fn content_at(&self, commit: &str, path: &str) -> Result<Option<String>, HistoryError>;

    /// Commit metadata, or `None` for an unknown commit.
    fn info_for(&self, commit: &str) -> Result<Option<CommitInfo>, HistoryError>;
}

/// Local clone of the monitored repository, or an existing working copy.
#[derive(Clone)]
pub struct RepoMirror {
    path: PathBuf,
    branch: String,
    username: Option<String>,
    password: Option<String>,
    /// The directory was cloned by us and may be removed on shutdown.
    owned: bool,
}

impl RepoMirror {
    /// Clone the configured repository into the work directory, replacing
    /// any stale clone. Without a repository URL the local working copy is
    /// opened instead.
    pub fn setup(config: &MonitorConfig) -> Result<Self, SetupError> {
        let mut mirror = Self {
            path: config.local_path.clone(),
            branch: config.branch.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            owned: false,
        };

        if !config.is_remote() {
            Repository::open(&mirror.path).map_err(|source| SetupError::Open {
                path: mirror.path.display().to_string(),
                source,
            })?;
            tracing::info!("Using local working copy at {:?}", mirror.path);
            return Ok(mirror);
        }

        std::fs::create_dir_all(&config.work_dir)?;
        mirror.path = config.work_dir.join(mirror_dir_name(&config.key()));
        mirror.owned = true;

        if mirror.path.exists() {
            std::fs::remove_dir_all(&mirror.path)?;
        }

        tracing::info!("Cloning repository: {} (branch {})", config.repo_url, config.branch);
        if let Err(e) = mirror.clone_repo(&config.repo_url, Some(&config.branch)) {
            tracing::warn!(
                "Clone of branch {} failed ({}), retrying with the default branch",
                config.branch,
                e.message()
            );
            if mirror.path.exists() {
                std::fs::remove_dir_all(&mirror.path)?;
            }
            mirror
                .clone_repo(&config.repo_url, None)
                .and_then(|repo| checkout_remote_branch(&repo, &config.branch))
                .map_err(|source| SetupError::Clone {
                    url: config.repo_url.clone(),
                    branch: config.branch.clone(),
                    source,
                })?;
        }

        tracing::info!("Repository ready at {:?}", mirror.path);
        Ok(mirror)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    fn clone_repo(&self, url: &str, branch: Option<&str>) -> Result<Repository, git2::Error> {
        let mut builder = RepoBuilder::new();
        builder.fetch_options(self.fetch_options());
        if let Some(branch) = branch {
            builder.branch(branch);
        }

        let result = builder.clone(url, &self.path);
        if let Err(e) = &result {
            tracing::error!(
                "Git clone error: {} (class: {:?}, code: {:?})",
                e.message(),
                e.class(),
                e.code()
            );
        }
        result
    }

    fn fetch_options(&self) -> FetchOptions<'static> {
        let mut callbacks = RemoteCallbacks::new();

        if let Some(password) = self.password.clone() {
            // Plain tokens authenticate with the conventional token user.
            let username = self
                .username
                .clone()
                .unwrap_or_else(|| "x-access-token".to_string());
            let mut attempts = 0;
            callbacks.credentials(move |_url, _username_from_url, _allowed_types| {
                // libgit2 re-invokes the callback after a rejected credential.
                attempts += 1;
                if attempts > 1 {
                    return Err(git2::Error::from_str("authentication failed"));
                }
                Cred::userpass_plaintext(&username, &password)
            });
        }

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(callbacks);
        fetch_options
    }

    /// Bring the mirror up to the remote branch tip. After one fetch a
    /// fast-forward is tried first, then a hard reset to the fetched tip.
    /// Returns whether either worked.
    pub fn pull(&self) -> bool {
        let repo = match Repository::open(&self.path) {
            Ok(repo) => repo,
            Err(e) => {
                tracing::warn!("Failed to open mirror at {:?}: {}", self.path, e);
                return false;
            }
        };

        if !self.owned {
            if repo.find_remote("origin").is_err() {
                tracing::debug!("Working copy has no origin remote, nothing to fetch");
                return true;
            }
            return match self.fetch(&repo) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Git fetch failed: {}", e);
                    false
                }
            };
        }

        let target = match self.fetch(&repo).and_then(|()| self.remote_tip(&repo)) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!("Git fetch failed: {}", e);
                return false;
            }
        };

        match self.fast_forward(&repo, target) {
            Ok(()) => {
                tracing::debug!("Pulled latest changes for {}", self.branch);
                true
            }
            Err(e) => {
                tracing::warn!("Git pull failed ({}), resetting to remote tip", e);
                match self.reset_to(&repo, target) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("Hard reset to remote tip failed: {}", e);
                        false
                    }
                }
            }
        }
    }

    fn fetch(&self, repo: &Repository) -> Result<(), SyncError> {
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", self.branch);
        remote.fetch(&[refspec.as_str()], Some(&mut self.fetch_options()), None)?;
        Ok(())
    }

    fn remote_tip(&self, repo: &Repository) -> Result<Oid, SyncError> {
        repo.find_reference(&format!("refs/remotes/origin/{}", self.branch))
            .ok()
            .and_then(|reference| reference.target())
            .ok_or_else(|| SyncError::MissingRemoteBranch(self.branch.clone()))
    }

    fn fast_forward(&self, repo: &Repository, target: Oid) -> Result<(), SyncError> {
        let annotated = repo.find_annotated_commit(target)?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            return Ok(());
        }
        if !analysis.is_fast_forward() {
            return Err(SyncError::Diverged(self.branch.clone()));
        }

        let refname = format!("refs/heads/{}", self.branch);
        match repo.find_reference(&refname) {
            Ok(mut reference) => {
                reference.set_target(target, "pull: fast-forward")?;
            }
            Err(_) => {
                repo.reference(&refname, target, true, "pull: create branch")?;
            }
        }
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
        Ok(())
    }

    fn reset_to(&self, repo: &Repository, target: Oid) -> Result<(), SyncError> {
        let object = repo.find_object(target, None)?;
        repo.reset(&object, ResetType::Hard, Some(CheckoutBuilder::default().force()))?;
        Ok(())
    }

    pub fn current_head(&self) -> Result<String, SyncError> {
        let repo = Repository::open(&self.path)?;
        let head = repo.head()?.peel_to_commit()?;
        Ok(head.id().to_string())
    }

    /// Remove the on-disk clone. Working copies are left alone.
    pub fn cleanup(&self) -> std::io::Result<()> {
        if self.owned && self.path.exists() {
            tracing::info!("Removing mirror at {:?}", self.path);
            std::fs::remove_dir_all(&self.path)?;
        }
        Ok(())
    }
}

fn checkout_remote_branch(repo: &Repository, branch: &str) -> Result<(), git2::Error> {
    let remote_ref = repo.find_reference(&format!("refs/remotes/origin/{branch}"))?;
    let commit = remote_ref.peel_to_commit()?;
    if repo.find_branch(branch, BranchType::Local).is_err() {
        repo.branch(branch, &commit, true)?;
    }
    repo.set_head(&format!("refs/heads/{branch}"))?;
    repo.checkout_head(Some(CheckoutBuilder::default().force()))
}

/// Stable directory name for a configuration's clone.
fn mirror_dir_name(key: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// `CommitSource` backed by a git2 repository handle.
pub struct GitHistory {
    repo: Repository,
}

impl GitHistory {
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        Ok(Self {
            repo: Repository::open(path)?,
        })
    }

    fn find_commit(&self, rev: &str) -> Option<git2::Commit<'_>> {
        self.repo
            .revparse_single(rev)
            .and_then(|object| object.peel_to_commit())
            .ok()
    }
}

fn blob_at(commit: &git2::Commit, path: &Path) -> Option<Oid> {
    commit.tree().ok()?.get_path(path).ok().map(|entry| entry.id())
}

impl CommitSource for GitHistory {
    fn log_for(&self, path: &str) -> Result<Vec<String>, HistoryError> {
        let mut revwalk = self.repo.revwalk()?;
        if revwalk.push_head().is_err() {
            // Unborn HEAD: no history at all.
            return Ok(Vec::new());
        }
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

        let path = Path::new(path);
        let mut hashes = Vec::new();
        for oid in revwalk {
            let commit = self.repo.find_commit(oid?)?;
            let current = blob_at(&commit, path);
            let previous = commit.parent(0).ok().and_then(|p| blob_at(&p, path));
            if current != previous {
                hashes.push(commit.id().to_string());
            }
        }
        Ok(hashes)
    }

    fn content_at(&self, commit: &str, path: &str) -> Result<Option<String>, HistoryError> {
        let Some(commit) = self.find_commit(commit) else {
            return Ok(None);
        };
        let tree = commit.tree()?;
        let Ok(entry) = tree.get_path(Path::new(path)) else {
            return Ok(None);
        };
        let object = entry.to_object(&self.repo)?;
        Ok(object
            .as_blob()
            .map(|blob| String::from_utf8_lossy(blob.content()).into_owned()))
    }

    fn info_for(&self, commit: &str) -> Result<Option<CommitInfo>, HistoryError> {
        let Some(commit) = self.find_commit(commit) else {
            return Ok(None);
        };
        let hash = commit.id().to_string();
        let author = commit.author();
        Ok(Some(CommitInfo {
            short_hash: hash[..7].to_string(),
            date: Utc
                .timestamp_opt(commit.time().seconds(), 0)
                .single()
                .unwrap_or_default(),
            message: commit.summary().unwrap_or("").to_string(),
            author_name: author.name().unwrap_or("").to_string(),
            author_email: author.email().unwrap_or("").to_string(),
            hash,
        }))
    }
}
