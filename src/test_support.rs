//! Fixtures shared by the unit tests: throwaway git repositories and an
//! in-memory object store.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use git2::{Oid, Repository, Signature, Time};
use tempfile::TempDir;

use crate::config::{MonitorConfig, ResultStoreConfig, DEFAULT_TRACKED_FILES};
use crate::error::ResultStoreError;
use crate::models::TrackedFile;
use crate::results::ResultStore;

pub fn init_repo() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    Repository::init(dir.path()).unwrap();
    dir
}

/// Write `files` into the working tree and commit them at `secs` (unix time).
pub fn commit_files(repo: &Repository, files: &[(&str, &str)], secs: i64) -> Oid {
    let workdir = repo.workdir().unwrap().to_path_buf();
    let mut index = repo.index().unwrap();
    for (path, content) in files {
        let full_path = workdir.join(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full_path, content).unwrap();
        index.add_path(Path::new(path)).unwrap();
    }
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();

    let sig = Signature::new("Dev", "dev@example.com", &Time::new(secs, 0)).unwrap();
    let message = format!("update {secs}");
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &parents)
        .unwrap()
}

pub fn head_branch(repo: &Repository) -> String {
    repo.head().unwrap().shorthand().unwrap().to_string()
}

pub fn monitor_config(origin: &Path, work_dir: &Path, branch: &str) -> MonitorConfig {
    MonitorConfig {
        repo_url: origin.display().to_string(),
        local_path: work_dir.to_path_buf(),
        username: None,
        password: None,
        branch: branch.to_string(),
        poll_interval: Duration::from_millis(50),
        error_backoff: Duration::from_millis(100),
        results_refresh_interval: Duration::from_secs(300),
        tracked_files: DEFAULT_TRACKED_FILES
            .iter()
            .copied()
            .map(TrackedFile::new)
            .collect(),
        work_dir: work_dir.to_path_buf(),
        results: None,
    }
}

pub fn store_config() -> ResultStoreConfig {
    ResultStoreConfig {
        bucket: "evals".into(),
        endpoint: None,
        region: "us-east-1".into(),
        access_key: None,
        secret_key: None,
        ui_base_url: Some("http://console.local".into()),
    }
}

/// Object store holding a set of keys. `fail` makes every call error out.
#[derive(Default)]
pub struct MemoryStore {
    pub keys: Mutex<BTreeSet<String>>,
    pub fail: bool,
}

impl MemoryStore {
    pub fn with_keys(keys: &[&str]) -> Self {
        Self {
            keys: Mutex::new(keys.iter().map(|k| k.to_string()).collect()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn insert(&self, key: &str) {
        self.keys.lock().unwrap().insert(key.to_string());
    }

    fn check(&self, key: &str) -> Result<(), ResultStoreError> {
        if self.fail {
            return Err(ResultStoreError::Request {
                key: key.to_string(),
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn object_exists(&self, key: &str) -> Result<bool, ResultStoreError> {
        self.check(key)?;
        Ok(self.keys.lock().unwrap().contains(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ResultStoreError> {
        self.check(prefix)?;
        Ok(self
            .keys
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn fetch_object(&self, key: &str) -> Result<Option<Vec<u8>>, ResultStoreError> {
        self.check(key)?;
        let found = self.keys.lock().unwrap().contains(key);
        Ok(found.then(|| format!("<html>{key}</html>").into_bytes()))
    }
}
