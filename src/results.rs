use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ResultStoreConfig;
use crate::error::ResultStoreError;
use crate::models::{ArtifactDescriptor, ArtifactKind, ChangeRecord};
use crate::s3::S3Client;

/// Alternate location for benchmark runs: `guidellm-benchmarks/{commit}/...`.
pub const BENCHMARK_PREFIX: &str = "guidellm-benchmarks";
pub const EVAL_SUFFIX: &str = "_results.html";
pub const BENCHMARK_FILE: &str = "benchmark-results.html";

/// The subset of an object store the cross-referencer needs. "Not found"
/// is `Ok(false)` / `Ok(None)`, never an error.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn object_exists(&self, key: &str) -> Result<bool, ResultStoreError>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ResultStoreError>;
    async fn fetch_object(&self, key: &str) -> Result<Option<Vec<u8>>, ResultStoreError>;
}

/// Key of the evaluation report for one use case at one commit.
pub fn eval_key(commit: &str, usecase: &str) -> String {
    format!("{commit}/{usecase}{EVAL_SUFFIX}")
}

/// Links change records to evaluation and benchmark artifacts. Store
/// failures are logged and read as "no results".
pub struct ResultCrossReferencer {
    store: Arc<dyn ResultStore>,
    bucket: String,
    ui_base_url: Option<String>,
}

impl ResultCrossReferencer {
    pub fn new(store: Arc<dyn ResultStore>, config: &ResultStoreConfig) -> Self {
        Self {
            store,
            bucket: config.bucket.clone(),
            ui_base_url: config.ui_base_url.clone(),
        }
    }

    pub async fn connect(config: &ResultStoreConfig) -> Self {
        let client = S3Client::new(config).await;
        Self::new(Arc::new(client), config)
    }

    pub async fn exists(&self, commit: &str, usecase: &str) -> bool {
        let key = eval_key(commit, usecase);
        match self.store.object_exists(&key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Result lookup failed, treating as missing: {}", e);
                false
            }
        }
    }

    /// Viewer link for the evaluation report. No network access.
    pub fn url_for(&self, commit: &str, usecase: &str) -> Option<String> {
        self.url_for_key(&eval_key(commit, usecase))
    }

    fn url_for_key(&self, key: &str) -> Option<String> {
        let base = self.ui_base_url.as_deref()?;
        Some(format!("{}/browser/{}/{}", base, self.bucket, key))
    }

    /// Every artifact stored for `commit`, under both key conventions.
    pub async fn list_for_commit(&self, commit: &str) -> Vec<ArtifactDescriptor> {
        let prefixes = [
            format!("{commit}/"),
            format!("{BENCHMARK_PREFIX}/{commit}/"),
        ];

        let mut seen = HashSet::new();
        let mut artifacts = Vec::new();
        for prefix in &prefixes {
            let keys = match self.store.list_keys(prefix).await {
                Ok(keys) => keys,
                Err(e) => {
                    tracing::warn!("Listing {} failed: {}", prefix, e);
                    continue;
                }
            };

            for key in keys {
                let Some(rest) = key.strip_prefix(prefix.as_str()) else {
                    continue;
                };
                let artifact = self.describe(&key, rest, prefix.starts_with(BENCHMARK_PREFIX));
                if seen.insert((artifact.usecase.clone(), artifact.filename.clone())) {
                    artifacts.push(artifact);
                }
            }
        }
        artifacts
    }

    fn describe(&self, key: &str, rest: &str, benchmark_prefix: bool) -> ArtifactDescriptor {
        let (dir, filename) = match rest.rsplit_once('/') {
            Some((dir, filename)) => (dir, filename),
            None => ("", rest),
        };

        let (kind, usecase) = if filename.ends_with(BENCHMARK_FILE)
            || (benchmark_prefix && (filename.ends_with(".html") || filename.ends_with(".json")))
        {
            (ArtifactKind::Benchmark, dir.to_string())
        } else if let Some(usecase) = filename.strip_suffix(EVAL_SUFFIX) {
            (ArtifactKind::Evaluation, usecase.to_string())
        } else {
            (ArtifactKind::Other, dir.to_string())
        };

        ArtifactDescriptor {
            key: key.to_string(),
            usecase,
            filename: filename.to_string(),
            kind,
            url: self.url_for_key(key),
        }
    }

    /// Raw evaluation report, if present.
    pub async fn report(&self, commit: &str, usecase: &str) -> Option<Vec<u8>> {
        let key = eval_key(commit, usecase);
        match self.store.fetch_object(&key).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Fetching report {} failed: {}", key, e);
                None
            }
        }
    }

    /// Re-check every record's result availability and update its result
    /// fields. Returns how many records flipped.
    pub async fn refresh_all(&self, records: &mut [ChangeRecord]) -> usize {
        let mut checked: HashMap<(String, String), bool> = HashMap::new();
        let mut flipped = 0;

        for record in records.iter_mut() {
            let lookup = (record.commit_hash.clone(), record.state.usecase.clone());
            let found = match checked.get(&lookup) {
                Some(&found) => found,
                None => {
                    let found = self.exists(&lookup.0, &lookup.1).await;
                    checked.insert(lookup, found);
                    found
                }
            };

            if record.has_eval_results != found {
                flipped += 1;
            }
            record.has_eval_results = found;
            record.eval_url = if found {
                self.url_for(&record.commit_hash, &record.state.usecase)
            } else {
                None
            };
        }

        if flipped > 0 {
            tracing::info!("Result availability changed for {} records", flipped);
        }
        flipped
    }
}
