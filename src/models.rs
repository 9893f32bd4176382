use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A configuration file in the repository whose history is reconstructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub path: String,
    pub environment: String,
}

impl TrackedFile {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let environment = environment_for(&path);
        Self { path, environment }
    }
}

/// `chart/values-prod.yaml` -> `prod`. Paths outside that naming scheme
/// fall back to `test` when they mention it and `prod` otherwise.
pub fn environment_for(path: &str) -> String {
    if let Some(env) = values_suffix(path) {
        return env;
    }
    if path.contains("test") {
        "test".to_string()
    } else {
        "prod".to_string()
    }
}

fn values_suffix(path: &str) -> Option<String> {
    let re = Regex::new(r"values-([A-Za-z0-9_]+)\.ya?ml$").ok()?;
    re.captures(path).map(|caps| caps[1].to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub short_hash: String,
    pub date: DateTime<Utc>,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
}

/// One use case as configured at one commit. Compared field by field to
/// detect changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCaseState {
    pub usecase: String,
    pub model: String,
    pub prompt: String,
    pub enabled: bool,
    pub temperature: Option<f64>,
    pub top_k: Option<i64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub environment: String,
    #[serde(flatten)]
    pub state: UseCaseState,
    pub commit_hash: String,
    pub commit_short_hash: String,
    pub commit_date: DateTime<Utc>,
    pub commit_message: String,
    pub commit_author_name: String,
    pub commit_author_email: String,
    pub file_path: String,
    /// Newest record for its (use case, environment) pair.
    pub is_latest: bool,
    /// `is_latest` and the state is enabled.
    pub currently_enabled: bool,
    pub has_eval_results: bool,
    pub eval_url: Option<String>,
}

impl ChangeRecord {
    pub fn new(file: &TrackedFile, commit: &CommitInfo, state: UseCaseState) -> Self {
        Self {
            environment: file.environment.clone(),
            state,
            commit_hash: commit.hash.clone(),
            commit_short_hash: commit.short_hash.clone(),
            commit_date: commit.date,
            commit_message: commit.message.clone(),
            commit_author_name: commit.author_name.clone(),
            commit_author_email: commit.author_email.clone(),
            file_path: file.path.clone(),
            is_latest: false,
            currently_enabled: false,
            has_eval_results: false,
            eval_url: None,
        }
    }

    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.commit_hash, &self.state.usecase, &self.environment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Evaluation,
    Benchmark,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub key: String,
    pub usecase: String,
    pub filename: String,
    pub kind: ArtifactKind,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub refreshed_count: usize,
    pub results_updated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_from_values_file() {
        assert_eq!(environment_for("chart/values-test.yaml"), "test");
        assert_eq!(environment_for("chart/values-prod.yaml"), "prod");
        assert_eq!(environment_for("deploy/values-staging.yml"), "staging");
    }

    #[test]
    fn test_environment_fallback() {
        assert_eq!(environment_for("config/test/prompts.yaml"), "test");
        assert_eq!(environment_for("config/prompts.yaml"), "prod");
    }

    #[test]
    fn test_record_serializes_flat() {
        let file = TrackedFile::new("chart/values-test.yaml");
        let commit = CommitInfo {
            hash: "abc123".into(),
            short_hash: "abc123".into(),
            date: Utc::now(),
            message: "tune".into(),
            author_name: "dev".into(),
            author_email: "dev@example.com".into(),
        };
        let state = UseCaseState {
            usecase: "summarize".into(),
            model: "m1".into(),
            prompt: "p1".into(),
            enabled: true,
            temperature: Some(0.2),
            top_k: None,
            top_p: None,
            max_tokens: Some(256),
        };
        let json = serde_json::to_value(ChangeRecord::new(&file, &commit, state)).unwrap();
        assert_eq!(json["usecase"], "summarize");
        assert_eq!(json["environment"], "test");
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["has_eval_results"], false);
    }
}
