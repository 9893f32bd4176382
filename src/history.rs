use std::collections::{HashMap, HashSet};

use crate::extract::extract_usecases;
use crate::git::CommitSource;
use crate::models::{ChangeRecord, TrackedFile, UseCaseState};

/// Reconstruct the change history of every tracked file.
///
/// Commits are replayed oldest first and a record is emitted only when a
/// use case differs from its previous state in the same file. The result
/// is sorted newest first with the latest-enabled flags computed. Commits
/// sharing a timestamp keep their replay order, the later one being newer.
/// Failures on a single commit or file skip that commit or file.
pub fn build_history(source: &dyn CommitSource, files: &[TrackedFile]) -> Vec<ChangeRecord> {
    let mut records: Vec<(usize, ChangeRecord)> = Vec::new();
    let mut seen: HashSet<(String, String, String)> = HashSet::new();

    for file in files {
        let commits = match source.log_for(&file.path) {
            Ok(commits) => commits,
            Err(e) => {
                tracing::warn!("Failed to read history of {}: {}", file.path, e);
                continue;
            }
        };
        tracing::debug!("{} commits touch {}", commits.len(), file.path);

        let mut last_state: HashMap<String, UseCaseState> = HashMap::new();

        for hash in commits.iter().rev() {
            let info = match source.info_for(hash) {
                Ok(Some(info)) => info,
                Ok(None) => {
                    tracing::debug!("Commit {} not found, skipping", hash);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Failed to read commit {}: {}", hash, e);
                    continue;
                }
            };
            let content = match source.content_at(hash, &file.path) {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Failed to read {} at {}: {}", file.path, hash, e);
                    continue;
                }
            };

            for state in extract_usecases(&content) {
                let changed = last_state
                    .get(&state.usecase)
                    .map_or(true, |previous| previous != &state);

                if changed {
                    let identity = (
                        info.hash.clone(),
                        state.usecase.clone(),
                        file.environment.clone(),
                    );
                    if seen.insert(identity) {
                        let seq = records.len();
                        records.push((seq, ChangeRecord::new(file, &info, state.clone())));
                    }
                }
                last_state.insert(state.usecase.clone(), state);
            }
        }
    }

    records.sort_by(|(seq_a, a), (seq_b, b)| {
        b.commit_date
            .cmp(&a.commit_date)
            .then_with(|| seq_b.cmp(seq_a))
    });
    let mut records: Vec<ChangeRecord> = records.into_iter().map(|(_, record)| record).collect();
    mark_latest(&mut records);
    tracing::info!("Found {} changes in history", records.len());
    records
}

/// Flag the newest record of every (use case, environment) pair. Expects
/// `records` sorted newest first; on equal dates the record listed first
/// wins.
pub fn mark_latest(records: &mut [ChangeRecord]) {
    let mut newest: HashMap<(&str, &str), usize> = HashMap::new();
    for (idx, record) in records.iter().enumerate() {
        let key = (record.state.usecase.as_str(), record.environment.as_str());
        match newest.get(&key) {
            Some(&best) if records[best].commit_date >= record.commit_date => {}
            _ => {
                newest.insert(key, idx);
            }
        }
    }
    let latest: HashSet<usize> = newest.into_values().collect();

    for (idx, record) in records.iter_mut().enumerate() {
        record.is_latest = latest.contains(&idx);
        record.currently_enabled = record.is_latest && record.state.enabled;
    }
}
