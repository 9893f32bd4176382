use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex, RwLock};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, SetupError};
use crate::git::{GitHistory, RepoMirror};
use crate::history::build_history;
use crate::models::{ChangeRecord, RefreshSummary};
use crate::results::ResultCrossReferencer;

/// Bookkeeping owned by whoever holds the scan lock.
struct ScanState {
    last_head: Option<String>,
    last_results_refresh: Instant,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub rebuilt: bool,
    pub results_updated: usize,
}

/// Change tracking for one repository/branch configuration.
///
/// Rebuilds and result refreshes are serialized by the scan lock. Readers
/// take the published history without waiting for a scan: a rebuild swaps
/// in a complete new list when it finishes.
pub struct Monitor {
    config: MonitorConfig,
    mirror: RepoMirror,
    results: Option<ResultCrossReferencer>,
    history: RwLock<Arc<Vec<ChangeRecord>>>,
    scan: Mutex<ScanState>,
}

impl Monitor {
    /// Set up the mirror, connect the result store and run the first scan.
    pub async fn start(config: MonitorConfig) -> Result<Arc<Self>, SetupError> {
        let results = match &config.results {
            Some(store) => Some(ResultCrossReferencer::connect(store).await),
            None => None,
        };
        Self::with_results(config, results).await
    }

    pub async fn with_results(
        config: MonitorConfig,
        results: Option<ResultCrossReferencer>,
    ) -> Result<Arc<Self>, SetupError> {
        let setup_config = config.clone();
        let mirror = tokio::task::spawn_blocking(move || RepoMirror::setup(&setup_config)).await??;

        tracing::info!(
            "Initialized monitor for {} (interval {:?}, branch {})",
            config.key(),
            config.poll_interval,
            config.branch
        );

        let monitor = Arc::new(Self {
            config,
            mirror,
            results,
            history: RwLock::new(Arc::new(Vec::new())),
            scan: Mutex::new(ScanState {
                last_head: None,
                last_results_refresh: Instant::now(),
            }),
        });

        if let Err(e) = monitor.initial_scan().await {
            tracing::warn!("Initial scan of {} failed: {}", monitor.key(), e);
        }
        Ok(monitor)
    }

    pub fn key(&self) -> String {
        self.config.key()
    }

    pub fn mirror(&self) -> &RepoMirror {
        &self.mirror
    }

    pub fn results(&self) -> Option<&ResultCrossReferencer> {
        self.results.as_ref()
    }

    /// The current change history, newest first.
    pub async fn history(&self) -> Arc<Vec<ChangeRecord>> {
        self.history.read().await.clone()
    }

    async fn publish(&self, records: Vec<ChangeRecord>) {
        *self.history.write().await = Arc::new(records);
    }

    async fn initial_scan(&self) -> Result<(), MonitorError> {
        let mut state = self.scan.lock().await;
        let mirror = self.mirror.clone();
        let head = tokio::task::spawn_blocking(move || mirror.current_head()).await??;
        self.rebuild(&mut state).await?;
        state.last_head = Some(head);
        Ok(())
    }

    /// Pull and read HEAD. Pull failures are logged, not returned.
    async fn sync(&self) -> Result<String, MonitorError> {
        let mirror = self.mirror.clone();
        let (pulled, head) =
            tokio::task::spawn_blocking(move || (mirror.pull(), mirror.current_head())).await?;
        if !pulled {
            tracing::warn!("Failed to pull latest changes for {}", self.key());
        }
        Ok(head?)
    }

    /// Rebuild the full history, carrying known result flags over so the
    /// refresh count reflects real changes, then publish it.
    async fn rebuild(&self, state: &mut ScanState) -> Result<RefreshSummary, MonitorError> {
        let path = self.mirror.path().to_path_buf();
        let files = self.config.tracked_files.clone();
        let mut records = tokio::task::spawn_blocking(move || -> Result<_, MonitorError> {
            let source = GitHistory::open(&path)?;
            Ok(build_history(&source, &files))
        })
        .await??;

        let previous = self.history().await;
        let known: HashMap<(String, String, String), (bool, Option<String>)> = previous
            .iter()
            .map(|r| (identity_key(r), (r.has_eval_results, r.eval_url.clone())))
            .collect();
        for record in records.iter_mut() {
            if let Some((has_results, url)) = known.get(&identity_key(record)) {
                record.has_eval_results = *has_results;
                record.eval_url = url.clone();
            }
        }

        let results_updated = match &self.results {
            Some(results) => results.refresh_all(&mut records).await,
            None => 0,
        };
        state.last_results_refresh = Instant::now();

        let refreshed_count = records.len();
        self.publish(records).await;
        Ok(RefreshSummary {
            refreshed_count,
            results_updated,
        })
    }

    async fn refresh_results(&self, state: &mut ScanState) -> usize {
        let Some(results) = &self.results else {
            return 0;
        };
        let mut records = self.history().await.as_ref().clone();
        let updated = results.refresh_all(&mut records).await;
        state.last_results_refresh = Instant::now();
        if updated > 0 {
            self.publish(records).await;
        }
        updated
    }

    /// One scanning pass: pull, rebuild on HEAD movement, and re-check
    /// results once their refresh interval has elapsed.
    pub async fn tick(&self) -> Result<TickOutcome, MonitorError> {
        let mut state = self.scan.lock().await;
        let head = self.sync().await?;
        let mut outcome = TickOutcome::default();

        if state.last_head.as_deref() != Some(head.as_str()) {
            tracing::info!("New commits detected, rescanning history...");
            let summary = self.rebuild(&mut state).await?;
            state.last_head = Some(head);
            outcome.rebuilt = true;
            outcome.results_updated = summary.results_updated;
        } else if self.results.is_some()
            && state.last_results_refresh.elapsed() >= self.config.results_refresh_interval
        {
            outcome.results_updated = self.refresh_results(&mut state).await;
        }

        Ok(outcome)
    }

    /// Manual refresh: pull, rebuild unconditionally and re-check results.
    /// Never fails; on error the previous history stays published.
    pub async fn trigger_refresh(&self) -> RefreshSummary {
        let mut state = self.scan.lock().await;
        let head = match self.sync().await {
            Ok(head) => Some(head),
            Err(e) => {
                tracing::warn!("Refresh could not sync {}: {}", self.key(), e);
                None
            }
        };

        match self.rebuild(&mut state).await {
            Ok(summary) => {
                if head.is_some() {
                    state.last_head = head;
                }
                summary
            }
            Err(e) => {
                tracing::error!("Refresh of {} failed: {}", self.key(), e);
                RefreshSummary {
                    refreshed_count: self.history().await.len(),
                    results_updated: 0,
                }
            }
        }
    }

    /// Polling loop. Runs until `shutdown` fires or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Monitoring {} every {:?}", self.key(), self.config.poll_interval);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.tick().await {
                Ok(outcome) => {
                    tracing::debug!("Tick for {} finished: {:?}", self.key(), outcome);
                    self.config.poll_interval
                }
                Err(e) => {
                    tracing::error!("Error in monitor loop for {}: {}", self.key(), e);
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Monitor for {} stopped", self.key());
    }

    /// Remove the mirror from disk if it is ours.
    pub async fn cleanup(&self) {
        let mirror = self.mirror.clone();
        match tokio::task::spawn_blocking(move || mirror.cleanup()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to remove mirror for {}: {}", self.key(), e),
            Err(e) => tracing::warn!("Cleanup task for {} failed: {}", self.key(), e),
        }
    }
}

fn identity_key(record: &ChangeRecord) -> (String, String, String) {
    let (commit, usecase, environment) = record.identity();
    (commit.to_string(), usecase.to_string(), environment.to_string())
}
