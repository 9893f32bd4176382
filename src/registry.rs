use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::error::SetupError;
use crate::monitor::Monitor;

/// A running monitor and its polling task.
pub struct MonitorHandle {
    monitor: Arc<Monitor>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    fn spawn(monitor: Arc<Monitor>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(monitor.clone().run(rx));
        Self {
            monitor,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the polling task, wait for it, then remove the mirror.
    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Monitor task for {} ended abnormally: {}", self.monitor.key(), e);
            }
        }
        self.monitor.cleanup().await;
    }
}

type Slot = Arc<OnceCell<Arc<MonitorHandle>>>;

/// Monitors keyed by configuration identity.
///
/// A monitor is created the first time its configuration is requested.
/// Creation of one configuration does not block lookups of others.
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: Mutex<HashMap<String, Slot>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, config: MonitorConfig) -> Result<Arc<Monitor>, SetupError> {
        let key = config.key();
        let slot = {
            let mut monitors = self.monitors.lock().await;
            monitors.entry(key.clone()).or_default().clone()
        };

        let handle = slot
            .get_or_try_init(|| async move {
                let monitor = Monitor::start(config).await?;
                Ok::<_, SetupError>(Arc::new(MonitorHandle::spawn(monitor)))
            })
            .await?
            .clone();

        // A shutdown that ran before this slot was initialized has already
        // dropped it; nothing else would ever stop this monitor.
        if !self.is_registered(&key, &slot).await {
            tracing::warn!("Monitor for {} was shut down during setup, stopping it", key);
            handle.stop().await;
            return Err(SetupError::Cancelled(key));
        }
        Ok(handle.monitor.clone())
    }

    async fn is_registered(&self, key: &str, slot: &Slot) -> bool {
        let monitors = self.monitors.lock().await;
        monitors
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Monitor>> {
        let monitors = self.monitors.lock().await;
        monitors
            .get(key)
            .and_then(|slot| slot.get())
            .map(|handle| handle.monitor.clone())
    }

    pub async fn len(&self) -> usize {
        let monitors = self.monitors.lock().await;
        monitors.values().filter(|slot| slot.initialized()).count()
    }

    /// Stop and forget one configuration. Returns whether it was running.
    ///
    /// A creation still in flight is waited for and then stopped.
    pub async fn shutdown(&self, key: &str) -> bool {
        let Some(slot) = self.monitors.lock().await.get(key).cloned() else {
            return false;
        };
        let handle = settled(&slot).await;
        {
            let mut monitors = self.monitors.lock().await;
            if monitors
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, &slot))
            {
                monitors.remove(key);
            }
        }

        match handle {
            Some(handle) => {
                tracing::info!("Shutting down monitor for {}", key);
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        let slots: Vec<(String, Slot)> = self.monitors.lock().await.drain().collect();
        for (key, slot) in slots {
            if let Some(handle) = settled(&slot).await {
                tracing::info!("Shutting down monitor for {}", key);
                handle.stop().await;
            }
        }
    }
}

/// The slot's handle once any creation in flight has finished. An idle
/// empty slot yields `None` right away.
async fn settled(slot: &Slot) -> Option<Arc<MonitorHandle>> {
    slot.get_or_try_init(|| async { Err(()) })
        .await
        .ok()
        .cloned()
}
