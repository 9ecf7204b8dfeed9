use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A remote browser automation session owned by some other component.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

struct BrowserEntry {
    handle: Arc<dyn BrowserHandle>,
    last_access: Instant,
}

/// Browser sessions keyed by id, reaped once idle for too long.
#[derive(Default)]
pub struct BrowserSessions {
    sessions: Mutex<HashMap<String, BrowserEntry>>,
}

impl BrowserSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session, replacing (and closing) any previous one under the same id.
    pub async fn register(&self, id: impl Into<String>, handle: Arc<dyn BrowserHandle>) {
        let id = id.into();
        let previous = self.sessions.lock().await.insert(
            id.clone(),
            BrowserEntry {
                handle,
                last_access: Instant::now(),
            },
        );
        if let Some(previous) = previous {
            close_quietly(&id, previous.handle).await;
        }
    }

    /// Marks a session as used. Returns `false` for unknown ids.
    pub async fn touch(&self, id: &str) -> bool {
        match self.sessions.lock().await.get_mut(id) {
            Some(entry) => {
                entry.last_access = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn close(&self, id: &str) -> bool {
        let entry = self.sessions.lock().await.remove(id);
        match entry {
            Some(entry) => {
                close_quietly(id, entry.handle).await;
                true
            }
            None => false,
        }
    }

    /// Closes and forgets every session idle for longer than `threshold`.
    pub async fn sweep_stale(&self, threshold: Duration) -> usize {
        let stale: Vec<(String, Arc<dyn BrowserHandle>)> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| entry.last_access.elapsed() > threshold)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|entry| (id, entry.handle)))
                .collect()
        };

        let count = stale.len();
        for (id, handle) in stale {
            info!(browser_session = %id, "Closing stale browser session");
            close_quietly(&id, handle).await;
        }
        count
    }

    pub async fn close_all(&self) -> usize {
        let all: Vec<(String, BrowserEntry)> = self.sessions.lock().await.drain().collect();
        let count = all.len();
        for (id, entry) in all {
            close_quietly(&id, entry.handle).await;
        }
        count
    }
}

async fn close_quietly(id: &str, handle: Arc<dyn BrowserHandle>) {
    if let Err(e) = handle.close().await {
        warn!(browser_session = %id, error = %e, "Failed to close browser session");
    }
}

/// Runs [`BrowserSessions::sweep_stale`] every `interval` until the task is aborted.
pub fn spawn_sweeper(
    sessions: Arc<BrowserSessions>,
    interval: Duration,
    threshold: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = sessions.sweep_stale(threshold).await;
            if reaped > 0 {
                debug!(reaped, "Browser sweep finished");
            }
        }
    })
}
