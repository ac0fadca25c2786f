//! Concurrent upstream polling with a barrier before reconciliation.
//!
//! Each server is fetched in its own task. The cycle only reports back once
//! every task returned, so the loop never reconciles a fresh snapshot from one
//! server against a stale one from another.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use unspool_config::ServerConfig;
use unspool_core::{QueueClient, QueueEntry, SourceKind};

/// A configured upstream server and the client that polls it.
#[derive(Clone)]
pub struct UpstreamServer {
    /// Client for the server's queue.
    pub client: Arc<dyn QueueClient>,
    /// Server settings (protocols, retention).
    pub config: ServerConfig,
}

impl UpstreamServer {
    /// Application kind of the server.
    #[must_use]
    pub fn source(&self) -> SourceKind {
        self.client.source()
    }

    /// Server URL.
    #[must_use]
    pub fn origin(&self) -> &str {
        self.client.origin()
    }
}

/// Outcome of polling one server.
#[derive(Debug, Clone)]
pub struct PollResult {
    /// Application kind.
    pub source: SourceKind,
    /// Server URL.
    pub origin: String,
    /// Snapshot, or the error text when the fetch failed.
    pub result: Result<Vec<QueueEntry>, String>,
}

/// Poll every server concurrently and return once all of them finished.
/// Results keep the order of `servers`.
pub async fn poll_all(servers: &[UpstreamServer]) -> Vec<PollResult> {
    let mut tasks = JoinSet::new();
    for (index, server) in servers.iter().enumerate() {
        let client = Arc::clone(&server.client);
        tasks.spawn(async move {
            let result = client
                .fetch_queue()
                .await
                .map_err(|err| format!("{err:#}"));
            (
                index,
                PollResult {
                    source: client.source(),
                    origin: client.origin().to_string(),
                    result,
                },
            )
        });
    }

    let mut results = Vec::with_capacity(servers.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(err) => warn!(error = %err, "queue poll task ended abnormally"),
        }
    }
    results.sort_by_key(|(index, _)| *index);
    debug!(servers = results.len(), "poll cycle complete");
    results.into_iter().map(|(_, result)| result).collect()
}

/// Run one poll cycle in the background and deliver its results on `tx`.
pub fn spawn_cycle(servers: Arc<[UpstreamServer]>, tx: mpsc::Sender<Vec<PollResult>>) {
    tokio::spawn(async move {
        let results = poll_all(&servers).await;
        if tx.send(results).await.is_err() {
            debug!("poll results dropped; loop has stopped");
        }
    });
}
