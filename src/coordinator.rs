//! Single-flight blob coordinator
//!
//! Ensures at most one concurrent network fetch per digest. A follower's
//! wait handle carries the leader's outcome explicitly (success, or the
//! leader's error wrapped as `LeaderFailed`) rather than relying on memory
//! visibility of a captured variable shared across tasks.

use crate::{PullError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

#[derive(Clone, Debug)]
enum Outcome {
    Success,
    Failed(Arc<String>),
}

type Waiters = HashMap<String, Vec<oneshot::Sender<Outcome>>>;

/// Coordinates concurrent fetches of the same digest across workers.
#[derive(Debug)]
pub struct BlobCoordinator {
    enabled: bool,
    inflight: Mutex<Waiters>,
    follower_timeout: Duration,
}

impl Default for BlobCoordinator {
    fn default() -> Self {
        // Single-flight is off by default, so a one-shot CLI invocation
        // never pays the coordination cost.
        Self::new(false, Duration::from_secs(300))
    }
}

impl BlobCoordinator {
    pub fn new(enabled: bool, follower_timeout: Duration) -> Self {
        BlobCoordinator {
            enabled,
            inflight: Mutex::new(HashMap::new()),
            follower_timeout,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Duration::from_secs(300))
    }

    pub fn enabled(follower_timeout: Duration) -> Self {
        Self::new(true, follower_timeout)
    }

    /// Run `fetch` for `digest`, deduplicating concurrent callers. The first
    /// caller for a given digest is the leader and actually runs `fetch`;
    /// later callers are followers that wait for the leader's outcome.
    pub async fn run<F, Fut>(&self, digest: &str, fetch: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if !self.enabled {
            return fetch().await;
        }

        let is_leader = {
            let mut map = self.inflight.lock().await;
            if map.contains_key(digest) {
                false
            } else {
                map.insert(digest.to_string(), Vec::new());
                true
            }
        };

        if is_leader {
            let result = fetch().await;
            let outcome = match &result {
                Ok(()) => Outcome::Success,
                Err(e) => Outcome::Failed(Arc::new(e.to_string())),
            };
            let waiters = {
                let mut map = self.inflight.lock().await;
                map.remove(digest).unwrap_or_default()
            };
            for tx in waiters {
                let _ = tx.send(outcome.clone());
            }
            result
        } else {
            let rx = {
                let mut map = self.inflight.lock().await;
                match map.get_mut(digest) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    // The leader finished (and cleared the entry) between
                    // our initial check and taking the lock again; treat
                    // this as an immediate (already-complete) success since
                    // the store will reflect it.
                    None => None,
                }
            };
            let Some(rx) = rx else {
                return Ok(());
            };
            match tokio::time::timeout(self.follower_timeout, rx).await {
                Ok(Ok(Outcome::Success)) => Ok(()),
                Ok(Ok(Outcome::Failed(msg))) => Err(PullError::LeaderFailed((*msg).clone())),
                // Sender dropped without sending: the leader task was
                // aborted or panicked.
                Ok(Err(_)) => Err(PullError::LeaderFailed(
                    "leader task ended without a result".to_string(),
                )),
                Err(_) => Err(PullError::Timeout),
            }
        }
    }
}
