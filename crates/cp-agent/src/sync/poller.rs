//! API poller
//!
//! Lists proxy endpoints and forwards on a fixed interval, folds each listing
//! into the carried [`ModelSets`] and hands a joined [`Snapshot`] to the
//! reconciler whenever something changed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use cp_core::config::AgentConfig;
use cp_core::traits::{EventNotification, ListQuery, ListResult};
use cp_core::{ApiError, ControlPlane};
use cp_models::{ModelSets, Snapshot};

/// Periodic model-set sync against the control plane
pub struct ModelSetPoller {
    api: Arc<dyn ControlPlane>,
    agent_id: String,
    interval: Duration,
    batch_size: usize,
    full_sync_every: u32,
    sets: ModelSets,
    /// Successful syncs so far
    syncs: u64,
    /// An out-of-sync notification was sent for the current incorrect run
    out_of_sync_notified: bool,
}

impl ModelSetPoller {
    pub fn new(api: Arc<dyn ControlPlane>, config: &AgentConfig) -> Self {
        Self {
            api,
            agent_id: config.proxy_agent_id.clone(),
            interval: config.sync_interval(),
            batch_size: config.list_batch_size(),
            full_sync_every: config.api_full_sync_every,
            sets: ModelSets::new(),
            syncs: 0,
            out_of_sync_notified: false,
        }
    }

    /// Sync on every interval tick until cancelled, sending changed snapshots.
    ///
    /// A send waits for the reconciler to take the previous snapshot; if
    /// cancellation arrives first the snapshot is dropped.
    pub async fn run(mut self, cancel: CancellationToken, tx: mpsc::Sender<Arc<Snapshot>>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval = ?self.interval, batch = self.batch_size, "API poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.run_manually() => result,
            };

            match result {
                Ok(Some(snapshot)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(snapshot) => {
                            if sent.is_err() {
                                tracing::debug!("Snapshot receiver dropped, stopping poller");
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Model-set sync failed, keeping previous state");
                }
            }
        }

        tracing::info!("API poller stopped");
    }

    /// Run one sync now; returns the new snapshot when anything changed.
    ///
    /// On a listing error the carried state is left untouched.
    pub async fn run_manually(&mut self) -> Result<Option<Arc<Snapshot>>, ApiError> {
        let full = self.next_sync_is_full();
        let since = (!full).then(|| self.sets.max_updated_at());
        let first = match since {
            Some(since) => ListQuery::incremental(self.batch_size, since),
            None => ListQuery::full(self.batch_size),
        };

        let api = Arc::clone(&self.api);
        let endpoints = list_all(first.clone(), |q| {
            let api = Arc::clone(&api);
            async move { api.list_endpoints(&q).await }
        })
        .await?;
        let forwards = list_all(first, |q| {
            let api = Arc::clone(&api);
            async move { api.list_forwards(&q).await }
        })
        .await?;

        let listed = (endpoints.len(), forwards.len());
        let outcome = self.sets.apply(endpoints, forwards, full);
        self.syncs += 1;

        tracing::debug!(
            full,
            endpoints = listed.0,
            forwards = listed.1,
            added = outcome.added,
            updated = outcome.updated,
            removed = outcome.removed,
            stale = outcome.stale,
            "Model-set sync finished"
        );

        if !outcome.changed() {
            return Ok(None);
        }

        let snapshot = self.sets.join();
        self.report_consistency(&snapshot).await;
        Ok(Some(Arc::new(snapshot)))
    }

    fn next_sync_is_full(&self) -> bool {
        self.syncs == 0
            || self.full_sync_every == 0
            || self.syncs % u64::from(self.full_sync_every) == 0
    }

    /// Raise one out-of-sync notification per run of incorrect snapshots
    async fn report_consistency(&mut self, snapshot: &Snapshot) {
        if snapshot.is_correct() {
            self.out_of_sync_notified = false;
            return;
        }
        if self.out_of_sync_notified {
            return;
        }
        self.out_of_sync_notified = true;

        tracing::warn!(orphans = ?snapshot.orphans(), "Snapshot is out of sync");
        let event = EventNotification::out_of_sync(&self.agent_id, snapshot.orphans());
        if let Err(e) = self.api.notify_event(&event).await {
            tracing::warn!(error = %e, "Failed to send out-of-sync notification");
        }
    }
}

/// Fetch pages until the listing is exhausted
async fn list_all<T, F, Fut>(first: ListQuery, mut fetch: F) -> Result<Vec<T>, ApiError>
where
    F: FnMut(ListQuery) -> Fut,
    Fut: Future<Output = Result<ListResult<T>, ApiError>>,
{
    let mut rows = Vec::new();
    let mut query = first;
    loop {
        let page = fetch(query.clone()).await?;
        let last = page.is_last_page();
        let next_offset = query.offset + page.rows();
        rows.extend(page.data);
        if last {
            break;
        }
        query = query.at_offset(next_offset);
    }
    Ok(rows)
}
