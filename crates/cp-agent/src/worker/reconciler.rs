//! Reconciler worker
//!
//! Registers the agent, runs the API poller beside it, and on every new
//! snapshot or refresh tick drives the client set toward the snapshot with
//! a mark-and-sweep pass. A panic inside a pass is caught and reported; the
//! loop carries on.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use cp_core::config::AgentConfig;
use cp_core::traits::EventNotification;
use cp_core::{ControlPlane, RegisterError};
use cp_models::{Forward, ForwardKey, ForwardType, JoinedEndpoint, Snapshot};

use super::heartbeat::{heartbeat_callback, tick_duration};
use super::register::register;
use crate::netutil::HostAddrs;
use crate::ssh::{ClientSet, LocalForwardRequest, RemoteForwardRequest, SshConnector};
use crate::sync::ModelSetPoller;

/// Snapshots in flight between the poller and the reconciler
const SNAPSHOT_CHANNEL_CAPACITY: usize = 1;

/// Shortest heartbeat period handed to a forward
const MIN_HEARTBEAT_TICK: Duration = Duration::from_secs(1);

/// What one reconcile pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Clients recreated because their endpoint changed
    pub clients_reset: usize,
    /// Clients created for new endpoints
    pub clients_added: usize,
    /// Clients closed because their endpoint disappeared
    pub clients_removed: usize,
    /// Forwards closed
    pub forwards_closed: usize,
    /// Forwards opened or queued
    pub forwards_opened: usize,
    /// Forwards that failed to open
    pub forwards_failed: usize,
    /// Records skipped as invalid
    pub skipped: usize,
}

impl ReconcileReport {
    /// Whether the pass changed nothing
    pub fn is_noop(&self) -> bool {
        self.clients_reset == 0
            && self.clients_added == 0
            && self.clients_removed == 0
            && self.forwards_closed == 0
            && self.forwards_opened == 0
    }
}

/// The agent's top-level control loop
pub struct Worker {
    config: AgentConfig,
    api: Arc<dyn ControlPlane>,
    host: Arc<dyn HostAddrs>,
    clients: ClientSet,
    bind_addr: String,
    current: Option<Arc<Snapshot>>,
}

impl Worker {
    pub fn new(
        config: AgentConfig,
        api: Arc<dyn ControlPlane>,
        connector: Arc<dyn SshConnector>,
        host: Arc<dyn HostAddrs>,
    ) -> Self {
        let clients = ClientSet::new(connector, config.ssh.clone(), CancellationToken::new());
        Self {
            config,
            api,
            host,
            clients,
            bind_addr: String::new(),
            current: None,
        }
    }

    /// Address local forwards listen on
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    /// Use `bind_addr` for local forwards instead of registering
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    pub fn clients(&self) -> &ClientSet {
        &self.clients
    }

    /// Register, then reconcile until `cancel` fires.
    ///
    /// Only registration errors are returned; everything after that is
    /// logged and retried.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), RegisterError> {
        let registration = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            registration = register(
                self.api.as_ref(),
                &self.config.proxy_agent_id,
                self.config.proxy_agent_init_wait,
                self.host.as_ref(),
            ) => registration?,
        };
        self.bind_addr = registration.bind_addr;

        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let poller_cancel = cancel.child_token();
        let poller = ModelSetPoller::new(Arc::clone(&self.api), &self.config);
        let poller_task = tokio::spawn(poller.run(poller_cancel.clone(), tx));

        self.run_loop(cancel, rx).await;

        poller_cancel.cancel();
        if let Err(e) = poller_task.await {
            tracing::error!(error = %e, "API poller task failed");
        }
        self.shutdown().await;
        Ok(())
    }

    /// Reconcile on snapshots from `rx` and on the refresh tick until cancelled
    pub async fn run_loop(&mut self, cancel: CancellationToken, mut rx: mpsc::Receiver<Arc<Snapshot>>) {
        let period = self.config.refresh_interval;
        let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            agent_id = %self.config.proxy_agent_id,
            bind_addr = %self.bind_addr,
            refresh = ?period,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(mut snapshot) = rx.recv() => {
                    while let Ok(newer) = rx.try_recv() {
                        snapshot = newer;
                    }
                    tracing::debug!(
                        endpoints = snapshot.endpoint_count(),
                        forwards = snapshot.forward_count(),
                        correct = snapshot.is_correct(),
                        "New snapshot"
                    );
                    self.current = Some(snapshot);
                    self.reconcile_current().await;
                }
                _ = refresh.tick() => {
                    if self.current.is_some() {
                        self.reconcile_current().await;
                    }
                }
            }
        }

        tracing::info!("Reconciler stopping");
    }

    /// Close every SSH client and forward
    pub async fn shutdown(&mut self) {
        self.clients.close_all().await;
    }

    /// Run a pass against the current snapshot, surviving panics
    async fn reconcile_current(&mut self) {
        let Some(snapshot) = self.current.clone() else {
            return;
        };
        match AssertUnwindSafe(self.reconcile(&snapshot)).catch_unwind().await {
            Ok(report) if report.is_noop() => tracing::debug!(?report, "Reconcile pass: no changes"),
            Ok(report) => tracing::info!(?report, "Reconcile pass finished"),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, "Reconcile pass panicked");
                let event = EventNotification::bug_report(
                    &self.config.proxy_agent_id,
                    format!("reconcile panicked: {}", message),
                );
                if let Err(e) = self.api.notify_event(&event).await {
                    tracing::warn!(error = %e, "Failed to send bug report");
                }
            }
        }
    }

    /// One mark-and-sweep pass of the client set against `snapshot`
    pub async fn reconcile(&mut self, snapshot: &Snapshot) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        // Clients: claim the ones the snapshot still wants, reap the rest
        self.clients.clear_all_mark();
        let mut usable: HashSet<&str> = HashSet::new();
        for joined in snapshot.endpoints() {
            let endpoint = &joined.endpoint;
            let config = match endpoint.ssh_config() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(endpoint_id = %endpoint.id, error = %e, "Skipping endpoint");
                    report.skipped += 1;
                    continue;
                }
            };
            if self.clients.reset_if_changed(&endpoint.id, &config).await {
                report.clients_reset += 1;
            } else if self.clients.add_if_not_exist(&endpoint.id, &config) {
                tracing::info!(endpoint_id = %endpoint.id, addr = %config, "SSH client added");
                report.clients_added += 1;
            }
            usable.insert(endpoint.id.as_str());
        }
        report.clients_removed = self.clients.reset_unmarked().await.len();

        // Forwards: whatever is live and still wanted stays, the rest closes
        let mut removes = self.clients.forward_key_set().await;
        let mut adds: BTreeMap<ForwardKey, (&JoinedEndpoint, &Forward)> = BTreeMap::new();
        for joined in snapshot.endpoints() {
            if !usable.contains(joined.endpoint.id.as_str()) {
                continue;
            }
            for forward in joined.forwards.values() {
                if forward.proxy_agent_id != self.config.proxy_agent_id
                    || forward.proxy_endpoint_id.is_empty()
                {
                    continue;
                }
                let key = match forward.key(&joined.endpoint, &self.bind_addr) {
                    Ok(key) => key,
                    Err(e) => {
                        tracing::warn!(forward_id = %forward.id, error = %e, "Skipping forward");
                        report.skipped += 1;
                        continue;
                    }
                };
                if removes.remove(&key) {
                    continue;
                }
                if let Some((_, first)) = adds.get(&key) {
                    tracing::warn!(
                        %key,
                        forward_id = %forward.id,
                        kept = %first.id,
                        "Duplicate forward key, ignoring"
                    );
                    report.skipped += 1;
                    continue;
                }
                adds.insert(key, (joined, forward));
            }
        }

        for key in &removes {
            if self.clients.close_forward(key).await {
                report.forwards_closed += 1;
            }
        }

        for (key, (joined, forward)) in adds {
            match self.open_forward(joined, forward).await {
                Ok(()) => {
                    tracing::info!(%key, forward_id = %forward.id, "Forward opened");
                    report.forwards_opened += 1;
                }
                Err(e) => {
                    tracing::error!(%key, forward_id = %forward.id, error = %e, "Failed to open forward");
                    report.forwards_failed += 1;
                }
            }
        }

        report
    }

    async fn open_forward(
        &self,
        joined: &JoinedEndpoint,
        forward: &Forward,
    ) -> Result<(), cp_core::ForwardError> {
        let tick = tick_duration(forward.last_seen_timeout).max(MIN_HEARTBEAT_TICK);
        let tick_cb = Some(heartbeat_callback(Arc::clone(&self.api), forward.id.clone()));
        let endpoint_id = joined.endpoint.id.as_str();

        match forward.forward_type {
            ForwardType::Local => {
                let req = LocalForwardRequest {
                    local_addr: self.bind_addr.clone(),
                    local_port: forward.bind_port,
                    remote_addr: forward.remote_addr.clone(),
                    remote_port: forward.remote_port,
                    tick,
                    tick_cb,
                };
                self.clients.local_forward(endpoint_id, req).await
            }
            ForwardType::Remote => {
                let req = RemoteForwardRequest {
                    local_addr: forward.remote_addr.clone(),
                    local_port: forward.remote_port,
                    remote_addr: joined.endpoint.intranet_ip_addr.clone(),
                    remote_port: forward.bind_port,
                    tick,
                    tick_cb,
                };
                self.clients.remote_forward(endpoint_id, req).await
            }
            // Filtered out by `Forward::key`
            ForwardType::Other(_) => Ok(()),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
