//! Keyed set of SSH clients
//!
//! Clients are keyed by endpoint id. Reconciliation is mark-and-sweep: a
//! pass bumps the generation with [`ClientSet::clear_all_mark`], claims the
//! clients it still wants through [`ClientSet::add_if_not_exist`] and
//! [`ClientSet::reset_if_changed`], then reaps the rest with
//! [`ClientSet::reset_unmarked`]. Only the reconciler mutates the set.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use cp_core::config::SshConfig;
use cp_core::ForwardError;
use cp_models::{EndpointConfig, ForwardKey};

use super::client::{ClientState, SshClient};
use super::forward::{ForwardRequest, LocalForwardRequest, RemoteForwardRequest};
use super::transport::SshConnector;

pub struct ClientSet {
    connector: Arc<dyn SshConnector>,
    ssh: SshConfig,
    cancel: CancellationToken,
    clients: HashMap<String, SshClient>,
    /// Current reconcile generation
    mark: u64,
}

impl ClientSet {
    pub fn new(connector: Arc<dyn SshConnector>, ssh: SshConfig, cancel: CancellationToken) -> Self {
        Self {
            connector,
            ssh,
            cancel,
            clients: HashMap::new(),
            mark: 0,
        }
    }

    /// Number of clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// State of the client for `endpoint_id`
    pub fn client_state(&self, endpoint_id: &str) -> Option<ClientState> {
        self.clients.get(endpoint_id).map(SshClient::state)
    }

    /// The client for `endpoint_id`
    pub fn client(&self, endpoint_id: &str) -> Option<&SshClient> {
        self.clients.get(endpoint_id)
    }

    /// Start a new generation; every client is unmarked until claimed again
    pub fn clear_all_mark(&mut self) {
        self.mark = self.mark.wrapping_add(1);
    }

    /// Create and mark a client for `endpoint_id` if there is none.
    ///
    /// An existing client is marked as well. Returns whether one was created.
    pub fn add_if_not_exist(&mut self, endpoint_id: &str, config: &EndpointConfig) -> bool {
        if let Some(client) = self.clients.get_mut(endpoint_id) {
            client.mark = self.mark;
            return false;
        }
        self.insert(endpoint_id, config);
        true
    }

    /// Replace the client for `endpoint_id` if its connection parameters
    /// differ from `config`. The old client and all its forwards are closed
    /// first. Returns whether a reset happened.
    pub async fn reset_if_changed(&mut self, endpoint_id: &str, config: &EndpointConfig) -> bool {
        let changed = self
            .clients
            .get(endpoint_id)
            .is_some_and(|client| client.config() != config);
        if !changed {
            return false;
        }
        if let Some(old) = self.clients.remove(endpoint_id) {
            tracing::info!(
                %endpoint_id,
                from = %old.config(),
                to = %config,
                "Endpoint changed, resetting SSH client"
            );
            old.close().await;
        }
        self.insert(endpoint_id, config);
        true
    }

    /// Close every client not claimed in the current generation.
    /// Returns the ids of the closed clients.
    pub async fn reset_unmarked(&mut self) -> Vec<String> {
        let stale: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, client)| client.mark != self.mark)
            .map(|(id, _)| id.clone())
            .collect();

        let closing: Vec<SshClient> = stale
            .iter()
            .filter_map(|id| self.clients.remove(id))
            .collect();
        for client in &closing {
            tracing::info!(endpoint_id = %client.endpoint_id(), "Endpoint gone, closing SSH client");
        }
        join_all(closing.into_iter().map(SshClient::close)).await;
        stale
    }

    /// Keys of every forward held by every client
    pub async fn forward_key_set(&self) -> BTreeSet<ForwardKey> {
        let mut keys = BTreeSet::new();
        for client in self.clients.values() {
            keys.extend(client.forward_keys().await);
        }
        keys
    }

    /// Open a local forward on the client for `endpoint_id`
    pub async fn local_forward(
        &self,
        endpoint_id: &str,
        req: LocalForwardRequest,
    ) -> Result<(), ForwardError> {
        self.get(endpoint_id)?
            .add_forward(ForwardRequest::Local(req))
            .await
    }

    /// Open a remote forward on the client for `endpoint_id`
    pub async fn remote_forward(
        &self,
        endpoint_id: &str,
        req: RemoteForwardRequest,
    ) -> Result<(), ForwardError> {
        self.get(endpoint_id)?
            .add_forward(ForwardRequest::Remote(req))
            .await
    }

    /// Close the forward identified by `key`; returns whether it existed
    pub async fn close_forward(&self, key: &ForwardKey) -> bool {
        match self.clients.get(&key.endpoint_id) {
            Some(client) => client.close_forward(key).await,
            None => false,
        }
    }

    /// Close every client
    pub async fn close_all(&mut self) {
        let clients: Vec<SshClient> = self.clients.drain().map(|(_, c)| c).collect();
        if !clients.is_empty() {
            tracing::info!(count = clients.len(), "Closing all SSH clients");
        }
        join_all(clients.into_iter().map(SshClient::close)).await;
    }

    fn get(&self, endpoint_id: &str) -> Result<&SshClient, ForwardError> {
        self.clients
            .get(endpoint_id)
            .ok_or_else(|| ForwardError::UnknownClient(endpoint_id.to_string()))
    }

    fn insert(&mut self, endpoint_id: &str, config: &EndpointConfig) {
        let mut client = SshClient::spawn(
            endpoint_id,
            config.clone(),
            Arc::clone(&self.connector),
            &self.ssh,
            &self.cancel,
        );
        client.mark = self.mark;
        self.clients.insert(endpoint_id.to_string(), client);
    }
}
