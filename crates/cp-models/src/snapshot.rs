//! Model-set container and the joined snapshot
//!
//! `ModelSets` is the mutable, unjoined state the poller carries between
//! syncs. `ModelSets::join` resolves each forward's endpoint reference and
//! produces an immutable `Snapshot` that owns copies of the entities; the
//! forward → endpoint link is expressed through the nesting, not through
//! back-references.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::endpoint::ProxyEndpoint;
use crate::forward::Forward;
use crate::model_set::{ApplyOutcome, ModelSet};

/// Unjoined endpoints and forwards as last observed
#[derive(Debug, Clone, Default)]
pub struct ModelSets {
    pub endpoints: ModelSet<ProxyEndpoint>,
    pub forwards: ModelSet<Forward>,
}

impl ModelSets {
    /// Create empty model sets
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one listing of every kind.
    pub fn apply(
        &mut self,
        endpoints: Vec<ProxyEndpoint>,
        forwards: Vec<Forward>,
        full: bool,
    ) -> ApplyOutcome {
        let mut outcome = self.endpoints.apply(endpoints, full);
        outcome.merge(self.forwards.apply(forwards, full));
        outcome
    }

    /// Watermark for the next incremental listing
    pub fn max_updated_at(&self) -> DateTime<Utc> {
        std::cmp::max(
            self.endpoints.max_updated_at(),
            self.forwards.max_updated_at(),
        )
    }

    /// Resolve forward → endpoint references into a snapshot.
    ///
    /// Forwards that name an endpoint missing from the set are left out
    /// and recorded as orphans, which marks the snapshot incorrect.
    /// Forwards with no endpoint assigned yet are skipped silently.
    pub fn join(&self) -> Snapshot {
        let mut endpoints: BTreeMap<String, JoinedEndpoint> = self
            .endpoints
            .iter()
            .map(|ep| {
                (
                    ep.id.clone(),
                    JoinedEndpoint {
                        endpoint: ep.clone(),
                        forwards: BTreeMap::new(),
                    },
                )
            })
            .collect();
        let mut orphans = Vec::new();

        for fwd in self.forwards.iter() {
            if fwd.proxy_endpoint_id.is_empty() {
                continue;
            }
            match endpoints.get_mut(&fwd.proxy_endpoint_id) {
                Some(joined) => {
                    joined.forwards.insert(fwd.id.clone(), fwd.clone());
                }
                None => {
                    tracing::warn!(
                        forward_id = %fwd.id,
                        endpoint_id = %fwd.proxy_endpoint_id,
                        "Forward references a proxy endpoint that is not present"
                    );
                    orphans.push(fwd.id.clone());
                }
            }
        }

        Snapshot { endpoints, orphans }
    }
}

/// An endpoint together with the forwards that resolved to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedEndpoint {
    pub endpoint: ProxyEndpoint,
    /// Forwards keyed by forward id
    pub forwards: BTreeMap<String, Forward>,
}

/// Immutable joined view of endpoints and forwards at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    endpoints: BTreeMap<String, JoinedEndpoint>,
    orphans: Vec<String>,
}

impl Snapshot {
    /// Whether every forward resolved to an endpoint
    pub fn is_correct(&self) -> bool {
        self.orphans.is_empty()
    }

    /// Ids of forwards whose endpoint was missing
    pub fn orphans(&self) -> &[String] {
        &self.orphans
    }

    /// Joined endpoints in id order
    pub fn endpoints(&self) -> impl Iterator<Item = &JoinedEndpoint> {
        self.endpoints.values()
    }

    /// Look up a joined endpoint
    pub fn endpoint(&self, id: &str) -> Option<&JoinedEndpoint> {
        self.endpoints.get(id)
    }

    /// Number of endpoints
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Number of joined forwards
    pub fn forward_count(&self) -> usize {
        self.endpoints.values().map(|e| e.forwards.len()).sum()
    }

    /// `update_version` of any entity in the snapshot by id
    pub fn version_of(&self, id: &str) -> Option<i64> {
        if let Some(joined) = self.endpoints.get(id) {
            return Some(joined.endpoint.update_version);
        }
        self.endpoints
            .values()
            .find_map(|e| e.forwards.get(id))
            .map(|f| f.update_version)
    }
}
