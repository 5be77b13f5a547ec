//! Versioned per-kind model sets
//!
//! A `ModelSet` holds the latest observed copy of every entity of one kind,
//! keyed by id. Applying a fresh listing follows the monotonic update rule:
//! an entity is only replaced by a copy with a strictly larger
//! `update_version`, and deleted or pending-deleted rows are treated as
//! absent.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};

use crate::time::pseudo_zero;

/// An entity kind listed from the control plane
pub trait Model: Clone + fmt::Debug + Send + Sync + 'static {
    /// Singular resource keyword, used to wrap single-object bodies
    const KEYWORD: &'static str;

    /// Plural resource keyword, used in URLs and list envelopes
    const KEYWORD_PLURAL: &'static str;

    /// Stable identifier
    fn id(&self) -> &str;

    /// Monotonic revision counter maintained by the control plane
    fn update_version(&self) -> i64;

    /// Last modification time
    fn updated_at(&self) -> DateTime<Utc>;

    /// Deleted or pending-deleted rows count as absent
    fn is_removed(&self) -> bool;
}

/// Counters describing what a listing changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Entities seen for the first time
    pub added: usize,
    /// Entities replaced by a newer version
    pub updated: usize,
    /// Entities dropped (deleted upstream or absent from a full listing)
    pub removed: usize,
    /// Updates ignored because they carried an older version
    pub stale: usize,
}

impl ApplyOutcome {
    /// Whether the set differs from before the listing was applied
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }

    /// Accumulate counters from another kind
    pub fn merge(&mut self, other: ApplyOutcome) {
        self.added += other.added;
        self.updated += other.updated;
        self.removed += other.removed;
        self.stale += other.stale;
    }
}

/// All live entities of one kind, keyed by id
#[derive(Debug, Clone)]
pub struct ModelSet<M> {
    items: BTreeMap<String, M>,
}

impl<M> Default for ModelSet<M> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<M: Model> ModelSet<M> {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up an entity by id
    pub fn get(&self, id: &str) -> Option<&M> {
        self.items.get(id)
    }

    /// Iterate entities in id order
    pub fn iter(&self) -> impl Iterator<Item = &M> {
        self.items.values()
    }

    /// Largest `updated_at` across the set, pseudo-zero when empty
    pub fn max_updated_at(&self) -> DateTime<Utc> {
        self.items
            .values()
            .map(Model::updated_at)
            .max()
            .unwrap_or_else(pseudo_zero)
    }

    /// Apply a listing from the control plane.
    ///
    /// With `full` set the listing is authoritative: every entity that does
    /// not appear in it is removed. Incremental listings only carry rows
    /// changed since the previous watermark, so absence means nothing.
    pub fn apply(&mut self, listing: Vec<M>, full: bool) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let mut seen: HashSet<String> = HashSet::with_capacity(listing.len());

        for incoming in listing {
            let id = incoming.id().to_string();
            seen.insert(id.clone());

            if incoming.is_removed() {
                if self.items.remove(&id).is_some() {
                    outcome.removed += 1;
                }
                continue;
            }

            match self.items.get(&id) {
                Some(current) => {
                    let (old, new) = (current.update_version(), incoming.update_version());
                    if new > old {
                        self.items.insert(id, incoming);
                        outcome.updated += 1;
                    } else if new < old {
                        tracing::warn!(
                            kind = M::KEYWORD,
                            id = %id,
                            current_version = old,
                            incoming_version = new,
                            "Dropping stale update"
                        );
                        outcome.stale += 1;
                    }
                }
                None => {
                    self.items.insert(id, incoming);
                    outcome.added += 1;
                }
            }
        }

        if full {
            let before = self.items.len();
            self.items.retain(|id, _| seen.contains(id));
            outcome.removed += before - self.items.len();
        }

        outcome
    }
}

impl<M: Model> FromIterator<M> for ModelSet<M> {
    fn from_iter<I: IntoIterator<Item = M>>(iter: I) -> Self {
        let mut set = Self::new();
        set.apply(iter.into_iter().collect(), false);
        set
    }
}
