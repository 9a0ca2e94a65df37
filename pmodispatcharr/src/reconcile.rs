//! Diff between the exposed entities and the latest snapshot
//!
//! [`ExposedEntitySet`] remembers the last [`StreamView`] handed to the
//! entity layer for every live stream. Each call to
//! [`ExposedEntitySet::reconcile`] moves it to the new snapshot and returns
//! the minimal list of [`Action`]s that moves the host platform the same
//! way.
//!
//! # Ordering
//!
//! Removes come first, then Creates, then Updates, each group sorted by
//! ascending [`StreamIdentity`]. The optional `Count` action closes the
//! list. The output is therefore fully determined by the inputs.

use crate::models::{StreamIdentity, StreamView};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// What the entity layer must do
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create(StreamIdentity, StreamView),
    Update(StreamIdentity, StreamView),
    Remove(StreamIdentity),
    /// New value of the "total active streams" sensor
    Count(usize),
}

impl Action {
    pub fn identity(&self) -> Option<&StreamIdentity> {
        match self {
            Action::Create(id, _) | Action::Update(id, _) | Action::Remove(id) => Some(id),
            Action::Count(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Create(..) => "create",
            Action::Update(..) => "update",
            Action::Remove(_) => "remove",
            Action::Count(_) => "count",
        }
    }
}

/// When the `Count` action is emitted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountPolicy {
    /// Only when the number of streams differs from the last published one
    #[default]
    OnChange,
    /// On every successful tick
    EveryTick,
}

impl std::str::FromStr for CountPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_change" | "onchange" => Ok(CountPolicy::OnChange),
            "every_tick" | "everytick" | "always" => Ok(CountPolicy::EveryTick),
            other => Err(format!("unknown count policy '{}'", other)),
        }
    }
}

/// Per-tick counters, for logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl ReconcileSummary {
    pub fn from_actions(actions: &[Action], total: usize) -> Self {
        let mut summary = Self::default();
        for action in actions {
            match action {
                Action::Create(..) => summary.created += 1,
                Action::Update(..) => summary.updated += 1,
                Action::Remove(_) => summary.removed += 1,
                Action::Count(_) => {}
            }
        }
        summary.unchanged = total.saturating_sub(summary.created + summary.updated);
        summary
    }
}

/// Entities currently exposed to the host platform
#[derive(Debug, Clone, Default)]
pub struct ExposedEntitySet {
    views: BTreeMap<StreamIdentity, StreamView>,
    last_count: Option<usize>,
    count_policy: CountPolicy,
}

impl ExposedEntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_count_policy(count_policy: CountPolicy) -> Self {
        Self {
            count_policy,
            ..Self::default()
        }
    }

    pub fn count_policy(&self) -> CountPolicy {
        self.count_policy
    }

    pub fn set_count_policy(&mut self, policy: CountPolicy) {
        self.count_policy = policy;
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn contains(&self, id: &StreamIdentity) -> bool {
        self.views.contains_key(id)
    }

    pub fn get(&self, id: &StreamIdentity) -> Option<&StreamView> {
        self.views.get(id)
    }

    /// Exposed identities, ascending
    pub fn identities(&self) -> impl Iterator<Item = &StreamIdentity> {
        self.views.keys()
    }

    /// Last value carried by a `Count` action
    pub fn last_count(&self) -> Option<usize> {
        self.last_count
    }

    /// Moves the set to `views` and returns the actions that describe the move
    ///
    /// `views` must be the complete snapshot of the tick. When an identity
    /// shows up twice, the first view wins.
    pub fn reconcile(&mut self, views: Vec<StreamView>) -> Vec<Action> {
        let mut incoming: BTreeMap<StreamIdentity, StreamView> = BTreeMap::new();
        for view in views {
            match incoming.entry(view.identity.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(view);
                }
                Entry::Occupied(_) => {
                    warn!(identity = %view.identity, "Duplicate stream identity in snapshot, keeping the first one");
                }
            }
        }

        let mut removes = Vec::new();
        let mut creates = Vec::new();
        let mut updates = Vec::new();

        let gone: BTreeSet<StreamIdentity> = self
            .views
            .keys()
            .filter(|id| !incoming.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            self.views.remove(&id);
            removes.push(Action::Remove(id));
        }

        for (id, view) in incoming {
            match self.views.entry(id) {
                Entry::Vacant(slot) => {
                    creates.push(Action::Create(slot.key().clone(), view.clone()));
                    slot.insert(view);
                }
                Entry::Occupied(mut slot) => {
                    if *slot.get() != view {
                        updates.push(Action::Update(slot.key().clone(), view.clone()));
                        slot.insert(view);
                    }
                }
            }
        }

        let total = self.views.len();
        let mut actions = removes;
        actions.append(&mut creates);
        actions.append(&mut updates);

        let count_due = match self.count_policy {
            CountPolicy::EveryTick => true,
            CountPolicy::OnChange => self.last_count != Some(total),
        };
        if count_due {
            self.last_count = Some(total);
            actions.push(Action::Count(total));
        }

        debug!(
            total,
            actions = actions.len(),
            "Reconciled exposed entity set"
        );

        actions
    }
}
