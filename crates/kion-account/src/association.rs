//! Many-to-many association reconciliation
//!
//! Owners, policies, OUs, templates and labels all follow the same shape:
//! a previous set of related ids, a desired set, and a remote endpoint that
//! adds or removes members in bulk. [`diff`] computes the minimal change;
//! [`reconcile`] and [`reconcile_all`] apply it with at most one add call
//! and one remove call.

use crate::error::{AccountError, Result};
use crate::model::{Label, Labels};
use kion_client::{Remote, RemoteExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;

/// Minimal change between two snapshots of a relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationDelta<T: Ord> {
    pub to_add: BTreeSet<T>,
    pub to_remove: BTreeSet<T>,
}

impl<T: Ord + Clone> AssociationDelta<T> {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// The snapshot obtained by applying this delta to `previous`
    pub fn apply(&self, previous: &BTreeSet<T>) -> BTreeSet<T> {
        previous
            .union(&self.to_add)
            .filter(|id| !self.to_remove.contains(id))
            .cloned()
            .collect()
    }
}

/// `to_add = desired \ previous`, `to_remove = previous \ desired`
pub fn diff<T: Ord + Clone>(previous: &BTreeSet<T>, desired: &BTreeSet<T>) -> AssociationDelta<T> {
    AssociationDelta {
        to_add: desired.difference(previous).cloned().collect(),
        to_remove: previous.difference(desired).cloned().collect(),
    }
}

/// Add and remove paths of a relation collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationEndpoint {
    pub add: String,
    pub remove: String,
}

impl AssociationEndpoint {
    pub fn new(add: impl Into<String>, remove: impl Into<String>) -> Self {
        Self {
            add: add.into(),
            remove: remove.into(),
        }
    }

    /// `/v3/{kind}/{id}/association` for both directions
    pub fn associations(kind: &str, id: impl std::fmt::Display) -> Self {
        let path = format!("/v3/{}/{}/association", kind, id);
        Self::new(path.clone(), path)
    }

    /// `/v3/{kind}/{id}/owner` for both directions
    pub fn owners(kind: &str, id: impl std::fmt::Display) -> Self {
        let path = format!("/v3/{}/{}/owner", kind, id);
        Self::new(path.clone(), path)
    }
}

/// Several relations sharing one endpoint, reconciled together
///
/// Each relation becomes one array field of the request body, named after
/// the relation (`owner_user_ids`, `ou_ids`, ...).
#[derive(Debug, Clone, Default)]
pub struct AssociationChangeSet {
    relations: Vec<(String, AssociationDelta<u64>)>,
}

impl AssociationChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(
        mut self,
        name: impl Into<String>,
        previous: &BTreeSet<u64>,
        desired: &BTreeSet<u64>,
    ) -> Self {
        self.relations.push((name.into(), diff(previous, desired)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.relations.iter().all(|(_, d)| d.is_empty())
    }

    pub fn delta(&self, name: &str) -> Option<&AssociationDelta<u64>> {
        self.relations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }

    fn names(&self) -> String {
        self.relations
            .iter()
            .map(|(n, _)| n.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn body(&self, pick: impl Fn(&AssociationDelta<u64>) -> &BTreeSet<u64>) -> Option<Value> {
        if self.relations.iter().all(|(_, d)| pick(d).is_empty()) {
            return None;
        }
        let body: Map<String, Value> = self
            .relations
            .iter()
            .map(|(name, delta)| (name.clone(), json!(pick(delta))))
            .collect();
        Some(Value::Object(body))
    }
}

/// What a reconciliation did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: usize,
    pub removed: usize,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.removed > 0
    }
}

/// Reconcile one relation
pub async fn reconcile<R: Remote + ?Sized>(
    remote: &R,
    relation: &str,
    previous: &BTreeSet<u64>,
    desired: &BTreeSet<u64>,
    endpoint: &AssociationEndpoint,
) -> Result<ReconcileOutcome> {
    let changes = AssociationChangeSet::new().relation(relation, previous, desired);
    reconcile_all(remote, &changes, endpoint).await
}

/// Reconcile every relation of `changes` with one POST and one DELETE at most
pub async fn reconcile_all<R: Remote + ?Sized>(
    remote: &R,
    changes: &AssociationChangeSet,
    endpoint: &AssociationEndpoint,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();
    if changes.is_empty() {
        tracing::debug!("Associations [{}] unchanged", changes.names());
        return Ok(outcome);
    }

    if let Some(body) = changes.body(|d| &d.to_add) {
        tracing::debug!("Adding associations via POST {}: {}", endpoint.add, body);
        remote
            .post(&endpoint.add, Some(&body))
            .await
            .map_err(|source| AccountError::Association {
                relations: changes.names(),
                source,
            })?;
        outcome.added = changes.relations.iter().map(|(_, d)| d.to_add.len()).sum();
    }

    if let Some(body) = changes.body(|d| &d.to_remove) {
        tracing::debug!("Removing associations via DELETE {}: {}", endpoint.remove, body);
        remote
            .delete(&endpoint.remove, Some(&body))
            .await
            .map_err(|source| AccountError::Association {
                relations: changes.names(),
                source,
            })?;
        outcome.removed = changes
            .relations
            .iter()
            .map(|(_, d)| d.to_remove.len())
            .sum();
    }

    Ok(outcome)
}

#[derive(Debug, Serialize)]
struct LabelsBody {
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct LabelsEnvelope {
    #[serde(default)]
    data: Vec<Label>,
}

fn label_items(labels: &Labels) -> BTreeSet<Label> {
    labels
        .iter()
        .map(|(key, value)| Label::new(key, value))
        .collect()
}

/// Current labels of a resource
pub async fn read_labels<R: Remote + ?Sized>(
    remote: &R,
    resource_kind: &str,
    resource_id: impl std::fmt::Display,
) -> Result<Labels> {
    let path = format!("/v3/{}/{}/labels", resource_kind, resource_id);
    let envelope: LabelsEnvelope = remote
        .get_as(&path)
        .await
        .map_err(|source| AccountError::Association {
            relations: "labels".to_string(),
            source,
        })?;
    Ok(envelope
        .data
        .into_iter()
        .map(|label| (label.key, label.value))
        .collect())
}

/// Replace the labels of a resource when they changed
///
/// The label endpoint stores the whole set, so a change is written with a
/// single PUT of the desired labels.
pub async fn reconcile_labels<R: Remote + ?Sized>(
    remote: &R,
    resource_kind: &str,
    resource_id: impl std::fmt::Display,
    previous: &Labels,
    desired: &Labels,
) -> Result<ReconcileOutcome> {
    let desired_items = label_items(desired);
    let delta = diff(&label_items(previous), &desired_items);
    if delta.is_empty() {
        return Ok(ReconcileOutcome::default());
    }

    let path = format!("/v3/{}/{}/labels", resource_kind, resource_id);
    let body = serde_json::to_value(LabelsBody {
        labels: desired_items.into_iter().collect(),
    })
    .map_err(|e| AccountError::InvalidRecord(e.to_string()))?;

    tracing::debug!("Updating labels via PUT {}", path);
    remote
        .put(&path, &body)
        .await
        .map_err(|source| AccountError::Association {
            relations: "labels".to_string(),
            source,
        })?;

    Ok(ReconcileOutcome {
        added: delta.to_add.len(),
        removed: delta.to_remove.len(),
    })
}
