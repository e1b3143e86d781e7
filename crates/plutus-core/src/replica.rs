//! Wraps the embedded CRDT engine with the bookkeeping this crate needs on
//! top of it: per-name container kind enforcement (the engine itself lets
//! the same root name be reused across container types without complaint),
//! and a materialized, owned change-event shape for subscribers.

use std::sync::Mutex;

use loro::event::Diff;
use loro::{ContainerID, ExportMode, LoroCounter, LoroList, LoroMap, LoroText};
use loro::{LoroDoc, Subscription, VersionVector};
use rustc_hash::FxHashMap;

use crate::error::{PlutusError, PlutusResult};
use crate::value::PlutusValue;

/// Which kind of CRDT container a root name was first created as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Map,
    List,
    Text,
    Counter,
}

impl ContainerKind {
    fn label(self) -> &'static str {
        match self {
            ContainerKind::Map => "map",
            ContainerKind::List => "list",
            ContainerKind::Text => "text",
            ContainerKind::Counter => "counter",
        }
    }
}

/// A key that changed inside one root-level map during a commit.
#[derive(Debug, Clone)]
pub struct KeyChange {
    /// The changed key.
    pub key: String,
    /// The new value, or `None` if the key was deleted.
    pub value: Option<PlutusValue>,
}

/// The changes to a single root-level map container observed in one event.
#[derive(Debug, Clone)]
pub struct NamespaceChange {
    /// The root container name (see [`crate::namespace::Namespace`]).
    pub name: String,
    /// Keys that were inserted, updated, or deleted.
    pub updates: Vec<KeyChange>,
}

/// An owned, 'static materialization of the engine's borrowed diff event,
/// restricted to root-level map changes (the only containers a
/// [`crate::namespace::Namespace`] can see).
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Free-form string naming what triggered the change (local op, import, etc).
    pub origin: String,
    /// Per-namespace key changes observed in this event.
    pub namespaces: Vec<NamespaceChange>,
}

/// A CRDT-backed replica of a swarm's shared state.
pub struct Replica {
    doc: LoroDoc,
    container_kinds: Mutex<FxHashMap<String, ContainerKind>>,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    /// A fresh, empty replica.
    pub fn new() -> Self {
        Replica {
            doc: LoroDoc::new(),
            container_kinds: Mutex::new(FxHashMap::default()),
        }
    }

    fn check_kind(&self, name: &str, kind: ContainerKind) -> PlutusResult<()> {
        let mut kinds = self.container_kinds.lock().unwrap();
        match kinds.get(name) {
            Some(existing) if *existing != kind => Err(PlutusError::Value(format!(
                "container '{name}' is already a {}, cannot reuse as a {}",
                existing.label(),
                kind.label()
            ))),
            Some(_) => Ok(()),
            None => {
                kinds.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    /// Get (creating if absent) a root-level map container.
    pub fn map(&self, name: &str) -> PlutusResult<LoroMap> {
        self.check_kind(name, ContainerKind::Map)?;
        Ok(self.doc.get_map(name))
    }

    /// Get (creating if absent) a root-level list container.
    pub fn list(&self, name: &str) -> PlutusResult<LoroList> {
        self.check_kind(name, ContainerKind::List)?;
        Ok(self.doc.get_list(name))
    }

    /// Get (creating if absent) a root-level text container.
    pub fn text(&self, name: &str) -> PlutusResult<LoroText> {
        self.check_kind(name, ContainerKind::Text)?;
        Ok(self.doc.get_text(name))
    }

    /// Get (creating if absent) a root-level counter container.
    pub fn counter(&self, name: &str) -> PlutusResult<LoroCounter> {
        self.check_kind(name, ContainerKind::Counter)?;
        Ok(self.doc.get_counter(name))
    }

    /// Finalize the current pending transaction into a committed change.
    pub fn commit(&self) {
        self.doc.commit();
    }

    /// The replica's current operation-log version vector.
    pub fn version_vector(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    /// Export a full snapshot (state + history) of this replica.
    pub fn export_snapshot(&self) -> PlutusResult<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| PlutusError::Decode(format!("failed to export snapshot: {e}")))
    }

    /// Export every update this replica has ever recorded.
    pub fn export_all_updates(&self) -> PlutusResult<Vec<u8>> {
        self.doc
            .export(ExportMode::all_updates())
            .map_err(|e| PlutusError::Decode(format!("failed to export updates: {e}")))
    }

    /// Export the updates this replica has recorded since `since`.
    pub fn export_updates_since(&self, since: &VersionVector) -> PlutusResult<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(since))
            .map_err(|e| PlutusError::Decode(format!("failed to export updates: {e}")))
    }

    /// Import a single update or snapshot blob.
    ///
    /// Importing is idempotent and commutative: applying the same bytes
    /// twice, or applying two update blobs in either order, converges to the
    /// same state.
    pub fn import_updates(&self, bytes: &[u8]) -> PlutusResult<()> {
        self.doc
            .import(bytes)
            .map(|_status| ())
            .map_err(|e| PlutusError::Decode(format!("failed to import update: {e}")))
    }

    /// Import a batch of update blobs at once.
    pub fn import_batch(&self, updates: &[Vec<u8>]) -> PlutusResult<()> {
        self.doc
            .import_batch(updates)
            .map(|_status| ())
            .map_err(|e| PlutusError::Decode(format!("failed to import update batch: {e}")))
    }

    /// Subscribe to locally produced update bytes, e.g. to forward them to a
    /// broadcaster without waiting for a full commit-diff round trip.
    ///
    /// `callback` returns whether it wants to keep receiving updates;
    /// returning `false` unsubscribes it, same as dropping the returned
    /// [`Subscription`] handle would.
    pub fn subscribe_local_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.doc
            .subscribe_local_update(Box::new(move |bytes: &Vec<u8>| callback(bytes)))
    }

    /// Subscribe to committed changes across every root-level container,
    /// materialized into an owned [`ChangeEvent`].
    pub fn subscribe_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.doc.subscribe_root(std::sync::Arc::new(move |event| {
            let mut namespaces = Vec::new();
            for container_diff in &event.events {
                let Diff::Map(map_delta) = &container_diff.diff else {
                    continue;
                };
                let ContainerID::Root { name, .. } = container_diff.target else {
                    continue;
                };
                let updates = map_delta
                    .updated
                    .iter()
                    .map(|(key, value)| KeyChange {
                        key: key.to_string(),
                        value: value
                            .as_ref()
                            .map(|v| PlutusValue::from_loro(&v.get_deep_value())),
                    })
                    .collect();
                namespaces.push(NamespaceChange {
                    name: name.to_string(),
                    updates,
                });
            }
            callback(ChangeEvent {
                origin: event.origin.to_string(),
                namespaces,
            });
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn reusing_a_name_with_a_different_kind_is_rejected() {
        let replica = Replica::new();
        replica.map("state").unwrap();
        let err = replica.list("state").unwrap_err();
        assert!(matches!(err, PlutusError::Value(_)));
    }

    #[test]
    fn reusing_a_name_with_the_same_kind_is_fine() {
        let replica = Replica::new();
        replica.map("state").unwrap();
        assert!(replica.map("state").is_ok());
    }

    #[test]
    fn import_is_idempotent() {
        let a = Replica::new();
        a.map("state").unwrap().insert("x", 1).unwrap();
        a.commit();
        let update = a.export_all_updates().unwrap();

        let b = Replica::new();
        b.import_updates(&update).unwrap();
        b.import_updates(&update).unwrap();

        let value = b.map("state").unwrap().get_deep_value();
        assert_eq!(PlutusValue::from_loro(&value), {
            let mut map = std::collections::BTreeMap::new();
            map.insert("x".to_string(), PlutusValue::Int(1));
            PlutusValue::Map(map)
        });
    }

    #[test]
    fn concurrent_updates_converge() {
        let a = Replica::new();
        let b = Replica::new();
        a.map("state").unwrap().insert("from_a", 1).unwrap();
        a.commit();
        b.map("state").unwrap().insert("from_b", 2).unwrap();
        b.commit();

        let update_from_a = a.export_all_updates().unwrap();
        let update_from_b = b.export_all_updates().unwrap();

        a.import_updates(&update_from_b).unwrap();
        b.import_updates(&update_from_a).unwrap();

        let a_value = PlutusValue::from_loro(&a.map("state").unwrap().get_deep_value());
        let b_value = PlutusValue::from_loro(&b.map("state").unwrap().get_deep_value());
        assert_eq!(a_value, b_value);
    }

    #[test]
    fn local_update_subscription_fires_on_commit() {
        let replica = Replica::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let _sub = replica.subscribe_local_update(move |_bytes| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            true
        });
        replica.map("state").unwrap().insert("x", 1).unwrap();
        replica.commit();
        assert!(fired.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn local_update_subscription_stops_after_returning_false() {
        let replica = Replica::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let _sub = replica.subscribe_local_update(move |_bytes| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            false
        });
        replica.map("state").unwrap().insert("x", 1).unwrap();
        replica.commit();
        let after_first = fired.load(Ordering::SeqCst);
        assert!(after_first > 0);

        replica.map("state").unwrap().insert("y", 2).unwrap();
        replica.commit();
        assert_eq!(fired.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn change_subscription_reports_updated_keys() {
        let replica = Replica::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = replica.subscribe_change(move |event| {
            seen_clone.lock().unwrap().push(event);
        });
        replica.map("state").unwrap().insert("x", 1).unwrap();
        replica.commit();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        let namespace = seen
            .iter()
            .flat_map(|e| e.namespaces.iter())
            .find(|n| n.name == "state")
            .expect("expected an event for the 'state' namespace");
        assert!(namespace.updates.iter().any(|u| u.key == "x"));
    }
}
