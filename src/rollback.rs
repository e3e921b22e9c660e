//! Restores a resource to an archived version by committing a new version
//! whose fields equal the archived ones. History only ever moves forward.
use crate::archive::{ArchiveStore, Snapshot};
use crate::audit::{AuditAction, AuditTrail, NewAuditEntry};
use crate::diff::ChangeSet;
use crate::error::{ArchiveError, Result, abort};
use crate::ledger::ResourceLocks;
use crate::resource::{Layer, LayerEntry, MapEntry};
use crate::snapshot;
use crate::store::{Store, Tx};
use crate::types::{ResourceKey, ResourceKind};
use crate::versioning::{CommitContext, VersionChange, commit_layer_version, commit_map_version, create_layer};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Value, json};
use sled::transaction::ConflictableTransactionResult;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct RollbackReport {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub rolled_to: u64,
    pub version_after_rollback: u64,
    pub diff: ChangeSet,
    /// Member layers that no longer existed and were re-created. Each resumes
    /// after its last archived version, or starts at 1 without history.
    pub recreated_layers: Vec<String>,
    /// Existing member layers whose fields differed from the snapshot. Each
    /// got a new version carrying the archived fields.
    pub restored_layers: Vec<String>,
}

// `{rolled_to, map_id, version_after_rollback, map_diff}` for maps and the
// `layer_*` equivalents for layers.
impl Serialize for RollbackReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let (id_key, diff_key) = match self.kind {
            ResourceKind::Map => ("map_id", "map_diff"),
            ResourceKind::Layer => ("layer_id", "layer_diff"),
        };
        let len = 4
            + usize::from(!self.recreated_layers.is_empty())
            + usize::from(!self.restored_layers.is_empty());
        let mut state = serializer.serialize_map(Some(len))?;
        state.serialize_entry("rolled_to", &self.rolled_to)?;
        state.serialize_entry(id_key, &self.resource_id)?;
        state.serialize_entry("version_after_rollback", &self.version_after_rollback)?;
        state.serialize_entry(diff_key, &self.diff)?;
        if !self.recreated_layers.is_empty() {
            state.serialize_entry("recreated_layers", &self.recreated_layers)?;
        }
        if !self.restored_layers.is_empty() {
            state.serialize_entry("restored_layers", &self.restored_layers)?;
        }
        state.end()
    }
}

pub struct RollbackEngine<'a> {
    store: &'a Store,
    archive: &'a ArchiveStore,
    locks: &'a ResourceLocks,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(store: &'a Store, archive: &'a ArchiveStore, locks: &'a ResourceLocks) -> Self {
        Self {
            store,
            archive,
            locks,
        }
    }

    /// Rolls `key` back to archived version `target`. Fails with
    /// `SnapshotNotFound` when that version was never archived.
    pub fn rollback(
        &self,
        key: &ResourceKey,
        target: u64,
        actor: Option<&str>,
        message: Option<&str>,
    ) -> Result<RollbackReport> {
        let archived = self.archive.get(key, target)?;
        let note = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Rollback to v{target}"));
        let ctx = CommitContext::new(actor, Some(note.as_str()));

        let report = match key.kind {
            ResourceKind::Map => self.rollback_map(key, &archived, &ctx)?,
            ResourceKind::Layer => self.rollback_layer(key, &archived, &ctx)?,
        };
        tracing::info!(
            resource = %key,
            rolled_to = target,
            version = report.version_after_rollback,
            "rollback committed"
        );
        Ok(report)
    }

    fn rollback_map(
        &self,
        key: &ResourceKey,
        archived: &Snapshot,
        ctx: &CommitContext<'_>,
    ) -> Result<RollbackReport> {
        let entry = MapEntry::from_value(snapshot_part(archived, "map")?).map_err(corrupted)?;
        let members = archived_members(archived)?;

        let layer_keys: Vec<ResourceKey> = members
            .iter()
            .map(|(id, _)| ResourceKey::layer(id.clone()))
            .collect();
        let mut keys: Vec<&ResourceKey> = vec![key];
        keys.extend(layer_keys.iter());
        let _guards = self.locks.acquire(&keys);

        let mut history = HashMap::new();
        for layer_key in &layer_keys {
            if let Some(last) = self.archive.latest(layer_key)? {
                history.insert(layer_key.id.clone(), last);
            }
        }

        let (change, recreated, restored) = self.store.transact(|tx| {
            let map = match tx.get_map(&key.id)? {
                Some(map) => map,
                None => return abort(ArchiveError::not_found(key.kind, &key.id)),
            };
            let before = snapshot::serialize_map(&map, &tx.map_layers(&key.id)?);

            let mut recreated = Vec::new();
            let mut restored = Vec::new();
            for (layer_id, layer_entry) in &members {
                if let Some(layer) = tx.get_layer(layer_id)? {
                    let mut next = layer.clone();
                    next.apply(layer_entry);
                    if !same_fields(&layer, &next) {
                        let before = snapshot::serialize_layer(&layer);
                        commit_layer_version(tx, next, &before, ctx)?;
                        restored.push(layer_id.clone());
                    }
                } else {
                    let mut layer = Layer::new_with_id(layer_id.clone(), "");
                    layer.apply(layer_entry);
                    match history.get(layer_id) {
                        // continue its own history past the last archived version
                        Some(last) => {
                            layer.version_number = last.version_number;
                            commit_layer_version(tx, layer, &last.document, ctx)?;
                        }
                        None => {
                            create_layer(tx, layer, ctx)?;
                        }
                    }
                    recreated.push(layer_id.clone());
                }
            }
            tx.set_members(&key.id, members.iter().map(|(id, _)| id.clone()).collect::<BTreeSet<_>>())?;

            let mut next = map;
            next.apply(&entry);
            let change = commit_map_version(tx, next, &before, ctx)?;
            record_rollback(tx, &change, archived.version_number, "map_diff", ctx)?;
            Ok((change, recreated, restored))
        })?;

        let mut rolled = report(change, archived.version_number, recreated);
        rolled.restored_layers = restored;
        Ok(rolled)
    }

    fn rollback_layer(
        &self,
        key: &ResourceKey,
        archived: &Snapshot,
        ctx: &CommitContext<'_>,
    ) -> Result<RollbackReport> {
        let entry = LayerEntry::from_value(snapshot_part(archived, "layer")?).map_err(corrupted)?;
        let _guards = self.locks.acquire(&[key]);

        let change = self.store.transact(|tx| {
            let layer = match tx.get_layer(&key.id)? {
                Some(layer) => layer,
                None => return abort(ArchiveError::not_found(key.kind, &key.id)),
            };
            let before = snapshot::serialize_layer(&layer);
            let mut next = layer;
            next.apply(&entry);
            let change = commit_layer_version(tx, next, &before, ctx)?;
            record_rollback(tx, &change, archived.version_number, "layer_diff", ctx)?;
            Ok(change)
        })?;

        Ok(report(change, archived.version_number, Vec::new()))
    }
}

fn report(change: VersionChange, rolled_to: u64, recreated_layers: Vec<String>) -> RollbackReport {
    RollbackReport {
        kind: change.kind,
        resource_id: change.id,
        rolled_to,
        version_after_rollback: change.new_version,
        diff: change.diff,
        recreated_layers,
        restored_layers: Vec::new(),
    }
}

fn same_fields(a: &Layer, b: &Layer) -> bool {
    a.name == b.name && a.layer_type == b.layer_type && a.author == b.author && a.message == b.message
}

fn record_rollback(
    tx: &Tx<'_>,
    change: &VersionChange,
    rolled_to: u64,
    diff_key: &str,
    ctx: &CommitContext<'_>,
) -> ConflictableTransactionResult<u64, ArchiveError> {
    let mut meta = json!({
        "rolled_to": rolled_to,
        "new_version": change.new_version,
    });
    meta[diff_key] = serde_json::to_value(&change.diff).unwrap_or(Value::Null);
    let entry = NewAuditEntry::new(AuditAction::Rollback, change.kind.as_str(), &change.id, meta)
        .by(ctx.actor);
    AuditTrail::record_in(tx.audit, &entry)
}

fn snapshot_part<'s>(archived: &'s Snapshot, part: &str) -> Result<&'s Value> {
    archived.document.get(part).ok_or_else(|| {
        ArchiveError::Corrupted(format!(
            "snapshot {} v{} has no {part:?} section",
            archived.key(),
            archived.version_number
        ))
    })
}

/// Member layers recorded in a map snapshot, keyed by id.
fn archived_members(archived: &Snapshot) -> Result<Vec<(String, LayerEntry)>> {
    let Some(layers) = archived.document.get("layers") else {
        return Ok(Vec::new());
    };
    let Value::Array(layers) = layers else {
        return Err(ArchiveError::Corrupted(format!(
            "snapshot {} v{} has a malformed layer list",
            archived.key(),
            archived.version_number
        )));
    };
    layers
        .iter()
        .map(|raw| {
            let entry = LayerEntry::from_value(raw).map_err(corrupted)?;
            let id = entry.id.clone().ok_or_else(|| {
                ArchiveError::Corrupted(format!("snapshot {} has a layer without id", archived.key()))
            })?;
            Ok((id, entry))
        })
        .collect()
}

fn corrupted(err: ArchiveError) -> ArchiveError {
    ArchiveError::Corrupted(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Map;
    use crate::versioning::create_map;
    use std::sync::Arc;

    struct Fixture {
        store: Store,
        archive: ArchiveStore,
        locks: ResourceLocks,
    }

    impl Fixture {
        fn new() -> Self {
            let db = sled::Config::new().temporary(true).open().unwrap();
            let store = Store::open(Arc::new(db)).unwrap();
            let archive = ArchiveStore::new(store.snapshots.clone());
            Self {
                store,
                archive,
                locks: ResourceLocks::default(),
            }
        }

        fn engine(&self) -> RollbackEngine<'_> {
            RollbackEngine::new(&self.store, &self.archive, &self.locks)
        }

        fn rename_layer(&self, id: &str, name: &str) {
            let ctx = CommitContext::default();
            self.store
                .transact(|tx| {
                    let layer = tx.get_layer(id)?.unwrap();
                    let before = snapshot::serialize_layer(&layer);
                    commit_layer_version(tx, layer.set_name(name), &before, &ctx)
                })
                .unwrap();
        }
    }

    #[test]
    fn layer_rollback_moves_forward() {
        let fx = Fixture::new();
        let ctx = CommitContext::default();
        fx.store
            .transact(|tx| create_layer(tx, Layer::new_with_id("l1", "Power").set_name("v1"), &ctx))
            .unwrap();
        fx.rename_layer("l1", "v2");
        fx.rename_layer("l1", "v3");

        let report = fx
            .engine()
            .rollback(&ResourceKey::layer("l1"), 1, Some("ops"), None)
            .unwrap();

        assert_eq!(report.rolled_to, 1);
        assert_eq!(report.version_after_rollback, 4);
        let live = fx.store.get_layer("l1").unwrap().unwrap();
        assert_eq!(live.name, "v1");
        assert_eq!(live.version_number, 4);
        let archived = fx.archive.get(&ResourceKey::layer("l1"), 4).unwrap();
        assert_eq!(archived.message, "Rollback to v1");
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let fx = Fixture::new();
        let ctx = CommitContext::default();
        fx.store
            .transact(|tx| create_map(tx, Map::new_with_id("m1"), &ctx))
            .unwrap();

        let err = fx
            .engine()
            .rollback(&ResourceKey::map("m1"), 9, None, None)
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(fx.store.get_map("m1").unwrap().unwrap().version_number, 1);
    }

    #[test]
    fn map_rollback_recreates_missing_layers() {
        let fx = Fixture::new();
        let ctx = CommitContext::default();
        fx.store
            .transact(|tx| {
                create_map(tx, Map::new_with_id("m1"), &ctx)?;
                create_layer(tx, Layer::new_with_id("l1", "Power"), &ctx)?;
                tx.bind("m1", "l1")?;
                let map = tx.get_map("m1")?.unwrap();
                let before = snapshot::serialize_map(&map, &[]);
                commit_map_version(tx, map, &before, &ctx)
            })
            .unwrap();
        // drop the layer out from under the map
        fx.store.layers.remove("l1").unwrap();
        fx.store.memberships.remove("m1").unwrap();

        let report = fx
            .engine()
            .rollback(&ResourceKey::map("m1"), 2, None, Some("restore"))
            .unwrap();

        assert_eq!(report.recreated_layers, vec!["l1".to_string()]);
        assert_eq!(report.version_after_rollback, 3);
        let layer = fx.store.get_layer("l1").unwrap().unwrap();
        assert_eq!(layer.layer_type, "Power");
        assert_eq!(layer.version_number, 2);
        assert!(fx.store.members("m1").unwrap().contains("l1"));
    }

    #[test]
    fn report_uses_kind_specific_keys() {
        let report = RollbackReport {
            kind: ResourceKind::Map,
            resource_id: "m1".into(),
            rolled_to: 2,
            version_after_rollback: 6,
            diff: ChangeSet::default(),
            recreated_layers: Vec::new(),
            restored_layers: vec!["l1".into()],
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["map_id"], "m1");
        assert_eq!(value["version_after_rollback"], 6);
        assert!(value.get("map_diff").is_some());
        assert!(value.get("recreated_layers").is_none());
        assert_eq!(value["restored_layers"], json!(["l1"]));
    }
}
