//! sled-backed rows for live resources and their memberships.
//!
//! Live state lives in three trees: `maps`, `layers` and `memberships`
//! (map id -> member layer ids). `snapshots` and `audit` belong to the
//! archive and audit trail but share the same transaction so that a
//! version advance commits or fails as one unit.
use crate::error::{ArchiveError, OrAbort, Result, abort};
use crate::resource::{Layer, Map, Resource};
use crate::types::{ResourceKey, ResourceKind};
use sled::transaction::{ConflictableTransactionResult, TransactionalTree, Transactional};
use sled::{Db, IVec, Tree};
use std::collections::BTreeSet;
use std::sync::Arc;

const MAPS: &str = "maps";
const LAYERS: &str = "layers";
const MEMBERSHIPS: &str = "memberships";
const SNAPSHOTS: &str = "snapshots";
const AUDIT: &str = "audit";
const IMPORT_JOBS: &str = "import_jobs";

/// Member layer ids of one map. Order is irrelevant; kept sorted.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    #[n(0)]
    pub layer_ids: Vec<String>,
}

impl Membership {
    pub fn from_set(ids: BTreeSet<String>) -> Self {
        Self {
            layer_ids: ids.into_iter().collect(),
        }
    }
    pub fn to_set(&self) -> BTreeSet<String> {
        self.layer_ids.iter().cloned().collect()
    }
}

#[derive(Clone)]
pub struct Store {
    instance: Arc<Db>,
    pub(crate) maps: Tree,
    pub(crate) layers: Tree,
    pub(crate) memberships: Tree,
    pub(crate) snapshots: Tree,
    pub(crate) audit: Tree,
    pub(crate) import_jobs: Tree,
}

/// Transactional view over every tree touched by a version advance.
pub struct Tx<'a> {
    pub maps: &'a TransactionalTree,
    pub layers: &'a TransactionalTree,
    pub memberships: &'a TransactionalTree,
    pub snapshots: &'a TransactionalTree,
    pub audit: &'a TransactionalTree,
}

impl Store {
    pub fn open(instance: Arc<Db>) -> Result<Self> {
        Ok(Self {
            maps: instance.open_tree(MAPS)?,
            layers: instance.open_tree(LAYERS)?,
            memberships: instance.open_tree(MEMBERSHIPS)?,
            snapshots: instance.open_tree(SNAPSHOTS)?,
            audit: instance.open_tree(AUDIT)?,
            import_jobs: instance.open_tree(IMPORT_JOBS)?,
            instance,
        })
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.instance
    }

    /// Runs `f` inside one serializable transaction over the live, snapshot
    /// and audit trees. sled may re-run `f` on conflict, so it must not have
    /// side effects outside the transaction.
    pub fn transact<A, F>(&self, f: F) -> Result<A>
    where
        F: Fn(&Tx<'_>) -> ConflictableTransactionResult<A, ArchiveError>,
    {
        let result = (
            &self.maps,
            &self.layers,
            &self.memberships,
            &self.snapshots,
            &self.audit,
        )
            .transaction(|(maps, layers, memberships, snapshots, audit)| {
                let tx = Tx {
                    maps,
                    layers,
                    memberships,
                    snapshots,
                    audit,
                };
                f(&tx)
            })?;
        Ok(result)
    }

    pub fn flush(&self) -> Result<usize> {
        Ok(self.instance.flush()?)
    }

    pub fn get_map(&self, id: &str) -> Result<Option<Map>> {
        decode_row(self.maps.get(id.as_bytes())?)
    }

    pub fn get_layer(&self, id: &str) -> Result<Option<Layer>> {
        decode_row(self.layers.get(id.as_bytes())?)
    }

    pub fn members(&self, map_id: &str) -> Result<BTreeSet<String>> {
        let membership: Option<Membership> = decode_row(self.memberships.get(map_id.as_bytes())?)?;
        Ok(membership.map(|m| m.to_set()).unwrap_or_default())
    }

    pub fn map_layers(&self, map_id: &str) -> Result<Vec<Layer>> {
        let mut layers = Vec::new();
        for layer_id in self.members(map_id)? {
            match self.get_layer(&layer_id)? {
                Some(layer) => layers.push(layer),
                None => {
                    return Err(ArchiveError::Corrupted(format!(
                        "map {map_id} references missing layer {layer_id}"
                    )));
                }
            }
        }
        Ok(layers)
    }

    /// Loads the live aggregate, including a map's member layers.
    pub fn load(&self, key: &ResourceKey) -> Result<Resource> {
        match key.kind {
            ResourceKind::Map => {
                let map = self
                    .get_map(&key.id)?
                    .ok_or_else(|| ArchiveError::not_found(key.kind, &key.id))?;
                let layers = self.map_layers(&key.id)?;
                Ok(Resource::Map { map, layers })
            }
            ResourceKind::Layer => self
                .get_layer(&key.id)?
                .map(Resource::Layer)
                .ok_or_else(|| ArchiveError::not_found(key.kind, &key.id)),
        }
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Map => self.maps.len(),
            ResourceKind::Layer => self.layers.len(),
        }
    }
}

impl Tx<'_> {
    pub fn get_map(&self, id: &str) -> ConflictableTransactionResult<Option<Map>, ArchiveError> {
        decode_row(self.maps.get(id.as_bytes())?).or_abort()
    }

    pub fn put_map(&self, map: &Map) -> ConflictableTransactionResult<(), ArchiveError> {
        self.maps.insert(map.id.as_bytes(), encode_row(map).or_abort()?)?;
        Ok(())
    }

    pub fn get_layer(&self, id: &str) -> ConflictableTransactionResult<Option<Layer>, ArchiveError> {
        decode_row(self.layers.get(id.as_bytes())?).or_abort()
    }

    pub fn put_layer(&self, layer: &Layer) -> ConflictableTransactionResult<(), ArchiveError> {
        self.layers
            .insert(layer.id.as_bytes(), encode_row(layer).or_abort()?)?;
        Ok(())
    }

    pub fn members(&self, map_id: &str) -> ConflictableTransactionResult<BTreeSet<String>, ArchiveError> {
        let membership: Option<Membership> =
            decode_row(self.memberships.get(map_id.as_bytes())?).or_abort()?;
        Ok(membership.map(|m| m.to_set()).unwrap_or_default())
    }

    /// Replaces the whole membership of a map.
    pub fn set_members(
        &self,
        map_id: &str,
        layer_ids: BTreeSet<String>,
    ) -> ConflictableTransactionResult<(), ArchiveError> {
        let row = encode_row(&Membership::from_set(layer_ids)).or_abort()?;
        self.memberships.insert(map_id.as_bytes(), row)?;
        Ok(())
    }

    /// Adds one layer to a map's membership; binding twice is a no-op.
    pub fn bind(&self, map_id: &str, layer_id: &str) -> ConflictableTransactionResult<bool, ArchiveError> {
        let mut members = self.members(map_id)?;
        if !members.insert(layer_id.to_string()) {
            return Ok(false);
        }
        self.set_members(map_id, members)?;
        Ok(true)
    }

    pub fn map_layers(&self, map_id: &str) -> ConflictableTransactionResult<Vec<Layer>, ArchiveError> {
        let mut layers = Vec::new();
        for layer_id in self.members(map_id)? {
            match self.get_layer(&layer_id)? {
                Some(layer) => layers.push(layer),
                None => {
                    return abort(ArchiveError::Corrupted(format!(
                        "map {map_id} references missing layer {layer_id}"
                    )));
                }
            }
        }
        Ok(layers)
    }
}

pub(crate) fn encode_row<T: minicbor::Encode<()>>(row: &T) -> Result<Vec<u8>> {
    minicbor::to_vec(row).map_err(|e| ArchiveError::Encode(e.to_string()))
}

pub(crate) fn decode_row<T>(bytes: Option<IVec>) -> Result<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match bytes {
        Some(bytes) => minicbor::decode(&bytes)
            .map(Some)
            .map_err(|e| ArchiveError::Decode(e.to_string())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> Store {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Store::open(Arc::new(db)).unwrap()
    }

    #[test]
    fn transaction_commits_rows_together() {
        let store = temp_store();
        let map = Map::new_with_id("m1");
        let layer = Layer::new_with_id("l1", "Power");

        store
            .transact(|tx| {
                tx.put_map(&map)?;
                tx.put_layer(&layer)?;
                tx.bind(&map.id, &layer.id)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get_map("m1").unwrap(), Some(map));
        assert_eq!(store.map_layers("m1").unwrap(), vec![layer]);
    }

    #[test]
    fn aborted_transaction_leaves_no_rows() {
        let store = temp_store();
        let map = Map::new_with_id("m1");

        let result: Result<()> = store.transact(|tx| {
            tx.put_map(&map)?;
            abort(ArchiveError::validation("stop"))
        });

        assert!(matches!(result, Err(ArchiveError::Validation(_))));
        assert_eq!(store.get_map("m1").unwrap(), None);
    }

    #[test]
    fn bind_is_idempotent() {
        let store = temp_store();
        let bound = store
            .transact(|tx| Ok((tx.bind("m1", "l1")?, tx.bind("m1", "l1")?)))
            .unwrap();
        assert_eq!(bound, (true, false));
        assert_eq!(store.members("m1").unwrap().len(), 1);
    }
}
