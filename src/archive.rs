//! Write-once snapshot archive keyed by (resource, version).
use crate::error::{ArchiveError, OrAbort, Result, abort};
use crate::store::{decode_row, encode_row};
use crate::types::{Document, ResourceKey, ResourceKind, TimeStamp};
use crate::utils::checksum;
use chrono::Utc;
use serde::Serialize;
use sled::Tree;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Snapshot {
    #[n(0)]
    pub kind: ResourceKind,
    #[n(1)]
    pub resource_id: String,
    #[n(2)]
    pub version_number: u64,
    #[n(3)]
    pub document: Document,
    #[n(4)]
    pub author: String,
    #[n(5)]
    pub message: String,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
    #[n(7)]
    pub checksum: String,
}

/// Returned by `put`; identifies the archived row without its document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRef {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub version_number: u64,
    pub checksum: String,
}

/// Listing entry for the version history of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotMeta {
    pub version_number: u64,
    pub author: String,
    pub message: String,
    pub created_at: TimeStamp<Utc>,
    pub checksum: String,
}

impl Snapshot {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.resource_id.clone())
    }

    pub fn verify(&self) -> bool {
        checksum(self.document.as_value()) == self.checksum
    }

    fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            version_number: self.version_number,
            author: self.author.clone(),
            message: self.message.clone(),
            created_at: self.created_at.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ArchiveStore {
    tree: Tree,
}

impl ArchiveStore {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    /// Archives `document` as `version` of `key` inside the caller's
    /// transaction. Fails with `DuplicateVersion` if the pair already exists.
    pub fn put(
        tx: &TransactionalTree,
        key: &ResourceKey,
        version: u64,
        document: Document,
        author: &str,
        message: &str,
    ) -> ConflictableTransactionResult<SnapshotRef, ArchiveError> {
        let row_key = key.snapshot_key(version);
        if tx.get(&row_key)?.is_some() {
            return abort(ArchiveError::DuplicateVersion {
                kind: key.kind,
                id: key.id.clone(),
                version,
            });
        }

        let snapshot = Snapshot {
            kind: key.kind,
            resource_id: key.id.clone(),
            version_number: version,
            checksum: checksum(document.as_value()),
            document,
            author: author.to_string(),
            message: message.to_string(),
            created_at: TimeStamp::new(),
        };
        tx.insert(row_key, encode_row(&snapshot).or_abort()?)?;
        tracing::debug!(resource = %key, version, "archived snapshot");

        Ok(SnapshotRef {
            kind: key.kind,
            resource_id: key.id.clone(),
            version_number: version,
            checksum: snapshot.checksum,
        })
    }

    pub fn get(&self, key: &ResourceKey, version: u64) -> Result<Snapshot> {
        let snapshot: Snapshot = decode_row(self.tree.get(key.snapshot_key(version))?)?.ok_or_else(
            || ArchiveError::SnapshotNotFound {
                kind: key.kind,
                id: key.id.clone(),
                version,
            },
        )?;
        verified(snapshot)
    }

    pub fn contains(&self, key: &ResourceKey, version: u64) -> Result<bool> {
        Ok(self.tree.contains_key(key.snapshot_key(version))?)
    }

    /// Metadata of every archived version, newest first.
    pub fn list(&self, key: &ResourceKey) -> Result<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        for row in self.tree.scan_prefix(key.snapshot_prefix()).rev() {
            let (_, bytes) = row?;
            let snapshot: Snapshot = minicbor::decode(&bytes)
                .map_err(|e| ArchiveError::Decode(e.to_string()))?;
            metas.push(verified(snapshot)?.meta());
        }
        Ok(metas)
    }

    pub fn latest(&self, key: &ResourceKey) -> Result<Option<Snapshot>> {
        match self.tree.scan_prefix(key.snapshot_prefix()).next_back() {
            Some(row) => {
                let (_, bytes) = row?;
                decode_row(Some(bytes))?.map(verified).transpose()
            }
            None => Ok(None),
        }
    }
}

fn verified(snapshot: Snapshot) -> Result<Snapshot> {
    if !snapshot.verify() {
        return Err(ArchiveError::Corrupted(format!(
            "checksum mismatch for {} version {}",
            snapshot.key(),
            snapshot.version_number
        )));
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;
    use std::sync::Arc;

    fn temp_store() -> Store {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Store::open(Arc::new(db)).unwrap()
    }

    fn archive(store: &Store, key: &ResourceKey, version: u64) -> Result<SnapshotRef> {
        store.transact(|tx| {
            ArchiveStore::put(
                tx.snapshots,
                key,
                version,
                Document(json!({"v": version})),
                "tester",
                "msg",
            )
        })
    }

    #[test]
    fn put_then_get() {
        let store = temp_store();
        let archive_store = ArchiveStore::new(store.snapshots.clone());
        let key = ResourceKey::map("m1");

        archive(&store, &key, 1).unwrap();
        let snapshot = archive_store.get(&key, 1).unwrap();

        assert_eq!(snapshot.document, Document(json!({"v": 1})));
        assert_eq!(snapshot.author, "tester");
        assert!(snapshot.verify());
    }

    #[test]
    fn second_put_for_same_version_is_rejected() {
        let store = temp_store();
        let archive_store = ArchiveStore::new(store.snapshots.clone());
        let key = ResourceKey::layer("l1");

        archive(&store, &key, 1).unwrap();
        let err = archive(&store, &key, 1).unwrap_err();

        assert!(matches!(err, ArchiveError::DuplicateVersion { version: 1, .. }));
        assert_eq!(archive_store.list(&key).unwrap().len(), 1);
    }

    #[test]
    fn missing_version_is_not_found() {
        let store = temp_store();
        let archive_store = ArchiveStore::new(store.snapshots.clone());
        let err = archive_store.get(&ResourceKey::map("m1"), 3).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_is_newest_first_and_scoped() {
        let store = temp_store();
        let archive_store = ArchiveStore::new(store.snapshots.clone());
        let key = ResourceKey::map("m1");
        for version in [1, 2, 10] {
            archive(&store, &key, version).unwrap();
        }
        archive(&store, &ResourceKey::map("m10"), 1).unwrap();

        let versions: Vec<u64> = archive_store
            .list(&key)
            .unwrap()
            .iter()
            .map(|m| m.version_number)
            .collect();
        assert_eq!(versions, vec![10, 2, 1]);
        assert_eq!(archive_store.latest(&key).unwrap().unwrap().version_number, 10);
    }

    #[test]
    fn tampered_rows_fail_closed_on_every_read() {
        let store = temp_store();
        let archive_store = ArchiveStore::new(store.snapshots.clone());
        let key = ResourceKey::layer("l1");
        archive(&store, &key, 1).unwrap();

        let mut snapshot = archive_store.get(&key, 1).unwrap();
        snapshot.document = Document(json!({"v": "edited"}));
        store
            .snapshots
            .insert(key.snapshot_key(1), encode_row(&snapshot).unwrap())
            .unwrap();

        assert!(matches!(archive_store.get(&key, 1), Err(ArchiveError::Corrupted(_))));
        assert!(matches!(archive_store.list(&key), Err(ArchiveError::Corrupted(_))));
        assert!(matches!(archive_store.latest(&key), Err(ArchiveError::Corrupted(_))));
    }
}
