//! Service layer API for archive, import and rollback operations
use crate::archive::{ArchiveStore, SnapshotMeta};
use crate::audit::{AuditAction, AuditEntry, AuditTrail, NewAuditEntry};
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result, abort};
use crate::import::{ImportPipeline, ImportReport};
use crate::job::{ImportJob, JobStore};
use crate::ledger::{DEFAULT_LOCK_STRIPES, ResourceLocks};
use crate::resource::{Layer, Map, Resource};
use crate::rollback::{RollbackEngine, RollbackReport};
use crate::snapshot;
use crate::store::Store;
use crate::types::{ResourceKey, ResourceKind, TimeStamp};
use crate::versioning::{
    CommitContext, VersionChange, commit_layer_version, commit_map_version, create_layer,
    create_map,
};
use serde::Serialize;
use serde_json::{Value, json};
use sled::Db;
use std::sync::Arc;

/// Current version plus the archived history of one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionHistory {
    pub kind: ResourceKind,
    pub id: String,
    pub current_version: u64,
    pub archives: Vec<SnapshotMeta>,
}

pub struct ArchiveService {
    store: Store,
    archive: ArchiveStore,
    audit: AuditTrail,
    jobs: JobStore,
    locks: ResourceLocks,
}

impl ArchiveService {
    pub fn new(instance: Arc<Db>) -> Result<Self> {
        Self::with_lock_stripes(instance, DEFAULT_LOCK_STRIPES)
    }

    pub fn with_lock_stripes(instance: Arc<Db>, stripes: usize) -> Result<Self> {
        let store = Store::open(instance)?;
        Ok(Self {
            archive: ArchiveStore::new(store.snapshots.clone()),
            audit: AuditTrail::new(store.audit.clone()),
            jobs: JobStore::new(store.import_jobs.clone()),
            locks: ResourceLocks::new(stripes),
            store,
        })
    }

    /// Opens the database named by `config`.
    pub fn open(config: &ArchiveConfig) -> Result<Self> {
        let db = config.open_db()?;
        Self::with_lock_stripes(Arc::new(db), config.lock_stripes)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    /// Creates a map at version 1 and archives it.
    #[tracing::instrument(skip(self, map), fields(map = %map.id))]
    pub fn create_map(&self, map: Map, actor: Option<&str>) -> Result<VersionChange> {
        let _guards = self.locks.acquire(&[&ResourceKey::map(map.id.clone())]);
        let ctx = CommitContext::new(actor, None);
        let change = self.store.transact(|tx| create_map(tx, map.clone(), &ctx))?;
        tracing::info!("map created");
        Ok(change)
    }

    /// Creates a layer at version 1, archives it, and optionally binds it to
    /// an existing map in the same unit.
    #[tracing::instrument(skip(self, layer), fields(layer = %layer.id))]
    pub fn create_layer(
        &self,
        layer: Layer,
        bind_map: Option<&str>,
        actor: Option<&str>,
    ) -> Result<VersionChange> {
        let layer_key = ResourceKey::layer(layer.id.clone());
        let map_key = bind_map.map(ResourceKey::map);
        let mut keys = vec![&layer_key];
        keys.extend(map_key.as_ref());
        let _guards = self.locks.acquire(&keys);

        let ctx = CommitContext::new(actor, None);
        let change = self.store.transact(|tx| {
            if let Some(map_id) = bind_map {
                if tx.get_map(map_id)?.is_none() {
                    return abort(ArchiveError::not_found(ResourceKind::Map, map_id));
                }
            }
            let change = create_layer(tx, layer.clone(), &ctx)?;
            if let Some(map_id) = bind_map {
                tx.bind(map_id, &layer.id)?;
            }
            Ok(change)
        })?;
        tracing::info!("layer created");
        Ok(change)
    }

    /// Manual version bump: archives the live state as a new version.
    #[tracing::instrument(skip(self, key, actor, message), fields(resource = %key))]
    pub fn create_version(
        &self,
        key: &ResourceKey,
        actor: Option<&str>,
        message: Option<&str>,
    ) -> Result<VersionChange> {
        let _guards = self.locks.acquire(&[key]);
        let ctx = CommitContext::new(actor, message);

        let change = self.store.transact(|tx| match key.kind {
            ResourceKind::Map => {
                let Some(map) = tx.get_map(&key.id)? else {
                    return abort(ArchiveError::not_found(key.kind, &key.id));
                };
                let before = snapshot::serialize_map(&map, &tx.map_layers(&key.id)?);
                commit_map_version(tx, map, &before, &ctx)
            }
            ResourceKind::Layer => {
                let Some(layer) = tx.get_layer(&key.id)? else {
                    return abort(ArchiveError::not_found(key.kind, &key.id));
                };
                let before = snapshot::serialize_layer(&layer);
                commit_layer_version(tx, layer, &before, &ctx)
            }
        })?;
        tracing::info!(version = change.new_version, "version created");
        Ok(change)
    }

    /// Runs one import. See `ImportPipeline::import`.
    #[tracing::instrument(skip(self, payload))]
    pub fn import(&self, payload: Value, actor: Option<&str>) -> Result<ImportReport> {
        ImportPipeline::new(&self.store, &self.locks, &self.jobs, &self.audit).import(payload, actor)
    }

    #[tracing::instrument(skip(self, key, actor, message), fields(resource = %key))]
    pub fn rollback(
        &self,
        key: &ResourceKey,
        version: u64,
        actor: Option<&str>,
        message: Option<&str>,
    ) -> Result<RollbackReport> {
        RollbackEngine::new(&self.store, &self.archive, &self.locks)
            .rollback(key, version, actor, message)
    }

    /// Export envelope of the live resource, or of an archived version when
    /// `version` is given. Every export is audited.
    #[tracing::instrument(skip(self, key, actor), fields(resource = %key))]
    pub fn export(&self, key: &ResourceKey, version: Option<u64>, actor: Option<&str>) -> Result<Value> {
        let exported_at = TimeStamp::new().to_iso8601();

        let (mut document, exported_version) = match version {
            Some(version) => {
                let archived = self.archive.get(key, version)?;
                (archived.document.into_value(), version)
            }
            None => {
                let live = self.store.load(key)?;
                let version = live.version_number();
                (snapshot::serialize(&live).into_value(), version)
            }
        };
        if let Value::Object(fields) = &mut document {
            fields.insert("exported_at".into(), Value::String(exported_at));
            if let Some(version) = version {
                fields.insert("archived_version".into(), json!(version));
            }
        }

        self.audit.record(
            NewAuditEntry::new(
                AuditAction::Export,
                key.kind.as_str(),
                &key.id,
                json!({
                    "version": exported_version,
                    "archived": version.is_some(),
                }),
            )
            .by(actor),
        )?;
        tracing::info!(version = exported_version, "exported");
        Ok(document)
    }

    pub fn versions(&self, key: &ResourceKey) -> Result<VersionHistory> {
        let current_version = self.store.load(key)?.version_number();
        Ok(VersionHistory {
            kind: key.kind,
            id: key.id.clone(),
            current_version,
            archives: self.archive.list(key)?,
        })
    }

    /// Live member layer documents of a map, ordered by id.
    pub fn map_layers(&self, map_id: &str) -> Result<Vec<Value>> {
        if self.store.get_map(map_id)?.is_none() {
            return Err(ArchiveError::not_found(ResourceKind::Map, map_id));
        }
        Ok(self
            .store
            .map_layers(map_id)?
            .iter()
            .map(snapshot::layer_fields)
            .collect())
    }

    pub fn load(&self, key: &ResourceKey) -> Result<Resource> {
        self.store.load(key)
    }

    pub fn import_job(&self, id: &str) -> Result<ImportJob> {
        self.jobs.get(id)
    }

    pub fn audit_log(&self) -> Result<Vec<AuditEntry>> {
        self.audit.entries()
    }

    pub fn audit_for(&self, key: &ResourceKey) -> Result<Vec<AuditEntry>> {
        self.audit.for_resource(key.kind.as_str(), &key.id)
    }

    pub fn flush(&self) -> Result<usize> {
        self.store.flush()
    }
}
