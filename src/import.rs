//! Import pipeline: validates a payload, upserts the map and its layers, and
//! records a per-item outcome for every entry.
//!
//! Each resource is its own atomic unit. A failure aborts the unit in flight
//! and stops the import; units that already committed stay committed and are
//! reported as partial results.
use crate::audit::{AuditAction, AuditTrail, NewAuditEntry};
use crate::diff::ChangeSet;
use crate::error::{ArchiveError, Result, abort};
use crate::job::{ImportJob, ImportKind, JobStatus, JobStore};
use crate::ledger::{ResourceLocks, Verdict, VersionLedger};
use crate::resource::{Layer, LayerEntry, Map, MapEntry, generate_id};
use crate::snapshot;
use crate::store::Store;
use crate::types::{ResourceKey, ResourceKind};
use crate::utils::is_valid_id;
use crate::versioning::{
    CommitContext, VersionChange, commit_layer_version, commit_map_version, create_layer,
    create_map,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// The import envelope. `kind` and `data` are required.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportRequest {
    pub kind: ImportKind,
    pub data: Value,
    #[serde(default)]
    pub bind_map: Option<String>,
    #[serde(default)]
    pub bind_layer: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ImportRequest {
    /// Envelope validation. Runs before anything is written.
    pub fn from_value(payload: &Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(ArchiveError::validation("import payload must be a JSON object"));
        }
        let request: ImportRequest = serde_json::from_value(payload.clone())
            .map_err(|e| ArchiveError::validation(format!("invalid import payload: {e}")))?;
        if !request.data.is_object() {
            return Err(ArchiveError::validation("import data must be a JSON object"));
        }
        for id in [&request.bind_map, &request.bind_layer].into_iter().flatten() {
            if !is_valid_id(id) {
                return Err(ArchiveError::validation(format!("invalid bind target {id:?}")));
            }
        }
        Ok(request)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MapImport {
    map: Value,
    #[serde(default)]
    layers: Vec<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    exported_at: Option<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    archived_version: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayerImport {
    layer: Value,
    #[serde(default)]
    #[allow(dead_code)]
    exported_at: Option<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    archived_version: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub kind: ResourceKind,
    pub id: String,
    pub reason: String,
    pub current_version: u64,
    pub incoming_version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportResults {
    pub created: Vec<ResourceRef>,
    pub updated: Vec<ResourceRef>,
    pub conflicts: Vec<ConflictRecord>,
    pub version_changes: Vec<VersionChange>,
}

impl ImportResults {
    pub fn was_updated(&self, id: &str) -> bool {
        self.updated.iter().any(|r| r.id == id)
    }
    pub fn was_created(&self, id: &str) -> bool {
        self.created.iter().any(|r| r.id == id)
    }
    pub fn has_conflict(&self, id: &str) -> bool {
        self.conflicts.iter().any(|c| c.id == id)
    }

    fn counts(&self) -> Value {
        json!({
            "created": self.created.len(),
            "updated": self.updated.len(),
            "conflicts": self.conflicts.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerDiff {
    pub layer_id: String,
    pub diff: ChangeSet,
}

/// Structured log kept on the import job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportLog {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_diff: Option<ChangeSet>,
    pub layer_diffs: Vec<LayerDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response of one import. On success the outcomes are under `results`; on
/// failure whatever committed before the failing unit is under
/// `partial_results` and `errors` says why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportReport {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<ImportResults>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_results: Option<ImportResults>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ImportReport {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }

    /// Outcomes regardless of status.
    pub fn outcomes(&self) -> Option<&ImportResults> {
        self.results.as_ref().or(self.partial_results.as_ref())
    }
}

enum LayerOutcome {
    Created(VersionChange),
    Updated(VersionChange),
    Conflict(ConflictRecord),
}

pub struct ImportPipeline<'a> {
    store: &'a Store,
    locks: &'a ResourceLocks,
    jobs: &'a JobStore,
    audit: &'a AuditTrail,
}

impl<'a> ImportPipeline<'a> {
    pub fn new(
        store: &'a Store,
        locks: &'a ResourceLocks,
        jobs: &'a JobStore,
        audit: &'a AuditTrail,
    ) -> Self {
        Self {
            store,
            locks,
            jobs,
            audit,
        }
    }

    /// Runs one import. Envelope errors are returned as `Err` before any
    /// write; everything after the job row exists is reported in the
    /// `ImportReport` instead.
    pub fn import(&self, payload: Value, actor: Option<&str>) -> Result<ImportReport> {
        let request = ImportRequest::from_value(&payload)?;
        let mut job = self.jobs.create(
            request.kind,
            payload,
            actor,
            request.bind_map.as_deref(),
            request.bind_layer.as_deref(),
        )?;
        tracing::debug!(job = %job.id, kind = request.kind.as_str(), "import job created");

        let ctx = CommitContext::new(actor, request.message.as_deref());
        let mut results = ImportResults::default();
        let mut log = ImportLog::default();

        let outcome = match request.kind {
            ImportKind::Map => self.import_map(&request, &ctx, &mut results, &mut log),
            ImportKind::Layer => self.import_single_layer(&request, &ctx, &mut results, &mut log),
        };

        match outcome {
            Ok(()) => self.succeed(&mut job, actor, results, log),
            Err(err) => self.fail(&mut job, actor, results, log, err),
        }
    }

    fn succeed(
        &self,
        job: &mut ImportJob,
        actor: Option<&str>,
        results: ImportResults,
        log: ImportLog,
    ) -> Result<ImportReport> {
        let log_value = serde_json::to_value(&log)?;
        self.jobs.finish(job, JobStatus::Success, log_value.clone())?;
        self.audit.record(
            NewAuditEntry::new(
                AuditAction::Import,
                job.kind.as_str(),
                &job.id,
                json!({
                    "results": results,
                    "counts": results.counts(),
                    "logs": log_value,
                }),
            )
            .by(actor),
        )?;
        tracing::info!(
            job = %job.id,
            created = results.created.len(),
            updated = results.updated.len(),
            conflicts = results.conflicts.len(),
            "import succeeded"
        );

        Ok(ImportReport {
            job_id: job.id.clone(),
            status: JobStatus::Success,
            results: Some(results),
            partial_results: None,
            errors: Vec::new(),
        })
    }

    fn fail(
        &self,
        job: &mut ImportJob,
        actor: Option<&str>,
        results: ImportResults,
        mut log: ImportLog,
        err: ArchiveError,
    ) -> Result<ImportReport> {
        let message = err.to_string();
        tracing::warn!(job = %job.id, error = %message, "import failed");

        log.error = Some(message.clone());
        self.jobs
            .finish(job, JobStatus::Failed, serde_json::to_value(&log)?)?;
        self.audit.record(
            NewAuditEntry::new(
                AuditAction::Import,
                job.kind.as_str(),
                &job.id,
                json!({
                    "error": message,
                    "partial_results": results,
                }),
            )
            .by(actor),
        )?;

        Ok(ImportReport {
            job_id: job.id.clone(),
            status: JobStatus::Failed,
            results: None,
            partial_results: Some(results),
            errors: vec![message],
        })
    }

    fn import_map(
        &self,
        request: &ImportRequest,
        ctx: &CommitContext<'_>,
        results: &mut ImportResults,
        log: &mut ImportLog,
    ) -> Result<()> {
        let data: MapImport = serde_json::from_value(request.data.clone())
            .map_err(|e| ArchiveError::validation(format!("MAP import data: {e}")))?;
        let entry = MapEntry::from_value(&data.map)?;
        let map_id = resolve_id(ResourceKind::Map, entry.id.as_deref())?;
        // every entry is parsed and every id resolved before the first write
        let layers = data
            .layers
            .iter()
            .map(prepare_layer)
            .collect::<Result<Vec<_>>>()?;

        let change = self.upsert_map(&map_id, &entry, ctx)?;
        let reference = ResourceRef {
            kind: ResourceKind::Map,
            id: map_id.clone(),
        };
        if change.created {
            results.created.push(reference);
        } else {
            log.map_diff = Some(change.diff.clone());
            results.updated.push(reference);
        }
        results.version_changes.push(change);

        for (layer_id, entry) in &layers {
            self.import_layer(layer_id, entry, Some(map_id.as_str()), ctx, results, log)?;
        }
        Ok(())
    }

    fn import_single_layer(
        &self,
        request: &ImportRequest,
        ctx: &CommitContext<'_>,
        results: &mut ImportResults,
        log: &mut ImportLog,
    ) -> Result<()> {
        let data: LayerImport = serde_json::from_value(request.data.clone())
            .map_err(|e| ArchiveError::validation(format!("LAYER import data: {e}")))?;
        let (layer_id, entry) = prepare_layer(&data.layer)?;
        self.import_layer(&layer_id, &entry, request.bind_map.as_deref(), ctx, results, log)
    }

    fn upsert_map(
        &self,
        map_id: &str,
        entry: &MapEntry,
        ctx: &CommitContext<'_>,
    ) -> Result<VersionChange> {
        let key = ResourceKey::map(map_id);
        let _guards = self.locks.acquire(&[&key]);

        self.store.transact(|tx| match tx.get_map(map_id)? {
            Some(map) => {
                let layers = tx.map_layers(map_id)?;
                let before = snapshot::serialize_map(&map, &layers);
                let mut next = map;
                next.apply(entry);
                commit_map_version(tx, next, &before, ctx)
            }
            None => {
                let mut map = Map::new_with_id(map_id);
                map.apply(entry);
                create_map(tx, map, ctx)
            }
        })
    }

    /// One layer entry as its own atomic unit. Created and accepted layers
    /// are bound to `bind_map`; a conflicting layer is left untouched.
    fn import_layer(
        &self,
        layer_id: &str,
        entry: &LayerEntry,
        bind_map: Option<&str>,
        ctx: &CommitContext<'_>,
        results: &mut ImportResults,
        log: &mut ImportLog,
    ) -> Result<()> {
        let layer_key = ResourceKey::layer(layer_id);
        let map_key = bind_map.map(ResourceKey::map);
        let mut keys = vec![&layer_key];
        keys.extend(map_key.as_ref());
        let _guards = self.locks.acquire(&keys);

        let incoming = entry.incoming_version();
        let outcome = self.store.transact(|tx| {
            if let Some(map_id) = bind_map {
                if tx.get_map(map_id)?.is_none() {
                    return abort(ArchiveError::not_found(ResourceKind::Map, map_id));
                }
            }

            match tx.get_layer(layer_id)? {
                Some(layer) => match VersionLedger::accept_incoming(&layer, incoming) {
                    Verdict::Conflict { current, incoming } => {
                        Ok(LayerOutcome::Conflict(ConflictRecord {
                            kind: ResourceKind::Layer,
                            id: layer_id.to_string(),
                            reason: "incoming version not newer".to_string(),
                            current_version: current,
                            incoming_version: incoming,
                        }))
                    }
                    Verdict::Accept => {
                        let before = snapshot::serialize_layer(&layer);
                        let mut next = layer;
                        next.apply(entry);
                        let change = commit_layer_version(tx, next, &before, ctx)?;
                        if let Some(map_id) = bind_map {
                            tx.bind(map_id, layer_id)?;
                        }
                        Ok(LayerOutcome::Updated(change))
                    }
                },
                None => {
                    let mut layer = Layer::new_with_id(layer_id, "");
                    layer.apply(entry);
                    let change = create_layer(tx, layer, ctx)?;
                    if let Some(map_id) = bind_map {
                        tx.bind(map_id, layer_id)?;
                    }
                    Ok(LayerOutcome::Created(change))
                }
            }
        })?;

        let reference = ResourceRef {
            kind: ResourceKind::Layer,
            id: layer_id.to_string(),
        };
        match outcome {
            LayerOutcome::Created(change) => {
                results.created.push(reference);
                results.version_changes.push(change);
            }
            LayerOutcome::Updated(change) => {
                log.layer_diffs.push(LayerDiff {
                    layer_id: layer_id.to_string(),
                    diff: change.diff.clone(),
                });
                results.updated.push(reference);
                results.version_changes.push(change);
            }
            LayerOutcome::Conflict(conflict) => {
                tracing::warn!(
                    layer = %conflict.id,
                    current = conflict.current_version,
                    incoming = conflict.incoming_version,
                    "import conflict"
                );
                results.conflicts.push(conflict);
            }
        }
        Ok(())
    }
}

/// Parses one raw layer entry and settles its id without touching storage.
fn prepare_layer(raw: &Value) -> Result<(String, LayerEntry)> {
    let entry = LayerEntry::from_value(raw)?;
    let layer_id = resolve_id(ResourceKind::Layer, entry.id.as_deref())?;
    Ok((layer_id, entry))
}

fn resolve_id(kind: ResourceKind, id: Option<&str>) -> Result<String> {
    match id {
        Some(id) if is_valid_id(id) => Ok(id.to_string()),
        Some(id) => Err(ArchiveError::validation(format!("invalid {kind} id {id:?}"))),
        None => generate_id(kind),
    }
}
