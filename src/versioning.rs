//! The single version-creation path shared by import, rollback and manual
//! version bumps: advance the counter, persist, archive, audit.
//!
//! These functions run inside a `Store::transact` closure. sled may retry
//! that closure, so callers re-read the live row from the transaction on
//! every attempt and hand an owned copy in here.
use crate::archive::ArchiveStore;
use crate::audit::{AuditAction, AuditTrail, NewAuditEntry};
use crate::diff::{ChangeSet, diff};
use crate::error::{ArchiveError, OrAbort};
use crate::ledger::VersionLedger;
use crate::resource::{Layer, Map, Versioned};
use crate::snapshot;
use crate::store::Tx;
use crate::types::{Document, ResourceKind};
use serde::Serialize;
use serde_json::json;
use sled::transaction::ConflictableTransactionResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionChange {
    pub kind: ResourceKind,
    pub id: String,
    pub new_version: u64,
    pub diff: ChangeSet,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub created: bool,
}

/// Who is acting and the note attached to the archived version. The note
/// annotates the snapshot and audit entry only; it never rewrites the
/// resource's own `message` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitContext<'a> {
    pub actor: Option<&'a str>,
    pub message: Option<&'a str>,
}

impl<'a> CommitContext<'a> {
    pub fn new(actor: Option<&'a str>, message: Option<&'a str>) -> Self {
        Self { actor, message }
    }
}

/// Advances `map` past its stored version and archives the result. `before`
/// is the live document prior to any field changes made by the caller.
pub fn commit_map_version(
    tx: &Tx<'_>,
    mut map: Map,
    before: &Document,
    ctx: &CommitContext<'_>,
) -> ConflictableTransactionResult<VersionChange, ArchiveError> {
    map.validate().or_abort()?;
    let version = VersionLedger::advance(&mut map).or_abort()?;
    tx.put_map(&map)?;

    let layers = tx.map_layers(&map.id)?;
    let after = snapshot::serialize_map(&map, &layers);
    let changes = diff(before.as_value(), after.as_value());
    let note = ctx.message.unwrap_or(map.message.as_str()).to_string();

    ArchiveStore::put(tx.snapshots, &map.key(), version, after, &map.author, &note)?;
    record_version(tx, ResourceKind::Map, &map.id, version, &changes, &note, ctx)?;

    Ok(VersionChange {
        kind: ResourceKind::Map,
        id: map.id,
        new_version: version,
        diff: changes,
        created: false,
    })
}

pub fn commit_layer_version(
    tx: &Tx<'_>,
    mut layer: Layer,
    before: &Document,
    ctx: &CommitContext<'_>,
) -> ConflictableTransactionResult<VersionChange, ArchiveError> {
    layer.validate().or_abort()?;
    let version = VersionLedger::advance(&mut layer).or_abort()?;
    tx.put_layer(&layer)?;

    let after = snapshot::serialize_layer(&layer);
    let changes = diff(before.as_value(), after.as_value());
    let note = ctx.message.unwrap_or(layer.message.as_str()).to_string();

    ArchiveStore::put(tx.snapshots, &layer.key(), version, after, &layer.author, &note)?;
    record_version(tx, ResourceKind::Layer, &layer.id, version, &changes, &note, ctx)?;

    Ok(VersionChange {
        kind: ResourceKind::Layer,
        id: layer.id,
        new_version: version,
        diff: changes,
        created: false,
    })
}

/// Persists a new map at version 1 and archives it immediately, so every
/// map has a rollback target from the moment it exists.
pub fn create_map(
    tx: &Tx<'_>,
    mut map: Map,
    ctx: &CommitContext<'_>,
) -> ConflictableTransactionResult<VersionChange, ArchiveError> {
    map.version_number = 1;
    map.validate().or_abort()?;
    if tx.get_map(&map.id)?.is_some() {
        return crate::error::abort(ArchiveError::validation(format!(
            "map {} already exists",
            map.id
        )));
    }
    tx.put_map(&map)?;

    let layers = tx.map_layers(&map.id)?;
    let document = snapshot::serialize_map(&map, &layers);
    let note = ctx.message.unwrap_or(map.message.as_str()).to_string();
    ArchiveStore::put(tx.snapshots, &map.key(), 1, document, &map.author, &note)?;
    record_created(tx, ResourceKind::Map, &map.id, &note, ctx)?;

    Ok(created(ResourceKind::Map, map.id))
}

pub fn create_layer(
    tx: &Tx<'_>,
    mut layer: Layer,
    ctx: &CommitContext<'_>,
) -> ConflictableTransactionResult<VersionChange, ArchiveError> {
    layer.version_number = 1;
    layer.validate().or_abort()?;
    if tx.get_layer(&layer.id)?.is_some() {
        return crate::error::abort(ArchiveError::validation(format!(
            "layer {} already exists",
            layer.id
        )));
    }
    tx.put_layer(&layer)?;

    let document = snapshot::serialize_layer(&layer);
    let note = ctx.message.unwrap_or(layer.message.as_str()).to_string();
    ArchiveStore::put(tx.snapshots, &layer.key(), 1, document, &layer.author, &note)?;
    record_created(tx, ResourceKind::Layer, &layer.id, &note, ctx)?;

    Ok(created(ResourceKind::Layer, layer.id))
}

fn created(kind: ResourceKind, id: String) -> VersionChange {
    VersionChange {
        kind,
        id,
        new_version: 1,
        diff: ChangeSet::default(),
        created: true,
    }
}

fn record_version(
    tx: &Tx<'_>,
    kind: ResourceKind,
    id: &str,
    version: u64,
    changes: &ChangeSet,
    note: &str,
    ctx: &CommitContext<'_>,
) -> ConflictableTransactionResult<u64, ArchiveError> {
    let entry = NewAuditEntry::new(
        AuditAction::Version,
        kind.as_str(),
        id,
        json!({
            "diff": changes,
            "new_version": version,
            "message": note,
        }),
    )
    .by(ctx.actor);
    AuditTrail::record_in(tx.audit, &entry)
}

fn record_created(
    tx: &Tx<'_>,
    kind: ResourceKind,
    id: &str,
    note: &str,
    ctx: &CommitContext<'_>,
) -> ConflictableTransactionResult<u64, ArchiveError> {
    let entry = NewAuditEntry::new(
        AuditAction::Version,
        kind.as_str(),
        id,
        json!({
            "created": true,
            "new_version": 1,
            "message": note,
        }),
    )
    .by(ctx.actor);
    AuditTrail::record_in(tx.audit, &entry)
}
