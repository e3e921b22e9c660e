//! Append-only audit trail.
use crate::error::{ArchiveError, OrAbort, Result};
use crate::store::encode_row;
use crate::types::{Document, TimeStamp};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sled::Tree;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    #[n(0)]
    Export,
    #[n(1)]
    Import,
    #[n(2)]
    Version,
    #[n(3)]
    Rollback,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub actor: Option<String>,
    #[n(2)]
    pub action: AuditAction,
    #[n(3)]
    pub resource_type: String,
    #[n(4)]
    pub resource_id: String,
    #[n(5)]
    pub meta: Document,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

/// An entry before it is assigned an id.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor: Option<String>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub meta: Value,
}

impl NewAuditEntry {
    pub fn new(action: AuditAction, resource_type: &str, resource_id: &str, meta: Value) -> Self {
        Self {
            actor: None,
            action,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            meta,
        }
    }

    pub fn by(mut self, actor: Option<&str>) -> Self {
        self.actor = actor.map(str::to_string);
        self
    }

    fn into_entry(self, id: u64) -> AuditEntry {
        AuditEntry {
            id,
            actor: self.actor,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            meta: Document(self.meta),
            created_at: TimeStamp::new(),
        }
    }
}

#[derive(Clone)]
pub struct AuditTrail {
    tree: Tree,
}

impl AuditTrail {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    /// Appends inside the caller's transaction, so the entry commits with the
    /// change it describes.
    pub fn record_in(
        tx: &TransactionalTree,
        entry: &NewAuditEntry,
    ) -> ConflictableTransactionResult<u64, ArchiveError> {
        let id = tx.generate_id()?;
        let row = encode_row(&entry.clone().into_entry(id)).or_abort()?;
        tx.insert(id.to_be_bytes().to_vec(), row)?;
        Ok(id)
    }

    /// Appends outside any resource transaction (import summaries, exports).
    pub fn record(&self, entry: NewAuditEntry) -> Result<u64> {
        let id = self
            .tree
            .transaction(|tx| AuditTrail::record_in(tx, &entry))?;
        Ok(id)
    }

    /// Every entry in append order.
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.tree
            .iter()
            .values()
            .map(|row| {
                let bytes = row?;
                minicbor::decode(&bytes).map_err(|e| ArchiveError::Decode(e.to_string()))
            })
            .collect()
    }

    pub fn for_resource(&self, resource_type: &str, resource_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.resource_type == resource_type && e.resource_id == resource_id)
            .collect())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
