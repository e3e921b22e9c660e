//! Import job records: one row per import invocation.
use crate::error::{ArchiveError, Result};
use crate::store::{decode_row, encode_row};
use crate::types::{Document, TimeStamp};
use crate::utils;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sled::Tree;

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImportKind {
    #[n(0)]
    Map,
    #[n(1)]
    Layer,
}

impl ImportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKind::Map => "MAP",
            ImportKind::Layer => "LAYER",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Success,
    #[n(2)]
    Failed,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
pub struct ImportJob {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub kind: ImportKind,
    #[n(2)]
    pub payload: Document,
    #[n(3)]
    pub status: JobStatus,
    #[n(4)]
    pub log: Document,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub actor: Option<String>,
    #[n(8)]
    pub target_map: Option<String>,
    #[n(9)]
    pub target_layer: Option<String>,
}

#[derive(Clone)]
pub struct JobStore {
    tree: Tree,
}

impl JobStore {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    /// Records a new PENDING job holding the raw payload.
    pub fn create(
        &self,
        kind: ImportKind,
        payload: Value,
        actor: Option<&str>,
        target_map: Option<&str>,
        target_layer: Option<&str>,
    ) -> Result<ImportJob> {
        let id = utils::new_uuid_to_bech32("job_").map_err(|e| ArchiveError::Encode(e.to_string()))?;
        let job = ImportJob {
            id,
            kind,
            payload: Document(payload),
            status: JobStatus::Pending,
            log: Document(json!({})),
            created_at: TimeStamp::new(),
            completed_at: None,
            actor: actor.map(str::to_string),
            target_map: target_map.map(str::to_string),
            target_layer: target_layer.map(str::to_string),
        };
        self.tree.insert(job.id.as_bytes(), encode_row(&job)?)?;
        Ok(job)
    }

    /// Sets the terminal status, completion time and log of a job.
    pub fn finish(&self, job: &mut ImportJob, status: JobStatus, log: Value) -> Result<()> {
        job.status = status;
        job.completed_at = Some(TimeStamp::new());
        job.log = Document(log);
        self.tree.insert(job.id.as_bytes(), encode_row(job)?)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<ImportJob> {
        decode_row(self.tree.get(id.as_bytes())?)?.ok_or_else(|| ArchiveError::JobNotFound(id.to_string()))
    }
}
