#![allow(unused_imports)]

pub mod archive;
pub mod audit;
pub mod config;
pub mod diff;
pub mod error;
pub mod import;
pub mod job;
pub mod ledger;
pub mod resource;
pub mod rollback;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod utils;
pub mod versioning;

pub use config::ArchiveConfig;
pub use diff::{ChangeSet, diff};
pub use error::{ArchiveError, Result};
pub use import::{ImportReport, ImportResults};
pub use resource::{Layer, Map, Resource};
pub use rollback::RollbackReport;
pub use service::{ArchiveService, VersionHistory};
pub use types::{ResourceKey, ResourceKind};
