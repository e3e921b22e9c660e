//! Map and Layer aggregates and their allow-listed field mappings
use crate::error::{ArchiveError, Result};
use crate::types::{ResourceKey, ResourceKind, TimeStamp};
use crate::utils::{self, is_valid_id};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

pub const MAX_AUTHOR_LEN: usize = 50;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_LAYER_TYPE_LEN: usize = 50;

/// Common access to the version counter of a resource.
pub trait Versioned {
    fn key(&self) -> ResourceKey;
    fn version_number(&self) -> u64;
    fn set_version_number(&mut self, version: u64);
    fn touch(&mut self);
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Map {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub version_number: u64,
    #[n(3)]
    pub author: String,
    #[n(4)]
    pub message: String,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub updated_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub layer_type: String,
    #[n(3)]
    pub version_number: u64,
    #[n(4)]
    pub author: String,
    #[n(5)]
    pub message: String,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
    #[n(7)]
    pub updated_at: TimeStamp<Utc>,
}

/// Tagged union over the two aggregates. A Map carries its live member layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Map { map: Map, layers: Vec<Layer> },
    Layer(Layer),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Map { .. } => ResourceKind::Map,
            Resource::Layer(_) => ResourceKind::Layer,
        }
    }
    pub fn key(&self) -> ResourceKey {
        match self {
            Resource::Map { map, .. } => map.key(),
            Resource::Layer(layer) => layer.key(),
        }
    }
    pub fn version_number(&self) -> u64 {
        match self {
            Resource::Map { map, .. } => map.version_number,
            Resource::Layer(layer) => layer.version_number,
        }
    }
}

impl Map {
    /// A fresh map at version 1 with a generated id.
    pub fn new() -> Result<Self> {
        Ok(Self::new_with_id(generate_id(ResourceKind::Map)?))
    }
    pub fn new_with_id(id: impl Into<String>) -> Self {
        let now = TimeStamp::new();
        Self {
            id: id.into(),
            name: String::new(),
            version_number: 1,
            author: String::new(),
            message: String::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
    pub fn set_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
    pub fn set_author(mut self, author: &str) -> Self {
        self.author = author.to_string();
        self
    }
    pub fn set_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    /// Copies the mutable fields present in `entry`. Identity, version and
    /// timestamps are never taken from input.
    pub fn apply(&mut self, entry: &MapEntry) {
        if let Some(name) = &entry.name {
            self.name = name.clone();
        }
        if let Some(author) = &entry.author {
            self.author = author.clone();
        }
        if let Some(message) = &entry.message {
            self.message = message.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_id(ResourceKind::Map, &self.id)?;
        check_len("map name", &self.name, MAX_NAME_LEN)?;
        check_len("map author", &self.author, MAX_AUTHOR_LEN)?;
        Ok(())
    }
}

impl Layer {
    pub fn new(layer_type: &str) -> Result<Self> {
        Ok(Self::new_with_id(generate_id(ResourceKind::Layer)?, layer_type))
    }
    pub fn new_with_id(id: impl Into<String>, layer_type: &str) -> Self {
        let now = TimeStamp::new();
        Self {
            id: id.into(),
            name: String::new(),
            layer_type: layer_type.to_string(),
            version_number: 1,
            author: String::new(),
            message: String::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
    pub fn set_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
    pub fn set_author(mut self, author: &str) -> Self {
        self.author = author.to_string();
        self
    }
    pub fn set_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn apply(&mut self, entry: &LayerEntry) {
        if let Some(name) = &entry.name {
            self.name = name.clone();
        }
        if let Some(layer_type) = &entry.layer_type {
            self.layer_type = layer_type.clone();
        }
        if let Some(author) = &entry.author {
            self.author = author.clone();
        }
        if let Some(message) = &entry.message {
            self.message = message.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_id(ResourceKind::Layer, &self.id)?;
        if self.layer_type.trim().is_empty() {
            return Err(ArchiveError::validation(format!(
                "layer {} requires a non-empty type",
                self.id
            )));
        }
        check_len("layer type", &self.layer_type, MAX_LAYER_TYPE_LEN)?;
        check_len("layer name", &self.name, MAX_NAME_LEN)?;
        check_len("layer author", &self.author, MAX_AUTHOR_LEN)?;
        Ok(())
    }
}

impl Versioned for Map {
    fn key(&self) -> ResourceKey {
        ResourceKey::map(self.id.clone())
    }
    fn version_number(&self) -> u64 {
        self.version_number
    }
    fn set_version_number(&mut self, version: u64) {
        self.version_number = version;
    }
    fn touch(&mut self) {
        self.updated_at = TimeStamp::new();
    }
}

impl Versioned for Layer {
    fn key(&self) -> ResourceKey {
        ResourceKey::layer(self.id.clone())
    }
    fn version_number(&self) -> u64 {
        self.version_number
    }
    fn set_version_number(&mut self, version: u64) {
        self.version_number = version;
    }
    fn touch(&mut self) {
        self.updated_at = TimeStamp::new();
    }
}

/// Allow-listed keys of a Map entry in an import payload or snapshot.
/// Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub version_number: Option<u64>,
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub updated_at: Option<Value>,
}

/// Allow-listed keys of a Layer entry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub layer_type: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub version_number: Option<u64>,
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub updated_at: Option<Value>,
}

impl MapEntry {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| ArchiveError::validation(format!("invalid map entry: {e}")))
    }
}

impl LayerEntry {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| ArchiveError::validation(format!("invalid layer entry: {e}")))
    }

    /// Version presented by the payload; absent means 1.
    pub fn incoming_version(&self) -> u64 {
        self.version_number.unwrap_or(1)
    }
}

/// A fresh bech32 id for a resource of `kind`.
pub fn generate_id(kind: ResourceKind) -> Result<String> {
    let hrp = match kind {
        ResourceKind::Map => "map_",
        ResourceKind::Layer => "layer_",
    };
    utils::new_uuid_to_bech32(hrp).map_err(|e| ArchiveError::Encode(e.to_string()))
}

fn check_id(kind: ResourceKind, id: &str) -> Result<()> {
    if is_valid_id(id) {
        return Ok(());
    }
    Err(ArchiveError::validation(format!("invalid {kind} id {id:?}")))
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(ArchiveError::validation(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}
