//! Shared value types: timestamps, resource identity and stored JSON documents.
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(TimeStamp)
            .unwrap_or_else(|| TimeStamp(DateTime::from_timestamp_nanos(0)))
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// ISO-8601 rendering used in serialized documents.
    pub fn to_iso8601(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl Serialize for TimeStamp<Utc> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso8601())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// The two aggregate kinds subject to versioning.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub enum ResourceKind {
    #[n(0)]
    Map,
    #[n(1)]
    Layer,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Map => "Map",
            ResourceKind::Layer => "Layer",
        }
    }

    fn key_segment(&self) -> &'static str {
        match self {
            ResourceKind::Map => "map",
            ResourceKind::Layer => "layer",
        }
    }

    /// Parses the lowercase form used on the command line and in routes.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "map" => Some(ResourceKind::Map),
            "layer" => Some(ResourceKind::Layer),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one versioned resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
    pub fn map(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Map, id)
    }
    pub fn layer(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Layer, id)
    }

    /// Prefix shared by every snapshot of this resource. Ids never contain
    /// `/`, so prefixes of distinct resources cannot overlap.
    pub fn snapshot_prefix(&self) -> Vec<u8> {
        format!("{}/{}/", self.kind.key_segment(), self.id).into_bytes()
    }

    pub fn snapshot_key(&self, version: u64) -> Vec<u8> {
        let mut key = self.snapshot_prefix();
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// A JSON-safe structured document. Stored inside CBOR rows as JSON text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub Value);

impl Document {
    pub fn as_value(&self) -> &Value {
        &self.0
    }
    pub fn into_value(self) -> Value {
        self.0
    }
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl From<Value> for Document {
    fn from(value: Value) -> Self {
        Document(value)
    }
}

impl<C> minicbor::Encode<C> for Document {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        let text = serde_json::to_string(&self.0)
            .map_err(|err| minicbor::encode::Error::message(err.to_string()))?;
        e.str(&text)?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Document {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let text = d.str()?;

        serde_json::from_str(text)
            .map(Document)
            .map_err(|err| minicbor::decode::Error::message(err.to_string()))
    }
}
