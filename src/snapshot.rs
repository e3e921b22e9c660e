//! Schema-driven serialization of live aggregates into JSON documents.
//!
//! Every persisted field is emitted. Timestamps become ISO-8601 strings and
//! member layers are ordered by id so the same aggregate always yields the
//! same document.
use crate::resource::{Layer, Map, Resource};
use crate::types::Document;
use serde_json::{Map as JsonMap, Value, json};

pub fn serialize(resource: &Resource) -> Document {
    match resource {
        Resource::Map { map, layers } => serialize_map(map, layers),
        Resource::Layer(layer) => serialize_layer(layer),
    }
}

/// `{ "map": {...}, "layers": [...] }`
pub fn serialize_map(map: &Map, layers: &[Layer]) -> Document {
    let mut members: Vec<&Layer> = layers.iter().collect();
    members.sort_by(|a, b| a.id.cmp(&b.id));

    Document(json!({
        "map": map_fields(map),
        "layers": members.into_iter().map(layer_fields).collect::<Vec<_>>(),
    }))
}

/// `{ "layer": {...} }`
pub fn serialize_layer(layer: &Layer) -> Document {
    Document(json!({ "layer": layer_fields(layer) }))
}

pub fn map_fields(map: &Map) -> Value {
    let mut fields = JsonMap::new();
    fields.insert("id".into(), Value::String(map.id.clone()));
    fields.insert("name".into(), Value::String(map.name.clone()));
    fields.insert("version_number".into(), json!(map.version_number));
    fields.insert("author".into(), Value::String(map.author.clone()));
    fields.insert("message".into(), Value::String(map.message.clone()));
    fields.insert("created_at".into(), Value::String(map.created_at.to_iso8601()));
    fields.insert("updated_at".into(), Value::String(map.updated_at.to_iso8601()));
    Value::Object(fields)
}

pub fn layer_fields(layer: &Layer) -> Value {
    let mut fields = JsonMap::new();
    fields.insert("id".into(), Value::String(layer.id.clone()));
    fields.insert("name".into(), Value::String(layer.name.clone()));
    fields.insert("type".into(), Value::String(layer.layer_type.clone()));
    fields.insert("version_number".into(), json!(layer.version_number));
    fields.insert("author".into(), Value::String(layer.author.clone()));
    fields.insert("message".into(), Value::String(layer.message.clone()));
    fields.insert("created_at".into(), Value::String(layer.created_at.to_iso8601()));
    fields.insert("updated_at".into(), Value::String(layer.updated_at.to_iso8601()));
    Value::Object(fields)
}
