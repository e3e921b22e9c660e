//! Utility functions for identifiers, canonical JSON and hashing

use bech32::Bech32m;
use serde_json::Value;
use uuid7::uuid7;

const MAX_ID_LEN: usize = 128;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Ids are restricted to `[A-Za-z0-9_-]{1,128}`; they are used verbatim in
/// storage keys.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Order-insensitive canonical text for a JSON value. Object keys are sorted
/// and array elements are sorted by their own canonical text, so two values
/// that differ only in sequence order render identically.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let mut rendered: Vec<String> = items.iter().map(canonical_json).collect();
            rendered.sort();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(fields) => {
            let mut rendered: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            rendered.sort();
            format!("{{{}}}", rendered.join(","))
        }
        scalar => scalar.to_string(),
    }
}

/// SHA-256 over the canonical text of a document.
pub fn checksum(value: &Value) -> String {
    sha256::digest(canonical_json(value))
}
