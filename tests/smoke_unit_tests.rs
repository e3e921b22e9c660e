//! Smoke Screen Unit tests for map archive components
//!
//! These test are unit tests that span the codebase, testing behavior in
//! isolation from integration scenarios. These are intended as smoke-screen
//! and generally test the happy-path.
//!
#![allow(unused_imports)]

use serde_json::{Value, json};
use std::sync::Arc;
use map_archive::{
    ArchiveService, ChangeSet, Layer, Map, Resource, ResourceKey, ResourceKind, diff,
    resource::{LayerEntry, MapEntry},
    snapshot,
    types::TimeStamp,
    utils::{canonical_json, checksum, is_valid_id, new_uuid_to_bech32},
};

fn temp_service() -> ArchiveService {
    let db = sled::Config::new().temporary(true).open().unwrap();
    ArchiveService::new(Arc::new(db)).unwrap()
}

// UTILS MODULE TESTS
#[cfg(test)]
mod utils_tests {
    use super::*;

    /// Test that new_uuid_to_bech32 generates valid bech32-encoded strings
    /// with the correct human-readable prefix
    #[test]
    fn generates_valid_bech32_with_hrp() {
        let encoded = new_uuid_to_bech32("map_").unwrap();
        assert!(encoded.starts_with("map_1"));
        assert!(is_valid_id(&encoded));
    }

    /// Test that multiple calls generate unique identifiers
    #[test]
    fn generates_unique_ids() {
        let id1 = new_uuid_to_bech32("layer_").unwrap();
        let id2 = new_uuid_to_bech32("layer_").unwrap();
        assert_ne!(id1, id2);
    }

    /// Ids end up in storage keys, so separators are refused
    #[test]
    fn id_pattern() {
        assert!(is_valid_id("Layer-01_a"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id(&"x".repeat(129)));
    }

    /// Canonical text ignores key and sequence order
    #[test]
    fn canonical_json_is_order_insensitive() {
        let a = json!({"b": [3, 1, 2], "a": {"y": 1, "x": 2}});
        let b = json!({"a": {"x": 2, "y": 1}, "b": [2, 3, 1]});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(checksum(&a), checksum(&b));
        assert_eq!(checksum(&a).len(), 64);
    }
}

// DIFF MODULE TESTS
#[cfg(test)]
mod diff_tests {
    use super::*;

    /// A renamed field shows up under values_changed with both values
    #[test]
    fn reports_changed_value() {
        let changes = diff(&json!({"map": {"name": "a"}}), &json!({"map": {"name": "b"}}));
        let change = &changes.values_changed["root['map']['name']"];
        assert_eq!(change.old_value, json!("a"));
        assert_eq!(change.new_value, json!("b"));
        assert_eq!(changes.len(), 1);
    }

    /// Added and removed keys are reported with their values
    #[test]
    fn reports_added_and_removed_keys() {
        let changes = diff(&json!({"a": 1}), &json!({"b": 2}));
        assert_eq!(changes.removed["root['a']"], json!(1));
        assert_eq!(changes.added["root['b']"], json!(2));
    }

    /// A value that changes JSON type is a type change
    #[test]
    fn reports_type_change() {
        let changes = diff(&json!({"v": 1}), &json!({"v": "1"}));
        assert!(changes.types_changed.contains_key("root['v']"));
        assert!(changes.values_changed.is_empty());
    }

    /// Reordered layer lists are not a change
    #[test]
    fn ignores_sequence_order() {
        let old = json!({"layers": [{"id": "a"}, {"id": "b"}]});
        let new = json!({"layers": [{"id": "b"}, {"id": "a"}]});
        assert!(diff(&old, &new).is_empty());
    }

    /// An empty change-set serializes to an empty object
    #[test]
    fn empty_changeset_serializes_to_empty_object() {
        assert_eq!(ChangeSet::default().to_value(), json!({}));
    }
}

// SNAPSHOT MODULE TESTS
#[cfg(test)]
mod snapshot_tests {
    use super::*;

    /// Map documents carry every field and their layers sorted by id
    #[test]
    fn map_document_shape() {
        let map = Map::new_with_id("m1").set_name("City").set_author("alice");
        let layers = vec![Layer::new_with_id("l2", "Water"), Layer::new_with_id("l1", "Power")];

        let document = snapshot::serialize(&Resource::Map { map, layers });

        let fields = document.get("map").unwrap();
        for key in ["id", "name", "version_number", "author", "message", "created_at", "updated_at"] {
            assert!(fields.get(key).is_some(), "missing {key}");
        }
        let ids: Vec<_> = document.get("layers").unwrap().as_array().unwrap().iter().map(|l| l["id"].clone()).collect();
        assert_eq!(ids, vec![json!("l1"), json!("l2")]);
    }

    /// Layer documents name the type field `type`
    #[test]
    fn layer_document_uses_type_key() {
        let document = snapshot::serialize_layer(&Layer::new_with_id("l1", "Power"));
        assert_eq!(document.get("layer").unwrap()["type"], "Power");
    }

    /// A serialized layer parses back as an allow-listed entry
    #[test]
    fn layer_document_is_a_valid_entry() {
        let layer = Layer::new_with_id("l1", "Power").set_name("Grid");
        let document = snapshot::serialize_layer(&layer);
        let entry = LayerEntry::from_value(document.get("layer").unwrap()).unwrap();

        let mut restored = Layer::new_with_id("l1", "");
        restored.apply(&entry);
        assert_eq!(restored.name, "Grid");
        assert_eq!(restored.layer_type, "Power");
    }
}

// RESOURCE MODULE TESTS
#[cfg(test)]
mod resource_tests {
    use super::*;

    /// Entries reject keys outside the allow-list
    #[test]
    fn entries_reject_unknown_keys() {
        assert!(MapEntry::from_value(&json!({"id": "m1", "owner": "x"})).is_err());
        assert!(LayerEntry::from_value(&json!({"kind": "Power"})).is_err());
    }

    /// Identity and version never come from input
    #[test]
    fn apply_skips_control_fields() {
        let mut map = Map::new_with_id("m1");
        let entry = MapEntry::from_value(&json!({"id": "other", "name": "n", "version_number": 9})).unwrap();
        map.apply(&entry);
        assert_eq!(map.id, "m1");
        assert_eq!(map.version_number, 1);
        assert_eq!(map.name, "n");
    }

    /// Authors are limited to 50 characters
    #[test]
    fn author_length_is_limited() {
        let map = Map::new_with_id("m1").set_author(&"a".repeat(51));
        assert!(map.validate().is_err());
        assert!(Map::new_with_id("m1").set_author(&"a".repeat(50)).validate().is_ok());
    }

    /// Timestamps render as RFC 3339 in UTC
    #[test]
    fn timestamps_render_in_utc() {
        let ts = TimeStamp::new_with(2024, 5, 17, 8, 30, 0);
        assert_eq!(ts.to_iso8601(), "2024-05-17T08:30:00.000000Z");
    }
}

// SERVICE TESTS
#[cfg(test)]
mod service_tests {
    use super::*;

    /// A manual bump archives the live state and audits it
    #[test]
    fn create_version_bumps_and_archives() {
        let service = temp_service();
        service.create_layer(Layer::new_with_id("l1", "Power"), None, Some("alice")).unwrap();

        let key = ResourceKey::layer("l1");
        let change = service.create_version(&key, Some("alice"), Some("checkpoint")).unwrap();

        assert_eq!(change.new_version, 2);
        let history = service.versions(&key).unwrap();
        assert_eq!(history.current_version, 2);
        assert_eq!(history.archives[0].message, "checkpoint");
        assert_eq!(service.audit_for(&key).unwrap().len(), 2);
    }

    /// Bumping a resource that does not exist fails cleanly
    #[test]
    fn create_version_of_missing_resource() {
        let service = temp_service();
        let err = service.create_version(&ResourceKey::map("m9"), None, None).unwrap_err();
        assert!(err.is_not_found());
    }

    /// Creating a resource twice is refused
    #[test]
    fn duplicate_creation_is_refused() {
        let service = temp_service();
        service.create_map(Map::new_with_id("m1"), None).unwrap();
        assert!(service.create_map(Map::new_with_id("m1"), None).is_err());
        assert_eq!(service.versions(&ResourceKey::map("m1")).unwrap().archives.len(), 1);
    }

    /// Unknown jobs are reported as not found
    #[test]
    fn unknown_job() {
        let service = temp_service();
        assert!(service.import_job("job_nope").unwrap_err().is_not_found());
    }

    /// Layer listing of an unknown map is not found
    #[test]
    fn layers_of_unknown_map() {
        let service = temp_service();
        assert!(service.map_layers("m0").unwrap_err().is_not_found());
    }
}
