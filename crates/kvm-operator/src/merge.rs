//! Annotation tracked three-way merge.
//!
//! Objects written through this module carry a serialized snapshot of what
//! the operator last applied in [`LAST_APPLIED_ANNOTATION`]. On update the
//! operator computes a JSON merge patch from three inputs:
//!
//! - original: the snapshot stored on the live object
//! - modified: the newly computed desired object
//! - current: the live object
//!
//! Keys the operator removed since the snapshot are deleted, keys it changed
//! are set, and everything else on the live object (cluster IPs, resource
//! versions, fields set by other controllers) is kept.

use crate::error::{OperatorError, Result};
use crate::framework::ManagedObject;
use crate::key::LAST_APPLIED_ANNOTATION;
use crate::store::{get_optional, ObjectStore};
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Serialized form of `obj` without its own last-applied annotation
pub fn serialize_for_annotation<K: ManagedObject>(obj: &K) -> Result<String> {
    let mut snapshot = obj.clone();
    if let Some(annotations) = snapshot.meta_mut().annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
        if annotations.is_empty() {
            snapshot.meta_mut().annotations = None;
        }
    }
    Ok(serde_json::to_string(&snapshot)?)
}

/// Stamps the last-applied annotation with `serialized`
pub fn set_last_applied<K: ManagedObject>(obj: &mut K, serialized: String) {
    obj.meta_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), serialized);
}

/// Stamps the annotation with the object's own serialization
pub fn stamp_last_applied<K: ManagedObject>(obj: &mut K) -> Result<()> {
    let serialized = serialize_for_annotation(obj)?;
    set_last_applied(obj, serialized);
    Ok(())
}

pub fn last_applied<K: ManagedObject>(obj: &K) -> Option<&str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .map(String::as_str)
}

/// Whether the live object was last written from a different desired state
pub fn needs_update<K: ManagedObject>(current: &K, desired: &K) -> Result<bool> {
    let wanted = serialize_for_annotation(desired)?;
    Ok(last_applied(current) != Some(wanted.as_str()))
}

fn ensure_kind<K: ManagedObject>(snapshot: &Value) -> Result<()> {
    match snapshot.get("kind").and_then(Value::as_str) {
        Some(kind) if kind != K::KIND.to_string() => Err(OperatorError::UnknownResourceType {
            expected: K::KIND,
            actual: kind.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Keys of `current` that have to change to become `modified`
fn additions_and_changes(current: &Map<String, Value>, modified: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();
    for (key, wanted) in modified {
        match (current.get(key), wanted) {
            (Some(have), _) if have == wanted => {}
            (Some(Value::Object(have)), Value::Object(want)) => {
                let nested = additions_and_changes(have, want);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            _ => {
                patch.insert(key.clone(), wanted.clone());
            }
        }
    }
    patch
}

/// Keys of `original` the operator no longer sets, as `null`
fn deletions(original: &Map<String, Value>, modified: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();
    for (key, was) in original {
        match (modified.get(key), was) {
            (None, _) => {
                patch.insert(key.clone(), Value::Null);
            }
            (Some(Value::Object(want)), Value::Object(was)) => {
                let nested = deletions(was, want);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            _ => {}
        }
    }
    patch
}

fn merge_maps(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => merge_maps(existing, nested),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn as_object(value: &Value, what: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        other => Err(OperatorError::MergePatch(format!(
            "{} is not an object: {}",
            what, other
        ))),
    }
}

/// JSON merge patch turning `current` into `modified` while deleting only
/// keys that were present in `original`
pub fn three_way_merge_patch(original: &Value, modified: &Value, current: &Value) -> Result<Value> {
    let original = as_object(original, "original")?;
    let modified = as_object(modified, "modified")?;
    let current = as_object(current, "current")?;

    let mut patch = deletions(&original, &modified);
    merge_maps(&mut patch, additions_and_changes(&current, &modified));
    Ok(Value::Object(patch))
}

/// RFC 7386 merge patch application
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Merges `desired` into the live object `current` using the snapshot stored
/// on `current`. The result carries a refreshed snapshot.
pub fn merge_desired<K: ManagedObject>(current: &K, desired: &K) -> Result<K> {
    let modified_raw = serialize_for_annotation(desired)?;
    let modified: Value = serde_json::from_str(&modified_raw)?;
    let original = match last_applied(current) {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw)?;
            ensure_kind::<K>(&value)?;
            value
        }
        None => Value::Null,
    };
    let mut live = serde_json::to_value(current)?;

    let patch = three_way_merge_patch(&original, &modified, &live)?;
    apply_merge_patch(&mut live, &patch);

    let mut merged: K = serde_json::from_value(live)?;
    set_last_applied(&mut merged, modified_raw);
    Ok(merged)
}

/// Creates or merges every desired object
///
/// Absent objects are created with a fresh snapshot. Present objects are only
/// touched when their snapshot differs from the new desired state; they are
/// updated with the merged result, never with the raw desired object.
pub async fn reconcile_resource_state<K: ManagedObject>(
    store: &dyn ObjectStore<K>,
    desired: &[K],
) -> Result<()> {
    for wanted in desired {
        let namespace = wanted.meta().namespace.as_deref();
        let name = wanted.object_name();

        match get_optional(store, namespace, name).await? {
            None => {
                let mut obj = wanted.clone();
                stamp_last_applied(&mut obj)?;
                match store.create(&obj).await {
                    Ok(_) => info!(kind = %K::KIND, name, "Created object"),
                    Err(e) if e.is_already_exists() => {
                        debug!(kind = %K::KIND, name, "Object already exists")
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(current) => {
                if !needs_update(&current, wanted)? {
                    debug!(kind = %K::KIND, name, "Object up to date");
                    continue;
                }
                let merged = merge_desired(&current, wanted)?;
                store.replace(&merged).await?;
                info!(kind = %K::KIND, name, "Updated object from three-way merge");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn service(name: &str, port: i32) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("al9qy".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("api".to_string()),
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_annotation_round_trip() {
        let desired = service("master", 443);
        let mut stamped = desired.clone();
        stamp_last_applied(&mut stamped).unwrap();

        let decoded: Service = serde_json::from_str(last_applied(&stamped).unwrap()).unwrap();
        assert_eq!(decoded, desired);
    }

    #[test]
    fn test_snapshot_excludes_itself() {
        let mut obj = service("master", 443);
        stamp_last_applied(&mut obj).unwrap();
        let first = last_applied(&obj).unwrap().to_string();
        stamp_last_applied(&mut obj).unwrap();
        assert_eq!(last_applied(&obj), Some(first.as_str()));
        assert!(!first.contains(LAST_APPLIED_ANNOTATION));
    }

    #[test]
    fn test_needs_update() {
        let desired = service("master", 443);
        let mut current = desired.clone();
        stamp_last_applied(&mut current).unwrap();
        assert!(!needs_update(&current, &desired).unwrap());
        assert!(needs_update(&current, &service("master", 6443)).unwrap());
    }

    #[test]
    fn test_three_way_patch_keeps_foreign_fields() {
        let original = json!({"spec": {"a": 1, "b": 2}});
        let modified = json!({"spec": {"a": 1, "c": 3}});
        let current = json!({"spec": {"a": 1, "b": 2, "clusterIP": "10.0.0.1"}});

        let patch = three_way_merge_patch(&original, &modified, &current).unwrap();
        assert_eq!(patch, json!({"spec": {"b": null, "c": 3}}));

        let mut live = current.clone();
        apply_merge_patch(&mut live, &patch);
        assert_eq!(live, json!({"spec": {"a": 1, "c": 3, "clusterIP": "10.0.0.1"}}));
    }

    #[test]
    fn test_three_way_patch_reverts_drift() {
        let original = json!({"data": {"k": "v"}});
        let modified = json!({"data": {"k": "v"}});
        let current = json!({"data": {"k": "edited"}});

        let patch = three_way_merge_patch(&original, &modified, &current).unwrap();
        assert_eq!(patch, json!({"data": {"k": "v"}}));
    }

    #[test]
    fn test_merge_patch_rfc7386() {
        let mut target = json!({"a": "b", "c": {"d": "e", "f": "g"}});
        apply_merge_patch(&mut target, &json!({"a": "z", "c": {"f": null}}));
        assert_eq!(target, json!({"a": "z", "c": {"d": "e"}}));

        let mut target = json!({"a": [1, 2]});
        apply_merge_patch(&mut target, &json!({"a": [3]}));
        assert_eq!(target, json!({"a": [3]}));
    }

    #[test]
    fn test_merge_desired_preserves_cluster_ip() {
        let mut live = service("master", 443);
        stamp_last_applied(&mut live).unwrap();
        live.metadata.resource_version = Some("42".to_string());
        if let Some(spec) = live.spec.as_mut() {
            spec.cluster_ip = Some("10.96.0.12".to_string());
        }

        let merged = merge_desired(&live, &service("master", 6443)).unwrap();
        let spec = merged.spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.12"));
        assert_eq!(spec.ports.as_ref().unwrap()[0].port, 6443);
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("42"));
        assert!(!needs_update(&merged, &service("master", 6443)).unwrap());
    }

    #[test]
    fn test_snapshot_of_other_kind_is_rejected() {
        let mut live = service("master", 443);
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some("master".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        set_last_applied(&mut live, serde_json::to_string(&config_map).unwrap());

        let err = merge_desired(&live, &service("master", 443)).unwrap_err();
        assert!(matches!(err, OperatorError::UnknownResourceType { .. }));
    }

    #[tokio::test]
    async fn test_reconcile_resource_state() {
        let store = MemoryStore::<Service>::new();
        let desired = vec![service("master", 443), service("worker", 30010)];

        reconcile_resource_state(&store, &desired).await.unwrap();
        assert_eq!(store.len(), 2);
        let created = store.stored(Some("al9qy"), "master").unwrap();
        assert!(last_applied(&created).is_some());

        // someone else sets a field the operator does not own
        let mut live = created.clone();
        live.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("external".to_string(), "true".to_string());
        store.insert(live);

        let replaces_before = store.calls(crate::store::memory::Op::Replace);
        reconcile_resource_state(&store, &desired).await.unwrap();
        assert_eq!(store.calls(crate::store::memory::Op::Replace), replaces_before);

        let changed = vec![service("master", 6443)];
        reconcile_resource_state(&store, &changed).await.unwrap();
        let updated = store.stored(Some("al9qy"), "master").unwrap();
        assert_eq!(updated.spec.unwrap().ports.unwrap()[0].port, 6443);
        assert_eq!(
            updated.metadata.labels.unwrap().get("external").map(String::as_str),
            Some("true")
        );
    }
}
