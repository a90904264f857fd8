//! Identity keyed set diff shared by every resource.
//!
//! All functions are pure and compare by [`ObjectKey`]; none of them looks at
//! resource versions or other server populated metadata.

use crate::framework::{ManagedObject, ObjectKey};
use std::collections::{HashMap, HashSet};

fn keys<K: ManagedObject>(objects: &[K]) -> HashSet<ObjectKey> {
    objects.iter().map(ManagedObject::key).collect()
}

/// Desired objects that do not exist yet (`D \ C`)
pub fn create_change<K: ManagedObject>(current: &[K], desired: &[K]) -> Vec<K> {
    let existing = keys(current);
    desired
        .iter()
        .filter(|d| !existing.contains(&d.key()))
        .cloned()
        .collect()
}

/// Existing objects no longer desired (`C \ D`), e.g. removed worker nodes
pub fn delete_change_for_update<K: ManagedObject>(current: &[K], desired: &[K]) -> Vec<K> {
    let wanted = keys(desired);
    current
        .iter()
        .filter(|c| !wanted.contains(&c.key()))
        .cloned()
        .collect()
}

/// Existing objects that are part of the desired state (`C ∩ D`), torn down
/// when the custom object goes away
pub fn delete_change_for_delete<K: ManagedObject>(current: &[K], desired: &[K]) -> Vec<K> {
    let wanted = keys(desired);
    current
        .iter()
        .filter(|c| wanted.contains(&c.key()))
        .cloned()
        .collect()
}

/// Desired objects whose live counterpart carries a different payload
pub fn update_change<K: ManagedObject>(current: &[K], desired: &[K]) -> Vec<K> {
    let existing: HashMap<ObjectKey, &K> = current.iter().map(|c| (c.key(), c)).collect();
    desired
        .iter()
        .filter(|d| {
            existing
                .get(&d.key())
                .is_some_and(|c| c.is_modified(d))
        })
        .cloned()
        .collect()
}
