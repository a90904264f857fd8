//! In-memory [`ObjectStore`] answering with the same API errors as the
//! API server, plus failure injection for the retry tests.

use super::ObjectStore;
use crate::error::{api_error, Result};
use crate::framework::ManagedObject;
use async_trait::async_trait;
use kube::Resource;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Get,
    List,
    Create,
    Replace,
    Delete,
}

type Key = (String, String);

pub(crate) struct MemoryStore<K> {
    objects: Mutex<BTreeMap<Key, K>>,
    failures: Mutex<VecDeque<(Op, u16, &'static str)>>,
    calls: Mutex<Vec<(Op, String)>>,
    deletes: Mutex<Vec<(String, Option<u32>)>>,
    next_version: Mutex<u64>,
}

impl<K: ManagedObject> MemoryStore<K> {
    pub(crate) fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            next_version: Mutex::new(1),
        }
    }

    pub(crate) fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::new();
        for obj in objects {
            store.insert(obj);
        }
        store
    }

    fn key_of(obj: &K) -> Key {
        let meta = obj.meta();
        (
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    fn bump(&self, obj: &mut K) {
        let mut version = self.next_version.lock();
        obj.meta_mut().resource_version = Some(version.to_string());
        *version += 1;
    }

    /// Seeds an object, assigning a resource version
    pub(crate) fn insert(&self, mut obj: K) {
        self.bump(&mut obj);
        self.objects.lock().insert(Self::key_of(&obj), obj);
    }

    pub(crate) fn stored(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let key = (namespace.unwrap_or_default().to_string(), name.to_string());
        self.objects.lock().get(&key).cloned()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.objects.lock().keys().map(|(_, n)| n.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Makes the next `times` calls of `op` fail with the given API error
    pub(crate) fn fail_next(&self, op: Op, times: usize, code: u16, reason: &'static str) {
        let mut failures = self.failures.lock();
        for _ in 0..times {
            failures.push_back((op, code, reason));
        }
    }

    pub(crate) fn calls(&self, op: Op) -> usize {
        self.calls.lock().iter().filter(|(o, _)| *o == op).count()
    }

    pub(crate) fn deletes(&self) -> Vec<(String, Option<u32>)> {
        self.deletes.lock().clone()
    }

    fn record(&self, op: Op, name: &str) -> Result<()> {
        self.calls.lock().push((op, name.to_string()));
        let mut failures = self.failures.lock();
        if let Some(pos) = failures.iter().position(|(o, _, _)| *o == op) {
            if let Some((_, code, reason)) = failures.remove(pos) {
                return Err(api_error(code, reason, format!("injected failure for {}", name)));
            }
        }
        Ok(())
    }

    fn not_found(name: &str) -> crate::error::OperatorError {
        api_error(404, "NotFound", format!("{} \"{}\" not found", K::KIND, name))
    }
}

/// Supports `k=v`, `k!=v` and `k in (a,b)` terms joined by commas
fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let mut terms = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                terms.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&selector[start..]);

    let value = |key: &str| labels.and_then(|l| l.get(key.trim())).map(String::as_str);

    terms.iter().map(|t| t.trim()).filter(|t| !t.is_empty()).all(|term| {
        if let Some((key, set)) = term.split_once(" in ") {
            let set = set.trim().trim_start_matches('(').trim_end_matches(')');
            let allowed: Vec<&str> = set.split(',').map(str::trim).collect();
            value(key).is_some_and(|v| allowed.contains(&v))
        } else if let Some((key, expected)) = term.split_once("!=") {
            value(key) != Some(expected.trim())
        } else if let Some((key, expected)) = term.split_once('=') {
            value(key) == Some(expected.trim())
        } else {
            value(term).is_some()
        }
    })
}

#[async_trait]
impl<K: ManagedObject> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        self.record(Op::Get, name)?;
        self.stored(namespace, name)
            .ok_or_else(|| Self::not_found(name))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>> {
        self.record(Op::List, label_selector)?;
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |want| want == ns.as_str()))
            .filter(|(_, obj)| matches_selector(obj.meta().labels.as_ref(), label_selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj);
        self.record(Op::Create, &key.1)?;
        if self.objects.lock().contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", K::KIND, key.1),
            ));
        }
        let mut stored = obj.clone();
        self.bump(&mut stored);
        self.objects.lock().insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj);
        self.record(Op::Replace, &key.1)?;
        let existing_version = match self.objects.lock().get(&key) {
            Some(existing) => existing.meta().resource_version.clone(),
            None => return Err(Self::not_found(&key.1)),
        };
        if let Some(version) = obj.meta().resource_version.as_ref() {
            if Some(version) != existing_version.as_ref() {
                return Err(api_error(
                    409,
                    "Conflict",
                    "the object has been modified; please apply your changes to the latest version",
                ));
            }
        }
        let mut stored = obj.clone();
        self.bump(&mut stored);
        self.objects.lock().insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        self.record(Op::Delete, name)?;
        let key = (namespace.unwrap_or_default().to_string(), name.to_string());
        if self.objects.lock().remove(&key).is_none() {
            return Err(Self::not_found(name));
        }
        self.deletes
            .lock()
            .push((name.to_string(), grace_period_seconds));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_matching() {
        let l = labels(&[("app", "worker"), ("cluster", "al9qy")]);
        assert!(matches_selector(Some(&l), "cluster=al9qy"));
        assert!(matches_selector(Some(&l), "app in (master,worker),cluster=al9qy"));
        assert!(!matches_selector(Some(&l), "app in (master)"));
        assert!(matches_selector(Some(&l), "app!=master"));
        assert!(!matches_selector(None, "cluster=al9qy"));
        assert!(matches_selector(None, ""));
    }
}
