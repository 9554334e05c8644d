//! In-memory [`ObjectStore`] for unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use clustertest_common::{ObjectRef, ObjectStore, Selector, StoreError};
use kube::api::DynamicObject;
use serde_json::Value;

/// Store operation, used to inject failures and inspect calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Create,
    Patch,
    Delete,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, DynamicObject>,
    failures: HashMap<(Op, String), VecDeque<StoreError>>,
    calls: Vec<(Op, String)>,
    next_version: u64,
}

/// Object store keyed by `apiVersion/kind/namespace/name`.
///
/// Patches follow JSON merge patch semantics. Failures queued with
/// [`MemoryStore::fail`] are returned in order before the real operation
/// runs again.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn key(r: &ObjectRef) -> String {
    format!(
        "{}/{}/{}/{}",
        r.api_version,
        r.kind,
        r.namespace.as_deref().unwrap_or(""),
        r.name
    )
}

fn selector_key(s: &Selector) -> String {
    format!(
        "{}/{}/{}",
        s.api_version,
        s.kind,
        s.namespace.as_deref().unwrap_or("")
    )
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(t), Some(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

fn matches_labels(object: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = object.metadata.labels.clone().unwrap_or_default();
    selector.split(',').filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
        None => labels.contains_key(term),
    })
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without recording a call
    pub fn insert(&self, object: DynamicObject) {
        let r = ObjectRef::from_object(&object).expect("seeded object needs types and name");
        self.inner.lock().unwrap().objects.insert(key(&r), object);
    }

    pub fn with(self, object: DynamicObject) -> Self {
        self.insert(object);
        self
    }

    /// Queue an error for the next `op` against `target`
    pub fn fail(&self, op: Op, target: &ObjectRef, error: StoreError) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .entry((op, key(target)))
            .or_default()
            .push_back(error);
    }

    /// Queue an error for the next list of a kind
    pub fn fail_list(&self, selector: &Selector, error: StoreError) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .entry((Op::List, selector_key(selector)))
            .or_default()
            .push_back(error);
    }

    pub fn object(&self, target: &ObjectRef) -> Option<DynamicObject> {
        self.inner.lock().unwrap().objects.get(&key(target)).cloned()
    }

    pub fn contains(&self, target: &ObjectRef) -> bool {
        self.object(target).is_some()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .objects
            .values()
            .filter(|o| o.types.as_ref().map(|t| t.kind.as_str()) == Some(kind))
            .count()
    }

    /// Number of recorded calls of `op`
    pub fn calls(&self, op: Op) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .count()
    }

    /// Recorded calls in order, as `op key`
    pub fn call_log(&self) -> Vec<(Op, String)> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn begin(&self, op: Op, k: String) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push((op, k.clone()));
        if let Some(err) = inner.failures.get_mut(&(op, k)).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(inner)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, object: &ObjectRef) -> Result<DynamicObject, StoreError> {
        let k = key(object);
        let inner = self.begin(Op::Get, k.clone())?;
        inner
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("{} not found", object)))
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<DynamicObject>, StoreError> {
        let inner = self.begin(Op::List, selector_key(selector))?;
        Ok(inner
            .objects
            .values()
            .filter(|o| {
                o.types.as_ref().is_some_and(|t| {
                    t.api_version == selector.api_version && t.kind == selector.kind
                })
            })
            .filter(|o| selector.namespace.is_none() || o.metadata.namespace == selector.namespace)
            .filter(|o| matches_labels(o, selector.label_selector.as_deref()))
            .cloned()
            .collect())
    }

    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let r = ObjectRef::from_object(object)
            .ok_or_else(|| StoreError::api(clustertest_common::ErrorKind::Permanent, 400, "invalid object"))?;
        let k = key(&r);
        let mut inner = self.begin(Op::Create, k.clone())?;
        if inner.objects.contains_key(&k) {
            return Err(StoreError::already_exists(format!("{} already exists", r)));
        }
        inner.next_version += 1;
        let mut stored = object.clone();
        stored.metadata.resource_version = Some(inner.next_version.to_string());
        inner.objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn patch(&self, object: &ObjectRef, patch: &Value) -> Result<DynamicObject, StoreError> {
        let k = key(object);
        let mut inner = self.begin(Op::Patch, k.clone())?;
        let current = inner
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("{} not found", object)))?;
        let mut value = serde_json::to_value(&current).unwrap();
        merge_patch(&mut value, patch);
        let mut patched: DynamicObject = serde_json::from_value(value).unwrap();
        inner.next_version += 1;
        patched.metadata.resource_version = Some(inner.next_version.to_string());
        inner.objects.insert(k, patched.clone());
        Ok(patched)
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), StoreError> {
        let k = key(object);
        let mut inner = self.begin(Op::Delete, k.clone())?;
        inner
            .objects
            .remove(&k)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("{} not found", object)))
    }
}
