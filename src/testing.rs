//! Test fixtures: a small custom resource and an in-memory store that
//! behaves like the API server for merge patches

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crd::{Resource, Status};
use crate::error::api_error;
use crate::reconciler::{ObjectKey, ResourceStore};
use crate::{Result, FINALIZER};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "test.kloudlite.io",
    version = "v1",
    kind = "Probe",
    namespaced,
    status = "Status"
)]
pub(crate) struct ProbeSpec {
    #[serde(default)]
    pub image: String,
}

impl Resource for Probe {
    fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut Status {
        self.status.get_or_insert_with(Status::default)
    }

    fn ensured_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("kloudlite.io/probe".to_string(), "true".to_string())])
    }
}

pub(crate) fn probe(namespace: &str, name: &str) -> Probe {
    let mut obj = Probe::new(name, ProbeSpec::default());
    obj.metadata.namespace = Some(namespace.to_string());
    obj.metadata.generation = Some(1);
    obj
}

/// Mark an object as deleted while the core finalizer still holds it
pub(crate) fn deleting(mut obj: Probe) -> Probe {
    obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    obj.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    obj
}

/// RFC 7386 merge patch application
pub(crate) fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// In-memory [`ResourceStore`] with resourceVersion checks.
///
/// Write counters count attempts, including rejected ones.
pub(crate) struct FakeStore<K> {
    objects: Mutex<HashMap<ObjectKey, Value>>,
    next_version: AtomicU64,
    updates: AtomicUsize,
    status_updates: AtomicUsize,
    pending_conflicts: AtomicUsize,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Default for FakeStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            updates: AtomicUsize::new(0),
            status_updates: AtomicUsize::new(0),
            pending_conflicts: AtomicUsize::new(0),
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> FakeStore<K> {
    pub(crate) fn insert(&self, obj: K) {
        let key = ObjectKey::of(&obj);
        let mut value = serde_json::to_value(&obj).unwrap();
        self.stamp_version(&mut value);
        self.objects.lock().unwrap().insert(key, value);
    }

    pub(crate) fn stored(&self, key: &ObjectKey) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Simulate a concurrent writer bumping the resourceVersion
    pub(crate) fn touch(&self, key: &ObjectKey) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(value) = objects.get_mut(key) {
            self.stamp_version(value);
        }
    }

    pub(crate) fn fail_next_writes_with_conflict(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    pub(crate) fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub(crate) fn status_update_count(&self) -> usize {
        self.status_updates.load(Ordering::SeqCst)
    }

    fn stamp_version(&self, value: &mut Value) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        value["metadata"]["resourceVersion"] = Value::String(version.to_string());
    }

    fn write(&self, key: &ObjectKey, patch: &Value, subtree: Subtree) -> Result<K> {
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(api_error(409, "Conflict"));
        }

        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get_mut(key) else {
            return Err(api_error(404, "NotFound"));
        };

        let expected = &patch["metadata"]["resourceVersion"];
        if !expected.is_null() && *expected != current["metadata"]["resourceVersion"] {
            return Err(api_error(409, "Conflict"));
        }

        let mut patch = patch.clone();
        if let Value::Object(map) = &mut patch {
            match subtree {
                Subtree::Main => {
                    map.remove("status");
                }
                Subtree::Status => map.retain(|k, _| k == "status"),
            }
        }
        apply_merge_patch(current, &patch);
        self.stamp_version(current);

        let obj: K = serde_json::from_value(current.clone())?;
        let meta = obj.meta();
        let released = meta
            .finalizers
            .as_ref()
            .map_or(true, |f| f.is_empty());
        if meta.deletion_timestamp.is_some() && released {
            objects.remove(key);
        }
        Ok(obj)
    }
}

#[derive(Clone, Copy)]
enum Subtree {
    Main,
    Status,
}

#[async_trait]
impl<K: Resource> ResourceStore<K> for FakeStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        Ok(self.stored(key))
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<K> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.write(key, patch, Subtree::Main)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<K> {
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        self.write(key, patch, Subtree::Status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_nulls_remove_keys() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}});
        apply_merge_patch(&mut target, &json!({"a": null, "b": {"c": null, "e": 4}}));
        assert_eq!(target, json!({"b": {"d": 3, "e": 4}}));
    }

    #[test]
    fn merge_diff_and_apply_agree() {
        let old = json!({"checks": {"x": {"state": "Passed"}}, "isReady": true});
        let new = json!({"checks": {"y": {"state": "Waiting"}}, "isReady": false});
        let diff = crate::reconciler::merge_diff(&old, &new).unwrap();
        let mut patched = old.clone();
        apply_merge_patch(&mut patched, &diff);
        assert_eq!(patched, new);
    }
}
