//! Persistence seam between a reconcile cycle and the API server
//!
//! Writes are JSON merge patches carrying `metadata.resourceVersion`, so the
//! API server rejects them with 409 when the object changed underneath us.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{Map, Value};

use crate::crd::Resource;
use crate::{Result, FIELD_MANAGER};

/// Namespace and name of an object
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone().filter(|ns| !ns.is_empty()),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Typed access to the reconciled objects
#[async_trait]
pub trait ResourceStore<K: Resource>: Send + Sync {
    /// Fetch the object, `None` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// Merge patch the main resource (metadata and spec)
    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<K>;

    /// Merge patch the status subresource
    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<K>;
}

/// [`ResourceStore`] backed by the API server
pub struct KubeResourceStore<K> {
    client: Client,
    resource: ApiResource,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Resource> KubeResourceStore<K> {
    /// Create a store for `K`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resource: ApiResource::erase::<K>(&()),
            _kind: PhantomData,
        }
    }

    fn api(&self, key: &ObjectKey) -> Api<DynamicObject> {
        match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }

    fn params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl<K: Resource> ResourceStore<K> for KubeResourceStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        match self.api(key).get_opt(&key.name).await? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<K> {
        let obj = self
            .api(key)
            .patch(&key.name, &Self::params(), &Patch::Merge(patch))
            .await?;
        from_dynamic(obj)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<K> {
        let obj = self
            .api(key)
            .patch_status(&key.name, &Self::params(), &Patch::Merge(patch))
            .await?;
        from_dynamic(obj)
    }
}

fn from_dynamic<K: Resource>(obj: DynamicObject) -> Result<K> {
    let value = serde_json::to_value(obj)?;
    serde_json::from_value(value)
        .map_err(|e| crate::Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
}

/// Compute the RFC 7386 merge patch turning `old` into `new`.
///
/// Returns `None` when the two are equal. Keys missing from `new` become
/// explicit nulls so removed map entries are deleted server side.
pub fn merge_diff(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, old_value) in old {
                match new.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new_value) => {
                        if let Some(diff) = merge_diff(old_value, new_value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    patch.insert(key.clone(), new_value.clone());
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if old == new => None,
        _ => Some(new.clone()),
    }
}
