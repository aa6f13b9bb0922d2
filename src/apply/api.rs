//! Untyped CRUD against arbitrary resources

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use super::mapper::ResourceMapping;
use crate::{Error, Result, FIELD_MANAGER};

/// Dynamic object operations; an empty namespace means cluster scope (or
/// the client's default namespace for namespaced kinds).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DynamicApi: Send + Sync {
    /// Fetch an object, `None` when absent
    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create an object
    async fn create(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Replace an object; `obj` must carry the live resourceVersion
    async fn replace(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Delete an object; false when it did not exist
    async fn delete(&self, mapping: &ResourceMapping, namespace: &str, name: &str) -> Result<bool>;

    /// List objects matching a label selector
    async fn list(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Merge patch an object
    async fn patch_merge(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject>;
}

/// [`DynamicApi`] backed by the API server
pub struct KubeDynamicApi {
    client: Client,
}

impl KubeDynamicApi {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, mapping: &ResourceMapping, namespace: &str) -> Api<DynamicObject> {
        if !mapping.namespaced {
            Api::all_with(self.client.clone(), &mapping.resource)
        } else if namespace.is_empty() {
            Api::default_namespaced_with(self.client.clone(), &mapping.resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &mapping.resource)
        }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn object_name(obj: &DynamicObject) -> Result<&str> {
    obj.metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::validation_for_field("metadata.name", "object has no name"))
}

#[async_trait]
impl DynamicApi for KubeDynamicApi {
    async fn get(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(mapping, namespace).get_opt(name).await?)
    }

    async fn create(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(mapping, namespace)
            .create(&post_params(), obj)
            .await?)
    }

    async fn replace(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = object_name(obj)?;
        Ok(self
            .api(mapping, namespace)
            .replace(name, &post_params(), obj)
            .await?)
    }

    async fn delete(&self, mapping: &ResourceMapping, namespace: &str, name: &str) -> Result<bool> {
        match self
            .api(mapping, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(selector);
        Ok(self.api(mapping, namespace).list(&params).await?.items)
    }

    async fn patch_merge(
        &self,
        mapping: &ResourceMapping,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self
            .api(mapping, namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await?)
    }
}
