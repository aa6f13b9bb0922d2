//! Apply client for arbitrary Kubernetes documents
//!
//! Works like `kubectl apply`: every applied object carries a snapshot of
//! the desired state it was last applied with, and an unchanged snapshot
//! means no write at all. Labels and annotations are merged three ways so
//! keys added by other controllers or humans survive.

mod api;
mod mapper;
mod merge;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use kube::api::{DynamicObject, GroupVersionKind};
use kube::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

pub use api::{DynamicApi, KubeDynamicApi};
pub use mapper::{DiscoveryRestMapper, ResourceMapping, RestMapper, StaticRestMapper};
pub use merge::{previous_metadata, snapshot, three_way};

#[cfg(test)]
pub use api::MockDynamicApi;
#[cfg(test)]
pub use mapper::MockRestMapper;

use crate::crd::{split_api_version, ResourceRef};
use crate::yaml::parse_documents;
use crate::{Error, Result, ANNOTATION_LAST_APPLIED, ANNOTATION_RESTARTED_AT};

/// Workload kinds that support a rollout restart
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
}

impl RolloutKind {
    fn gvk(&self) -> GroupVersionKind {
        let kind = match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
        };
        GroupVersionKind::gvk("apps", "v1", kind)
    }
}

/// Applies and deletes documents through a [`DynamicApi`]
pub struct YamlClient {
    api: Arc<dyn DynamicApi>,
    mapper: Arc<dyn RestMapper>,
    ensured_labels: BTreeMap<String, String>,
    ensured_annotations: BTreeMap<String, String>,
}

struct Decoded {
    object: DynamicObject,
    mapping: ResourceMapping,
    namespace: String,
    name: String,
    api_version: String,
    kind: String,
}

impl YamlClient {
    /// Build a client from its two seams
    pub fn new(api: Arc<dyn DynamicApi>, mapper: Arc<dyn RestMapper>) -> Self {
        Self {
            api,
            mapper,
            ensured_labels: BTreeMap::new(),
            ensured_annotations: BTreeMap::new(),
        }
    }

    /// Client talking to the API server with discovery based mapping
    pub fn from_client(client: Client) -> Self {
        Self::new(
            Arc::new(KubeDynamicApi::new(client.clone())),
            Arc::new(DiscoveryRestMapper::new(client)),
        )
    }

    /// Labels stamped on every object this client writes
    pub fn with_ensured_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.ensured_labels = labels;
        self
    }

    /// Annotations stamped on every object this client writes
    pub fn with_ensured_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.ensured_annotations = annotations;
        self
    }

    /// The mapper used to resolve kinds, shared with dynamic watches
    pub fn mapper(&self) -> Arc<dyn RestMapper> {
        Arc::clone(&self.mapper)
    }

    /// Apply every document in `yaml`, returning refs in document order
    pub async fn apply_yaml(&self, yaml: &str) -> Result<Vec<ResourceRef>> {
        let mut refs = Vec::new();
        for doc in parse_documents(yaml)? {
            refs.push(self.apply_value(doc).await?);
        }
        Ok(refs)
    }

    /// Delete every document in `yaml`; absent objects are fine
    pub async fn delete_yaml(&self, yaml: &str) -> Result<()> {
        for doc in parse_documents(yaml)? {
            self.delete_value(doc).await?;
        }
        Ok(())
    }

    /// Apply a typed object
    pub async fn apply<T: Serialize + Sync>(&self, obj: &T) -> Result<ResourceRef> {
        self.apply_value(serde_json::to_value(obj)?).await
    }

    /// Delete a typed object
    pub async fn delete_resource<T: Serialize + Sync>(&self, obj: &T) -> Result<()> {
        self.delete_value(serde_json::to_value(obj)?).await
    }

    /// Delete previously applied objects, e.g. the stale refs returned by
    /// `Request::sync_owned_resources`
    pub async fn delete_refs(&self, refs: &[ResourceRef]) -> Result<()> {
        for r in refs {
            let (group, version) = split_api_version(&r.api_version);
            let gvk = GroupVersionKind::gvk(group, version, &r.kind);
            let Some(mapping) = self.mapper.resolve(&gvk).await? else {
                debug!(resource = %r, "kind no longer served, nothing to delete");
                continue;
            };
            let namespace = if mapping.namespaced { r.namespace.as_str() } else { "" };
            if self.api.delete(&mapping, namespace, &r.name).await? {
                info!(resource = %r, "deleted owned resource");
            }
        }
        Ok(())
    }

    /// Restart the pods of matching workloads by stamping their pod template.
    ///
    /// Returns how many workloads were restarted.
    pub async fn rollout_restart(
        &self,
        kind: RolloutKind,
        namespace: &str,
        selector: &str,
    ) -> Result<usize> {
        let gvk = kind.gvk();
        let mapping = self
            .mapper
            .resolve(&gvk)
            .await?
            .ok_or_else(|| Error::mapping("apps/v1", gvk.kind.clone()))?;

        let restarted_at = Utc::now().to_rfc3339();
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": {
                ANNOTATION_RESTARTED_AT: restarted_at
            }}}}
        });

        let workloads = self.api.list(&mapping, namespace, selector).await?;
        for workload in &workloads {
            let name = workload.metadata.name.as_deref().unwrap_or_default();
            self.api.patch_merge(&mapping, namespace, name, &patch).await?;
            info!(kind = ?kind, namespace, name, "rollout restart");
        }
        Ok(workloads.len())
    }

    async fn decode(&self, doc: Value) -> Result<Decoded> {
        let api_version = doc
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation_for_field("apiVersion", "document has no apiVersion"))?
            .to_string();
        let kind = doc
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation_for_field("kind", "document has no kind"))?
            .to_string();

        let object: DynamicObject = serde_json::from_value(doc)
            .map_err(|e| Error::serialization_for_kind(kind.clone(), e.to_string()))?;
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation_for_field("metadata.name", format!("{} has no name", kind)))?;

        let (group, version) = split_api_version(&api_version);
        let gvk = GroupVersionKind::gvk(group, version, &kind);
        let mapping = self
            .mapper
            .resolve(&gvk)
            .await?
            .ok_or_else(|| Error::mapping(api_version.clone(), kind.clone()))?;

        let namespace = if mapping.namespaced {
            object.metadata.namespace.clone().unwrap_or_default()
        } else {
            String::new()
        };

        Ok(Decoded {
            object,
            mapping,
            namespace,
            name,
            api_version,
            kind,
        })
    }

    async fn apply_value(&self, doc: Value) -> Result<ResourceRef> {
        let last_applied = snapshot(&doc)?;
        let Decoded {
            mut object,
            mapping,
            namespace,
            name,
            api_version,
            kind,
        } = self.decode(doc).await?;

        let resource_ref = ResourceRef {
            api_version,
            kind,
            namespace: namespace.clone(),
            name: name.clone(),
        };

        if let Some(data) = object.data.as_object_mut() {
            data.remove("status");
        }

        match self.api.get(&mapping, &namespace, &name).await? {
            None => {
                self.stamp(&mut object, last_applied);
                self.api.create(&mapping, &namespace, &object).await?;
                info!(resource = %resource_ref, "created");
            }
            Some(live) => {
                let live_snapshot = live
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_LAST_APPLIED));
                if live_snapshot == Some(&last_applied) {
                    debug!(resource = %resource_ref, "unchanged, skipping");
                    return Ok(resource_ref);
                }

                let (prev_labels, prev_annotations) =
                    previous_metadata(live_snapshot.map(String::as_str));
                let live_labels = live.metadata.labels.clone().unwrap_or_default();
                let live_annotations = live.metadata.annotations.clone().unwrap_or_default();

                let desired_labels = object.metadata.labels.take().unwrap_or_default();
                let desired_annotations = object.metadata.annotations.take().unwrap_or_default();
                object.metadata.labels =
                    Some(three_way(&desired_labels, &live_labels, &prev_labels));
                object.metadata.annotations =
                    Some(three_way(&desired_annotations, &live_annotations, &prev_annotations));
                self.stamp(&mut object, last_applied);

                object.metadata.resource_version = live.metadata.resource_version.clone();
                object.metadata.uid = live.metadata.uid.clone();
                if object.metadata.finalizers.is_none() {
                    object.metadata.finalizers = live.metadata.finalizers.clone();
                }
                if let Some(status) = live.data.get("status") {
                    if let Some(data) = object.data.as_object_mut() {
                        data.insert("status".to_string(), status.clone());
                    }
                }

                self.api.replace(&mapping, &namespace, &object).await?;
                info!(resource = %resource_ref, "updated");
            }
        }
        Ok(resource_ref)
    }

    async fn delete_value(&self, doc: Value) -> Result<()> {
        let decoded = match self.decode(doc).await {
            Ok(decoded) => decoded,
            Err(Error::Mapping { api_version, kind }) => {
                debug!(%api_version, %kind, "kind not served, nothing to delete");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if self
            .api
            .delete(&decoded.mapping, &decoded.namespace, &decoded.name)
            .await?
        {
            info!(kind = %decoded.kind, namespace = %decoded.namespace, name = %decoded.name, "deleted");
        }
        Ok(())
    }

    fn stamp(&self, object: &mut DynamicObject, last_applied: String) {
        let labels = object.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in &self.ensured_labels {
            labels.insert(k.clone(), v.clone());
        }
        let annotations = object.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (k, v) in &self.ensured_annotations {
            annotations.insert(k.clone(), v.clone());
        }
        annotations.insert(ANNOTATION_LAST_APPLIED.to_string(), last_applied);
    }
}
