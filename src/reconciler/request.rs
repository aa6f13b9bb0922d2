//! Per-cycle reconcile context
//!
//! A [`Request`] binds one fetched object to its store for the duration of a
//! reconcile cycle. It keeps two copies of the object: the working copy that
//! steps mutate and the last copy known to the API server, which every write
//! is diffed against.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use kube::api::GroupVersionKind;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::store::{merge_diff, ObjectKey, ResourceStore};
use crate::apply::YamlClient;
use crate::crd::{CheckDefinition, Resource, ResourceRef, Status};
use crate::watch::DynamicWatches;
use crate::{
    Error, Result, ANNOTATION_CHECKS, ANNOTATION_CLEAR_STATUS, ANNOTATION_DO_RESTART,
    ANNOTATION_RESET_CHECK, ANNOTATION_RESOURCE_READY, ANNOTATION_SHOULD_RECONCILE, FINALIZER,
};

static EMPTY_STATUS: Status = Status {
    is_ready: false,
    check_list: Vec::new(),
    checks: std::collections::BTreeMap::new(),
    last_ready_generation: 0,
    last_reconcile_time: None,
    resources: Vec::new(),
};

/// Scratch space shared between the steps of one cycle
#[derive(Clone, Debug, Default)]
pub struct Kv {
    values: HashMap<String, Value>,
}

impl Kv {
    /// Store a value under `key`, replacing any previous one
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        self.values.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read a value back, `None` if the key was never set
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .map(|v| serde_json::from_value(v.clone()).map_err(Error::from))
            .transpose()
    }

    /// Whether `key` holds a value
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Remove and return the raw value under `key`
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }
}

/// One reconcile cycle of one object
pub struct Request<K: Resource> {
    object: K,
    synced: K,
    key: ObjectKey,
    store: Arc<dyn ResourceStore<K>>,
    yaml: Option<Arc<YamlClient>>,
    watches: Option<Arc<DynamicWatches<K>>>,
    started: Instant,
    /// Scratch space for passing data between steps
    pub kv: Kv,
}

impl<K: Resource> Request<K> {
    /// Fetch the object behind `key`.
    ///
    /// Fails with [`Error::NotFound`] when the object is gone; callers treat
    /// that as already deleted.
    pub async fn new(store: Arc<dyn ResourceStore<K>>, key: ObjectKey) -> Result<Self> {
        let mut object = store
            .get(&key)
            .await?
            .ok_or_else(|| Error::not_found(K::kind(&()).to_string(), key.to_string()))?;
        let synced = object.clone();
        object.status_mut();

        Ok(Self {
            object,
            synced,
            key,
            store,
            yaml: None,
            watches: None,
            started: Instant::now(),
            kv: Kv::default(),
        })
    }

    /// Attach the apply client steps use to converge children
    pub fn with_yaml_client(mut self, yaml: Arc<YamlClient>) -> Self {
        self.yaml = Some(yaml);
        self
    }

    /// The apply client, a configuration error if none was attached
    pub fn yaml_client(&self) -> Result<&YamlClient> {
        self.yaml
            .as_deref()
            .ok_or_else(|| Error::config("no yaml client attached to the reconciler"))
    }

    /// Attach the controller's dynamic watch registry
    pub fn with_watches(mut self, watches: Arc<DynamicWatches<K>>) -> Self {
        self.watches = Some(watches);
        self
    }

    /// Watch a runtime-discovered kind whose objects this controller owns.
    ///
    /// `false` when the kind is not served or the controller runs without
    /// dynamic watches.
    pub async fn own_dynamic(&self, api_version: &str, kind: &str) -> Result<bool> {
        match &self.watches {
            Some(watches) => watches.own(api_version, kind).await,
            None => {
                debug!(api_version, kind, "dynamic watches not enabled");
                Ok(false)
            }
        }
    }

    /// Working copy of the object
    pub fn object(&self) -> &K {
        &self.object
    }

    /// Mutable working copy; metadata changes need [`Request::update_object`]
    pub fn object_mut(&mut self) -> &mut K {
        &mut self.object
    }

    /// Key of the object
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// GroupVersionKind of the reconciled type
    pub fn gvk(&self) -> GroupVersionKind {
        K::gvk()
    }

    /// Working copy of the status
    pub fn status(&self) -> &Status {
        self.object.status().unwrap_or(&EMPTY_STATUS)
    }

    /// Mutable working copy of the status
    pub fn status_mut(&mut self) -> &mut Status {
        self.object.status_mut()
    }

    /// `metadata.generation`, zero when unset
    pub fn generation(&self) -> i64 {
        self.object.meta().generation.unwrap_or_default()
    }

    /// True once the API server set a deletion timestamp
    pub fn is_being_deleted(&self) -> bool {
        self.object.meta().deletion_timestamp.is_some()
    }

    /// False when the object opted out through the should-reconcile annotation
    pub fn should_reconcile(&self) -> bool {
        self.object
            .annotations()
            .get(ANNOTATION_SHOULD_RECONCILE)
            .map_or(true, |v| v != "false")
    }

    /// Open the cycle
    pub fn pre_reconcile(&mut self) {
        self.started = Instant::now();
        info!(
            kind = %K::kind(&()),
            resource = %self.key,
            generation = self.generation(),
            deleting = self.is_being_deleted(),
            "reconcile start"
        );
    }

    /// Close the cycle: stamp timestamps, persist status, refresh the
    /// summary annotations.
    ///
    /// NotFound and Conflict are expected while the object is still being
    /// worked on and are not reported as errors.
    pub async fn post_reconcile(&mut self) -> Result<()> {
        let generation = self.generation();
        let deleting = self.is_being_deleted();

        let status = self.status_mut();
        status.last_reconcile_time = Some(Utc::now());
        if status.is_ready {
            status.last_ready_generation = generation;
        }

        let outcome = self.write_summary(generation, deleting).await;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;

        match outcome {
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!(resource = %self.key, error = %e, "reconcile still in progress");
                Ok(())
            }
            Err(e) => Err(e),
            Ok(()) => {
                info!(
                    kind = %K::kind(&()),
                    resource = %self.key,
                    ready = self.status().is_ready,
                    elapsed_ms,
                    "reconcile end"
                );
                Ok(())
            }
        }
    }

    async fn write_summary(&mut self, generation: i64, deleting: bool) -> Result<()> {
        self.update_status().await?;

        let ready = self.status().ready_summary(generation, deleting);
        let checks = self.status().checks_summary();
        let annotations = self.object.annotations();
        if annotations.get(ANNOTATION_RESOURCE_READY) == Some(&ready)
            && annotations.get(ANNOTATION_CHECKS) == Some(&checks)
        {
            return Ok(());
        }

        let annotations = self.object.annotations_mut();
        annotations.insert(ANNOTATION_RESOURCE_READY.to_string(), ready);
        annotations.insert(ANNOTATION_CHECKS.to_string(), checks);
        self.update_object().await
    }

    /// Add missing ensured labels and annotations; true if a write happened
    pub async fn ensure_labels_and_annotations(&mut self) -> Result<bool> {
        let mut changed = false;
        for (key, value) in self.object.ensured_labels() {
            if self.object.labels().get(&key) != Some(&value) {
                self.object.labels_mut().insert(key, value);
                changed = true;
            }
        }
        for (key, value) in self.object.ensured_annotations() {
            if self.object.annotations().get(&key) != Some(&value) {
                self.object.annotations_mut().insert(key, value);
                changed = true;
            }
        }
        if changed {
            debug!(resource = %self.key, "ensuring labels and annotations");
            self.update_object().await?;
        }
        Ok(changed)
    }

    /// Add the core finalizer; true if a write happened
    pub async fn ensure_finalizers(&mut self) -> Result<bool> {
        if self.object.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(false);
        }
        self.object.finalizers_mut().push(FINALIZER.to_string());
        debug!(resource = %self.key, finalizer = FINALIZER, "adding finalizer");
        self.update_object().await?;
        Ok(true)
    }

    /// Drop the core finalizer, letting the API server delete the object
    pub async fn remove_finalizer(&mut self) -> Result<()> {
        let before = self.object.finalizers().len();
        self.object.finalizers_mut().retain(|f| f != FINALIZER);
        if self.object.finalizers().len() == before {
            return Ok(());
        }
        info!(resource = %self.key, finalizer = FINALIZER, "removing finalizer");
        self.update_object().await
    }

    /// Replace the check list when it differs; true if a write happened
    pub async fn ensure_check_list(&mut self, defs: &[CheckDefinition]) -> Result<bool> {
        if !self.status_mut().ensure_check_list(defs) {
            return Ok(false);
        }
        debug!(
            resource = %self.key,
            checks = ?defs.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "check list changed"
        );
        self.update_status().await?;
        Ok(true)
    }

    /// Wipe the status when the clear-status annotation is present
    pub async fn clear_status_if_annotated(&mut self) -> Result<bool> {
        if !self.object.annotations().contains_key(ANNOTATION_CLEAR_STATUS) {
            return Ok(false);
        }
        info!(resource = %self.key, "clearing status on request");
        *self.status_mut() = Status::default();
        self.update_status().await?;
        self.object.annotations_mut().remove(ANNOTATION_CLEAR_STATUS);
        self.update_object().await?;
        Ok(true)
    }

    /// Put the check named by the reset-check annotation back to Waiting
    pub async fn reset_check_if_annotated(&mut self) -> Result<bool> {
        let Some(name) = self.object.annotations().get(ANNOTATION_RESET_CHECK).cloned() else {
            return Ok(false);
        };
        if self.status_mut().reset_check(&name) {
            info!(resource = %self.key, check = %name, "resetting check on request");
            self.update_status().await?;
        } else {
            debug!(resource = %self.key, check = %name, "reset requested for unknown check");
        }
        self.object.annotations_mut().remove(ANNOTATION_RESET_CHECK);
        self.update_object().await?;
        Ok(true)
    }

    /// Consume a pending restart request; true when one was pending
    pub async fn take_restart_request(&mut self) -> Result<bool> {
        if self
            .object
            .annotations_mut()
            .remove(ANNOTATION_DO_RESTART)
            .is_none()
        {
            return Ok(false);
        }
        self.update_object().await?;
        Ok(true)
    }

    /// Record the children applied this cycle and return the previously
    /// owned refs that are no longer applied.
    ///
    /// Only the working copy changes; the status is persisted by the next
    /// check outcome or by `post_reconcile`.
    pub fn sync_owned_resources(&mut self, refs: Vec<ResourceRef>) -> Vec<ResourceRef> {
        let current: BTreeSet<ResourceRef> = refs.into_iter().collect();
        let status = self.status_mut();
        let stale = status
            .resources
            .iter()
            .filter(|r| !current.contains(*r))
            .cloned()
            .collect();
        status.resources = current.into_iter().collect();
        stale
    }

    /// Persist the status working copy when it differs from the server's
    pub async fn update_status(&mut self) -> Result<()> {
        let old = serde_json::to_value(self.synced.status())?;
        let new = serde_json::to_value(self.object.status())?;
        let Some(diff) = merge_diff(&old, &new) else {
            return Ok(());
        };

        let patch = json!({
            "metadata": { "resourceVersion": self.synced.resource_version() },
            "status": diff,
        });
        let updated = self.store.patch_status(&self.key, &patch).await?;
        self.absorb(updated);
        Ok(())
    }

    /// Persist label, annotation and finalizer changes of the working copy.
    ///
    /// The local status survives the write even if it was not persisted yet.
    pub async fn update_object(&mut self) -> Result<()> {
        let old = metadata_view(&self.synced);
        let new = metadata_view(&self.object);
        let Some(diff) = merge_diff(&old, &new) else {
            return Ok(());
        };

        let mut metadata = diff;
        if let Value::Object(map) = &mut metadata {
            map.insert(
                "resourceVersion".to_string(),
                json!(self.synced.resource_version()),
            );
        }
        let updated = self
            .store
            .patch(&self.key, &json!({ "metadata": metadata }))
            .await?;
        self.absorb(updated);
        Ok(())
    }

    fn absorb(&mut self, updated: K) {
        let status = self.object.status().cloned();
        self.synced = updated.clone();
        self.object = updated;
        if let Some(status) = status {
            *self.object.status_mut() = status;
        }
    }
}

fn metadata_view<K: Resource>(obj: &K) -> Value {
    let meta = obj.meta();
    json!({
        "labels": meta.labels,
        "annotations": meta.annotations,
        "finalizers": meta.finalizers,
    })
}
