//! Change detection for watch events
//!
//! Controllers write status and summary annotations on every cycle. Those
//! writes come back as watch events; reconciling on each of them would loop
//! forever. [`update_requires_reconcile`] keeps only the changes that can
//! affect convergence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::{future, Stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::watcher;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::crd::CheckResult;
use crate::{
    ANNOTATION_CHECKS, ANNOTATION_KUBECTL_LAST_APPLIED, ANNOTATION_LAST_APPLIED,
    ANNOTATION_RESOURCE_READY,
};

/// Annotations whose changes never warrant a reconcile
const IGNORED_ANNOTATIONS: &[&str] = &[
    ANNOTATION_LAST_APPLIED,
    ANNOTATION_KUBECTL_LAST_APPLIED,
    ANNOTATION_RESOURCE_READY,
    ANNOTATION_CHECKS,
    "deployment.kubernetes.io/revision",
];

/// The status fields that matter for change detection
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusDigest {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    is_ready: bool,
    #[serde(default)]
    checks: BTreeMap<String, CheckResult>,
}

impl StatusDigest {
    /// `None` unless the status looks like a Kloudlite status
    fn from_object(obj: &Value) -> Option<Self> {
        let status = obj.get("status")?.as_object()?;
        if !["isReady", "checks", "checkList"]
            .iter()
            .any(|k| status.contains_key(*k))
        {
            return None;
        }
        serde_json::from_value(Value::Object(status.clone())).ok()
    }
}

/// Everything [`update_requires_reconcile`] compares
#[derive(Clone, Debug, PartialEq)]
pub struct Fingerprint {
    generation: Option<i64>,
    deleting: bool,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    finalizers: Vec<String>,
    owner_references: Vec<OwnerReference>,
    status: Option<StatusDigest>,
}

impl Fingerprint {
    /// Capture the comparable state of an object
    pub fn of<K: kube::Resource + Serialize>(obj: &K) -> Self {
        let annotations = obj
            .annotations()
            .iter()
            .filter(|(k, _)| !IGNORED_ANNOTATIONS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let status = serde_json::to_value(obj)
            .ok()
            .and_then(|v| StatusDigest::from_object(&v));

        Self {
            generation: obj.meta().generation,
            deleting: obj.meta().deletion_timestamp.is_some(),
            labels: obj.labels().clone(),
            annotations,
            finalizers: obj.finalizers().to_vec(),
            owner_references: obj.owner_references().to_vec(),
            status,
        }
    }

    /// True when the status had the shape of a Kloudlite status
    pub fn has_known_status(&self) -> bool {
        self.status.is_some()
    }
}

/// Whether the change from `old` to `new` warrants a reconcile.
///
/// Objects without a recognizable status always pass: they are typically
/// children (Pods, Jobs) whose events the parent needs.
pub fn update_requires_reconcile(old: &Fingerprint, new: &Fingerprint) -> bool {
    if !old.has_known_status() || !new.has_known_status() {
        return true;
    }
    old != new
}

/// Per-object memory of the last admitted state, applied to a watch stream
///
/// A relist (`Init` .. `InitDone`) replaces the memory: objects deleted
/// while the watch was down never produce a `Delete` event.
#[derive(Default)]
pub struct ReconcileFilter {
    seen: DashMap<String, Fingerprint>,
    relisting: AtomicBool,
    relisted: DashMap<String, ()>,
}

impl ReconcileFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `obj` and report whether it differs enough from the last
    /// version seen. First sightings are always admitted.
    pub fn admit<K: kube::Resource + Serialize>(&self, obj: &K) -> bool {
        let key = object_key(obj);
        if self.relisting.load(Ordering::Acquire) {
            self.relisted.insert(key.clone(), ());
        }
        let fingerprint = Fingerprint::of(obj);
        let admitted = match self.seen.insert(key.clone(), fingerprint.clone()) {
            None => true,
            Some(previous) => update_requires_reconcile(&previous, &fingerprint),
        };
        if !admitted {
            trace!(object = %key, "update filtered");
        }
        admitted
    }

    /// Drop the memory of a deleted object
    pub fn forget<K: kube::Resource>(&self, obj: &K) {
        self.seen.remove(&object_key(obj));
    }

    /// Start collecting the keys of a relist
    pub fn begin_relist(&self) {
        self.relisted.clear();
        self.relisting.store(true, Ordering::Release);
    }

    /// Forget every object the finished relist did not return
    pub fn finish_relist(&self) {
        if !self.relisting.swap(false, Ordering::AcqRel) {
            return;
        }
        let before = self.seen.len();
        self.seen.retain(|key, _| self.relisted.contains_key(key));
        self.relisted.clear();
        trace!(dropped = before - self.seen.len(), "relist done");
    }

    /// Number of objects currently remembered
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when no object is remembered
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Apply the filter to a raw watch event stream, yielding the objects
    /// that need a reconcile. Watch errors pass through.
    pub fn filter_events<K, S>(
        self: std::sync::Arc<Self>,
        events: S,
    ) -> impl Stream<Item = Result<K, watcher::Error>> + Send
    where
        K: kube::Resource + Serialize + Send + 'static,
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    {
        events.filter_map(move |event| {
            let out = match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    self.admit(&obj).then_some(Ok(obj))
                }
                Ok(watcher::Event::Delete(obj)) => {
                    self.forget(&obj);
                    None
                }
                Ok(watcher::Event::Init) => {
                    self.begin_relist();
                    None
                }
                Ok(watcher::Event::InitDone) => {
                    self.finish_relist();
                    None
                }
                Err(e) => Some(Err(e)),
            };
            future::ready(out)
        })
    }
}

fn object_key<K: kube::Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::stream;
    use k8s_openapi::api::core::v1::Pod;

    use super::*;
    use crate::crd::{CheckDefinition, CheckState, Status};
    use crate::testing::{probe, Probe};
    use crate::FINALIZER;

    fn ready_probe() -> Probe {
        let mut obj = probe("default", "web");
        let mut status = Status::default();
        status.ensure_check_list(&[CheckDefinition::new("create/a", "")]);
        status.checks.get_mut("create/a").unwrap().state = CheckState::Passed;
        status.is_ready = true;
        obj.status = Some(status);
        obj.metadata.resource_version = Some("1".into());
        obj
    }

    fn changed(old: &Probe, new: &Probe) -> bool {
        update_requires_reconcile(&Fingerprint::of(old), &Fingerprint::of(new))
    }

    /// Story: our own bookkeeping writes do not retrigger a reconcile
    #[test]
    fn story_noise_is_filtered() {
        let old = ready_probe();
        let mut new = old.clone();
        new.metadata.resource_version = Some("2".into());
        new.annotations_mut()
            .insert(ANNOTATION_LAST_APPLIED.into(), "{\"x\":1}".into());
        new.annotations_mut()
            .insert(ANNOTATION_RESOURCE_READY.into(), "true (1)".into());
        new.annotations_mut()
            .insert(ANNOTATION_CHECKS.into(), "✓".into());
        new.status.as_mut().unwrap().last_reconcile_time = Some(chrono::Utc::now());
        new.status.as_mut().unwrap().checks.get_mut("create/a").unwrap().completed_at =
            Some(chrono::Utc::now());

        assert!(!changed(&old, &new));
    }

    /// Story: losing readiness is reconcile-worthy
    #[test]
    fn story_ready_flip_triggers() {
        let old = ready_probe();
        let mut new = old.clone();
        new.status.as_mut().unwrap().is_ready = false;
        assert!(changed(&old, &new));
    }

    #[test]
    fn metadata_changes_trigger() {
        let old = ready_probe();

        let mut new = old.clone();
        new.metadata.generation = Some(2);
        assert!(changed(&old, &new));

        let mut new = old.clone();
        new.labels_mut().insert("team".into(), "a".into());
        assert!(changed(&old, &new));

        let mut new = old.clone();
        new.annotations_mut()
            .insert(crate::ANNOTATION_RESET_CHECK.into(), "create/a".into());
        assert!(changed(&old, &new));

        let mut new = old.clone();
        new.finalizers_mut().push(FINALIZER.into());
        assert!(changed(&old, &new));

        let mut new = old.clone();
        new.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert!(changed(&old, &new));

        let mut new = old.clone();
        new.owner_references_mut().push(OwnerReference {
            api_version: "v1".into(),
            kind: "Namespace".into(),
            name: "team-a".into(),
            uid: "uid".into(),
            ..Default::default()
        });
        assert!(changed(&old, &new));
    }

    #[test]
    fn check_message_change_triggers() {
        let old = ready_probe();
        let mut new = old.clone();
        new.status.as_mut().unwrap().checks.get_mut("create/a").unwrap().message =
            Some("new message".into());
        assert!(changed(&old, &new));
    }

    #[test]
    fn foreign_objects_always_pass() {
        let mut old = Pod::default();
        old.metadata.name = Some("web-0".into());
        old.metadata.resource_version = Some("1".into());
        let mut new = old.clone();
        new.metadata.resource_version = Some("2".into());

        let (old, new) = (Fingerprint::of(&old), Fingerprint::of(&new));
        assert!(!old.has_known_status());
        assert!(update_requires_reconcile(&old, &new));
    }

    #[test]
    fn filter_admits_first_sighting_and_real_changes() {
        let filter = ReconcileFilter::new();
        let obj = ready_probe();
        assert!(filter.admit(&obj));

        let mut noisy = obj.clone();
        noisy.metadata.resource_version = Some("9".into());
        assert!(!filter.admit(&noisy));

        let mut real = noisy.clone();
        real.metadata.generation = Some(5);
        assert!(filter.admit(&real));

        filter.forget(&real);
        assert!(filter.admit(&real));
    }

    #[tokio::test]
    async fn event_stream_is_filtered() {
        let obj = ready_probe();
        let mut noisy = obj.clone();
        noisy.metadata.resource_version = Some("2".into());
        let mut deleted = obj.clone();
        deleted.metadata.resource_version = Some("3".into());

        let events = stream::iter(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(obj.clone())),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Apply(noisy)),
            Ok(watcher::Event::Delete(deleted)),
            Ok(watcher::Event::Apply(obj.clone())),
        ]);

        let out: Vec<_> = Arc::new(ReconcileFilter::new())
            .filter_events(events)
            .collect()
            .await;
        assert_eq!(out.len(), 2, "first sighting and re-creation after delete");
    }

    /// Story: an object deleted while the watch was down is forgotten on relist
    #[tokio::test]
    async fn story_relist_forgets_vanished_objects() {
        let kept = ready_probe();
        let gone = probe("default", "gone");

        let events = stream::iter(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(kept.clone())),
            Ok(watcher::Event::InitApply(gone.clone())),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(kept.clone())),
            Ok(watcher::Event::InitDone),
        ]);

        let filter = Arc::new(ReconcileFilter::new());
        let out: Vec<_> = filter.clone().filter_events(events).collect().await;
        assert_eq!(out.len(), 2, "only first sightings pass");
        assert_eq!(filter.len(), 1);

        assert!(filter.admit(&gone), "a returning object is a first sighting");
    }
}
