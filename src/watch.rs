//! Watches for kinds discovered at runtime
//!
//! Plugin CRDs are unknown at compile time, so a controller that creates
//! them registers a watch from inside a reconcile, the first time it applies
//! such an object. Child events are routed back to the owning parent through
//! owner references.

use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::{DynamicObject, GroupVersionKind};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::apply::{ResourceMapping, RestMapper};
use crate::crd::{api_version, split_api_version, Resource};
use crate::reconciler::ObjectKey;
use crate::Result;

/// Watcher timeout (seconds), below the client read timeout of 30s
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Sends child events to the parents named in their owner references
#[derive(Clone, Debug)]
pub struct ParentRoute {
    api_version: String,
    kind: String,
    namespaced: bool,
    tx: UnboundedSender<ObjectKey>,
}

impl ParentRoute {
    /// Route to parents of the given type
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespaced: bool,
        tx: UnboundedSender<ObjectKey>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespaced,
            tx,
        }
    }

    /// Keys of the parents owning `child`
    ///
    /// Owner references carry no namespace: a namespaced parent lives in the
    /// child's namespace.
    pub fn parent_keys(&self, child: &DynamicObject) -> Vec<ObjectKey> {
        let owners = child.metadata.owner_references.as_deref().unwrap_or_default();
        owners
            .iter()
            .filter(|o| o.api_version == self.api_version && o.kind == self.kind)
            .filter_map(|o| {
                if !self.namespaced {
                    return Some(ObjectKey::cluster(&o.name));
                }
                child
                    .metadata
                    .namespace
                    .as_deref()
                    .map(|ns| ObjectKey::namespaced(ns, &o.name))
            })
            .collect()
    }

    /// Enqueue the parents of `child`; returns how many were enqueued
    pub fn route(&self, child: &DynamicObject) -> usize {
        let keys = self.parent_keys(child);
        let mut sent = 0;
        for key in keys {
            if self.tx.send(key).is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

/// Starts a watch on one resource and feeds its events to a route
#[cfg_attr(test, automock)]
pub trait WatchLauncher: Send + Sync {
    /// Start watching `mapping`; must not block.
    ///
    /// The returned handle stops the watch.
    fn launch(&self, mapping: &ResourceMapping, route: ParentRoute) -> Result<AbortHandle>;
}

/// [`WatchLauncher`] spawning a cluster wide `DynamicObject` watcher
pub struct KubeWatchLauncher {
    client: Client,
}

impl KubeWatchLauncher {
    /// Create a launcher using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl WatchLauncher for KubeWatchLauncher {
    fn launch(&self, mapping: &ResourceMapping, route: ParentRoute) -> Result<AbortHandle> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &mapping.resource);
        let kind = mapping.resource.kind.clone();
        let mut events = watcher::watcher(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .default_backoff()
            .touched_objects()
            .boxed();

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(child) => {
                        let sent = route.route(&child);
                        debug!(kind = %kind, parents = sent, "child event routed");
                    }
                    Err(e) => warn!(kind = %kind, error = %e, "dynamic watch error"),
                }
            }
            debug!(kind = %kind, "dynamic watch ended");
        });
        Ok(task.abort_handle())
    }
}

/// Registry of dynamic watches for one parent type
///
/// Dropping the registry stops every watch it started.
pub struct DynamicWatches<K> {
    registered: DashMap<String, AbortHandle>,
    mapper: Arc<dyn RestMapper>,
    launcher: Arc<dyn WatchLauncher>,
    route: ParentRoute,
    _parent: PhantomData<fn() -> K>,
}

impl<K: Resource> DynamicWatches<K> {
    /// Registry feeding parent keys of type `K` into `tx`
    ///
    /// `namespaced` states whether `K` itself is namespaced.
    pub fn new(
        mapper: Arc<dyn RestMapper>,
        launcher: Arc<dyn WatchLauncher>,
        namespaced: bool,
        tx: UnboundedSender<ObjectKey>,
    ) -> Self {
        let gvk = K::gvk();
        Self {
            registered: DashMap::new(),
            mapper,
            launcher,
            route: ParentRoute::new(api_version(&gvk), gvk.kind, namespaced, tx),
            _parent: PhantomData,
        }
    }

    /// Watch `kind` and route its events to owning parents.
    ///
    /// Registers at most once per `"<apiVersion>.<kind>"`. Returns `false`
    /// without registering when the kind is not served (its CRD is not
    /// installed); a later call may succeed.
    pub async fn own(&self, api_version: &str, kind: &str) -> Result<bool> {
        let key = format!("{}.{}", api_version, kind);
        if self.registered.contains_key(&key) {
            return Ok(true);
        }

        let (group, version) = split_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let Some(mapping) = self.mapper.resolve(&gvk).await? else {
            warn!(api_version, kind, "CRD not installed, skipping watch registration");
            return Ok(false);
        };

        match self.registered.entry(key) {
            Entry::Occupied(_) => Ok(true),
            Entry::Vacant(slot) => {
                let handle = self.launcher.launch(&mapping, self.route.clone())?;
                slot.insert(handle);
                info!(api_version, kind, parent = %self.route.kind, "watching dynamic resource");
                Ok(true)
            }
        }
    }

    /// True once `"<apiVersion>.<kind>"` is watched
    pub fn is_watching(&self, api_version: &str, kind: &str) -> bool {
        self.registered
            .contains_key(&format!("{}.{}", api_version, kind))
    }
}

impl<K> Drop for DynamicWatches<K> {
    fn drop(&mut self) {
        for entry in self.registered.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ApiResource;
    use tokio::sync::mpsc;

    use super::*;
    use crate::apply::MockRestMapper;
    use crate::testing::Probe;

    fn child(namespace: &str, owners: Vec<OwnerReference>) -> DynamicObject {
        let gvk = GroupVersionKind::gvk("plugin.kloudlite.io", "v1", "Database");
        let mut obj = DynamicObject::new("db", &ApiResource::from_gvk(&gvk)).within(namespace);
        obj.metadata.owner_references = Some(owners);
        obj
    }

    fn owner(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            uid: format!("uid-{}", name),
            ..Default::default()
        }
    }

    fn mapper_serving(found: bool) -> MockRestMapper {
        let mut mapper = MockRestMapper::new();
        mapper
            .expect_resolve()
            .returning(move |gvk| Ok(found.then(|| ResourceMapping::namespaced(gvk))));
        mapper
    }

    /// Story: concurrent reconciles asking for the same kind start one watch
    #[tokio::test]
    async fn story_each_kind_is_watched_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut launcher = MockWatchLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|_, _| Ok(tokio::spawn(async {}).abort_handle()));

        let watches: DynamicWatches<Probe> =
            DynamicWatches::new(Arc::new(mapper_serving(true)), Arc::new(launcher), true, tx);

        assert!(watches.own("plugin.kloudlite.io/v1", "Database").await.unwrap());
        assert!(watches.own("plugin.kloudlite.io/v1", "Database").await.unwrap());
        assert!(watches.is_watching("plugin.kloudlite.io/v1", "Database"));
    }

    /// Story: an optional plugin CRD is missing, the controller keeps working
    #[tokio::test]
    async fn story_missing_crd_is_skipped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut launcher = MockWatchLauncher::new();
        launcher.expect_launch().never();

        let watches: DynamicWatches<Probe> =
            DynamicWatches::new(Arc::new(mapper_serving(false)), Arc::new(launcher), true, tx);

        assert!(!watches.own("plugin.kloudlite.io/v1", "Database").await.unwrap());
        assert!(!watches.is_watching("plugin.kloudlite.io/v1", "Database"));
    }

    #[tokio::test]
    async fn launch_failure_leaves_kind_unregistered() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut launcher = MockWatchLauncher::new();
        launcher
            .expect_launch()
            .returning(|_, _| Err(crate::Error::internal("no runtime")));

        let watches: DynamicWatches<Probe> =
            DynamicWatches::new(Arc::new(mapper_serving(true)), Arc::new(launcher), true, tx);

        assert!(watches.own("plugin.kloudlite.io/v1", "Database").await.is_err());
        assert!(!watches.is_watching("plugin.kloudlite.io/v1", "Database"));
    }

    #[test]
    fn children_route_to_matching_owners_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let route = ParentRoute::new("test.kloudlite.io/v1", "Probe", true, tx);

        let obj = child(
            "team-a",
            vec![
                owner("test.kloudlite.io/v1", "Probe", "web"),
                owner("apps/v1", "Deployment", "web"),
                owner("test.kloudlite.io/v2", "Probe", "other-version"),
            ],
        );

        assert_eq!(route.route(&obj), 1);
        assert_eq!(rx.try_recv().unwrap(), ObjectKey::namespaced("team-a", "web"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cluster_scoped_parents_have_no_namespace() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let route = ParentRoute::new("test.kloudlite.io/v1", "Workspace", false, tx);
        let obj = child("team-a", vec![owner("test.kloudlite.io/v1", "Workspace", "ws")]);
        assert_eq!(route.parent_keys(&obj), vec![ObjectKey::cluster("ws")]);
    }

    #[test]
    fn orphans_route_nowhere() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let route = ParentRoute::new("test.kloudlite.io/v1", "Probe", true, tx);
        assert!(route.parent_keys(&child("team-a", vec![])).is_empty());
    }

    /// Story: shutting the controller down stops the child watches it started
    #[tokio::test]
    async fn story_dropping_registry_stops_watches() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tasks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let spawned = tasks.clone();
        let mut launcher = MockWatchLauncher::new();
        launcher.expect_launch().returning(move |_, _| {
            let task = tokio::spawn(futures::future::pending::<()>());
            let handle = task.abort_handle();
            spawned.lock().unwrap().push(task);
            Ok(handle)
        });

        let watches: DynamicWatches<Probe> =
            DynamicWatches::new(Arc::new(mapper_serving(true)), Arc::new(launcher), true, tx);
        assert!(watches.own("plugin.kloudlite.io/v1", "Database").await.unwrap());
        assert!(watches.own("plugin.kloudlite.io/v1", "Cache").await.unwrap());
        drop(watches);

        let tasks: Vec<_> = std::mem::take(&mut *tasks.lock().unwrap());
        assert_eq!(tasks.len(), 2);
        for task in tasks {
            assert!(task.await.unwrap_err().is_cancelled());
        }
    }
}
