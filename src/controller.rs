//! Binding of the reconciliation core to `kube::runtime::Controller`
//!
//! One [`Context`] per resource type holds the steps and the shared clients.
//! [`reconcile`] runs one cycle: fetch, pre-reconcile, steps, post-reconcile.
//! [`run`] wires the watch stream, the event filter and the dynamic watch
//! channel into a controller future.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info};

use crate::apply::YamlClient;
use crate::backoff::{BackoffConfig, FailureTracker};
use crate::crd::Resource;
use crate::health::{HealthState, ReconcileOutcome};
use crate::predicate::ReconcileFilter;
use crate::reconciler::{reconcile_steps, KubeResourceStore, ObjectKey, Request, ResourceStore, Step};
use crate::watch::{DynamicWatches, WATCH_TIMEOUT_SECS};
use crate::{Error, Result};

/// Shared state of one controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(steps)
///     .store(store)
///     .yaml_client(yaml)
///     .build()?;
/// ```
pub struct Context<K: Resource> {
    /// Read and write access to the reconciled objects
    pub store: Arc<dyn ResourceStore<K>>,
    /// Steps in registration order
    pub steps: Vec<Step<K>>,
    /// Apply client handed to every request
    pub yaml: Arc<YamlClient>,
    /// Watches for runtime-discovered child kinds
    pub watches: Option<Arc<DynamicWatches<K>>>,
    /// Consecutive failures per object, for requeue backoff
    pub failures: FailureTracker,
    /// Probe and metrics state
    pub health: Arc<HealthState>,
}

impl<K: Resource> Context<K> {
    /// Start building a context around `steps`
    pub fn builder(steps: Vec<Step<K>>) -> ContextBuilder<K> {
        ContextBuilder {
            steps,
            store: None,
            yaml: None,
            watches: None,
            backoff: BackoffConfig::default(),
            health: None,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder<K: Resource> {
    steps: Vec<Step<K>>,
    store: Option<Arc<dyn ResourceStore<K>>>,
    yaml: Option<Arc<YamlClient>>,
    watches: Option<Arc<DynamicWatches<K>>>,
    backoff: BackoffConfig,
    health: Option<Arc<HealthState>>,
}

impl<K: Resource> ContextBuilder<K> {
    /// Store and apply client talking to the API server
    pub fn client(self, client: Client) -> Self {
        self.store(Arc::new(KubeResourceStore::<K>::new(client.clone())))
            .yaml_client(Arc::new(YamlClient::from_client(client)))
    }

    /// Override the object store
    pub fn store(mut self, store: Arc<dyn ResourceStore<K>>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the apply client
    pub fn yaml_client(mut self, yaml: Arc<YamlClient>) -> Self {
        self.yaml = Some(yaml);
        self
    }

    /// Enable dynamic watches
    pub fn watches(mut self, watches: Arc<DynamicWatches<K>>) -> Self {
        self.watches = Some(watches);
        self
    }

    /// Override the requeue backoff curve
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Share probe and metrics state with the operator process
    pub fn health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the context; fails when the store or the apply client is missing
    pub fn build(self) -> Result<Context<K>> {
        let kind = K::kind(&());
        let store = self
            .store
            .ok_or_else(|| Error::config(format!("{} controller has no object store", kind)))?;
        let yaml = self
            .yaml
            .ok_or_else(|| Error::config(format!("{} controller has no yaml client", kind)))?;
        let health = match self.health {
            Some(health) => health,
            None => Arc::new(HealthState::new()?),
        };
        Ok(Context {
            store,
            steps: self.steps,
            yaml,
            watches: self.watches,
            failures: FailureTracker::new(self.backoff),
            health,
        })
    }
}

/// Run one reconcile cycle of `obj`
pub async fn reconcile<K: Resource>(obj: Arc<K>, ctx: Arc<Context<K>>) -> Result<Action> {
    let key = ObjectKey::of(obj.as_ref());
    let mut req = match Request::new(Arc::clone(&ctx.store), key.clone()).await {
        Ok(req) => req.with_yaml_client(Arc::clone(&ctx.yaml)),
        Err(e) if e.is_not_found() => {
            debug!(resource = %key, "object gone, nothing to reconcile");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    if let Some(watches) = &ctx.watches {
        req = req.with_watches(Arc::clone(watches));
    }

    if !req.should_reconcile() {
        info!(resource = %key, "reconciliation disabled by annotation");
        return Ok(Action::await_change());
    }

    let started = Instant::now();
    req.pre_reconcile();
    let result = reconcile_steps(&mut req, &ctx.steps).await;
    let closed = req.post_reconcile().await;
    ctx.health.metrics.observe(K::kind(&()).as_ref(), started.elapsed());

    let action = result.into_action()?;
    closed?;
    ctx.failures.reset(&key.to_string());
    Ok(action)
}

/// Requeue policy for errors returned by [`reconcile`]
///
/// Retryable errors back off per object; the others wait for the next change
/// of the object. Errored checks always arrive retryable, so only the core's
/// own reads and writes can end up waiting.
pub fn error_policy<K: Resource>(obj: Arc<K>, error: &Error, ctx: Arc<Context<K>>) -> Action {
    let key = ObjectKey::of(obj.as_ref()).to_string();
    if !error.is_retryable() {
        error!(?error, resource = %key, "reconciliation failed, waiting for a change");
        return Action::await_change();
    }
    let delay = ctx.failures.record_failure(&key);
    error!(
        ?error,
        resource = %key,
        failures = ctx.failures.failures(&key),
        requeue_ms = delay.as_millis() as u64,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

fn object_ref<K: Resource>(key: &ObjectKey) -> ObjectRef<K> {
    let reference = ObjectRef::new(&key.name);
    match &key.namespace {
        Some(ns) => reference.within(ns),
        None => reference,
    }
}

/// Controller future for `K` over `api`
///
/// Keys sent into `parents` (by [`DynamicWatches`]) are reconciled like
/// watch events. The future ends on SIGTERM/SIGINT.
pub async fn run<K: Resource>(
    api: Api<K>,
    ctx: Arc<Context<K>>,
    parents: UnboundedReceiver<ObjectKey>,
    concurrency: u16,
) {
    let name = K::kind(&()).to_string();
    let (reader, writer) = reflector::store::<K>();
    let filter = Arc::new(ReconcileFilter::new());

    let events = watcher::watcher(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff()
        .reflect(writer);
    let objects = filter.filter_events(events);
    let parents = UnboundedReceiverStream::new(parents).map(|key| object_ref::<K>(&key));

    info!(controller = %name, concurrency, "starting controller");
    let health = Arc::clone(&ctx.health);
    Controller::for_stream(objects, reader)
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .reconcile_on(parents)
        .shutdown_on_signal()
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|result| {
            match result {
                Ok((obj, action)) => {
                    health.metrics.record(&name, ReconcileOutcome::Success);
                    debug!(controller = %name, object = %obj, ?action, "reconciliation completed");
                }
                Err(e) => {
                    health.metrics.record(&name, ReconcileOutcome::Error);
                    error!(controller = %name, error = %e, "reconciliation error");
                }
            }
            std::future::ready(())
        })
        .await;
    info!(controller = %name, "controller stopped");
}
