//! Leader election using Kubernetes Leases
//!
//! With `--leader-elect`, only the pod holding the `coordination.k8s.io/v1`
//! Lease runs controllers. Standby replicas keep retrying and take over once
//! the holder stops renewing.
//!
//! # Atomicity
//!
//! Every write carries the resourceVersion read just before. If the lease
//! changed in between, the API server answers 409 and the attempt counts as
//! "not leader"; the next attempt starts from a fresh read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, Result, FIELD_MANAGER};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// What to do with the lease as last read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold it; bump renewTime
    Renew,
    /// The holder stopped renewing; take it with the next transition count
    TakeOver {
        /// Value to store in `leaseTransitions`
        transitions: i32,
    },
    /// Someone else holds a live lease
    Wait,
}

/// Decide how `identity` should treat `lease` at `now`.
///
/// A lease without a holder, renew time or duration counts as expired.
pub fn lease_action(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseAction::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (holder, renew_time, duration_secs) {
        (Some(_), Some(rt), Some(duration)) => {
            now > rt.0 + chrono::Duration::seconds(i64::from(duration))
        }
        _ => true,
    };

    if expired {
        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseAction::TakeOver {
            transitions: transitions.saturating_add(1),
        }
    } else {
        LeaseAction::Wait
    }
}

/// Leader elector backed by one Lease object
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while the lease is held
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until the lease is acquired, then keep renewing it in the
    /// background for as long as the returned guard lives
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return self.guard();
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "lease held by another replica");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "lease acquisition failed");
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move { elector.renew_until_lost(lost_tx).await });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        match lease_action(existing.as_ref(), &self.identity, now) {
            LeaseAction::Wait => Ok(false),
            LeaseAction::Create => {
                let lease = self.desired_lease(None, now, 0);
                self.write(api.create(&PostParams::default(), &lease).await, "created")
            }
            LeaseAction::Renew => {
                let Some(mut lease) = existing else {
                    return Ok(false);
                };
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                let result = api
                    .replace(&self.lease_name, &PostParams::default(), &lease)
                    .await;
                self.write(result, "renewed")
            }
            LeaseAction::TakeOver { transitions } => {
                let rv = existing.and_then(|l| l.metadata.resource_version);
                if rv.is_none() {
                    return Err(Error::internal_with_context(
                        "leader_election",
                        "lease missing resourceVersion",
                    ));
                }
                let lease = self.desired_lease(rv, now, transitions);
                let result = api
                    .replace(&self.lease_name, &PostParams::default(), &lease)
                    .await;
                self.write(result, "taken over")
            }
        }
    }

    fn write(&self, result: kube::Result<Lease>, what: &str) -> Result<bool> {
        match result {
            Ok(_) => {
                debug!(identity = %self.identity, "lease {}", what);
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "lease changed concurrently");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn desired_lease(
        &self,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn renew_until_lost(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release(&self) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(());
        }

        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": { "holderIdentity": null }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        info!(identity = %self.identity, "lease released");
        Ok(())
    }
}

/// Holds leadership while alive; the renewal task stops on drop
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolves once the lease could not be renewed
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Give the lease up during graceful shutdown
    pub async fn release(&self) -> Result<()> {
        self.elector.release().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
    }
}
