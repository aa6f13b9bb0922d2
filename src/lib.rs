//! Kloudlite operator core - generic reconciliation engine for custom resources
//!
//! Every Kloudlite controller (App, Router, Workspace, ManagedService, ...)
//! converges its objects through the same machinery:
//!
//! - [`crd`] - The `Resource` contract and the shared `Status` / check model
//! - [`reconciler`] - Request, Check state machine and Step orchestrator
//! - [`apply`] - Last-applied diff client for arbitrary Kubernetes documents
//! - [`predicate`] - Change detection deciding when an update is reconcile-worthy
//! - [`watch`] - Watches for kinds only discovered at runtime (plugin CRDs)
//! - [`controller`] - Wiring into `kube::runtime::Controller`
//!
//! Ambient pieces used when running an operator process:
//!
//! - [`config`] - Operator flags
//! - [`telemetry`] - Tracing subscriber setup
//! - [`health`] - Health probe and metrics endpoints
//! - [`leader_election`] - Lease based leader election
//! - [`operator`] - Process runtime tying the pieces together
//! - [`backoff`] - Requeue delays for failing reconciles

#![deny(missing_docs)]

pub mod apply;
pub mod backoff;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod health;
pub mod leader_election;
pub mod operator;
pub mod predicate;
pub mod reconciler;
pub mod telemetry;
pub mod watch;
pub mod yaml;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known keys
// =============================================================================
// Dashboards and the CLI read these keys, so they must stay bit-exact.

/// Annotation holding the human readable ready summary
pub const ANNOTATION_RESOURCE_READY: &str = "operator.kloudlite.io/resource.ready";

/// Annotation holding the compact per-check glyph string
pub const ANNOTATION_CHECKS: &str = "operator.kloudlite.io/checks";

/// Annotation holding the last applied desired state of a child object
pub const ANNOTATION_LAST_APPLIED: &str = "operator.kloudlite.io/last-applied";

/// Annotation that disables reconciliation when set to "false"
pub const ANNOTATION_SHOULD_RECONCILE: &str = "operator.kloudlite.io/should-reconcile";

/// Annotation that wipes the status on the next reconcile
pub const ANNOTATION_CLEAR_STATUS: &str = "operator.kloudlite.io/clear-status";

/// Annotation naming a single check to re-run
pub const ANNOTATION_RESET_CHECK: &str = "operator.kloudlite.io/reset-check";

/// Annotation requesting a rollout restart of the resource's workloads
pub const ANNOTATION_DO_RESTART: &str = "operator.kloudlite.io/do-restart";

/// kubectl's own last-applied annotation, never a reason to reconcile
pub const ANNOTATION_KUBECTL_LAST_APPLIED: &str =
    "kubectl.kubernetes.io/last-applied-configuration";

/// Pod template annotation used to trigger rollout restarts
pub const ANNOTATION_RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

/// Finalizer owned by the core; its removal lets the API server delete the object
pub const FINALIZER: &str = "kloudlite.io/finalizer";

/// Field manager name used for writes made by the core
pub const FIELD_MANAGER: &str = "kloudlite-operator";
