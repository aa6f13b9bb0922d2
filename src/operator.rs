//! Process runtime shared by every controller binary
//!
//! Installs tracing, serves probes and metrics, optionally waits for the
//! leader lease, then drives the controller futures until they end or the
//! lease is lost.

use std::sync::Arc;

use futures::future::{self, BoxFuture};
use kube::Client;
use tracing::{error, info};

use crate::config::OperatorArgs;
use crate::health::{self, HealthState};
use crate::leader_election::LeaderElector;
use crate::{telemetry, Error, Result};

/// Run `controllers` under the process flags in `args`.
///
/// `controllers` receives the shared [`HealthState`] so their contexts can
/// report reconcile metrics.
pub async fn run<F>(args: OperatorArgs, client: Client, controllers: F) -> Result<()>
where
    F: FnOnce(Arc<HealthState>) -> Vec<BoxFuture<'static, ()>>,
{
    telemetry::init_tracing(args.dev, args.debug)?;
    let state = Arc::new(HealthState::new()?);

    spawn_server(args.health_probe_bind_address, health::probe_router(state.clone()));
    spawn_server(args.metrics_bind_address, health::metrics_router(state.clone()));

    let controllers = controllers(state.clone());
    info!(count = controllers.len(), leader_elect = args.leader_elect, "starting controllers");

    if !args.leader_elect {
        state.set_ready(true);
        future::join_all(controllers).await;
        return Ok(());
    }

    let elector = Arc::new(LeaderElector::new(
        client,
        &args.leader_election_id,
        &args.leader_election_namespace,
        &OperatorArgs::holder_identity(),
    ));
    let mut guard = elector.acquire().await;
    state.set_ready(true);

    let lost = tokio::select! {
        _ = future::join_all(controllers) => false,
        _ = guard.lost() => true,
    };
    if lost {
        state.set_ready(false);
        return Err(Error::internal_with_context("leader_election", "leadership lost"));
    }
    if let Err(e) = guard.release().await {
        error!(error = %e, "failed to release leader lease");
    }
    Ok(())
}

fn spawn_server(addr: std::net::SocketAddr, router: axum::Router) {
    tokio::spawn(async move {
        if let Err(e) = health::serve(addr, router).await {
            error!(%addr, error = %e, "server stopped");
        }
    });
}
