//! Operator process flags
//!
//! Every controller binary is started with the same flags. Each flag can
//! also come from the environment, which is how the Helm chart sets them.

use std::net::SocketAddr;

use clap::Parser;

/// Flags shared by every Kloudlite operator binary
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "kloudlite-operator", version, about, long_about = None)]
pub struct OperatorArgs {
    /// Development mode: human readable logs instead of JSON
    #[arg(long, env = "DEV")]
    pub dev: bool,

    /// Debug logging for the operator's own crates
    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    /// Address serving reconcile metrics
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: SocketAddr,

    /// Address serving /healthz and /readyz
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// Only reconcile while holding the leader lease
    #[arg(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    /// Name of the leader election lease
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = "kloudlite-operator")]
    pub leader_election_id: String,

    /// Namespace holding the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "kloudlite")]
    pub leader_election_namespace: String,

    /// Upper bound of reconciles in flight per controller
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 5)]
    pub max_concurrent_reconciles: u16,
}

impl OperatorArgs {
    /// Identity used as the lease holder: the pod name when running in a
    /// cluster, otherwise the hostname
    pub fn holder_identity() -> String {
        std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("kloudlite-operator-{}", std::process::id()))
    }
}
