//! Tracing subscriber setup
//!
//! JSON logs in production, human readable logs with `--dev`. `RUST_LOG`
//! always wins over the flag derived default.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{Error, Result};

/// Default directives when `RUST_LOG` is unset
pub fn default_directives(debug: bool) -> &'static str {
    if debug {
        "info,kloudlite_operator=debug,kube=info,tower=warn,hyper=warn"
    } else {
        "info,kube=warn,tower=warn,hyper=warn"
    }
}

/// Install the global subscriber; fails if one is already installed
pub fn init_tracing(dev: bool, debug: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if dev {
        registry.with(fmt::layer().with_target(false)).try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()
    };

    installed.map_err(|e| Error::internal_with_context("telemetry", e.to_string()))
}
