//! Logging initialization
//!
//! `RUST_LOG` takes precedence; otherwise [`DEFAULT_FILTER`] is used.
//! Output is human-readable by default and JSON with `json = true`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::Error;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,impersonator=debug,kube=info,tower=warn,hyper=warn";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global tracing subscriber
///
/// Fails if a subscriber is already installed.
pub fn init_logging(json: bool) -> Result<(), Error> {
    let registry = tracing_subscriber::registry().with(env_filter());

    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| Error::internal_with_context("telemetry", e.to_string()))
}
