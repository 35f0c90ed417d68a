//! Kubernetes client construction and watch caches

use std::fmt::Debug;
use std::hash::Hash;
use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::Error;

/// Connect timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long [`wait_for_cache`] waits for a store's initial list
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Create a kube client from an optional kubeconfig path.
///
/// Without a path the in-cluster config or `KUBECONFIG` is used. The read
/// timeout is left at kube's default so long-running watches survive.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to infer kube config: {}", e),
            )
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Start a reflector for `api` on a background task and return its store.
///
/// Watch errors are logged and retried with the watcher's default backoff.
pub fn spawn_cache<K>(api: Api<K>, config: watcher::Config, dyntype: K::DynamicType) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    let kind = K::kind(&dyntype).to_string();
    let writer = reflector::store::Writer::new(dyntype);
    let reader = writer.as_reader();
    let stream = watcher(api, config)
        .default_backoff()
        .reflect(writer)
        .touched_objects();

    tokio::spawn(async move {
        stream
            .for_each(|event| {
                if let Err(e) = event {
                    warn!(kind = %kind, error = %e, "Cache watch error, backing off");
                }
                futures::future::ready(())
            })
            .await;
        debug!(kind = %kind, "Cache watch stream ended");
    });

    reader
}

/// Wait until `store` has its initial list, bounded by [`CACHE_SYNC_TIMEOUT`]
pub async fn wait_for_cache<K>(store: &Store<K>, kind: &str) -> Result<(), Error>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    match tokio::time::timeout(CACHE_SYNC_TIMEOUT, store.wait_until_ready()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::internal_with_context(
            "cache",
            format!("{} cache writer dropped: {}", kind, e),
        )),
        Err(_) => Err(Error::internal_with_context(
            "cache",
            format!("timed out waiting for {} cache to sync", kind),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_kubeconfig_file_is_reported() {
        let err = create_client(Some(Path::new("/nonexistent/kubeconfig")))
            .await
            .err().expect("expected create_client to fail");
        assert!(err.to_string().contains("failed to read kubeconfig"));
    }
}
