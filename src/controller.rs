//! Grant controller
//!
//! Runs a kube-runtime [`Controller`] per grant kind on the management
//! cluster. Applied grants ensure their user's principal and a failed
//! reconcile is requeued. A deleted grant leaves nothing to reconcile, so a
//! periodic [`ImpersonationManager::sweep`] removes principals whose users
//! have no grants left, including deletes missed while the controller was
//! down.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, StreamExt};
use kube::api::{Api, DynamicObject};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::lifecycle::ImpersonationManager;
use crate::management::{parse_grant, Grant, GrantKind};
use crate::Error;

/// Delay before a failed grant reconcile runs again
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Periodic re-reconcile of a healthy grant, repairing drift on the cluster
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Default period of the principal sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// What a grant asks of the manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrantAction {
    /// Ensure the user's principal, optionally with an extra group
    Ensure {
        /// User to provision
        user: String,
        /// Group principal named by the grant
        group: Option<String>,
    },
    /// Remove the user's principal if nothing references it any more
    Remove {
        /// User whose grant is going away
        user: String,
    },
}

/// Map a grant to an action on `cluster`.
///
/// Grants for other clusters and group-only grants yield nothing. A grant
/// marked for deletion is a removal.
pub fn grant_action(cluster: &str, grant: &Grant) -> Option<GrantAction> {
    let user = grant.user_name.clone()?;
    if grant.cluster.as_deref() != Some(cluster) {
        return None;
    }
    if grant.deleting {
        Some(GrantAction::Remove { user })
    } else {
        Some(GrantAction::Ensure {
            user,
            group: grant.group_principal_name.clone(),
        })
    }
}

/// Shared state for one grant kind's controller
pub struct Context {
    manager: Arc<ImpersonationManager>,
    kind: GrantKind,
}

impl Context {
    /// Context reconciling `kind` grants through `manager`
    pub fn new(manager: Arc<ImpersonationManager>, kind: GrantKind) -> Self {
        Self { manager, kind }
    }
}

/// Reconcile one grant.
///
/// An undecodable grant is logged and left until it changes.
#[instrument(skip(grant, ctx), fields(kind = ctx.kind.kind(), grant = %grant.name_any()))]
pub async fn reconcile(grant: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action, Error> {
    let parsed = match parse_grant(ctx.kind, &grant) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Skipping undecodable grant");
            return Ok(Action::await_change());
        }
    };
    let Some(action) = grant_action(ctx.manager.cluster_name(), &parsed) else {
        return Ok(Action::await_change());
    };

    debug!(?action, "Reconciling grant");
    match action {
        GrantAction::Ensure { user, group } => {
            ctx.manager.ensure_principal(&user, group.as_deref()).await?;
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        GrantAction::Remove { user } => {
            ctx.manager.remove_principal(&user).await?;
            Ok(Action::await_change())
        }
    }
}

/// Requeue a failed grant after [`ERROR_REQUEUE`]
pub fn error_policy(grant: Arc<DynamicObject>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        kind = ctx.kind.kind(),
        grant = %grant.name_any(),
        "Grant reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

fn grant_controller(
    client: Client,
    manager: Arc<ImpersonationManager>,
    kind: GrantKind,
) -> BoxFuture<'static, ()> {
    let resource = kind.api_resource();
    let grants: Api<DynamicObject> = Api::all_with(client, &resource);
    let ctx = Arc::new(Context::new(manager, kind));

    Controller::new_with(grants, watcher::Config::default(), resource)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| async move {
            match result {
                Ok((grant, action)) => {
                    debug!(kind = kind.kind(), grant = %grant.name, ?action, "Grant reconciliation completed");
                }
                Err(controller::Error::ObjectNotFound(grant)) => {
                    debug!(kind = kind.kind(), grant = %grant.name, "Grant deleted before reconcile");
                }
                Err(e) => {
                    error!(kind = kind.kind(), error = ?e, "Grant reconciliation error");
                }
            }
        })
        .boxed()
}

async fn sweep_periodically(manager: Arc<ImpersonationManager>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = manager.sweep().await {
            warn!(error = %e, "Principal sweep failed");
        }
    }
}

/// Run both grant controllers and the sweep until a shutdown signal.
pub async fn run(manager: Arc<ImpersonationManager>, client: Client, sweep_interval: Duration) {
    info!(cluster = %manager.cluster_name(), "Starting grant controllers");
    info!("  - ClusterRoleTemplateBinding controller");
    info!("  - ProjectRoleTemplateBinding controller");

    let controllers = future::join_all(
        [GrantKind::Cluster, GrantKind::Project]
            .map(|kind| grant_controller(client.clone(), manager.clone(), kind)),
    );

    tokio::select! {
        _ = controllers => {
            info!("Grant controllers stopped");
        }
        _ = sweep_periodically(manager, sweep_interval) => {}
    }
}
