//! kube-runtime wiring: watches Brokers, drives the engine through the
//! finalizer and publishes status.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{Broker, BrokerStatus};
use crate::engine::Engine;
use crate::error::ReconcileError;

pub const FINALIZER: &str = "brokers.eventing.knative.dev";
pub const CONTROLLER_NAME: &str = "kafka-broker-controller";

/// Must stay below the client read timeout so idle watches are closed by
/// the API server first.
const WATCH_TIMEOUT_SECS: u32 = 25;

pub struct Context {
    pub client: Client,
    pub engine: Engine,
    pub cancel: CancellationToken,
}

pub async fn reconcile(broker: Arc<Broker>, ctx: Arc<Context>) -> Result<Action, FinalizerError<ReconcileError>> {
    if !broker.is_kafka_class() {
        return Ok(Action::await_change());
    }
    let api: Api<Broker> = Api::namespaced(ctx.client.clone(), broker.namespace_or_default());
    finalizer(&api, FINALIZER, broker, |event| {
        let ctx = ctx.clone();
        let api = api.clone();
        async move {
            match event {
                FinalizerEvent::Apply(b) => apply(&b, &ctx, &api).await,
                FinalizerEvent::Cleanup(b) => cleanup(&b, &ctx).await,
            }
        }
    })
    .await
}

async fn apply(broker: &Broker, ctx: &Context, api: &Api<Broker>) -> Result<Action, ReconcileError> {
    let report = ctx.engine.reconcile(broker, &ctx.cancel).await;
    let mut status = report.status;
    status.observed_generation = broker.metadata.generation;
    patch_status(api, broker, &status).await?;
    report.result.map(|_| Action::await_change())
}

async fn cleanup(broker: &Broker, ctx: &Context) -> Result<Action, ReconcileError> {
    ctx.engine.finalize(broker, &ctx.cancel).await?;
    Ok(Action::await_change())
}

/// Merge-patch the status subresource; skipped when nothing changed so a
/// status write does not trigger another round.
async fn patch_status(api: &Api<Broker>, broker: &Broker, status: &BrokerStatus) -> Result<(), ReconcileError> {
    if broker.status.as_ref() == Some(status) {
        return Ok(());
    }
    let patch = serde_json::json!({ "status": status });
    api.patch_status(broker.name_or_empty(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(ReconcileError::Status)?;
    Ok(())
}

pub fn error_policy(_broker: Arc<Broker>, err: &FinalizerError<ReconcileError>, _ctx: Arc<Context>) -> Action {
    let delay = match err {
        FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e.requeue_after(),
        _ => Duration::from_secs(5),
    };
    Action::requeue(delay)
}

/// Run the Broker controller until `ctx.cancel` fires.
pub async fn run(ctx: Arc<Context>) {
    let brokers: Api<Broker> = Api::all(ctx.client.clone());
    let shutdown = ctx.cancel.clone().cancelled_owned();
    info!(controller = CONTROLLER_NAME, "starting broker controller");
    Controller::new(brokers, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .graceful_shutdown_on(shutdown)
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(broker = %obj.name, namespace = ?obj.namespace, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile failed"),
            }
        })
        .await;
    info!("broker controller stopped");
}
