//! Kubernetes resource watchers.
//!
//! IPPools and the VxNetPool go through a generic `watch_resource()` helper
//! built on kube_runtime::Controller. Namespace auto-assignment is not tied
//! to one object, so it runs as its own worker over merged watch streams.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::{IPAMBlock, IPPool, VxNetPool};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{Controller, WatchStreamExt, watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, warn};

type ReconcileFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Action, ControllerError>> + Send>>;

/// Runs a kube_runtime::Controller over `api` until its stream ends.
///
/// Failed reconciles requeue with a per-object Fibonacci backoff, except
/// validation failures which wait for the object to change. With `resync`
/// set every object is also reconciled on that period.
async fn watch_resource<K, F>(
    api: Api<K>,
    config: watcher::Config,
    resync: Option<Duration>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &'static str,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let name = obj.name_any();
        if let ControllerError::Validation(_) = error {
            warn!("{} {} is invalid, waiting for a change: {}", resource_name, name, error);
            return Action::await_change();
        }
        let delay = ctx.backoff(&name);
        error!("Reconciliation error for {} {}: {} (retry in {:?})", resource_name, name, error, delay);
        Action::requeue(delay)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let name = obj.name_any();
            debug!("Reconciling {} {}", resource_name, name);
            let action = reconcile_fn(ctx.clone(), obj).await?;
            ctx.reset_backoff(&name);
            Ok::<_, ControllerError>(action)
        }
    };

    // Debounce batches bursts of events; 3 reconciles at a time per kind
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(5))
        .concurrency(3);

    let mut controller = Controller::new(api, config).with_config(controller_config);
    if let Some(period) = resync {
        controller = controller.reconcile_all_on(IntervalStream::new(tokio::time::interval(period)).map(|_| ()));
    }
    controller
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                debug!("Controller error for {}: {}", resource_name, e);
            }
        })
        .await;

    Err(ControllerError::Watch(format!("{} controller stream ended", resource_name)))
}

/// Unit stream of watch events; watch errors are logged and retried with
/// the default watcher backoff
fn changes<K>(api: Api<K>, kind: &'static str) -> BoxStream<'static, ()>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(move |event| async move {
            match event {
                Ok(_) => Some(()),
                Err(e) => {
                    warn!("{} watch error: {}", kind, e);
                    None
                }
            }
        })
        .boxed()
}

/// Calls `reconcile` once per batch of `triggers` that are ready together
async fn drive<S, F, Fut>(triggers: S, reconcile: F)
where
    S: Stream<Item = ()> + Send,
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), ControllerError>>,
{
    let batches = triggers.ready_chunks(256);
    futures::pin_mut!(batches);
    while let Some(batch) = batches.next().await {
        debug!("Namespace assignment triggered by {} events", batch.len());
        if let Err(e) = reconcile().await {
            error!("Namespace subnet assignment failed: {}", e);
        }
    }
}

/// Watches Kubernetes resources for changes.
#[derive(Debug)]
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    ippool_api: Api<IPPool>,
    vxnetpool_api: Api<VxNetPool>,
    namespace_api: Api<Namespace>,
    block_api: Api<IPAMBlock>,
    vxnetpool_name: String,
    sync_period: Duration,
}

impl Watcher {
    pub fn new(
        reconciler: Arc<Reconciler>,
        ippool_api: Api<IPPool>,
        vxnetpool_api: Api<VxNetPool>,
        namespace_api: Api<Namespace>,
        block_api: Api<IPAMBlock>,
        vxnetpool_name: String,
        sync_period: Duration,
    ) -> Self {
        Self {
            reconciler,
            ippool_api,
            vxnetpool_api,
            namespace_api,
            block_api,
            vxnetpool_name,
            sync_period,
        }
    }

    pub async fn watch_ippools(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.ippool_api.clone(),
            watcher::Config::default(),
            None,
            self.reconciler.clone(),
            |reconciler, pool| Box::pin(async move { reconciler.reconcile_ippool(&pool).await }),
            "IPPool",
        )
        .await
    }

    /// Only the configured VxNetPool is reconciled; it is also resynced on
    /// the sync period because VIP jobs finish outside the cluster
    pub async fn watch_vxnet_pools(&self) -> Result<(), ControllerError> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.vxnetpool_name));
        watch_resource(
            self.vxnetpool_api.clone(),
            config,
            Some(self.sync_period),
            self.reconciler.clone(),
            |reconciler, pool| Box::pin(async move { reconciler.reconcile_vxnet_pool(&pool).await }),
            "VxNetPool",
        )
        .await
    }

    /// Recomputes namespace subnets on namespace, block and VxNetPool
    /// changes, and on the sync period so failed writes are retried
    pub async fn watch_namespaces(&self) -> Result<(), ControllerError> {
        info!("Starting namespace assignment watcher");
        let tick = IntervalStream::new(tokio::time::interval(self.sync_period * 6))
            .map(|_| ())
            .boxed();
        let triggers = stream::select_all(vec![
            changes(self.namespace_api.clone(), "Namespace"),
            changes(self.block_api.clone(), "IPAMBlock"),
            changes(self.vxnetpool_api.clone(), "VxNetPool"),
            tick,
        ]);
        drive(triggers, || self.reconciler.reconcile_namespaces(&self.vxnetpool_name)).await;
        Err(ControllerError::Watch("namespace watch streams ended".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_drive_batches_ready_events() {
        let calls = AtomicUsize::new(0);
        drive(stream::iter(vec![(); 10]), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drive_survives_failures() {
        let calls = AtomicUsize::new(0);
        let (tx, rx) = futures::channel::mpsc::unbounded();
        tx.unbounded_send(()).unwrap();
        let handle = drive(rx, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ControllerError::Watch("boom".to_string()))
        });
        futures::pin_mut!(handle);

        // first batch fails, the worker keeps waiting for more events
        assert!(futures::poll!(handle.as_mut()).is_pending());
        tx.unbounded_send(()).unwrap();
        assert!(futures::poll!(handle.as_mut()).is_pending());
        drop(tx);
        handle.await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
