//! Controller runner
//!
//! Wires ingestion, the work queue, periodic resync and the worker pool
//! together and owns the shutdown sequence: stop watching, shut the queue,
//! then wait for in-flight reconciliations to finish.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubez_common::events::KubeEventPublisher;
use kubez_common::{Error, CONTROLLER_NAME};

use crate::annotations::AnnotationKeys;
use crate::api::{AutoscalerApi, KubeAutoscalerApi, DEFAULT_API_TIMEOUT};
use crate::ingest::EventIngestion;
use crate::queue::{BackoffConfig, WorkQueue};
use crate::reconciler::Context;
use crate::recovery::RecoveryHints;
use crate::worker::WorkerPool;
use crate::workload::{WorkloadKey, WorkloadKind};

/// Default number of reconcile workers
pub const DEFAULT_WORKERS: usize = 2;

/// Default interval between full resyncs
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Runtime settings for the controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Annotation keys to recognize
    pub annotation_keys: AnnotationKeys,
    /// Deadline for each API call
    pub api_timeout: Duration,
    /// Retry schedule for failed keys
    pub backoff: BackoffConfig,
    /// Interval between full resyncs; `None` disables them
    pub resync_interval: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            annotation_keys: AnnotationKeys::default(),
            api_timeout: DEFAULT_API_TIMEOUT,
            backoff: BackoffConfig::default(),
            resync_interval: Some(DEFAULT_RESYNC_INTERVAL),
        }
    }
}

/// The autoscaler controller
pub struct Controller {
    client: Client,
    config: ControllerConfig,
}

impl Controller {
    /// Create a controller talking to the cluster through `client`
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self { client, config }
    }

    /// Run until `cancel` fires, then drain in-flight work.
    ///
    /// Returns an error if any worker stopped on an invariant violation.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let queue = WorkQueue::new(self.config.backoff.clone());
        let recovery = Arc::new(RecoveryHints::new());
        let api: Arc<dyn AutoscalerApi> = Arc::new(KubeAutoscalerApi::with_timeout(
            self.client.clone(),
            self.config.api_timeout,
        ));
        let ctx = Arc::new(
            Context::builder(Arc::clone(&api))
                .events(Arc::new(KubeEventPublisher::new(
                    self.client.clone(),
                    CONTROLLER_NAME,
                )))
                .annotation_keys(self.config.annotation_keys.clone())
                .recovery_hints(Arc::clone(&recovery))
                .build(),
        );

        info!(
            workers = self.config.workers,
            annotation_root = %self.config.annotation_keys.root(),
            "Starting autoscaler controller"
        );

        let ingestion = Arc::new(EventIngestion::new(Arc::clone(&queue), recovery));
        let watches = tokio::spawn(ingestion.run(self.client.clone(), cancel.child_token()));

        let resync = self.config.resync_interval.map(|period| {
            tokio::spawn(resync_loop(
                api,
                self.config.annotation_keys.clone(),
                Arc::clone(&queue),
                period,
                cancel.child_token(),
            ))
        });

        let pool = WorkerPool::spawn(self.config.workers, Arc::clone(&queue), ctx);

        cancel.cancelled().await;
        info!("Shutdown requested, draining work queue");

        queue.shutdown();
        if let Err(e) = watches.await {
            warn!(error = %e, "Watch task ended abnormally");
        }
        if let Some(resync) = resync {
            if let Err(e) = resync.await {
                warn!(error = %e, "Resync task ended abnormally");
            }
        }

        let failed = pool.join().await;
        info!("Autoscaler controller stopped");
        if failed > 0 {
            return Err(Error::internal_with_context(
                "worker",
                format!("{} worker(s) stopped abnormally", failed),
            ));
        }
        Ok(())
    }
}

/// Queue every annotated workload and every managed autoscaler.
///
/// Catches anything a watch may have missed; returns the number of keys
/// offered to the queue.
pub async fn resync(
    api: &dyn AutoscalerApi,
    keys: &AnnotationKeys,
    queue: &WorkQueue<WorkloadKey>,
) -> Result<usize, Error> {
    let mut offered = 0;
    for kind in WorkloadKind::ALL {
        for workload in api.list_workloads(kind).await? {
            if keys.has_any(&workload.annotations) {
                queue.enqueue(workload.key());
                offered += 1;
            }
        }
    }
    for key in api.list_managed_hpas().await? {
        queue.enqueue(key);
        offered += 1;
    }
    Ok(offered)
}

async fn resync_loop(
    api: Arc<dyn AutoscalerApi>,
    keys: AnnotationKeys,
    queue: Arc<WorkQueue<WorkloadKey>>,
    period: Duration,
    cancel: CancellationToken,
) {
    // The watches list everything on start, so the first resync waits a period
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match resync(api.as_ref(), &keys, &queue).await {
                    Ok(offered) => debug!(offered, "Periodic resync queued keys"),
                    Err(e) => warn!(error = %e, "Periodic resync failed"),
                }
            }
        }
    }
}
