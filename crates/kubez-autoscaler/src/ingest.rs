//! Event ingestion
//!
//! Watches the three workload kinds and managed autoscalers and turns every
//! notification into a [`WorkloadKey`] on the work queue. Object contents
//! are never inspected: the reconciler re-reads the cluster itself.

use std::fmt::{self, Debug};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::ReplicationController;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use kubez_common::MANAGED_BY_SELECTOR;

use crate::queue::WorkQueue;
use crate::recovery::RecoveryHints;
use crate::workload::{WorkloadKey, WorkloadKind};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Resource kinds that produce notifications
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchedKind {
    /// A source workload
    Workload(WorkloadKind),
    /// A managed HorizontalPodAutoscaler
    HorizontalPodAutoscaler,
}

impl WatchedKind {
    /// Every watched kind
    pub const ALL: [WatchedKind; 4] = [
        WatchedKind::Workload(WorkloadKind::Deployment),
        WatchedKind::Workload(WorkloadKind::StatefulSet),
        WatchedKind::Workload(WorkloadKind::ReplicationController),
        WatchedKind::HorizontalPodAutoscaler,
    ];

    /// Kubernetes kind name
    pub fn as_str(self) -> &'static str {
        match self {
            WatchedKind::Workload(kind) => kind.as_str(),
            WatchedKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
        }
    }
}

impl fmt::Display for WatchedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the watched object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    /// Created, updated, or listed during a (re)initialization
    Applied,
    /// Deleted
    Deleted,
}

/// Single entry point for cluster notifications
pub struct EventIngestion {
    queue: Arc<WorkQueue<WorkloadKey>>,
    recovery: Arc<RecoveryHints>,
}

impl EventIngestion {
    /// Create an ingestion front-end feeding `queue`
    pub fn new(queue: Arc<WorkQueue<WorkloadKey>>, recovery: Arc<RecoveryHints>) -> Self {
        Self { queue, recovery }
    }

    /// Record a notification and queue its key
    pub fn on_change(&self, kind: WatchedKind, change: ChangeType, key: WorkloadKey) {
        if kind == WatchedKind::HorizontalPodAutoscaler && change == ChangeType::Deleted {
            info!(
                namespace = %key.namespace,
                name = %key.name,
                "Managed HPA deleted, scheduling recovery check"
            );
            self.recovery.mark_deleted(&key);
        } else {
            trace!(%kind, ?change, namespace = %key.namespace, name = %key.name, "Change observed");
        }
        self.queue.enqueue(key);
    }

    /// Translate one watcher event
    pub fn handle_event<K>(&self, kind: WatchedKind, event: Result<Event<K>, watcher::Error>)
    where
        K: Resource,
    {
        match event {
            Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
                if let Some(key) = key_of(&obj) {
                    self.on_change(kind, ChangeType::Applied, key);
                }
            }
            Ok(Event::Delete(obj)) => {
                if let Some(key) = key_of(&obj) {
                    self.on_change(kind, ChangeType::Deleted, key);
                }
            }
            Ok(Event::Init) => debug!(%kind, "Watch (re)starting"),
            Ok(Event::InitDone) => debug!(%kind, "Watch initialized"),
            Err(e) => warn!(%kind, error = %e, "Watcher error, will retry"),
        }
    }

    /// Watch one resource kind until `cancel` fires.
    ///
    /// Stream failures are retried by the watcher's backoff.
    pub async fn watch<K>(
        &self,
        api: Api<K>,
        kind: WatchedKind,
        config: watcher::Config,
        cancel: CancellationToken,
    ) where
        K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
        K::DynamicType: Default,
    {
        let stream = watcher::watcher(api, config).default_backoff();
        let mut stream = std::pin::pin!(stream);
        info!(%kind, "Watching");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(event) => self.handle_event(kind, event),
                    None => break,
                },
            }
        }
        info!(%kind, "Watch stopped");
    }

    /// Watch every kind, returning when all watches have stopped
    pub async fn run(self: Arc<Self>, client: Client, cancel: CancellationToken) {
        let workload_config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let hpa_config = watcher::Config::default()
            .timeout(WATCH_TIMEOUT_SECS)
            .labels(MANAGED_BY_SELECTOR);

        tokio::join!(
            self.watch(
                Api::<Deployment>::all(client.clone()),
                WatchedKind::Workload(WorkloadKind::Deployment),
                workload_config.clone(),
                cancel.clone(),
            ),
            self.watch(
                Api::<StatefulSet>::all(client.clone()),
                WatchedKind::Workload(WorkloadKind::StatefulSet),
                workload_config.clone(),
                cancel.clone(),
            ),
            self.watch(
                Api::<ReplicationController>::all(client.clone()),
                WatchedKind::Workload(WorkloadKind::ReplicationController),
                workload_config,
                cancel.clone(),
            ),
            self.watch(
                Api::<HorizontalPodAutoscaler>::all(client),
                WatchedKind::HorizontalPodAutoscaler,
                hpa_config,
                cancel,
            ),
        );
    }
}

fn key_of<K: Resource>(obj: &K) -> Option<WorkloadKey> {
    let namespace = obj.namespace()?;
    let name = obj.meta().name.clone()?;
    Some(WorkloadKey::new(namespace, name))
}
