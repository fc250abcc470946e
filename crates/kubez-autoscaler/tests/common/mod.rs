//! In-memory cluster and harness shared by the flow tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::error::ErrorResponse;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use parking_lot::Mutex;

use kubez_autoscaler::api::AutoscalerApi;
use kubez_autoscaler::ingest::{ChangeType, EventIngestion, WatchedKind};
use kubez_autoscaler::queue::{BackoffConfig, WorkQueue};
use kubez_autoscaler::recovery::RecoveryHints;
use kubez_autoscaler::worker::WorkerPool;
use kubez_autoscaler::{Context, SourceWorkload, WorkloadKey, WorkloadKind};
use kubez_common::events::EventPublisher;
use kubez_common::{Error, MANAGED_BY_LABEL_KEY};

pub const ROOT: &str = "hpa.caoyingjunz.autoscaler";

/// Annotation map with `{root}` expanded to the default root
pub fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.replace("{root}", ROOT), v.to_string()))
        .collect()
}

fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

#[derive(Default)]
struct State {
    workloads: HashMap<(WorkloadKind, WorkloadKey), SourceWorkload>,
    hpas: HashMap<WorkloadKey, HorizontalPodAutoscaler>,
    writes: usize,
    next_id: u64,
    failing_writes: usize,
}

/// Cluster state held in memory, with API-server-like write semantics:
/// UIDs and resourceVersions are assigned on write, stale replaces and
/// mismatched delete preconditions conflict.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_workload(
        &self,
        kind: WorkloadKind,
        key: &WorkloadKey,
        annotations: BTreeMap<String, String>,
    ) {
        let mut state = self.state.lock();
        state.next_id += 1;
        let uid = format!("workload-{}", state.next_id);
        let entry = state
            .workloads
            .entry((kind, key.clone()))
            .or_insert_with(|| SourceWorkload {
                kind,
                namespace: key.namespace.clone(),
                name: key.name.clone(),
                uid: Some(uid),
                annotations: BTreeMap::new(),
            });
        entry.annotations = annotations;
    }

    pub fn remove_workload(&self, kind: WorkloadKind, key: &WorkloadKey) {
        self.state.lock().workloads.remove(&(kind, key.clone()));
    }

    pub fn hpa(&self, key: &WorkloadKey) -> Option<HorizontalPodAutoscaler> {
        self.state.lock().hpas.get(key).cloned()
    }

    /// Someone else deletes the HPA
    pub fn delete_hpa_out_of_band(&self, key: &WorkloadKey) -> Option<HorizontalPodAutoscaler> {
        self.state.lock().hpas.remove(key)
    }

    /// Someone else creates an HPA we do not own
    pub fn put_foreign_hpa(&self, key: &WorkloadKey) {
        let mut hpa = HorizontalPodAutoscaler::default();
        hpa.metadata.name = Some(key.name.clone());
        hpa.metadata.namespace = Some(key.namespace.clone());
        hpa.metadata.uid = Some("foreign".to_string());
        hpa.metadata.resource_version = Some("1".to_string());
        self.state.lock().hpas.insert(key.clone(), hpa);
    }

    /// Fail the next `n` writes with 503
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().failing_writes = n;
    }

    /// Successful create/replace/delete calls so far
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    fn check_failure(state: &mut State) -> Result<(), Error> {
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(api_error(503, "ServiceUnavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl AutoscalerApi for FakeCluster {
    async fn get_workload(
        &self,
        kind: WorkloadKind,
        key: &WorkloadKey,
    ) -> Result<Option<SourceWorkload>, Error> {
        Ok(self.state.lock().workloads.get(&(kind, key.clone())).cloned())
    }

    async fn get_hpa(&self, key: &WorkloadKey) -> Result<Option<HorizontalPodAutoscaler>, Error> {
        Ok(self.hpa(key))
    }

    async fn create_hpa(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error> {
        let mut state = self.state.lock();
        Self::check_failure(&mut state)?;
        let key = WorkloadKey::new(hpa.namespace().unwrap_or_default(), hpa.name_any());
        if state.hpas.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.next_id += 1;
        let mut stored = hpa.clone();
        stored.metadata.uid = Some(format!("hpa-{}", state.next_id));
        stored.metadata.resource_version = Some(state.next_id.to_string());
        state.hpas.insert(key, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn replace_hpa(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error> {
        let mut state = self.state.lock();
        Self::check_failure(&mut state)?;
        let key = WorkloadKey::new(hpa.namespace().unwrap_or_default(), hpa.name_any());
        let current_rv = match state.hpas.get(&key) {
            Some(current) => current.metadata.resource_version.clone(),
            None => return Err(api_error(404, "NotFound")),
        };
        if hpa.metadata.resource_version != current_rv {
            return Err(api_error(409, "Conflict"));
        }
        state.next_id += 1;
        let mut stored = hpa.clone();
        stored.metadata.resource_version = Some(state.next_id.to_string());
        state.hpas.insert(key, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn delete_hpa(&self, key: &WorkloadKey, uid: Option<String>) -> Result<bool, Error> {
        let mut state = self.state.lock();
        Self::check_failure(&mut state)?;
        let Some(current) = state.hpas.get(key) else {
            return Ok(false);
        };
        if uid.is_some() && current.metadata.uid != uid {
            return Err(api_error(409, "Conflict"));
        }
        state.hpas.remove(key);
        state.writes += 1;
        Ok(true)
    }

    async fn list_workloads(&self, kind: WorkloadKind) -> Result<Vec<SourceWorkload>, Error> {
        Ok(self
            .state
            .lock()
            .workloads
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, w)| w.clone())
            .collect())
    }

    async fn list_managed_hpas(&self) -> Result<Vec<WorkloadKey>, Error> {
        Ok(self
            .state
            .lock()
            .hpas
            .iter()
            .filter(|(_, h)| h.labels().contains_key(MANAGED_BY_LABEL_KEY))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Captures published events
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(EventType, String)>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn warnings(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(t, _)| *t == EventType::Warning)
            .count()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events.lock().push((type_, reason.to_string()));
    }
}

/// Queue, ingestion and workers running against a [`FakeCluster`]
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub events: Arc<RecordingEvents>,
    pub queue: Arc<WorkQueue<WorkloadKey>>,
    pub ingestion: EventIngestion,
    pool: WorkerPool,
}

impl Harness {
    pub fn start(workers: usize) -> Self {
        let cluster = FakeCluster::new();
        let events = Arc::new(RecordingEvents::default());
        let queue = WorkQueue::new(BackoffConfig::new(
            Duration::from_millis(1),
            Duration::from_millis(20),
        ));
        let recovery = Arc::new(RecoveryHints::new());
        let ctx = Arc::new(
            Context::builder(cluster.clone())
                .events(events.clone())
                .recovery_hints(Arc::clone(&recovery))
                .build(),
        );
        let ingestion = EventIngestion::new(Arc::clone(&queue), recovery);
        let pool = WorkerPool::spawn(workers, Arc::clone(&queue), ctx);
        Self {
            cluster,
            events,
            queue,
            ingestion,
            pool,
        }
    }

    /// A workload notification
    pub fn workload_changed(&self, kind: WorkloadKind, key: &WorkloadKey) {
        self.ingestion
            .on_change(WatchedKind::Workload(kind), ChangeType::Applied, key.clone());
    }

    /// A workload delete notification
    pub fn workload_deleted(&self, kind: WorkloadKind, key: &WorkloadKey) {
        self.ingestion
            .on_change(WatchedKind::Workload(kind), ChangeType::Deleted, key.clone());
    }

    /// A managed HPA notification
    pub fn hpa_changed(&self, change: ChangeType, key: &WorkloadKey) {
        self.ingestion
            .on_change(WatchedKind::HorizontalPodAutoscaler, change, key.clone());
    }

    /// Wait until nothing is queued, in flight, or backing off
    pub async fn settle(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut quiet_rounds = 0;
        while quiet_rounds < 5 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "queue did not settle"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.queue.is_empty() && self.queue.in_flight() == 0 {
                quiet_rounds += 1;
            } else {
                quiet_rounds = 0;
            }
        }
    }

    /// Shut down and return the number of abnormally stopped workers
    pub async fn stop(self) -> usize {
        self.queue.shutdown();
        self.queue.wait_idle().await;
        self.pool.join().await
    }
}
