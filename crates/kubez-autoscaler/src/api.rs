//! Cluster access for the reconciler
//!
//! [`AutoscalerApi`] is the only way reconciliation touches the cluster, which
//! keeps the reconciler testable against mocks and in-memory fakes.
//! [`KubeAutoscalerApi`] runs every call under the configured deadline.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::ReplicationController;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubez_common::error::is_not_found;
use kubez_common::kube_utils::with_deadline;
use kubez_common::{Error, CONTROLLER_NAME, MANAGED_BY_SELECTOR};

use crate::workload::{SourceWorkload, WorkloadKey, WorkloadKind};

/// Default deadline for a single API call
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Trait abstracting the Kubernetes operations used by reconciliation
///
/// All reads treat not-found as `Ok(None)`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AutoscalerApi: Send + Sync {
    /// Fetch a workload of the given kind
    async fn get_workload(
        &self,
        kind: WorkloadKind,
        key: &WorkloadKey,
    ) -> Result<Option<SourceWorkload>, Error>;

    /// Fetch the autoscaler sharing the workload's name
    async fn get_hpa(&self, key: &WorkloadKey) -> Result<Option<HorizontalPodAutoscaler>, Error>;

    /// Create an autoscaler
    async fn create_hpa(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error>;

    /// Replace an autoscaler; `metadata.resourceVersion` must be set
    async fn replace_hpa(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error>;

    /// Delete an autoscaler, guarded by its UID when known
    ///
    /// Returns `false` when it was already gone.
    async fn delete_hpa(&self, key: &WorkloadKey, uid: Option<String>) -> Result<bool, Error>;

    /// List all workloads of a kind across namespaces
    async fn list_workloads(&self, kind: WorkloadKind) -> Result<Vec<SourceWorkload>, Error>;

    /// Keys of every autoscaler carrying the ownership label
    async fn list_managed_hpas(&self) -> Result<Vec<WorkloadKey>, Error>;
}

/// Real implementation backed by a kube `Client`
pub struct KubeAutoscalerApi {
    client: Client,
    timeout: Duration,
}

impl KubeAutoscalerApi {
    /// Wrap a client with the default per-call deadline
    pub fn new(client: Client) -> Self {
        Self::with_timeout(client, DEFAULT_API_TIMEOUT)
    }

    /// Wrap a client with a custom per-call deadline
    pub fn with_timeout(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn hpas(&self, namespace: &str) -> Api<HorizontalPodAutoscaler> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_source<K>(
        &self,
        kind: WorkloadKind,
        key: &WorkloadKey,
    ) -> Result<Option<SourceWorkload>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let operation = format!("get {}", kind.as_str().to_lowercase());
        let obj = with_deadline(&operation, self.timeout, api.get_opt(&key.name)).await?;
        Ok(obj.map(|o| to_source(kind, &o)))
    }

    async fn list_sources<K>(&self, kind: WorkloadKind) -> Result<Vec<SourceWorkload>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let operation = format!("list {}", kind.as_str().to_lowercase());
        let list = with_deadline(&operation, self.timeout, api.list(&ListParams::default())).await?;
        Ok(list.items.iter().map(|o| to_source(kind, o)).collect())
    }
}

fn to_source<K: Resource>(kind: WorkloadKind, obj: &K) -> SourceWorkload {
    SourceWorkload {
        kind,
        namespace: obj.namespace().unwrap_or_default(),
        name: obj.name_any(),
        uid: obj.uid(),
        annotations: obj.annotations().clone(),
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(CONTROLLER_NAME.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl AutoscalerApi for KubeAutoscalerApi {
    async fn get_workload(
        &self,
        kind: WorkloadKind,
        key: &WorkloadKey,
    ) -> Result<Option<SourceWorkload>, Error> {
        match kind {
            WorkloadKind::Deployment => self.get_source::<Deployment>(kind, key).await,
            WorkloadKind::StatefulSet => self.get_source::<StatefulSet>(kind, key).await,
            WorkloadKind::ReplicationController => {
                self.get_source::<ReplicationController>(kind, key).await
            }
        }
    }

    async fn get_hpa(&self, key: &WorkloadKey) -> Result<Option<HorizontalPodAutoscaler>, Error> {
        let api = self.hpas(&key.namespace);
        with_deadline("get hpa", self.timeout, api.get_opt(&key.name)).await
    }

    async fn create_hpa(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error> {
        let api = self.hpas(&hpa.namespace().unwrap_or_default());
        with_deadline("create hpa", self.timeout, api.create(&post_params(), hpa)).await
    }

    async fn replace_hpa(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error> {
        let api = self.hpas(&hpa.namespace().unwrap_or_default());
        let name = hpa.name_any();
        with_deadline(
            "replace hpa",
            self.timeout,
            api.replace(&name, &post_params(), hpa),
        )
        .await
    }

    async fn delete_hpa(&self, key: &WorkloadKey, uid: Option<String>) -> Result<bool, Error> {
        let api = self.hpas(&key.namespace);
        let params = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid),
                resource_version: None,
            }),
            ..Default::default()
        };
        let result = tokio::time::timeout(self.timeout, api.delete(&key.name, &params)).await;
        match result {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) if is_not_found(&e) => {
                debug!(namespace = %key.namespace, name = %key.name, "HPA already gone");
                Ok(false)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::timeout("delete hpa", self.timeout.as_secs())),
        }
    }

    async fn list_workloads(&self, kind: WorkloadKind) -> Result<Vec<SourceWorkload>, Error> {
        match kind {
            WorkloadKind::Deployment => self.list_sources::<Deployment>(kind).await,
            WorkloadKind::StatefulSet => self.list_sources::<StatefulSet>(kind).await,
            WorkloadKind::ReplicationController => {
                self.list_sources::<ReplicationController>(kind).await
            }
        }
    }

    async fn list_managed_hpas(&self) -> Result<Vec<WorkloadKey>, Error> {
        let api: Api<HorizontalPodAutoscaler> = Api::all(self.client.clone());
        let params = ListParams::default().labels(MANAGED_BY_SELECTOR);
        let list = with_deadline("list hpa", self.timeout, api.list(&params)).await?;
        Ok(list
            .items
            .iter()
            .map(|h| WorkloadKey::new(h.namespace().unwrap_or_default(), h.name_any()))
            .collect())
    }
}
