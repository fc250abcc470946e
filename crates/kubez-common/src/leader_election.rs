//! Leader election using Kubernetes Leases
//!
//! Only the lease holder runs watches and workers, so two replicas never
//! reconcile the same workload at once.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and we retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::CONTROLLER_NAME;

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Lease object came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Lease timing and identity
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// Lease object name
    pub lease_name: String,
    /// Namespace holding the lease
    pub namespace: String,
    /// Identity written as holder (usually the pod name)
    pub identity: String,
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How often the holder renews
    pub renew_interval: Duration,
    /// How often candidates retry acquisition
    pub retry_interval: Duration,
}

impl LeaderElectionConfig {
    /// Config with the platform's component defaults (15s lease, 10s renew, 2s retry)
    pub fn new(
        lease_name: impl Into<String>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            lease_name: lease_name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
        }
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    config: LeaderElectionConfig,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create a new leader elector
    pub fn new(client: Client, config: LeaderElectionConfig) -> Self {
        Self {
            client,
            config,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this instance currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lease; `LeaderGuard::lost` resolves
    /// when a renewal fails.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard, LeaderElectionError> {
        info!(
            identity = %self.config.identity,
            lease = %self.config.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.config.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Ok(self.create_guard());
                }
                Ok(false) => {
                    debug!(identity = %self.config.identity, "Lease held by another, waiting...");
                }
                Err(e) => {
                    warn!(
                        identity = %self.config.identity,
                        error = %e,
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let now = Utc::now();

        let Some(lease) = api.get_opt(&self.config.lease_name).await? else {
            return self.create_lease(&api, now).await;
        };

        let spec = lease.spec.as_ref();
        if spec.and_then(|s| s.holder_identity.as_ref()) == Some(&self.config.identity) {
            return self.write_lease(&api, &lease, now, false).await;
        }

        let renew_time = spec.and_then(|s| s.renew_time.as_ref());
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        if lease_expired(renew_time.map(|t| t.0), duration_secs, now) {
            self.write_lease(&api, &lease, now, true).await
        } else {
            Ok(false)
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.config.lease_name.clone()),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, now, 0)),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.config.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Renew our own lease or take over an expired one, guarded by resourceVersion
    async fn write_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        now: chrono::DateTime<Utc>,
        take_over: bool,
    ) -> Result<bool, LeaderElectionError> {
        let resource_version = existing
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.config.lease_name.clone()))?;

        let spec = existing.spec.as_ref();
        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        let (acquire_time, transitions) = if take_over {
            (now, transitions + 1)
        } else {
            let acquired = spec
                .and_then(|s| s.acquire_time.as_ref())
                .map(|t| t.0)
                .unwrap_or(now);
            (acquired, transitions)
        };

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.config.lease_name.clone()),
                namespace: Some(self.config.namespace.clone()),
                resource_version: Some(resource_version),
                ..Default::default()
            },
            spec: Some(self.lease_spec(acquire_time, now, transitions)),
        };

        match api
            .replace(&self.config.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                if take_over {
                    info!(identity = %self.config.identity, transitions, "Took over expired lease");
                } else {
                    debug!(identity = %self.config.identity, "Lease renewed");
                }
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.config.identity, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lease_spec(
        &self,
        acquire_time: chrono::DateTime<Utc>,
        renew_time: chrono::DateTime<Utc>,
        transitions: i32,
    ) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(acquire_time)),
            renew_time: Some(MicroTime(renew_time)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.config.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.config.identity, "Leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.config.namespace);

        let Some(lease) = api.get_opt(&self.config.lease_name).await? else {
            return Ok(());
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.config.identity) {
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });

        api.patch(
            &self.config.lease_name,
            &PatchParams::apply(CONTROLLER_NAME).force(),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.config.identity, "Lease released for fast failover");
        Ok(())
    }
}

/// Whether a lease last renewed at `renew_time` has run out at `now`
fn lease_expired(
    renew_time: Option<chrono::DateTime<Utc>>,
    duration_secs: Option<i32>,
    now: chrono::DateTime<Utc>,
) -> bool {
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership by clearing the lease holder
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.config.identity, "Leadership released");
    }
}
