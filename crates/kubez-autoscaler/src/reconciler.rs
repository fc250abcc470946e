//! Reconciliation of one workload key
//!
//! Every pass starts from a fresh read of the cluster: locate the source
//! workload, parse its annotations, then create, update or delete the
//! autoscaler so that it exists exactly when a valid policy does. Writes
//! happen only when an owned field differs, so repeated passes over
//! unchanged input are free.

use std::sync::Arc;

use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use kubez_common::events::{actions, reasons, EventPublisher, NoopEventPublisher};
use kubez_common::Error;

use crate::annotations::AnnotationKeys;
use crate::api::AutoscalerApi;
use crate::hpa;
use crate::policy::ScalingPolicy;
use crate::recovery::RecoveryHints;
use crate::workload::{SourceWorkload, WorkloadKey, WorkloadKind};

/// Shared state handed to every reconciliation
pub struct Context {
    /// Cluster access (trait object for testability)
    pub api: Arc<dyn AutoscalerApi>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Recognized annotation keys
    pub keys: AnnotationKeys,
    /// Keys whose autoscaler was deleted out-of-band
    pub recovery: Arc<RecoveryHints>,
}

impl Context {
    /// Create a builder around the given cluster access
    pub fn builder(api: Arc<dyn AutoscalerApi>) -> ContextBuilder {
        ContextBuilder::new(api)
    }

    /// Create a context for testing with a mock API and no-op events
    #[cfg(test)]
    pub fn for_testing(api: Arc<dyn AutoscalerApi>) -> Self {
        Self::builder(api).build()
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(Arc::new(KubeAutoscalerApi::new(client.clone())))
///     .events(Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)))
///     .annotation_keys(AnnotationKeys::new("scaling.example.com"))
///     .build();
/// ```
pub struct ContextBuilder {
    api: Arc<dyn AutoscalerApi>,
    events: Option<Arc<dyn EventPublisher>>,
    keys: Option<AnnotationKeys>,
    recovery: Option<Arc<RecoveryHints>>,
}

impl ContextBuilder {
    fn new(api: Arc<dyn AutoscalerApi>) -> Self {
        Self {
            api,
            events: None,
            keys: None,
            recovery: None,
        }
    }

    /// Set the Event sink (defaults to a no-op publisher)
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the annotation keys (defaults to the standard root)
    pub fn annotation_keys(mut self, keys: AnnotationKeys) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Share a recovery hint set with event ingestion
    pub fn recovery_hints(mut self, recovery: Arc<RecoveryHints>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            api: self.api,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            keys: self.keys.unwrap_or_default(),
            recovery: self
                .recovery
                .unwrap_or_else(|| Arc::new(RecoveryHints::new())),
        }
    }
}

/// What a reconciliation did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Autoscaler created for a newly annotated workload
    Created,
    /// Autoscaler recreated after an out-of-band delete
    Recovered,
    /// Autoscaler updated; lists the changed fields
    Updated(Vec<&'static str>),
    /// Autoscaler deleted because the policy or the source went away
    Deleted,
    /// Autoscaler already matches the policy
    Unchanged,
    /// No policy and no managed autoscaler
    NoPolicy,
}

impl ReconcileOutcome {
    /// Whether the pass wrote to the API
    pub fn wrote(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Created
                | ReconcileOutcome::Recovered
                | ReconcileOutcome::Updated(_)
                | ReconcileOutcome::Deleted
        )
    }
}

/// Bring the autoscaler for `key` in line with its source's annotations
///
/// Returns `Err(Error::Validation)` for malformed annotations after
/// recording a Warning event; the caller decides whether to retry.
#[instrument(skip(ctx), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile(key: &WorkloadKey, ctx: &Context) -> Result<ReconcileOutcome, Error> {
    // Keys come from named, namespaced objects; anything else is a bug upstream
    if key.namespace.is_empty() || key.name.is_empty() {
        return Err(Error::internal_with_context(
            "invariant",
            format!("key '{}' does not identify a namespaced workload", key),
        ));
    }

    let Some(source) = find_source(key, ctx).await? else {
        debug!("Source workload not found");
        ctx.recovery.clear(key);
        return delete_managed(key, ctx, None).await;
    };

    let policy = match ctx.keys.parse(&source.annotations) {
        Ok(Some(policy)) => policy,
        Ok(None) => {
            ctx.recovery.clear(key);
            return delete_managed(key, ctx, Some(&source)).await;
        }
        Err(e) => {
            warn!(kind = %source.kind, error = %e, "Invalid scaling annotations");
            ctx.events
                .publish(
                    &source.object_ref(),
                    EventType::Warning,
                    reasons::INVALID_ANNOTATIONS,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            ctx.recovery.clear(key);
            return Err(e.into_error(key));
        }
    };

    let desired = hpa::build(&source, &policy);
    match ctx.api.get_hpa(key).await? {
        None => create(key, ctx, &source, &policy, &desired).await,
        Some(existing) if !hpa::is_managed(&existing) => {
            warn!("HPA with this name exists and is not managed by us");
            ctx.events
                .publish(
                    &source.object_ref(),
                    EventType::Warning,
                    reasons::NAME_CONFLICT,
                    actions::RECONCILE,
                    Some(format!(
                        "HorizontalPodAutoscaler {} already exists and is not managed by {}",
                        key,
                        kubez_common::CONTROLLER_NAME
                    )),
                )
                .await;
            ctx.recovery.clear(key);
            Err(Error::unmanaged(key.to_string()))
        }
        Some(existing) => update(ctx, &source, &existing, &desired).await,
    }
}

/// Locate the source for a key.
///
/// Kinds are tried in lookup order; the first object carrying a recognized
/// annotation wins, otherwise the first object found.
async fn find_source(key: &WorkloadKey, ctx: &Context) -> Result<Option<SourceWorkload>, Error> {
    let mut fallback = None;
    for kind in WorkloadKind::ALL {
        if let Some(source) = ctx.api.get_workload(kind, key).await? {
            if ctx.keys.has_any(&source.annotations) {
                return Ok(Some(source));
            }
            fallback.get_or_insert(source);
        }
    }
    Ok(fallback)
}

async fn create(
    key: &WorkloadKey,
    ctx: &Context,
    source: &SourceWorkload,
    policy: &ScalingPolicy,
    desired: &HorizontalPodAutoscaler,
) -> Result<ReconcileOutcome, Error> {
    if let Err(e) = ctx.api.create_hpa(desired).await {
        return Err(report_rejected_write(ctx, source, actions::CREATE, e).await);
    }
    let recovered = ctx.recovery.take(key);

    let (reason, outcome) = if recovered {
        (reasons::RECOVERED, ReconcileOutcome::Recovered)
    } else {
        (reasons::CREATED, ReconcileOutcome::Created)
    };
    info!(
        kind = %source.kind,
        metric = %policy.metric.metric_type(),
        min_replicas = policy.min_replicas,
        max_replicas = policy.max_replicas,
        recovered,
        "Created HPA"
    );
    ctx.events
        .publish(
            &source.object_ref(),
            EventType::Normal,
            reason,
            actions::CREATE,
            Some(format!(
                "HorizontalPodAutoscaler {} scaling {} between {} and {} replicas",
                key,
                policy.metric.metric_type(),
                policy.min_replicas,
                policy.max_replicas
            )),
        )
        .await;
    Ok(outcome)
}

async fn update(
    ctx: &Context,
    source: &SourceWorkload,
    existing: &HorizontalPodAutoscaler,
    desired: &HorizontalPodAutoscaler,
) -> Result<ReconcileOutcome, Error> {
    let changed = hpa::changed_fields(existing, desired);
    if changed.is_empty() {
        debug!("HPA up to date");
        return Ok(ReconcileOutcome::Unchanged);
    }

    // Carries the observed resourceVersion, so a concurrent edit is a 409
    let merged = hpa::merge_desired(existing, desired);
    if let Err(e) = ctx.api.replace_hpa(&merged).await {
        return Err(report_rejected_write(ctx, source, actions::UPDATE, e).await);
    }

    info!(kind = %source.kind, fields = ?changed, "Updated HPA");
    ctx.events
        .publish(
            &source.object_ref(),
            EventType::Normal,
            reasons::UPDATED,
            actions::UPDATE,
            Some(format!("Changed {}", changed.join(", "))),
        )
        .await;
    Ok(ReconcileOutcome::Updated(changed))
}

/// Surface a write the API server refused outright as a Warning on the
/// source. Transient failures are retried and only logged.
async fn report_rejected_write(
    ctx: &Context,
    source: &SourceWorkload,
    action: &str,
    err: Error,
) -> Error {
    if let Error::Kube {
        source: kube::Error::Api(response),
    } = &err
    {
        if !err.is_retryable() {
            warn!(kind = %source.kind, code = response.code, error = %err, "HPA write rejected");
            ctx.events
                .publish(
                    &source.object_ref(),
                    EventType::Warning,
                    reasons::REJECTED,
                    action,
                    Some(format!(
                        "HorizontalPodAutoscaler {}/{} rejected ({}): {}",
                        source.namespace, source.name, response.code, response.message
                    )),
                )
                .await;
        }
    }
    err
}

async fn delete_managed(
    key: &WorkloadKey,
    ctx: &Context,
    source: Option<&SourceWorkload>,
) -> Result<ReconcileOutcome, Error> {
    let Some(existing) = ctx.api.get_hpa(key).await? else {
        return Ok(ReconcileOutcome::NoPolicy);
    };
    if !hpa::is_managed(&existing) {
        debug!("Leaving unmanaged HPA alone");
        return Ok(ReconcileOutcome::NoPolicy);
    }

    if !ctx.api.delete_hpa(key, existing.uid()).await? {
        return Ok(ReconcileOutcome::NoPolicy);
    }
    info!(source_present = source.is_some(), "Deleted HPA");

    // A deleted source cannot carry events
    if let Some(source) = source {
        ctx.events
            .publish(
                &source.object_ref(),
                EventType::Normal,
                reasons::DELETED,
                actions::DELETE,
                Some(format!(
                    "Scaling annotations removed, deleted HorizontalPodAutoscaler {}",
                    key
                )),
            )
            .await;
    }
    Ok(ReconcileOutcome::Deleted)
}
