//! Derived HorizontalPodAutoscaler construction and diffing
//!
//! [`build`] renders a [`ScalingPolicy`] into an `autoscaling/v2` object named
//! after its source. [`changed_fields`] compares only the fields this
//! controller owns, so server-side defaults (behavior, status) never look
//! like drift, and quantities compare by value rather than spelling.

use std::collections::BTreeMap;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, ExternalMetricSource, HorizontalPodAutoscaler,
    HorizontalPodAutoscalerSpec, MetricIdentifier, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use kubez_common::{CONTROLLER_NAME, MANAGED_BY_LABEL_KEY};

use crate::policy::{quantities_equal, Metric, ScalingPolicy, ScalingTarget};
use crate::workload::SourceWorkload;

const RESOURCE: &str = "Resource";
const EXTERNAL: &str = "External";
const UTILIZATION: &str = "Utilization";
const AVERAGE_VALUE: &str = "AverageValue";

/// Build the desired autoscaler for `source`
pub fn build(source: &SourceWorkload, policy: &ScalingPolicy) -> HorizontalPodAutoscaler {
    HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(source.name.clone()),
            namespace: Some(source.namespace.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL_KEY.to_string(),
                CONTROLLER_NAME.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some(source.kind.api_version().to_string()),
                kind: source.kind.as_str().to_string(),
                name: source.name.clone(),
            },
            min_replicas: Some(policy.min_replicas),
            max_replicas: policy.max_replicas,
            metrics: Some(vec![metric_spec(&policy.metric)]),
            behavior: None,
        }),
        status: None,
    }
}

fn metric_spec(metric: &Metric) -> MetricSpec {
    match metric {
        Metric::Cpu(target) => resource_metric("cpu", target),
        Metric::Memory(target) => resource_metric("memory", target),
        Metric::External { name, target } => MetricSpec {
            type_: EXTERNAL.to_string(),
            external: Some(ExternalMetricSource {
                metric: MetricIdentifier {
                    name: name.clone(),
                    selector: None,
                },
                // External metrics only accept Value/AverageValue targets
                target: match target {
                    ScalingTarget::Utilization(percent) => average_value(percent.to_string()),
                    ScalingTarget::AverageValue(quantity) => average_value(quantity.clone()),
                },
            }),
            ..Default::default()
        },
    }
}

fn resource_metric(resource: &str, target: &ScalingTarget) -> MetricSpec {
    let target = match target {
        ScalingTarget::Utilization(percent) => MetricTarget {
            type_: UTILIZATION.to_string(),
            average_utilization: Some(*percent),
            ..Default::default()
        },
        ScalingTarget::AverageValue(quantity) => average_value(quantity.clone()),
    };
    MetricSpec {
        type_: RESOURCE.to_string(),
        resource: Some(ResourceMetricSource {
            name: resource.to_string(),
            target,
        }),
        ..Default::default()
    }
}

fn average_value(quantity: String) -> MetricTarget {
    MetricTarget {
        type_: AVERAGE_VALUE.to_string(),
        average_value: Some(Quantity(quantity)),
        ..Default::default()
    }
}

/// Whether the autoscaler carries this controller's ownership label
pub fn is_managed(hpa: &HorizontalPodAutoscaler) -> bool {
    hpa.labels()
        .get(MANAGED_BY_LABEL_KEY)
        .is_some_and(|v| v == CONTROLLER_NAME)
}

/// Names of owned fields that differ between `existing` and `desired`
pub fn changed_fields(
    existing: &HorizontalPodAutoscaler,
    desired: &HorizontalPodAutoscaler,
) -> Vec<&'static str> {
    let mut changed = Vec::new();

    let (Some(have), Some(want)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
        if existing.spec.is_none() && desired.spec.is_some() {
            changed.push("spec");
        }
        return changed;
    };

    if !target_ref_eq(&have.scale_target_ref, &want.scale_target_ref) {
        changed.push("spec.scaleTargetRef");
    }
    // The API server defaults minReplicas to 1
    if have.min_replicas.unwrap_or(1) != want.min_replicas.unwrap_or(1) {
        changed.push("spec.minReplicas");
    }
    if have.max_replicas != want.max_replicas {
        changed.push("spec.maxReplicas");
    }
    if !metrics_eq(
        have.metrics.as_deref().unwrap_or_default(),
        want.metrics.as_deref().unwrap_or_default(),
    ) {
        changed.push("spec.metrics");
    }
    changed
}

/// Copy owned fields from `desired` onto `existing`.
///
/// Everything else, including `metadata.resourceVersion`, is kept so that
/// a replace fails with a conflict if the object moved underneath us.
pub fn merge_desired(
    existing: &HorizontalPodAutoscaler,
    desired: &HorizontalPodAutoscaler,
) -> HorizontalPodAutoscaler {
    let mut merged = existing.clone();
    merged
        .labels_mut()
        .insert(MANAGED_BY_LABEL_KEY.to_string(), CONTROLLER_NAME.to_string());

    if let Some(want) = desired.spec.as_ref() {
        let spec = merged.spec.get_or_insert_with(Default::default);
        spec.scale_target_ref = want.scale_target_ref.clone();
        spec.min_replicas = want.min_replicas;
        spec.max_replicas = want.max_replicas;
        spec.metrics = want.metrics.clone();
    }
    merged.status = None;
    merged
}

fn target_ref_eq(a: &CrossVersionObjectReference, b: &CrossVersionObjectReference) -> bool {
    a.kind == b.kind && a.name == b.name && a.api_version == b.api_version
}

fn metrics_eq(a: &[MetricSpec], b: &[MetricSpec]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| metric_eq(x, y))
}

fn metric_eq(a: &MetricSpec, b: &MetricSpec) -> bool {
    if a.type_ != b.type_ {
        return false;
    }
    match (&a.resource, &b.resource, &a.external, &b.external) {
        (Some(x), Some(y), None, None) => x.name == y.name && target_eq(&x.target, &y.target),
        (None, None, Some(x), Some(y)) => {
            x.metric.name == y.metric.name
                && x.metric.selector == y.metric.selector
                && target_eq(&x.target, &y.target)
        }
        // Other metric sources are never written by us; compare structurally
        _ => a == b,
    }
}

fn target_eq(a: &MetricTarget, b: &MetricTarget) -> bool {
    a.type_ == b.type_
        && a.average_utilization == b.average_utilization
        && quantity_eq(a.average_value.as_ref(), b.average_value.as_ref())
        && quantity_eq(a.value.as_ref(), b.value.as_ref())
}

fn quantity_eq(a: Option<&Quantity>, b: Option<&Quantity>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => quantities_equal(&x.0, &y.0),
        (None, None) => true,
        _ => false,
    }
}
