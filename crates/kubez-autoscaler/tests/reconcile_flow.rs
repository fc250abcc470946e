//! End-to-end flows: notifications through the queue and workers into an
//! in-memory cluster.

mod common;

use common::{annotations, Harness};
use kube::ResourceExt;
use kubez_autoscaler::hpa;
use kubez_autoscaler::ingest::ChangeType;
use kubez_autoscaler::{WorkloadKey, WorkloadKind};
use kubez_common::events::reasons;

fn cpu80_max10() -> std::collections::BTreeMap<String, String> {
    annotations(&[
        ("cpu.{root}/targetAverageUtilization", "80"),
        ("{root}/maxReplicas", "10"),
    ])
}

// =============================================================================
// Story: annotating a Deployment yields a matching HPA
// =============================================================================

#[tokio::test]
async fn story_annotated_deployment_gets_hpa() {
    let h = Harness::start(2);
    let key = WorkloadKey::new("ns", "foo");

    h.cluster
        .put_workload(WorkloadKind::Deployment, &key, cpu80_max10());
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;

    let created = h.cluster.hpa(&key).expect("HPA should exist");
    assert!(hpa::is_managed(&created));
    assert_eq!(created.name_any(), "foo");
    assert_eq!(created.namespace().as_deref(), Some("ns"));

    let spec = created.spec.as_ref().unwrap();
    assert_eq!(spec.scale_target_ref.kind, "Deployment");
    assert_eq!(spec.scale_target_ref.name, "foo");
    assert_eq!(spec.min_replicas, Some(1));
    assert_eq!(spec.max_replicas, 10);
    let resource = spec.metrics.as_ref().unwrap()[0].resource.as_ref().unwrap();
    assert_eq!(resource.name, "cpu");
    assert_eq!(resource.target.average_utilization, Some(80));

    assert_eq!(h.events.reasons(), vec![reasons::CREATED]);
    assert_eq!(h.stop().await, 0);
}

// =============================================================================
// Story: reconciling unchanged input writes exactly once
// =============================================================================

#[tokio::test]
async fn story_reconciliation_is_idempotent() {
    let h = Harness::start(3);
    let key = WorkloadKey::new("ns", "foo");
    h.cluster
        .put_workload(WorkloadKind::Deployment, &key, cpu80_max10());

    for _ in 0..5 {
        h.workload_changed(WorkloadKind::Deployment, &key);
    }
    h.settle().await;
    assert_eq!(h.cluster.writes(), 1);

    // The HPA's own update notification and a later resync change nothing
    h.hpa_changed(ChangeType::Applied, &key);
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;
    assert_eq!(h.cluster.writes(), 1);

    assert_eq!(h.stop().await, 0);
}

// =============================================================================
// Story: an HPA deleted out-of-band comes back
// =============================================================================

#[tokio::test]
async fn story_deleted_hpa_is_recovered() {
    let h = Harness::start(2);
    let key = WorkloadKey::new("ns", "foo");
    h.cluster
        .put_workload(WorkloadKind::Deployment, &key, cpu80_max10());
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;
    let original = h.cluster.hpa(&key).unwrap();

    let deleted = h.cluster.delete_hpa_out_of_band(&key).unwrap();
    h.hpa_changed(ChangeType::Deleted, &key);
    h.settle().await;

    let recovered = h.cluster.hpa(&key).expect("HPA should be recreated");
    assert_ne!(recovered.uid(), deleted.uid(), "fresh object identity");
    assert_eq!(recovered.spec, original.spec);
    assert_eq!(
        h.events.reasons(),
        vec![reasons::CREATED, reasons::RECOVERED]
    );
    assert_eq!(h.stop().await, 0);
}

// =============================================================================
// Story: the HPA follows the annotations
// =============================================================================

#[tokio::test]
async fn story_changed_annotations_update_hpa() {
    let h = Harness::start(2);
    let key = WorkloadKey::new("ns", "foo");
    h.cluster
        .put_workload(WorkloadKind::Deployment, &key, cpu80_max10());
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;
    let uid = h.cluster.hpa(&key).unwrap().uid();

    h.cluster.put_workload(
        WorkloadKind::Deployment,
        &key,
        annotations(&[
            ("memory.{root}/targetAverageValue", "256Mi"),
            ("{root}/minReplicas", "2"),
            ("{root}/maxReplicas", "6"),
        ]),
    );
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;

    let updated = h.cluster.hpa(&key).unwrap();
    assert_eq!(updated.uid(), uid, "updated in place");
    let spec = updated.spec.as_ref().unwrap();
    assert_eq!(spec.min_replicas, Some(2));
    assert_eq!(spec.max_replicas, 6);
    let resource = spec.metrics.as_ref().unwrap()[0].resource.as_ref().unwrap();
    assert_eq!(resource.name, "memory");
    assert_eq!(resource.target.type_, "AverageValue");

    assert_eq!(h.cluster.writes(), 2);
    assert_eq!(h.events.reasons(), vec![reasons::CREATED, reasons::UPDATED]);
    assert_eq!(h.stop().await, 0);
}

#[tokio::test]
async fn story_transient_write_failures_are_retried_until_converged() {
    let h = Harness::start(1);
    let key = WorkloadKey::new("ns", "foo");
    h.cluster
        .put_workload(WorkloadKind::Deployment, &key, cpu80_max10());
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;

    // Transient failures on the next writes are retried with backoff
    h.cluster.fail_next_writes(2);
    h.cluster.put_workload(
        WorkloadKind::Deployment,
        &key,
        annotations(&[
            ("cpu.{root}/targetAverageUtilization", "50"),
            ("{root}/maxReplicas", "10"),
        ]),
    );
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;

    let spec = h.cluster.hpa(&key).unwrap().spec.unwrap();
    let resource = spec.metrics.unwrap()[0].resource.clone().unwrap();
    assert_eq!(resource.target.average_utilization, Some(50));
    assert_eq!(h.cluster.writes(), 2);
    assert_eq!(h.stop().await, 0);
}

// =============================================================================
// Story: removing intent removes the HPA
// =============================================================================

#[tokio::test]
async fn story_removing_annotations_deletes_hpa() {
    let h = Harness::start(2);
    let key = WorkloadKey::new("ns", "foo");
    h.cluster
        .put_workload(WorkloadKind::Deployment, &key, cpu80_max10());
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;
    assert!(h.cluster.hpa(&key).is_some());

    h.cluster.put_workload(
        WorkloadKind::Deployment,
        &key,
        annotations(&[("deployment.kubernetes.io/revision", "2")]),
    );
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;

    assert!(h.cluster.hpa(&key).is_none());
    assert_eq!(h.events.reasons(), vec![reasons::CREATED, reasons::DELETED]);

    // The HPA delete notification must not bring it back
    h.hpa_changed(ChangeType::Deleted, &key);
    h.settle().await;
    assert!(h.cluster.hpa(&key).is_none());
    assert_eq!(h.stop().await, 0);
}

#[tokio::test]
async fn story_deleting_workload_deletes_hpa() {
    let h = Harness::start(2);
    let key = WorkloadKey::new("ns", "foo");
    h.cluster
        .put_workload(WorkloadKind::StatefulSet, &key, cpu80_max10());
    h.workload_changed(WorkloadKind::StatefulSet, &key);
    h.settle().await;
    assert!(h.cluster.hpa(&key).is_some());

    h.cluster.remove_workload(WorkloadKind::StatefulSet, &key);
    h.workload_deleted(WorkloadKind::StatefulSet, &key);
    h.settle().await;

    assert!(h.cluster.hpa(&key).is_none());
    assert_eq!(h.stop().await, 0);
}

// =============================================================================
// Story: bad input never produces or touches an HPA
// =============================================================================

#[tokio::test]
async fn story_zero_max_replicas_creates_nothing() {
    let h = Harness::start(2);
    let key = WorkloadKey::new("ns", "foo");
    h.cluster.put_workload(
        WorkloadKind::Deployment,
        &key,
        annotations(&[
            ("cpu.{root}/targetAverageUtilization", "80"),
            ("{root}/maxReplicas", "0"),
        ]),
    );
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;

    assert!(h.cluster.hpa(&key).is_none());
    assert_eq!(h.cluster.writes(), 0);
    assert_eq!(h.events.reasons(), vec![reasons::INVALID_ANNOTATIONS]);
    assert_eq!(h.stop().await, 0);
}

#[tokio::test]
async fn story_invalid_update_keeps_last_good_hpa() {
    let h = Harness::start(2);
    let key = WorkloadKey::new("ns", "foo");
    h.cluster
        .put_workload(WorkloadKind::Deployment, &key, cpu80_max10());
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;
    let before = h.cluster.hpa(&key).unwrap();

    h.cluster.put_workload(
        WorkloadKind::Deployment,
        &key,
        annotations(&[
            ("{root}/minReplicas", "12"),
            ("{root}/maxReplicas", "10"),
        ]),
    );
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;

    assert_eq!(h.cluster.hpa(&key).unwrap(), before);
    assert_eq!(h.events.warnings(), 1);
    assert_eq!(h.stop().await, 0);
}

#[tokio::test]
async fn story_foreign_hpa_blocks_creation_without_retry_storm() {
    let h = Harness::start(2);
    let key = WorkloadKey::new("ns", "foo");
    h.cluster.put_foreign_hpa(&key);
    h.cluster
        .put_workload(WorkloadKind::Deployment, &key, cpu80_max10());
    h.workload_changed(WorkloadKind::Deployment, &key);
    h.settle().await;

    let foreign = h.cluster.hpa(&key).unwrap();
    assert!(!hpa::is_managed(&foreign));
    assert_eq!(h.cluster.writes(), 0);
    assert_eq!(h.events.reasons(), vec![reasons::NAME_CONFLICT]);
    assert_eq!(h.stop().await, 0);
}

// =============================================================================
// Story: many workloads reconcile independently
// =============================================================================

#[tokio::test]
async fn story_many_workloads_across_workers() {
    let h = Harness::start(4);
    let keys: Vec<_> = (0..20)
        .map(|i| WorkloadKey::new(format!("ns-{}", i % 3), format!("app-{i}")))
        .collect();
    for key in &keys {
        h.cluster
            .put_workload(WorkloadKind::Deployment, key, cpu80_max10());
        h.workload_changed(WorkloadKind::Deployment, key);
        h.workload_changed(WorkloadKind::Deployment, key);
    }
    h.settle().await;

    for key in &keys {
        assert!(h.cluster.hpa(key).is_some(), "{key} should have an HPA");
    }
    assert_eq!(h.cluster.writes(), keys.len());
    assert_eq!(h.stop().await, 0);
}
