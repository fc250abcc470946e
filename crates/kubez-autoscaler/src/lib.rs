//! Annotation-driven HorizontalPodAutoscaler controller
//!
//! Operators annotate a Deployment, StatefulSet or ReplicationController with
//! replica bounds and a scaling metric; this crate keeps a matching
//! `autoscaling/v2` HorizontalPodAutoscaler in existence, up to date, and
//! gone once the annotations are removed.
//!
//! Flow: [`ingest`] turns watch notifications into [`WorkloadKey`]s on the
//! [`queue::WorkQueue`]; [`worker`] tasks pop keys and call
//! [`reconciler::reconcile`], which re-reads the cluster through
//! [`api::AutoscalerApi`], parses annotations with [`annotations`] and
//! applies the minimal change built by [`hpa`]. Deletes of managed
//! autoscalers are noted in [`recovery`] so their recreation is reported as
//! a recovery.

#![deny(missing_docs)]

pub mod annotations;
pub mod api;
pub mod controller;
pub mod hpa;
pub mod ingest;
pub mod policy;
pub mod queue;
pub mod recovery;
pub mod reconciler;
pub mod worker;
pub mod workload;

pub use annotations::{AnnotationKeys, ValidationError};
pub use controller::{Controller, ControllerConfig};
pub use policy::{Metric, MetricType, ScalingPolicy, ScalingTarget};
pub use reconciler::{reconcile, Context, ReconcileOutcome};
pub use workload::{SourceWorkload, WorkloadKey, WorkloadKind};
