//! Common building blocks for kubez controllers: errors, Kubernetes Events,
//! client construction, leader election and telemetry.

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod kube_utils;
pub mod leader_election;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name this controller reports as (field manager, event reporter, managed-by label value)
pub const CONTROLLER_NAME: &str = "kubez-autoscaler";

/// Label key marking objects owned by this controller
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";

/// Label selector matching objects owned by this controller
pub const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by=kubez-autoscaler";

/// Default annotation root prefix for scaling annotations
pub const DEFAULT_ANNOTATION_ROOT: &str = "hpa.caoyingjunz.autoscaler";
