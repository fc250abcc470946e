//! Scaling annotation parser
//!
//! Projects the raw annotation map of a workload into a typed
//! [`ScalingPolicy`]. Recognized keys live under a configurable root prefix:
//!
//! | Key | Meaning |
//! |---|---|
//! | `{root}/minReplicas` | lower bound, defaults to 1 |
//! | `{root}/maxReplicas` | upper bound, required |
//! | `{cpu,memory,prometheus}.{root}/targetAverageUtilization` | percent in 1..=100 |
//! | `{cpu,memory,prometheus}.{root}/targetAverageValue` | quantity |
//! | `prometheus.{root}/metricName` | external metric name |
//!
//! Metric families are checked in the order CPU, Memory, External; the first
//! family with a target wins and the others are ignored.

use std::collections::BTreeMap;
use std::fmt;

use kubez_common::{Error, DEFAULT_ANNOTATION_ROOT};
use thiserror::Error;

use crate::policy::{
    parse_quantity, Metric, MetricType, ScalingPolicy, ScalingTarget, DEFAULT_CPU_UTILIZATION,
};

const MIN_REPLICAS: &str = "minReplicas";
const MAX_REPLICAS: &str = "maxReplicas";
const TARGET_UTILIZATION: &str = "targetAverageUtilization";
const TARGET_VALUE: &str = "targetAverageValue";
const METRIC_NAME: &str = "metricName";

/// Metric families in selection priority order
const METRIC_PRIORITY: [MetricType; 3] = [MetricType::Cpu, MetricType::Memory, MetricType::External];

/// Reasons an annotation set cannot become a policy
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// `{root}/maxReplicas` is absent
    #[error("{key} is required")]
    MissingMaxReplicas {
        /// Expected key
        key: String,
    },

    /// A numeric annotation is not a base-10 int32
    #[error("{key}: '{value}' is not a valid 32-bit integer")]
    InvalidInteger {
        /// Offending key
        key: String,
        /// Raw value
        value: String,
    },

    /// A replica bound is below 1
    #[error("{key}: {value} must be at least 1")]
    ReplicasBelowOne {
        /// Offending key
        key: String,
        /// Parsed value
        value: i32,
    },

    /// `minReplicas > maxReplicas`
    #[error("minReplicas ({min}) must not exceed maxReplicas ({max})")]
    MinExceedsMax {
        /// Parsed minReplicas
        min: i32,
        /// Parsed maxReplicas
        max: i32,
    },

    /// Utilization outside (0, 100]
    #[error("{key}: {value} must be between 1 and 100")]
    UtilizationOutOfRange {
        /// Offending key
        key: String,
        /// Parsed value
        value: i32,
    },

    /// A value target is not a positive Kubernetes quantity
    #[error("{key}: '{value}' is not a positive quantity")]
    InvalidQuantity {
        /// Offending key
        key: String,
        /// Raw value
        value: String,
    },

    /// Both a utilization and a value target for the same metric
    #[error("{utilization} and {value} are mutually exclusive")]
    ConflictingTargets {
        /// Utilization key
        utilization: String,
        /// Value key
        value: String,
    },

    /// External metric without a name
    #[error("{key} is required for external metrics")]
    MissingMetricName {
        /// Expected key
        key: String,
    },
}

/// Fully qualified annotation keys for one root prefix
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotationKeys {
    root: String,
}

impl Default for AnnotationKeys {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOTATION_ROOT)
    }
}

impl AnnotationKeys {
    /// Keys under `root` (e.g. "hpa.caoyingjunz.autoscaler")
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// Root prefix
    pub fn root(&self) -> &str {
        &self.root
    }

    /// `{root}/minReplicas`
    pub fn min_replicas(&self) -> String {
        format!("{}/{}", self.root, MIN_REPLICAS)
    }

    /// `{root}/maxReplicas`
    pub fn max_replicas(&self) -> String {
        format!("{}/{}", self.root, MAX_REPLICAS)
    }

    /// `{prefix}.{root}/targetAverageUtilization`
    pub fn target_utilization(&self, metric: MetricType) -> String {
        format!("{}.{}/{}", metric.annotation_prefix(), self.root, TARGET_UTILIZATION)
    }

    /// `{prefix}.{root}/targetAverageValue`
    pub fn target_value(&self, metric: MetricType) -> String {
        format!("{}.{}/{}", metric.annotation_prefix(), self.root, TARGET_VALUE)
    }

    /// `prometheus.{root}/metricName`
    pub fn metric_name(&self) -> String {
        format!(
            "{}.{}/{}",
            MetricType::External.annotation_prefix(),
            self.root,
            METRIC_NAME
        )
    }

    /// Every key this controller reacts to
    pub fn all(&self) -> Vec<String> {
        let mut keys = vec![self.min_replicas(), self.max_replicas(), self.metric_name()];
        for metric in METRIC_PRIORITY {
            keys.push(self.target_utilization(metric));
            keys.push(self.target_value(metric));
        }
        keys
    }

    /// Whether any recognized key is present
    pub fn has_any(&self, annotations: &BTreeMap<String, String>) -> bool {
        self.all().iter().any(|key| annotations.contains_key(key))
    }

    /// Parse annotations into a policy.
    ///
    /// Returns `Ok(None)` when no recognized key is present: the workload
    /// does not ask for autoscaling, which is not an error.
    pub fn parse(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<ScalingPolicy>, ValidationError> {
        if !self.has_any(annotations) {
            return Ok(None);
        }

        let metric = self.select_metric(annotations)?;

        let max_key = self.max_replicas();
        let max_replicas = match annotations.get(&max_key) {
            Some(raw) => parse_i32(&max_key, raw)?,
            None => return Err(ValidationError::MissingMaxReplicas { key: max_key }),
        };

        let min_key = self.min_replicas();
        let min_replicas = match annotations.get(&min_key) {
            Some(raw) => parse_i32(&min_key, raw)?,
            None => 1,
        };

        if min_replicas < 1 {
            return Err(ValidationError::ReplicasBelowOne {
                key: min_key,
                value: min_replicas,
            });
        }
        if max_replicas < 1 {
            return Err(ValidationError::ReplicasBelowOne {
                key: max_key,
                value: max_replicas,
            });
        }
        if min_replicas > max_replicas {
            return Err(ValidationError::MinExceedsMax {
                min: min_replicas,
                max: max_replicas,
            });
        }

        Ok(Some(ScalingPolicy {
            metric,
            min_replicas,
            max_replicas,
        }))
    }

    /// Pick the first metric family carrying a target
    fn select_metric(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Metric, ValidationError> {
        for metric_type in METRIC_PRIORITY {
            let Some(target) = self.parse_target(metric_type, annotations)? else {
                continue;
            };
            return match metric_type {
                MetricType::Cpu => Ok(Metric::Cpu(target)),
                MetricType::Memory => Ok(Metric::Memory(target)),
                MetricType::External => {
                    let key = self.metric_name();
                    match annotations.get(&key).map(|n| n.trim()) {
                        Some(name) if !name.is_empty() => Ok(Metric::External {
                            name: name.to_string(),
                            target,
                        }),
                        _ => Err(ValidationError::MissingMetricName { key }),
                    }
                }
            };
        }

        // Replica bounds without a metric: fall back to the usual CPU default
        Ok(Metric::Cpu(ScalingTarget::Utilization(DEFAULT_CPU_UTILIZATION)))
    }

    fn parse_target(
        &self,
        metric_type: MetricType,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<ScalingTarget>, ValidationError> {
        let util_key = self.target_utilization(metric_type);
        let value_key = self.target_value(metric_type);

        match (annotations.get(&util_key), annotations.get(&value_key)) {
            (Some(_), Some(_)) => Err(ValidationError::ConflictingTargets {
                utilization: util_key,
                value: value_key,
            }),
            (Some(raw), None) => {
                let value = parse_i32(&util_key, raw)?;
                if !(1..=100).contains(&value) {
                    return Err(ValidationError::UtilizationOutOfRange {
                        key: util_key,
                        value,
                    });
                }
                Ok(Some(ScalingTarget::Utilization(value)))
            }
            (None, Some(raw)) => {
                let raw = raw.trim();
                match parse_quantity(raw) {
                    Some(v) if v > 0.0 => Ok(Some(ScalingTarget::AverageValue(raw.to_string()))),
                    _ => Err(ValidationError::InvalidQuantity {
                        key: value_key,
                        value: raw.to_string(),
                    }),
                }
            }
            (None, None) => Ok(None),
        }
    }
}

impl ValidationError {
    /// Attach the offending workload and convert into the crate-wide error
    pub fn into_error(self, object: impl fmt::Display) -> Error {
        Error::validation_for(object.to_string(), self.to_string())
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::validation(err.to_string())
    }
}

fn parse_i32(key: &str, raw: &str) -> Result<i32, ValidationError> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| ValidationError::InvalidInteger {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

/// Parse with the default annotation root
pub fn parse(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<ScalingPolicy>, ValidationError> {
    AnnotationKeys::default().parse(annotations)
}
