//! Typed scaling policy derived from workload annotations.
//!
//! A [`ScalingPolicy`] is rebuilt from annotations on every reconciliation and
//! only ever exists in valid form: the parser refuses to construct one that
//! breaks `1 <= min_replicas <= max_replicas` or has an out-of-range target.

use std::fmt;

/// Metric family selected by the annotations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricType {
    /// Container CPU (Resource metric "cpu")
    Cpu,
    /// Container memory (Resource metric "memory")
    Memory,
    /// External metric served by a metrics adapter (e.g. Prometheus)
    External,
}

impl MetricType {
    /// Annotation prefix selecting this metric type
    pub fn annotation_prefix(self) -> &'static str {
        match self {
            MetricType::Cpu => "cpu",
            MetricType::Memory => "memory",
            MetricType::External => "prometheus",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::Cpu => f.write_str("CPU"),
            MetricType::Memory => f.write_str("Memory"),
            MetricType::External => f.write_str("External"),
        }
    }
}

/// What the autoscaler should hold the metric at
#[derive(Clone, Debug, PartialEq)]
pub enum ScalingTarget {
    /// Average utilization percentage, in (0, 100]
    Utilization(i32),
    /// Average absolute value as a Kubernetes quantity (e.g. "500m", "256Mi")
    AverageValue(String),
}

/// The metric an autoscaler scales on
#[derive(Clone, Debug, PartialEq)]
pub enum Metric {
    /// CPU resource metric
    Cpu(ScalingTarget),
    /// Memory resource metric
    Memory(ScalingTarget),
    /// External metric with its name
    External {
        /// Metric name as exposed by the external metrics API
        name: String,
        /// Target for the metric
        target: ScalingTarget,
    },
}

impl Metric {
    /// Metric family
    pub fn metric_type(&self) -> MetricType {
        match self {
            Metric::Cpu(_) => MetricType::Cpu,
            Metric::Memory(_) => MetricType::Memory,
            Metric::External { .. } => MetricType::External,
        }
    }

    /// Target regardless of family
    pub fn target(&self) -> &ScalingTarget {
        match self {
            Metric::Cpu(target) | Metric::Memory(target) => target,
            Metric::External { target, .. } => target,
        }
    }
}

/// Validated scaling intent for one workload
#[derive(Clone, Debug, PartialEq)]
pub struct ScalingPolicy {
    /// Metric and target
    pub metric: Metric,
    /// Lower replica bound, at least 1
    pub min_replicas: i32,
    /// Upper replica bound, at least `min_replicas`
    pub max_replicas: i32,
}

/// Default CPU utilization used when only replica bounds are annotated
pub const DEFAULT_CPU_UTILIZATION: i32 = 80;

/// Parse a Kubernetes quantity into its numeric value.
///
/// Follows the API server's grammar: an optionally signed decimal number
/// followed by at most one suffix, which is either binary (Ki, Mi, Gi, Ti,
/// Pi, Ei), decimal SI (n, u, m, k, M, G, T, P, E) or an exponent ("e3",
/// "E-2"). Suffixes never combine, so "1e3m" is rejected.
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let (sign, unsigned) = match quantity.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, quantity.strip_prefix('+').unwrap_or(quantity)),
    };

    let number_end = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_end);
    if !number.chars().any(|c| c.is_ascii_digit()) || number.matches('.').count() > 1 {
        return None;
    }

    let value = sign * number.parse::<f64>().ok()? * suffix_multiplier(suffix)?;
    value.is_finite().then_some(value)
}

fn suffix_multiplier(suffix: &str) -> Option<f64> {
    const BINARY: [(&str, f64); 6] = [
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
    ];
    const DECIMAL: [(&str, f64); 10] = [
        ("", 1.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    if let Some((_, mult)) = BINARY.iter().chain(DECIMAL.iter()).find(|(s, _)| *s == suffix) {
        return Some(*mult);
    }

    // Exponent: e/E then a signed integer and nothing else
    let exponent = suffix.strip_prefix(['e', 'E'])?;
    let digits = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(10f64.powi(exponent.parse().ok()?))
}

/// Compare two quantities by value, so "1" and "1000m" are the same target
pub fn quantities_equal(a: &str, b: &str) -> bool {
    match (parse_quantity(a), parse_quantity(b)) {
        (Some(x), Some(y)) => {
            let scale = x.abs().max(y.abs()).max(f64::MIN_POSITIVE);
            (x - y).abs() / scale < 1e-9
        }
        _ => a == b,
    }
}
