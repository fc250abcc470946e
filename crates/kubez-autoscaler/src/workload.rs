//! Source workloads: the objects operators annotate.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::ObjectReference;

/// Stable queue key: namespace and name shared by a workload and its autoscaler
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    /// Namespace of the workload
    pub namespace: String,
    /// Name of the workload (and of the derived autoscaler)
    pub name: String,
}

impl WorkloadKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Workload kinds that can carry scaling annotations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// v1 ReplicationController
    ReplicationController,
}

impl WorkloadKind {
    /// All supported kinds, in source lookup order
    pub const ALL: [WorkloadKind; 3] = [
        WorkloadKind::Deployment,
        WorkloadKind::StatefulSet,
        WorkloadKind::ReplicationController,
    ];

    /// `apiVersion` used in the autoscaler's scaleTargetRef
    pub fn api_version(self) -> &'static str {
        match self {
            WorkloadKind::Deployment | WorkloadKind::StatefulSet => "apps/v1",
            WorkloadKind::ReplicationController => "v1",
        }
    }

    /// Kubernetes kind name
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::ReplicationController => "ReplicationController",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of a workload as fetched from the API
#[derive(Clone, Debug, PartialEq)]
pub struct SourceWorkload {
    /// Workload kind
    pub kind: WorkloadKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
    /// Object UID
    pub uid: Option<String>,
    /// Raw annotations
    pub annotations: BTreeMap<String, String>,
}

impl SourceWorkload {
    /// Queue key for this workload
    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(&self.namespace, &self.name)
    }

    /// Reference used when recording Events against the workload
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.kind.api_version().to_string()),
            kind: Some(self.kind.as_str().to_string()),
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            uid: self.uid.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_displays_as_namespace_slash_name() {
        assert_eq!(WorkloadKey::new("shop", "web").to_string(), "shop/web");
    }

    #[test]
    fn api_versions_per_kind() {
        assert_eq!(WorkloadKind::Deployment.api_version(), "apps/v1");
        assert_eq!(WorkloadKind::StatefulSet.api_version(), "apps/v1");
        assert_eq!(WorkloadKind::ReplicationController.api_version(), "v1");
    }

    #[test]
    fn lookup_order_starts_with_deployment() {
        assert_eq!(WorkloadKind::ALL[0], WorkloadKind::Deployment);
        assert_eq!(WorkloadKind::ALL.len(), 3);
    }

    #[test]
    fn object_ref_names_the_workload() {
        let source = SourceWorkload {
            kind: WorkloadKind::StatefulSet,
            namespace: "db".to_string(),
            name: "pg".to_string(),
            uid: Some("uid-1".to_string()),
            annotations: BTreeMap::new(),
        };
        let r = source.object_ref();
        assert_eq!(r.kind.as_deref(), Some("StatefulSet"));
        assert_eq!(r.api_version.as_deref(), Some("apps/v1"));
        assert_eq!(r.namespace.as_deref(), Some("db"));
        assert_eq!(r.uid.as_deref(), Some("uid-1"));
        assert_eq!(source.key(), WorkloadKey::new("db", "pg"));
    }
}
