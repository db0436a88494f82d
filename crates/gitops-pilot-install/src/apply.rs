//! Idempotent resource applier
//!
//! Creates manifest objects one at a time, in manifest order. An object
//! that already exists is a warning, anything else stops the run. Nothing
//! is rolled back.

use tracing::{info, warn};

use crate::cluster::ClusterApi;
use crate::error::{InstallError, KubeError};
use crate::manifest::ManifestObjects;

/// What the applier did with each object, by `kind/name`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: Vec<String>,
    /// Objects found already present, one warning each
    pub existing: Vec<String>,
}

impl ApplyReport {
    pub fn warnings(&self) -> usize {
        self.existing.len()
    }
}

/// What the deleter did with each object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub missing: Vec<String>,
}

/// Create every object, tolerating ones that already exist
pub async fn apply_objects(
    cluster: &dyn ClusterApi,
    objects: &ManifestObjects,
    namespace: &str,
) -> Result<ApplyReport, InstallError> {
    let mut report = ApplyReport::default();

    for object in objects.iter() {
        match cluster.create_object(object, namespace).await {
            Ok(()) => report.created.push(object.key()),
            Err(err @ KubeError::AlreadyExists { .. }) => {
                warn!("{}", err);
                report.existing.push(object.key());
            }
            Err(source) => {
                return Err(InstallError::ResourceApply {
                    kind: object.kind.clone(),
                    name: object.name.clone(),
                    source,
                });
            }
        }
    }

    info!(
        namespace = %namespace,
        created = report.created.len(),
        existing = report.existing.len(),
        "manifest applied"
    );
    Ok(report)
}

/// Delete every object in reverse manifest order, tolerating ones that
/// are already gone
pub async fn delete_objects(
    cluster: &dyn ClusterApi,
    objects: &ManifestObjects,
    namespace: &str,
) -> Result<DeleteReport, InstallError> {
    let mut report = DeleteReport::default();
    let ordered: Vec<_> = objects.iter().collect();

    for object in ordered.into_iter().rev() {
        match cluster.delete_object(object, namespace).await {
            Ok(()) => report.deleted.push(object.key()),
            Err(err @ KubeError::NotFound { .. }) => {
                warn!("{}", err);
                report.missing.push(object.key());
            }
            Err(source) => {
                return Err(InstallError::ResourceApply {
                    kind: object.kind.clone(),
                    name: object.name.clone(),
                    source,
                });
            }
        }
    }

    info!(
        namespace = %namespace,
        deleted = report.deleted.len(),
        missing = report.missing.len(),
        "manifest deleted"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::manifest::build_objects;
    use std::collections::BTreeMap;

    fn objects(k: usize) -> ManifestObjects {
        let content = (0..k)
            .map(|i| format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-{}\n", i))
            .collect::<Vec<_>>()
            .join("---\n");
        build_objects(&content, &BTreeMap::new()).unwrap()
    }

    #[tokio::test]
    async fn test_creates_in_order() {
        let mut cluster = MockClusterApi::new();
        let mut seq = mockall::Sequence::new();
        for i in 0..3 {
            let name = format!("cm-{}", i);
            cluster
                .expect_create_object()
                .withf(move |obj, ns| obj.name == name && ns == "argocd")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
        }

        let report = apply_objects(&cluster, &objects(3), "argocd").await.unwrap();
        assert_eq!(report.created, vec!["ConfigMap/cm-0", "ConfigMap/cm-1", "ConfigMap/cm-2"]);
        assert_eq!(report.warnings(), 0);
    }

    #[tokio::test]
    async fn test_reapply_gives_one_warning_per_object() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_create_object()
            .times(4)
            .returning(|obj, _| {
                Err(KubeError::AlreadyExists {
                    kind: obj.kind.clone(),
                    name: obj.name.clone(),
                })
            });

        let report = apply_objects(&cluster, &objects(4), "argocd").await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.warnings(), 4);
    }

    #[tokio::test]
    async fn test_other_error_aborts() {
        let mut cluster = MockClusterApi::new();
        let mut seq = mockall::Sequence::new();
        cluster
            .expect_create_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        cluster
            .expect_create_object()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(KubeError::ClientCreate("forbidden".to_string())));

        let err = apply_objects(&cluster, &objects(3), "argocd")
            .await
            .unwrap_err();
        match err {
            InstallError::ResourceApply { kind, name, .. } => {
                assert_eq!(kind, "ConfigMap");
                assert_eq!(name, "cm-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_set_makes_no_calls() {
        let cluster = MockClusterApi::new();
        let report = apply_objects(&cluster, &objects(0), "argocd").await.unwrap();
        assert_eq!(report, ApplyReport::default());
    }

    #[tokio::test]
    async fn test_delete_reverse_order_tolerates_missing() {
        let mut cluster = MockClusterApi::new();
        let mut seq = mockall::Sequence::new();
        cluster
            .expect_delete_object()
            .withf(|obj, _| obj.name == "cm-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|obj, _| {
                Err(KubeError::NotFound {
                    kind: obj.kind.clone(),
                    name: obj.name.clone(),
                })
            });
        cluster
            .expect_delete_object()
            .withf(|obj, _| obj.name == "cm-0")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let report = delete_objects(&cluster, &objects(2), "argocd").await.unwrap();
        assert_eq!(report.deleted, vec!["ConfigMap/cm-0"]);
        assert_eq!(report.missing, vec!["ConfigMap/cm-1"]);
    }
}
