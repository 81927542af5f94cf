// Object Reader: typed, synchronous access to the orchestration platform.

mod kube_store;
mod snapshot;

pub use self::kube_store::KubeStore;
pub use self::snapshot::SnapshotStore;

use crate::config::SourceKind;
use crate::error::{MigrateError, Result};
use crate::synth::rbac::RbacBundle;
use crate::types::{node_name, ordinal_of, CrdbNode};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Read access to source objects plus the few writes the migration is allowed.
/// A missing object is `Ok(None)`; transport failures are errors and are not retried.
pub trait ObjectStore {
    fn statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;
    /// CrdbNodes labelled as members of `cluster`, in any order.
    fn crdb_nodes(&self, namespace: &str, cluster: &str) -> Result<Vec<CrdbNode>>;
    fn pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;
    fn claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>>;
    fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
    fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Creates or updates a config object.
    fn apply_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()>;
    fn apply_rbac(&self, namespace: &str, bundle: &RbacBundle) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum SourceController {
    StatefulSet(Box<StatefulSet>),
    /// One per node, ordered by ordinal.
    CrdbNodes(Vec<CrdbNode>),
}

/// Everything read from the source cluster in one pass.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub namespace: String,
    pub cluster: String,
    pub controller: SourceController,
    /// Ordered by ordinal; every pod is bound to a host.
    pub pods: Vec<Pod>,
    /// Every claim mounted by one of `pods`, by name.
    pub claims: BTreeMap<String, PersistentVolumeClaim>,
    pub public_service: Option<Service>,
}

pub fn public_service_name(cluster: &str) -> String {
    format!("{}-public", cluster)
}

fn read_crdb_nodes(store: &impl ObjectStore, namespace: &str, cluster: &str) -> Result<Vec<CrdbNode>> {
    let mut nodes = store
        .crdb_nodes(namespace, cluster)?
        .into_iter()
        .map(|n| {
            let ordinal = ordinal_of(cluster, n.name()).ok_or_else(|| {
                MigrateError::Validation(format!(
                    "CrdbNode '{}' does not follow the '{}-<ordinal>' naming",
                    n.name(),
                    cluster
                ))
            })?;
            Ok((ordinal, n))
        })
        .collect::<Result<Vec<_>>>()?;
    if nodes.is_empty() {
        return Err(MigrateError::not_found(
            "CrdbNode",
            format!("{}/{}-*", namespace, cluster),
        ));
    }
    nodes.sort_by_key(|(ordinal, _)| *ordinal);
    for (expected, (ordinal, node)) in nodes.iter().enumerate() {
        if *ordinal != expected {
            return Err(MigrateError::Validation(format!(
                "CrdbNode ordinals are not contiguous: expected {}-{}, found '{}'",
                cluster,
                expected,
                node.name()
            )));
        }
    }
    Ok(nodes.into_iter().map(|(_, n)| n).collect())
}

/// Reads the controller, its pods in ordinal order and every claim they mount.
pub fn read_source(
    store: &impl ObjectStore,
    source: SourceKind,
    namespace: &str,
    cluster: &str,
) -> Result<SourceSnapshot> {
    let (controller, count) = match source {
        SourceKind::StatefulSet => {
            let sts = store
                .statefulset(namespace, cluster)?
                .ok_or_else(|| MigrateError::not_found("StatefulSet", format!("{}/{}", namespace, cluster)))?;
            let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let count = usize::try_from(replicas).map_err(|_| {
                MigrateError::Validation(format!("StatefulSet '{}' has {} replicas", cluster, replicas))
            })?;
            (SourceController::StatefulSet(Box::new(sts)), count)
        }
        SourceKind::CrdbNode => {
            let nodes = read_crdb_nodes(store, namespace, cluster)?;
            let count = nodes.len();
            (SourceController::CrdbNodes(nodes), count)
        }
    };
    if count == 0 {
        return Err(MigrateError::Validation(format!(
            "cluster '{}' has no nodes to migrate",
            cluster
        )));
    }

    let mut pods = Vec::with_capacity(count);
    let mut claims = BTreeMap::new();
    for ordinal in 0..count {
        let pod_name = node_name(cluster, ordinal);
        let pod = store
            .pod(namespace, &pod_name)?
            .ok_or_else(|| MigrateError::not_found("Pod", format!("{}/{}", namespace, pod_name)))?;
        let spec = pod
            .spec
            .as_ref()
            .ok_or_else(|| MigrateError::not_found("PodSpec", pod_name.as_str()))?;
        if spec.node_name.as_deref().unwrap_or_default().is_empty() {
            return Err(MigrateError::SchedulingIncomplete { pod: pod_name });
        }
        for volume in spec.volumes.iter().flatten() {
            let Some(source) = &volume.persistent_volume_claim else {
                continue;
            };
            let claim = store.claim(namespace, &source.claim_name)?.ok_or_else(|| {
                MigrateError::not_found(
                    "PersistentVolumeClaim",
                    format!("{}/{}", namespace, source.claim_name),
                )
            })?;
            debug!(pod = %pod_name, claim = %source.claim_name, "read claim");
            claims.insert(source.claim_name.clone(), claim);
        }
        pods.push(pod);
    }

    let public_service = store.service(namespace, &public_service_name(cluster))?;
    info!(
        namespace,
        cluster,
        pods = pods.len(),
        claims = claims.len(),
        public_service = public_service.is_some(),
        "read source cluster"
    );
    Ok(SourceSnapshot {
        namespace: namespace.to_string(),
        cluster: cluster.to_string(),
        controller,
        pods,
        claims,
        public_service,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("db".to_string()),
            ..Default::default()
        }
    }

    fn store_with_pods(hosts: &[Option<&str>]) -> SnapshotStore {
        let mut store = SnapshotStore::default();
        store.add_statefulset(StatefulSet {
            metadata: meta("crdb"),
            spec: Some(StatefulSetSpec {
                replicas: Some(hosts.len() as i32),
                ..Default::default()
            }),
            ..Default::default()
        });
        for (i, host) in hosts.iter().enumerate() {
            store.add_pod(Pod {
                metadata: meta(&node_name("crdb", i)),
                spec: Some(PodSpec {
                    node_name: host.map(String::from),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        store
    }

    #[test]
    fn test_unbound_pod_is_scheduling_incomplete() {
        let store = store_with_pods(&[Some("host-0"), None]);
        let err = read_source(&store, SourceKind::StatefulSet, "db", "crdb").unwrap_err();
        assert!(matches!(err, MigrateError::SchedulingIncomplete { ref pod } if pod == "crdb-1"));
    }

    #[test]
    fn test_pods_read_in_ordinal_order() {
        let store = store_with_pods(&[Some("host-0"), Some("host-1")]);
        let snapshot = read_source(&store, SourceKind::StatefulSet, "db", "crdb").unwrap();
        let names: Vec<_> = snapshot
            .pods
            .iter()
            .map(|p| p.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["crdb-0", "crdb-1"]);
        assert!(snapshot.public_service.is_none());
    }

    #[test]
    fn test_missing_statefulset_is_not_found() {
        let store = SnapshotStore::default();
        let err = read_source(&store, SourceKind::StatefulSet, "db", "crdb").unwrap_err();
        assert!(matches!(err, MigrateError::NotFound { kind: "StatefulSet", .. }));
    }
}
