// StatefulSet → CrdbNode: one CrdbNode per pod plus the operator chart values.

use super::{locality_label, opt, put, put_serialized, to_document, ManifestFile};
use crate::bridge::{MaterialRole, SecurityMaterialMap};
use crate::config::TargetSettings;
use crate::error::{MigrateError, Result};
use crate::observe::command_line::{store_options, store_path};
use crate::observe::storage::StorageDescriptor;
use crate::observe::wal_failover::WalFailoverMode;
use crate::observe::{ClusterObservation, NodeObservation};
use crate::types::{
    CrdbNode, CrdbNodeSpec, DataStore, ExternalCertificates, Certificates, WalFailoverSpec,
    CLUSTER_LABEL,
};
use k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use tracing::debug;

fn host_ip_env() -> EnvVar {
    EnvVar {
        name: "HOST_IP".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "status.hostIP".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn claim_template(descriptor: &StorageDescriptor) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(descriptor.name.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(if descriptor.access_modes.is_empty() {
                vec!["ReadWriteOnce".to_string()]
            } else {
                descriptor.access_modes.clone()
            }),
            storage_class_name: descriptor.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(descriptor.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn within(path: &str, mount: &str) -> bool {
    let mount = mount.trim_end_matches('/');
    path == mount || path.starts_with(&format!("{}/", mount))
}

/// One data store per data volume. An explicit `--store` path on that volume wins
/// over the mount path and brings its other fields along; every explicit store
/// must land on some data volume.
fn data_stores(node: &NodeObservation) -> Result<Vec<DataStore>> {
    let mut explicit = Vec::with_capacity(node.flags.stores.len());
    for store in &node.flags.stores {
        let path = store_path(store).filter(|p| p.starts_with('/')).ok_or_else(|| {
            MigrateError::Validation(format!(
                "node {}: store '{}' is not backed by a volume",
                node.index, store
            ))
        })?;
        explicit.push((path.trim_end_matches('/'), store_options(store)));
    }

    let mut stores = Vec::new();
    let mut covered = vec![false; explicit.len()];
    for descriptor in node.data_storage() {
        let matched = explicit
            .iter()
            .enumerate()
            .find(|(i, (p, _))| !covered[*i] && within(p, &descriptor.mount_path))
            .map(|(i, _)| i);
        let (path, options) = match matched {
            Some(i) => {
                covered[i] = true;
                (explicit[i].0.to_string(), explicit[i].1.clone())
            }
            None => (descriptor.mount_path.clone(), Vec::new()),
        };
        stores.push(DataStore {
            name: descriptor.name.clone(),
            path: Some(path),
            options,
            volume_claim_template: claim_template(descriptor),
        });
    }
    if let Some(i) = covered.iter().position(|c| !c) {
        return Err(MigrateError::Validation(format!(
            "node {}: store path '{}' is not on any data volume",
            node.index, explicit[i].0
        )));
    }
    Ok(stores)
}

fn wal_failover_spec(node: &NodeObservation) -> Option<WalFailoverSpec> {
    let (status, descriptor) = match (&node.failover, node.idle_failover_volume()) {
        (Some(failover), _) => ("enable", failover),
        // Keep an attached but unused volume so the operator does not drop it.
        (None, Some(idle)) => ("disable", idle),
        (None, None) => return None,
    };
    Some(WalFailoverSpec {
        status: status.to_string(),
        name: descriptor.name.clone(),
        path: descriptor.mount_path.clone(),
        size: descriptor.size.clone(),
        storage_class_name: descriptor.storage_class.clone(),
    })
}

fn external_certificates(security: &SecurityMaterialMap) -> Option<ExternalCertificates> {
    if security.is_empty() {
        return None;
    }
    let name = |role| {
        security
            .target(role)
            .map(|r| r.name.clone())
            .unwrap_or_default()
    };
    Some(ExternalCertificates {
        ca_config_map_name: name(MaterialRole::Ca),
        node_secret_name: name(MaterialRole::Node),
        root_sql_client_secret_name: name(MaterialRole::Client),
    })
}

fn node_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
        ("app.kubernetes.io/name".to_string(), "cockroachdb".to_string()),
        ("app.kubernetes.io/instance".to_string(), cluster.to_string()),
    ])
}

/// The CrdbNode replacing one pod. It takes the pod's name so the operator
/// resolves the same claims by the same names.
pub fn build_node(
    observation: &ClusterObservation,
    node: &NodeObservation,
    security: &SecurityMaterialMap,
    target: &TargetSettings,
) -> Result<CrdbNode> {
    let policy = &observation.policy;
    let flags = &node.flags;

    let mut extra = flags.extra.clone();
    if node.wal_failover == WalFailoverMode::AmongStores {
        extra.insert("--wal-failover", WalFailoverMode::AmongStores.flag_value());
    }
    let mut env = policy.env.clone();
    env.push(host_ip_env());

    let spec = CrdbNodeSpec {
        node_name: Some(node.host.clone()),
        join: flags.join.join(","),
        grpc_port: Some(i32::from(flags.grpc_port)),
        sql_port: Some(i32::from(flags.sql_port)),
        http_port: Some(i32::from(flags.http_port)),
        locality_labels: flags.locality.iter().map(|(k, _)| locality_label(k)).collect(),
        logging_config_map_name: observation.logging.as_ref().map(|l| l.name().to_string()),
        certificates: external_certificates(security).map(|c| Certificates {
            external_certificates: Some(c),
        }),
        data_stores: data_stores(node)?,
        wal_failover_spec: wal_failover_spec(node),
        flags: extra,
        env,
        resource_requirements: policy.resources.clone(),
        service_account_name: policy.service_account_name.clone(),
        pod_labels: policy.labels.clone(),
        pod_annotations: policy.annotations.clone(),
        tolerations: policy.tolerations.clone(),
        node_selector: policy.node_selector.clone(),
        affinity: policy.affinity.clone(),
        topology_spread_constraints: policy.topology_spread_constraints.clone(),
        termination_grace_period_seconds: policy.termination_grace_period_seconds,
        image: target.image.clone().or_else(|| policy.image.clone()),
    };
    debug!(node = node.index, name = %node.pod_name, stores = spec.data_stores.len(), "built CrdbNode");
    Ok(CrdbNode::new(
        ObjectMeta {
            name: Some(node.pod_name.clone()),
            namespace: Some(observation.namespace.clone()),
            labels: Some(node_labels(&observation.cluster)),
            ..Default::default()
        },
        spec,
    ))
}

fn region_code(observation: &ClusterObservation, target: &TargetSettings) -> Result<String> {
    target
        .region
        .clone()
        .or_else(|| {
            observation
                .flags()
                .locality
                .iter()
                .find(|(k, _)| k == "region")
                .map(|(_, v)| v.clone())
        })
        .ok_or_else(|| {
            MigrateError::Validation(
                "no region configured and no region locality tier observed".to_string(),
            )
        })
}

/// Cluster-wide values for the operator chart. Per-node detail lives in the CrdbNodes.
pub fn build_values(
    observation: &ClusterObservation,
    nodes: &[CrdbNode],
    security: &SecurityMaterialMap,
    target: &TargetSettings,
) -> Result<Value> {
    let first = &nodes
        .first()
        .ok_or_else(|| MigrateError::Validation("no nodes to describe".to_string()))?
        .spec;

    let mut region = Mapping::new();
    put(&mut region, "code", region_code(observation, target)?);
    put(&mut region, "nodes", observation.node_count() as u64);
    put(&mut region, "cloudProvider", opt(target.cloud_provider.clone()));
    put(&mut region, "namespace", observation.namespace.as_str());
    put(&mut region, "domain", opt(target.cluster_domain.clone()));

    let mut ports = Mapping::new();
    for (name, port) in [
        ("grpc", first.grpc_port),
        ("sql", first.sql_port),
        ("http", first.http_port),
    ] {
        let mut entry = Mapping::new();
        put(&mut entry, "port", opt(port));
        put(&mut ports, name, entry);
    }
    let mut service = Mapping::new();
    put(&mut service, "ports", ports);

    let mut image = Mapping::new();
    put(&mut image, "name", opt(first.image.clone()));

    let mut cluster = Mapping::new();
    put(&mut cluster, "image", image);
    put(&mut cluster, "regions", Value::Sequence(vec![Value::Mapping(region)]));
    put(&mut cluster, "service", service);
    put_serialized(&mut cluster, "localityLabels", &first.locality_labels)?;
    put(
        &mut cluster,
        "loggingConfigMapName",
        opt(first.logging_config_map_name.clone()),
    );
    put_serialized(&mut cluster, "flags", &first.flags)?;
    if let Some(store) = first.data_stores.first() {
        let mut data_store = Mapping::new();
        put_serialized(&mut data_store, "volumeClaimTemplate", &store.volume_claim_template)?;
        put_serialized(&mut data_store, "options", &store.options)?;
        put(&mut cluster, "dataStore", data_store);
    }
    put_serialized(&mut cluster, "walFailoverSpec", &first.wal_failover_spec)?;
    put_serialized(&mut cluster, "resources", &first.resource_requirements)?;
    put_serialized(&mut cluster, "tolerations", &first.tolerations)?;
    put_serialized(&mut cluster, "nodeSelector", &first.node_selector)?;
    put_serialized(&mut cluster, "affinity", &first.affinity)?;
    put_serialized(&mut cluster, "topologySpreadConstraints", &first.topology_spread_constraints)?;
    put_serialized(&mut cluster, "podLabels", &first.pod_labels)?;
    put_serialized(&mut cluster, "podAnnotations", &first.pod_annotations)?;
    put(
        &mut cluster,
        "terminationGracePeriod",
        opt(first
            .termination_grace_period_seconds
            .map(|s| format!("{}s", s))),
    );

    let mut tls = Mapping::new();
    put(&mut tls, "enabled", !security.is_empty());
    if let Some(certs) = external_certificates(security) {
        let mut external = Mapping::new();
        put(&mut external, "enabled", true);
        put_serialized(&mut external, "certificates", &certs)?;
        put(&mut tls, "externalCertificates", external);
    }

    let mut cockroachdb = Mapping::new();
    put(&mut cockroachdb, "clusterDomain", opt(target.cluster_domain.clone()));
    put(&mut cockroachdb, "tls", tls);
    put(&mut cockroachdb, "crdbCluster", cluster);

    let mut root = Mapping::new();
    put(&mut root, "cockroachdb", cockroachdb);
    Ok(Value::Mapping(root))
}

/// `crdbnode-<i>.yaml` per node, then `values.yaml`.
pub fn build(
    observation: &ClusterObservation,
    security: &SecurityMaterialMap,
    target: &TargetSettings,
) -> Result<Vec<ManifestFile>> {
    let nodes = observation
        .nodes
        .iter()
        .map(|node| build_node(observation, node, security, target))
        .collect::<Result<Vec<_>>>()?;
    let mut files = Vec::with_capacity(nodes.len() + 1);
    for (i, node) in nodes.iter().enumerate() {
        files.push(ManifestFile::new(
            format!("crdbnode-{}.yaml", i),
            vec![to_document(node)?],
        ));
    }
    files.push(ManifestFile::new(
        "values.yaml",
        vec![build_values(observation, &nodes, security, target)?],
    ));
    Ok(files)
}
