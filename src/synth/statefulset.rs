// CrdbNode → StatefulSet: pre-bound claims per node, chart values, the public
// service re-pointed at StatefulSet pods, and the RBAC bundle.

use super::rbac::RbacBundle;
use super::{opt, put, put_serialized, to_document, ManifestFile};
use crate::bridge::{MaterialRole, SecurityMaterialMap};
use crate::config::TargetSettings;
use crate::error::{MigrateError, Result};
use crate::observe::command_line::store_options;
use crate::observe::storage::StorageDescriptor;
use crate::observe::wal_failover::WalFailoverMode;
use crate::observe::{ClusterObservation, NodeObservation};
use crate::platform::public_service_name;
use crate::types::{claim_name, FAILOVER_VOLUME};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Service, ServicePort, ServiceSpec,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Labels the chart puts on StatefulSet pods.
pub fn pod_selector(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/component".to_string(), "cockroachdb".to_string()),
        ("app.kubernetes.io/instance".to_string(), cluster.to_string()),
        ("app.kubernetes.io/name".to_string(), "cockroachdb".to_string()),
    ])
}

fn chart_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/instance".to_string(), cluster.to_string()),
        ("app.kubernetes.io/name".to_string(), "cockroachdb".to_string()),
    ])
}

/// The StatefulSet renders one flag set for every pod, so all nodes must agree.
fn check_uniform(observation: &ClusterObservation) -> Result<()> {
    let first = &observation.nodes[0];
    for node in &observation.nodes[1..] {
        if node.flags != first.flags {
            return Err(MigrateError::Validation(format!(
                "node {} ('{}') runs with different flags than node 0; a StatefulSet cannot express per-node flags",
                node.index, node.pod_name
            )));
        }
    }
    Ok(())
}

/// A claim named the way the StatefulSet controller will look it up, bound to
/// the volume that already holds the node's data.
fn bound_claim(
    observation: &ClusterObservation,
    node: &NodeObservation,
    descriptor: &StorageDescriptor,
) -> Result<PersistentVolumeClaim> {
    let expected = claim_name(&descriptor.name, &node.pod_name);
    if descriptor.claim_name != expected {
        return Err(MigrateError::Validation(format!(
            "node {}: claim '{}' cannot be adopted by a StatefulSet, which expects '{}'",
            node.index, descriptor.claim_name, expected
        )));
    }
    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(expected),
            namespace: Some(observation.namespace.clone()),
            labels: Some(chart_labels(&observation.cluster)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(descriptor.access_modes.clone()).filter(|m| !m.is_empty()),
            storage_class_name: descriptor.storage_class.clone(),
            volume_name: descriptor.volume_name.clone(),
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
    })
}

pub fn build_claims(observation: &ClusterObservation, node: &NodeObservation) -> Result<Vec<PersistentVolumeClaim>> {
    node.storage
        .iter()
        .map(|d| bound_claim(observation, node, d))
        .collect()
}

/// Splits `repo:tag`; a registry port is not a tag.
fn split_image(image: &str) -> (String, Option<String>) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) if !image.contains('@') => {
            let at = name_start + i;
            (image[..at].to_string(), Some(image[at + 1..].to_string()))
        }
        _ => (image.to_string(), None),
    }
}

fn storage_block(descriptor: &StorageDescriptor) -> Mapping {
    let mut pv = Mapping::new();
    put(&mut pv, "enabled", true);
    put(&mut pv, "size", descriptor.size.as_str());
    put(&mut pv, "storageClass", opt(descriptor.storage_class.clone()));
    pv
}

fn size_mismatch(observation: &ClusterObservation, name: &str) -> bool {
    let sizes: Vec<_> = observation
        .nodes
        .iter()
        .filter_map(|n| n.storage.iter().find(|d| d.name == name))
        .map(|d| d.size.as_str())
        .collect();
    sizes.windows(2).any(|w| w[0] != w[1])
}

/// Account the StatefulSet pods run as; the RBAC bundle binds the same one.
pub fn service_account_name(observation: &ClusterObservation) -> String {
    observation
        .policy
        .service_account_name
        .clone()
        .unwrap_or_else(|| observation.cluster.clone())
}

/// `conf.store` for the chart. The chart renders one field set for every store,
/// so all `--store` flags must carry the same fields besides their path.
fn store_values(node: &NodeObservation, data_volumes: usize) -> Result<Mapping> {
    let mut shared: Option<Vec<String>> = None;
    for store in &node.flags.stores {
        let options = store_options(store);
        if let Some(seen) = &shared {
            if *seen != options {
                return Err(MigrateError::Validation(format!(
                    "node {}: stores carry different fields ({} vs {}); the chart renders one set",
                    node.index,
                    seen.join(","),
                    options.join(",")
                )));
            }
        }
        shared = Some(options);
    }

    let mut fields = Mapping::new();
    for option in shared.unwrap_or_default() {
        let (key, value) = option.split_once('=').unwrap_or((option.as_str(), ""));
        match key {
            "attrs" | "size" => put(&mut fields, key, value),
            other => {
                return Err(MigrateError::Validation(format!(
                    "node {}: store field '{}' has no StatefulSet chart value",
                    node.index, other
                )))
            }
        }
    }

    let mut block = Mapping::new();
    if data_volumes > 1 || !fields.is_empty() {
        put(&mut block, "enabled", true);
        if data_volumes > 1 {
            put(&mut block, "count", data_volumes as u64);
        }
        block.extend(fields);
    }
    Ok(block)
}

fn wal_failover_values(node: &NodeObservation) -> Mapping {
    let mut wal = Mapping::new();
    match &node.wal_failover {
        WalFailoverMode::Disabled => {}
        mode => put(&mut wal, "value", mode.flag_value()),
    }
    let volume = node
        .failover
        .as_ref()
        .or_else(|| node.storage.iter().find(|d| d.name == FAILOVER_VOLUME));
    if let Some(volume) = volume {
        put(&mut wal, "persistentVolume", storage_block(volume));
    }
    wal
}

/// Cluster values for the StatefulSet chart. Node 0 is representative; the
/// flags were checked to be uniform.
pub fn build_values(
    observation: &ClusterObservation,
    security: &SecurityMaterialMap,
    target: &TargetSettings,
) -> Result<Value> {
    let node = &observation.nodes[0];
    let flags = &node.flags;
    let policy = &observation.policy;

    let mut image = Mapping::new();
    if let Some(reference) = target.image.as_ref().or(policy.image.as_ref()) {
        let (repository, tag) = split_image(reference);
        put(&mut image, "repository", repository);
        put(&mut image, "tag", opt(tag));
    }

    let mut service_account = Mapping::new();
    put(&mut service_account, "create", false);
    put(&mut service_account, "name", service_account_name(observation));

    let mut statefulset = Mapping::new();
    put(&mut statefulset, "replicas", observation.node_count() as u64);
    put_serialized(&mut statefulset, "args", &flags.extra.to_args())?;
    put_serialized(&mut statefulset, "labels", &policy.labels)?;
    put_serialized(&mut statefulset, "annotations", &policy.annotations)?;
    put_serialized(&mut statefulset, "env", &policy.env)?;
    put_serialized(&mut statefulset, "resources", &policy.resources)?;
    put_serialized(&mut statefulset, "tolerations", &policy.tolerations)?;
    put_serialized(&mut statefulset, "nodeSelector", &policy.node_selector)?;
    if let Some(affinity) = &policy.affinity {
        put_serialized(&mut statefulset, "nodeAffinity", &affinity.node_affinity)?;
        put_serialized(&mut statefulset, "podAffinity", &affinity.pod_affinity)?;
        put_serialized(&mut statefulset, "podAntiAffinity", &affinity.pod_anti_affinity)?;
    }
    put_serialized(&mut statefulset, "topologySpreadConstraints", &policy.topology_spread_constraints)?;
    put(
        &mut statefulset,
        "terminationGracePeriodSeconds",
        opt(policy.termination_grace_period_seconds),
    );
    put(&mut statefulset, "serviceAccount", service_account);

    let mut external = Mapping::new();
    put(&mut external, "port", u64::from(flags.sql_port));
    let mut internal = Mapping::new();
    put(&mut internal, "port", u64::from(flags.grpc_port));
    let mut grpc = Mapping::new();
    put(&mut grpc, "external", external);
    put(&mut grpc, "internal", internal);
    let mut http = Mapping::new();
    put(&mut http, "port", u64::from(flags.http_port));
    let mut ports = Mapping::new();
    put(&mut ports, "grpc", grpc);
    put(&mut ports, "http", http);
    let mut service = Mapping::new();
    put(&mut service, "ports", ports);

    let mut conf = Mapping::new();
    put_serialized(&mut conf, "join", &flags.join)?;
    put(&mut conf, "locality", opt(flags.locality_flag()));
    put(&mut conf, "wal-failover", wal_failover_values(node));
    let data: Vec<&StorageDescriptor> = node.data_storage().collect();
    put(&mut conf, "store", store_values(node, data.len())?);
    if let Some(logging) = &observation.logging {
        let mut log = Mapping::new();
        put(&mut log, "enabled", true);
        put(&mut log, "existingConfigMap", logging.name());
        put(&mut conf, "log", log);
    }

    let mut storage = Mapping::new();
    if let Some(first) = data.first() {
        if size_mismatch(observation, &first.name) {
            warn!(volume = %first.name, "data volume sizes differ between nodes; values carry node 0's size");
        }
        put(&mut storage, "persistentVolume", storage_block(first));
    }

    let mut tls = Mapping::new();
    put(&mut tls, "enabled", !security.is_empty());
    if !security.is_empty() {
        let name = |role| security.target(role).map(|r| r.name.clone()).unwrap_or_default();
        let mut certs = Mapping::new();
        put(&mut certs, "provided", true);
        put(&mut certs, "nodeSecret", name(MaterialRole::Node));
        put(&mut certs, "clientRootSecret", name(MaterialRole::Client));
        put(&mut tls, "certs", certs);
    }

    let mut root = Mapping::new();
    put(&mut root, "fullnameOverride", observation.cluster.as_str());
    put(&mut root, "clusterDomain", opt(target.cluster_domain.clone()));
    put(&mut root, "image", image);
    put(&mut root, "statefulset", statefulset);
    put(&mut root, "service", service);
    put(&mut root, "conf", conf);
    put(&mut root, "storage", storage);
    put(&mut root, "tls", tls);
    Ok(Value::Mapping(root))
}

fn service_port(name: &str, port: u16, target: &str) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: i32::from(port),
        target_port: Some(IntOrString::String(target.to_string())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// The existing public service with its selector moved to StatefulSet pods,
/// or a fresh one when the source had none.
pub fn build_public_service(observation: &ClusterObservation) -> Service {
    let flags = observation.flags();
    let selector = pod_selector(&observation.cluster);
    match &observation.public_service {
        Some(existing) => {
            let mut svc = existing.clone();
            svc.status = None;
            svc.metadata = ObjectMeta {
                name: existing.metadata.name.clone(),
                namespace: existing.metadata.namespace.clone(),
                labels: existing.metadata.labels.clone(),
                annotations: existing.metadata.annotations.clone().map(|mut a| {
                    a.remove("kubectl.kubernetes.io/last-applied-configuration");
                    a
                }),
                ..Default::default()
            };
            if let Some(spec) = svc.spec.as_mut() {
                spec.selector = Some(selector);
                spec.cluster_ip = None;
                spec.cluster_ips = None;
            }
            svc
        }
        None => Service {
            metadata: ObjectMeta {
                name: Some(public_service_name(&observation.cluster)),
                namespace: Some(observation.namespace.clone()),
                labels: Some(chart_labels(&observation.cluster)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ports: Some(vec![
                    service_port("grpc", flags.sql_port, "grpc"),
                    service_port("http", flags.http_port, "http"),
                ]),
                selector: Some(selector),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

/// `persistentvolumeclaim-<i>.yaml` per node, then values, public service and RBAC.
pub fn build(
    observation: &ClusterObservation,
    security: &SecurityMaterialMap,
    target: &TargetSettings,
) -> Result<Vec<ManifestFile>> {
    check_uniform(observation)?;
    let mut files = Vec::with_capacity(observation.node_count() + 3);
    for node in &observation.nodes {
        let claims = build_claims(observation, node)?;
        debug!(node = node.index, claims = claims.len(), "built bound claims");
        files.push(ManifestFile::new(
            format!("persistentvolumeclaim-{}.yaml", node.index),
            claims.iter().map(to_document).collect::<Result<Vec<_>>>()?,
        ));
    }
    files.push(ManifestFile::new(
        "values.yaml",
        vec![build_values(observation, security, target)?],
    ));
    files.push(ManifestFile::new(
        "public-service.yaml",
        vec![to_document(&build_public_service(observation))?],
    ));
    files.push(ManifestFile::new(
        "rbac.yaml",
        RbacBundle::new(
            &observation.cluster,
            &observation.namespace,
            &service_account_name(observation),
        )
        .documents()?,
    ));
    Ok(files)
}
