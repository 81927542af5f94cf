// Builds the scheme-neutral observation of a running cluster from a read snapshot.
// Everything here is derived from live pods and claims, not from declared intent.

pub mod command_line;
pub mod storage;
pub mod wal_failover;

use crate::config::SourceKind;
use crate::error::{MigrateError, Result};
use crate::platform::{SourceController, SourceSnapshot};
use crate::types::{
    CrdbNodeSpec, ExternalCertificates, DATA_VOLUME, FAILOVER_VOLUME, LEGACY_CONTAINER,
    LOG_CONFIG_VOLUME, MANAGED_ENV, MANAGED_POD_LABELS, OPERATOR_CONTAINER,
};
use command_line::{parse_start_command, StartFlags};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, Pod, PodSpec, ResourceRequirements, Service, Toleration,
    TopologySpreadConstraint,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use storage::{ClaimTemplate, StorageDescriptor};
use tracing::{debug, info};
use wal_failover::WalFailoverMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    Enabled,
    Disabled,
}

/// How the logging configuration is stored on the source side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggingRef {
    Secret(String),
    ConfigMap(String),
}

impl LoggingRef {
    pub fn name(&self) -> &str {
        match self {
            LoggingRef::Secret(n) | LoggingRef::ConfigMap(n) => n,
        }
    }
}

/// Placement and runtime policy copied from the source pod template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodPolicy {
    pub image: Option<String>,
    pub service_account_name: Option<String>,
    pub termination_grace_period_seconds: Option<i64>,
    pub tolerations: Vec<Toleration>,
    pub node_selector: BTreeMap<String, String>,
    pub affinity: Option<Affinity>,
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    pub resources: Option<ResourceRequirements>,
    pub env: Vec<EnvVar>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

fn user_env(env: &[EnvVar]) -> Vec<EnvVar> {
    env.iter()
        .filter(|e| !MANAGED_ENV.contains(&e.name.as_str()))
        .cloned()
        .collect()
}

fn user_labels(labels: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    labels
        .into_iter()
        .flatten()
        .filter(|(k, _)| !MANAGED_POD_LABELS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl PodPolicy {
    fn from_pod_spec(spec: &PodSpec, container: &Container, meta: Option<&ObjectMeta>) -> Self {
        PodPolicy {
            image: container.image.clone(),
            service_account_name: spec.service_account_name.clone(),
            termination_grace_period_seconds: spec.termination_grace_period_seconds,
            tolerations: spec.tolerations.clone().unwrap_or_default(),
            node_selector: spec.node_selector.clone().unwrap_or_default(),
            affinity: spec.affinity.clone(),
            topology_spread_constraints: spec.topology_spread_constraints.clone().unwrap_or_default(),
            resources: container.resources.clone(),
            env: user_env(container.env.as_deref().unwrap_or_default()),
            labels: user_labels(meta.and_then(|m| m.labels.as_ref())),
            annotations: meta.and_then(|m| m.annotations.clone()).unwrap_or_default(),
        }
    }

    fn from_crdb_node(spec: &CrdbNodeSpec) -> Self {
        PodPolicy {
            image: spec.image.clone(),
            service_account_name: spec.service_account_name.clone(),
            termination_grace_period_seconds: spec.termination_grace_period_seconds,
            tolerations: spec.tolerations.clone(),
            node_selector: spec.node_selector.clone(),
            affinity: spec.affinity.clone(),
            topology_spread_constraints: spec.topology_spread_constraints.clone(),
            resources: spec.resource_requirements.clone(),
            env: user_env(&spec.env),
            labels: user_labels(Some(&spec.pod_labels)),
            annotations: spec.pod_annotations.clone(),
        }
    }
}

/// What one node actually runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeObservation {
    pub index: usize,
    pub pod_name: String,
    pub host: String,
    pub flags: StartFlags,
    pub wal_failover: WalFailoverMode,
    pub storage: Vec<StorageDescriptor>,
    pub failover: Option<StorageDescriptor>,
}

impl NodeObservation {
    /// Descriptors that back data stores, i.e. everything but the failover volume.
    pub fn data_storage(&self) -> impl Iterator<Item = &StorageDescriptor> {
        self.storage.iter().filter(|d| d.name != FAILOVER_VOLUME)
    }

    /// The failover volume when it is attached but failover is not in side-disk mode.
    pub fn idle_failover_volume(&self) -> Option<&StorageDescriptor> {
        if self.failover.is_some() {
            return None;
        }
        self.storage.iter().find(|d| d.name == FAILOVER_VOLUME)
    }
}

/// Canonical, scheme-neutral snapshot of a running cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterObservation {
    pub cluster: String,
    pub namespace: String,
    pub source: SourceKind,
    pub security: SecurityMode,
    pub logging: Option<LoggingRef>,
    /// Trust material names declared by an operator-managed source.
    pub certificates: Option<ExternalCertificates>,
    pub policy: PodPolicy,
    pub public_service: Option<Service>,
    pub nodes: Vec<NodeObservation>,
}

impl ClusterObservation {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Cluster-level flags; node 0 is representative.
    pub fn flags(&self) -> &StartFlags {
        &self.nodes[0].flags
    }

    pub fn wal_failover(&self) -> &WalFailoverMode {
        &self.nodes[0].wal_failover
    }
}

fn db_container<'a>(pod: &'a Pod, preferred: &str) -> Result<&'a Container> {
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();
    containers
        .iter()
        .find(|c| c.name == preferred)
        .or_else(|| containers.first())
        .ok_or_else(|| MigrateError::not_found("Container", format!("{}/{}", name, preferred)))
}

fn start_command(container: &Container) -> Vec<String> {
    container
        .command
        .iter()
        .flatten()
        .chain(container.args.iter().flatten())
        .cloned()
        .collect()
}

fn pod_logging(pod: &Pod) -> Option<LoggingRef> {
    let volume = pod
        .spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.name == LOG_CONFIG_VOLUME)?;
    if let Some(secret) = &volume.secret {
        return secret.secret_name.clone().map(LoggingRef::Secret);
    }
    volume
        .config_map
        .as_ref()
        .map(|cm| LoggingRef::ConfigMap(cm.name.clone()))
}

fn crdb_node_templates(spec: &CrdbNodeSpec) -> Vec<ClaimTemplate> {
    let mut templates: Vec<ClaimTemplate> = spec
        .data_stores
        .iter()
        .map(|ds| ClaimTemplate {
            name: ds
                .volume_claim_template
                .metadata
                .name
                .clone()
                .unwrap_or_else(|| ds.name.clone()),
            storage_class: ds
                .volume_claim_template
                .spec
                .as_ref()
                .and_then(|s| s.storage_class_name.clone()),
        })
        .collect();
    if templates.is_empty() {
        templates.push(ClaimTemplate {
            name: DATA_VOLUME.to_string(),
            storage_class: None,
        });
    }
    if let Some(wal) = &spec.wal_failover_spec {
        templates.push(ClaimTemplate {
            name: wal.name.clone(),
            storage_class: wal.storage_class_name.clone(),
        });
    }
    templates
}

/// Interprets one pod: flags, failover classification and its storage.
fn observe_node(
    index: usize,
    pod: &Pod,
    container_name: &str,
    templates: &[ClaimTemplate],
    snapshot: &SourceSnapshot,
) -> Result<NodeObservation> {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let container = db_container(pod, container_name)?;
    let flags = parse_start_command(&start_command(container))?;
    let wal_failover =
        wal_failover::classify(flags.wal_failover.as_deref(), flags.store_count())?;
    let storage = storage::resolve_node(index, pod, container, templates, &snapshot.claims)?;
    let failover = storage::failover_descriptor(index, &pod_name, &wal_failover, &storage)?;
    let host = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .unwrap_or_default();

    debug!(node = index, pod = %pod_name, host = %host, extra_flags = flags.extra.len(), "observed node");
    Ok(NodeObservation {
        index,
        pod_name,
        host,
        flags,
        wal_failover,
        storage,
        failover,
    })
}

/// Derives the observation; any unreadable node aborts the whole observation.
pub fn observe(snapshot: &SourceSnapshot) -> Result<ClusterObservation> {
    let first_pod = snapshot
        .pods
        .first()
        .ok_or_else(|| MigrateError::not_found("Pod", format!("{}-0", snapshot.cluster)))?;

    let (source, policy, logging, certificates, claim_templates) = match &snapshot.controller {
        SourceController::StatefulSet(sts) => {
            let spec = sts
                .spec
                .as_ref()
                .ok_or_else(|| MigrateError::not_found("StatefulSetSpec", snapshot.cluster.as_str()))?;
            let template_spec = spec.template.spec.as_ref().ok_or_else(|| {
                MigrateError::not_found("PodTemplateSpec", snapshot.cluster.as_str())
            })?;
            let container = template_spec
                .containers
                .iter()
                .find(|c| c.name == LEGACY_CONTAINER)
                .or_else(|| template_spec.containers.first())
                .ok_or_else(|| MigrateError::not_found("Container", LEGACY_CONTAINER))?;
            (
                SourceKind::StatefulSet,
                PodPolicy::from_pod_spec(template_spec, container, spec.template.metadata.as_ref()),
                pod_logging(first_pod),
                None,
                storage::claim_templates(spec.volume_claim_templates.as_deref().unwrap_or_default()),
            )
        }
        SourceController::CrdbNodes(nodes) => {
            let first = &nodes[0].spec;
            (
                SourceKind::CrdbNode,
                PodPolicy::from_crdb_node(first),
                first
                    .logging_config_map_name
                    .clone()
                    .map(LoggingRef::ConfigMap),
                first
                    .certificates
                    .as_ref()
                    .and_then(|c| c.external_certificates.clone()),
                crdb_node_templates(first),
            )
        }
    };

    let container_name = match source {
        SourceKind::StatefulSet => LEGACY_CONTAINER,
        SourceKind::CrdbNode => OPERATOR_CONTAINER,
    };
    let nodes = snapshot
        .pods
        .iter()
        .enumerate()
        .map(|(index, pod)| {
            let templates = match &snapshot.controller {
                SourceController::CrdbNodes(nodes) => crdb_node_templates(&nodes[index].spec),
                SourceController::StatefulSet(_) => claim_templates.clone(),
            };
            observe_node(index, pod, container_name, &templates, snapshot)
        })
        .collect::<Result<Vec<_>>>()?;

    let security = if nodes[0].flags.insecure {
        SecurityMode::Disabled
    } else {
        SecurityMode::Enabled
    };
    info!(
        cluster = %snapshot.cluster,
        nodes = nodes.len(),
        secure = security == SecurityMode::Enabled,
        wal_failover = %nodes[0].wal_failover.flag_value(),
        "observed cluster"
    );
    Ok(ClusterObservation {
        cluster: snapshot.cluster.clone(),
        namespace: snapshot.namespace.clone(),
        source,
        security,
        logging,
        certificates,
        policy,
        public_service: snapshot.public_service.clone(),
        nodes,
    })
}
