// Well-known names shared by both management schemes, and the CrdbNode schema.
// Source objects use the k8s-openapi types; CrdbNode is ours since no typed crate ships it.

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, PersistentVolumeClaim, ResourceRequirements, Toleration,
    TopologySpreadConstraint,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

pub const CRDB_GROUP: &str = "crdb.cockroachlabs.com";
pub const CRDB_VERSION: &str = "v1alpha1";
pub const CRDB_API_VERSION: &str = "crdb.cockroachlabs.com/v1alpha1";
pub const CRDBNODE_KIND: &str = "CrdbNode";
pub const CLUSTER_LABEL: &str = "crdb.cockroachlabs.com/cluster";

/// Field manager used for the few server-side applies we perform.
pub const FIELD_MANAGER: &str = "crdb-migrate";

pub const DATA_VOLUME: &str = "datadir";
pub const FAILOVER_VOLUME: &str = "failoverdir";
pub const LOG_CONFIG_VOLUME: &str = "log-config";

/// Database container name in a StatefulSet pod and in an operator pod.
pub const LEGACY_CONTAINER: &str = "db";
pub const OPERATOR_CONTAINER: &str = "cockroachdb";

pub const DEFAULT_SQL_PORT: u16 = 26257;
pub const DEFAULT_GRPC_PORT: u16 = 26258;
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Set by the scheduler on claims bound with WaitForFirstConsumer.
pub const SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";

pub const LEGACY_LOG_KEY: &str = "log-config.yaml";
pub const OPERATOR_LOG_KEY: &str = "logs.yaml";
pub const CA_KEY: &str = "ca.crt";

/// Secret key → config object key when log configuration changes representation.
pub const LOG_KEY_RENAMES: [(&str, &str); 1] = [(LEGACY_LOG_KEY, OPERATOR_LOG_KEY)];

/// Labels the platform or a controller adds to pods; never copied to the target.
pub const MANAGED_POD_LABELS: [&str; 5] = [
    "controller-revision-hash",
    "statefulset.kubernetes.io/pod-name",
    "apps.kubernetes.io/pod-index",
    "pod-template-hash",
    CLUSTER_LABEL,
];

/// Environment each scheme injects on its own.
pub const MANAGED_ENV: [&str; 4] = ["STATEFULSET_NAME", "STATEFULSET_FQDN", "HOST_IP", "POD_NAME"];

/// Start flags outside the recognized set, in first-seen order.
/// Re-inserting a key replaces its value but keeps its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraFlags(Vec<(String, String)>);

impl ExtraFlags {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders back to command-line form; bare flags stay bare.
    pub fn to_args(&self) -> Vec<String> {
        self.iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.to_string()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect()
    }
}

impl Serialize for ExtraFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ExtraFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FlagsVisitor;

        impl<'de> Visitor<'de> for FlagsVisitor {
            type Value = ExtraFlags;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of flag names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ExtraFlags, A::Error> {
                let mut flags = ExtraFlags::default();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    flags.insert(k, v);
                }
                Ok(flags)
            }
        }

        deserializer.deserialize_map(FlagsVisitor)
    }
}

/// One node of the operator-managed scheme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrdbNode {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CrdbNodeSpec,
}

impl CrdbNode {
    pub fn new(metadata: ObjectMeta, spec: CrdbNodeSpec) -> Self {
        CrdbNode {
            api_version: CRDB_API_VERSION.to_string(),
            kind: CRDBNODE_KIND.to_string(),
            metadata,
            spec,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrdbNodeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub join: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locality_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging_config_map_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<Certificates>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_stores: Vec<DataStore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_failover_spec: Option<WalFailoverSpec>,
    #[serde(default, skip_serializing_if = "ExtraFlags::is_empty")]
    pub flags: ExtraFlags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_requirements: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Certificates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_certificates: Option<ExternalCertificates>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCertificates {
    pub ca_config_map_name: String,
    pub node_secret_name: String,
    pub root_sql_client_secret_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataStore {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Remaining `--store` fields such as `attrs=ssd`, passed through verbatim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    pub volume_claim_template: PersistentVolumeClaim,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WalFailoverSpec {
    /// `enable` or `disable`; a disabled spec still keeps the volume attached.
    pub status: String,
    pub name: String,
    pub path: String,
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Parses the ordinal suffix of `<cluster>-<i>`.
pub fn ordinal_of(cluster: &str, name: &str) -> Option<usize> {
    name.strip_prefix(cluster)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

pub fn node_name(cluster: &str, ordinal: usize) -> String {
    format!("{}-{}", cluster, ordinal)
}

/// Claim name both schemes derive from a template and a pod name.
pub fn claim_name(template: &str, pod: &str) -> String {
    format!("{}-{}", template, pod)
}
