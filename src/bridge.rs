// Renames trust material and re-shapes the logging configuration between schemes.
// The only writes against the source cluster live here; both are additive and idempotent.

use crate::error::{MigrateError, Result};
use crate::observe::{ClusterObservation, LoggingRef, SecurityMode};
use crate::platform::ObjectStore;
use crate::synth::Direction;
use crate::types::{CA_KEY, LEGACY_LOG_KEY, LOG_KEY_RENAMES, OPERATOR_LOG_KEY};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaterialRole {
    Ca,
    Node,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MaterialKind {
    Secret,
    ConfigMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterialRef {
    pub kind: MaterialKind,
    pub name: String,
    /// Set when the material is one key of a larger object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl MaterialRef {
    fn secret(name: String) -> Self {
        MaterialRef {
            kind: MaterialKind::Secret,
            name,
            key: None,
        }
    }

    fn config_map(name: String) -> Self {
        MaterialRef {
            kind: MaterialKind::ConfigMap,
            name,
            key: None,
        }
    }

    fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterialRename {
    pub role: MaterialRole,
    pub from: MaterialRef,
    pub to: MaterialRef,
}

/// Source-scheme trust material names mapped to target-scheme names.
/// Empty when the cluster runs insecure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecurityMaterialMap {
    renames: Vec<MaterialRename>,
}

impl SecurityMaterialMap {
    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MaterialRename> {
        self.renames.iter()
    }

    pub fn target(&self, role: MaterialRole) -> Option<&MaterialRef> {
        self.renames.iter().find(|r| r.role == role).map(|r| &r.to)
    }

    /// Pure naming; no object is read.
    pub fn for_direction(direction: Direction, observation: &ClusterObservation) -> Self {
        if observation.security == SecurityMode::Disabled {
            return SecurityMaterialMap::default();
        }
        let cluster = &observation.cluster;
        let renames = match direction {
            Direction::ToCrdbNodes => {
                let node = format!("{}-node-secret", cluster);
                vec![
                    MaterialRename {
                        role: MaterialRole::Ca,
                        from: MaterialRef::secret(node.clone()).with_key(CA_KEY),
                        to: MaterialRef::config_map(format!("{}-ca-crt", cluster)).with_key(CA_KEY),
                    },
                    MaterialRename {
                        role: MaterialRole::Node,
                        from: MaterialRef::secret(node),
                        to: MaterialRef::secret(format!("{}-node-certs", cluster)),
                    },
                    MaterialRename {
                        role: MaterialRole::Client,
                        from: MaterialRef::secret(format!("{}-client-secret", cluster)),
                        to: MaterialRef::secret(format!("{}-client-certs", cluster)),
                    },
                ]
            }
            Direction::ToStatefulSet => {
                let (ca, node, client) = match &observation.certificates {
                    Some(certs) => (
                        certs.ca_config_map_name.clone(),
                        certs.node_secret_name.clone(),
                        certs.root_sql_client_secret_name.clone(),
                    ),
                    None => (
                        format!("{}-ca-crt", cluster),
                        format!("{}-node-certs", cluster),
                        format!("{}-client-certs", cluster),
                    ),
                };
                let node_secret = format!("{}-node-secret", cluster);
                vec![
                    MaterialRename {
                        role: MaterialRole::Ca,
                        from: MaterialRef::config_map(ca).with_key(CA_KEY),
                        to: MaterialRef::secret(node_secret.clone()).with_key(CA_KEY),
                    },
                    MaterialRename {
                        role: MaterialRole::Node,
                        from: MaterialRef::secret(node),
                        to: MaterialRef::secret(node_secret),
                    },
                    MaterialRename {
                        role: MaterialRole::Client,
                        from: MaterialRef::secret(client),
                        to: MaterialRef::secret(format!("{}-client-secret", cluster)),
                    },
                ]
            }
        };
        SecurityMaterialMap { renames }
    }
}

/// Builds the map and checks that every source object it names exists.
pub fn security_map(
    store: &impl ObjectStore,
    direction: Direction,
    observation: &ClusterObservation,
) -> Result<SecurityMaterialMap> {
    let map = SecurityMaterialMap::for_direction(direction, observation);
    for rename in map.iter() {
        let ns = observation.namespace.as_str();
        let name = rename.from.name.as_str();
        let found = match rename.from.kind {
            MaterialKind::Secret => store.secret(ns, name)?.is_some(),
            MaterialKind::ConfigMap => store.config_map(ns, name)?.is_some(),
        };
        if !found {
            let kind = match rename.from.kind {
                MaterialKind::Secret => "Secret",
                MaterialKind::ConfigMap => "ConfigMap",
            };
            return Err(MigrateError::not_found(kind, format!("{}/{}", ns, name)));
        }
    }
    Ok(map)
}

/// Re-keys trust material under the target scheme's names. Certificate
/// issuance lives outside this crate; implementations call into it.
pub trait CertificateRekeyer {
    fn rekey(&self, namespace: &str, map: &SecurityMaterialMap) -> Result<()>;
}

/// Reports the renames for whoever provisions certificates by hand.
pub struct ManualRekeyer;

impl CertificateRekeyer for ManualRekeyer {
    fn rekey(&self, namespace: &str, map: &SecurityMaterialMap) -> Result<()> {
        for rename in map.iter() {
            warn!(
                namespace,
                role = ?rename.role,
                from = %rename.from.name,
                to = %rename.to.name,
                "trust material must be provided under the new name before cutover"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeOutcome {
    Applied,
    Unchanged,
    Skipped,
}

fn log_config_map(namespace: &str, name: &str, data: BTreeMap<String, String>, labels: Option<BTreeMap<String, String>>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels,
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Copies a logging secret into a config object of the same name, renaming keys.
/// Existing config keys the secret does not carry are kept.
pub fn bridge_log_secret(store: &impl ObjectStore, namespace: &str, name: &str) -> Result<BridgeOutcome> {
    let secret = store
        .secret(namespace, name)?
        .ok_or_else(|| MigrateError::not_found("Secret", format!("{}/{}", namespace, name)))?;

    let mut payload: BTreeMap<String, String> = BTreeMap::new();
    for (key, bytes) in secret.data.iter().flatten() {
        let text = String::from_utf8(bytes.0.clone()).map_err(|_| {
            MigrateError::Validation(format!("secret '{}' key '{}' is not UTF-8", name, key))
        })?;
        payload.insert(key.clone(), text);
    }
    for (key, text) in secret.string_data.iter().flatten() {
        payload.insert(key.clone(), text.clone());
    }

    let existing = store.config_map(namespace, name)?;
    let mut data = existing
        .as_ref()
        .and_then(|cm| cm.data.clone())
        .unwrap_or_default();
    for (key, text) in payload {
        let renamed = LOG_KEY_RENAMES
            .iter()
            .find(|(from, _)| *from == key)
            .map(|(_, to)| to.to_string())
            .unwrap_or(key);
        data.insert(renamed, text);
    }

    if existing.as_ref().and_then(|cm| cm.data.as_ref()) == Some(&data) {
        info!(namespace, name, "logging config object already up to date");
        return Ok(BridgeOutcome::Unchanged);
    }
    let labels = existing
        .and_then(|cm| cm.metadata.labels)
        .or(secret.metadata.labels);
    store.apply_config_map(namespace, &log_config_map(namespace, name, data, labels))?;
    info!(namespace, name, "copied logging secret into config object");
    Ok(BridgeOutcome::Applied)
}

/// Copies `logs.yaml` to `log-config.yaml` inside a config object, keeping the original.
pub fn relocate_log_key(store: &impl ObjectStore, namespace: &str, name: &str) -> Result<BridgeOutcome> {
    let cm = store
        .config_map(namespace, name)?
        .ok_or_else(|| MigrateError::not_found("ConfigMap", format!("{}/{}", namespace, name)))?;
    let mut data = cm.data.clone().unwrap_or_default();
    let value = data.get(OPERATOR_LOG_KEY).cloned().ok_or_else(|| {
        MigrateError::not_found("ConfigMap key", format!("{}/{}:{}", namespace, name, OPERATOR_LOG_KEY))
    })?;
    if data.get(LEGACY_LOG_KEY) == Some(&value) {
        return Ok(BridgeOutcome::Unchanged);
    }
    data.insert(LEGACY_LOG_KEY.to_string(), value);
    store.apply_config_map(namespace, &log_config_map(namespace, name, data, cm.metadata.labels))?;
    info!(namespace, name, from = OPERATOR_LOG_KEY, to = LEGACY_LOG_KEY, "relocated logging key");
    Ok(BridgeOutcome::Applied)
}

/// Runs whichever logging mutation the direction needs, if any.
pub fn bridge_logging(
    store: &impl ObjectStore,
    direction: Direction,
    observation: &ClusterObservation,
) -> Result<BridgeOutcome> {
    let ns = observation.namespace.as_str();
    match (direction, &observation.logging) {
        (Direction::ToCrdbNodes, Some(LoggingRef::Secret(name))) => bridge_log_secret(store, ns, name),
        (Direction::ToStatefulSet, Some(LoggingRef::ConfigMap(name))) => relocate_log_key(store, ns, name),
        _ => Ok(BridgeOutcome::Skipped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SnapshotStore;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;

    fn log_secret(payload: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("crdb-log-config".to_string()),
                namespace: Some("db".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                LEGACY_LOG_KEY.to_string(),
                ByteString(payload.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn test_log_secret_becomes_config_object() {
        let mut store = SnapshotStore::default();
        let payload = "sinks:\n  stderr:\n    channels: all\n";
        store.add_secret(log_secret(payload));

        let outcome = bridge_log_secret(&store, "db", "crdb-log-config").unwrap();
        assert_eq!(outcome, BridgeOutcome::Applied);
        let cm = store.config_map("db", "crdb-log-config").unwrap().unwrap();
        let data = cm.data.unwrap();
        assert_eq!(data.get(OPERATOR_LOG_KEY).map(String::as_str), Some(payload));
        assert!(!data.contains_key(LEGACY_LOG_KEY));

        let secret = store.secret("db", "crdb-log-config").unwrap().unwrap();
        assert_eq!(secret, log_secret(payload));
    }

    #[test]
    fn test_log_secret_bridge_is_idempotent() {
        let mut store = SnapshotStore::default();
        store.add_secret(log_secret("a: b"));
        assert_eq!(
            bridge_log_secret(&store, "db", "crdb-log-config").unwrap(),
            BridgeOutcome::Applied
        );
        assert_eq!(
            bridge_log_secret(&store, "db", "crdb-log-config").unwrap(),
            BridgeOutcome::Unchanged
        );
    }

    #[test]
    fn test_relocate_keeps_original_key() {
        let mut store = SnapshotStore::default();
        store.add_config_map(log_config_map(
            "db",
            "crdb-log-config",
            BTreeMap::from([(OPERATOR_LOG_KEY.to_string(), "P".to_string())]),
            None,
        ));
        assert_eq!(
            relocate_log_key(&store, "db", "crdb-log-config").unwrap(),
            BridgeOutcome::Applied
        );
        let data = store
            .config_map("db", "crdb-log-config")
            .unwrap()
            .unwrap()
            .data
            .unwrap();
        assert_eq!(data.get(OPERATOR_LOG_KEY).map(String::as_str), Some("P"));
        assert_eq!(data.get(LEGACY_LOG_KEY).map(String::as_str), Some("P"));
        assert_eq!(
            relocate_log_key(&store, "db", "crdb-log-config").unwrap(),
            BridgeOutcome::Unchanged
        );
    }

    #[test]
    fn test_relocate_missing_key_is_not_found() {
        let mut store = SnapshotStore::default();
        store.add_config_map(log_config_map("db", "crdb-log-config", BTreeMap::new(), None));
        let err = relocate_log_key(&store, "db", "crdb-log-config").unwrap_err();
        assert!(matches!(err, MigrateError::NotFound { .. }));
    }
}
