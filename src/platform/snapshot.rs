// In-memory object store, loadable from a `kubectl get -o yaml` dump.

use super::ObjectStore;
use crate::error::{MigrateError, Result};
use crate::synth::rbac::RbacBundle;
use crate::types::{CrdbNode, CLUSTER_LABEL, CRDBNODE_KIND};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

type Key = (String, String);

fn key(meta: &ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        meta.name.clone().unwrap_or_default(),
    )
}

fn lookup<T: Clone>(map: &BTreeMap<Key, T>, namespace: &str, name: &str) -> Option<T> {
    map.get(&(namespace.to_string(), name.to_string())).cloned()
}

/// Objects held in memory. Writes land in memory too, so re-runs see them.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    statefulsets: BTreeMap<Key, StatefulSet>,
    crdb_nodes: BTreeMap<Key, CrdbNode>,
    pods: BTreeMap<Key, Pod>,
    claims: BTreeMap<Key, PersistentVolumeClaim>,
    secrets: BTreeMap<Key, Secret>,
    services: BTreeMap<Key, Service>,
    config_maps: RefCell<BTreeMap<Key, ConfigMap>>,
    rbac: RefCell<Vec<String>>,
}

impl SnapshotStore {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MigrateError::io(path.display().to_string(), e))?;
        Self::from_yaml(&text)
    }

    /// Accepts a multi-document stream; `List` documents are unwrapped.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut store = SnapshotStore::default();
        for doc in serde_yaml::Deserializer::from_str(text) {
            let value = serde_yaml::Value::deserialize(doc)?;
            if value.is_null() {
                continue;
            }
            store.insert_value(value)?;
        }
        Ok(store)
    }

    fn insert_value(&mut self, value: serde_yaml::Value) -> Result<()> {
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "List" => {
                if let Some(items) = value.get("items").and_then(|i| i.as_sequence()) {
                    for item in items.clone() {
                        self.insert_value(item)?;
                    }
                }
            }
            "StatefulSet" => self.add_statefulset(serde_yaml::from_value(value)?),
            CRDBNODE_KIND => self.add_crdb_node(serde_yaml::from_value(value)?),
            "Pod" => self.add_pod(serde_yaml::from_value(value)?),
            "PersistentVolumeClaim" => self.add_claim(serde_yaml::from_value(value)?),
            "Secret" => self.add_secret(serde_yaml::from_value(value)?),
            "ConfigMap" => self.add_config_map(serde_yaml::from_value(value)?),
            "Service" => self.add_service(serde_yaml::from_value(value)?),
            other => debug!(kind = other, "skipping object kind"),
        }
        Ok(())
    }

    pub fn add_statefulset(&mut self, sts: StatefulSet) {
        self.statefulsets.insert(key(&sts.metadata), sts);
    }

    pub fn add_crdb_node(&mut self, node: CrdbNode) {
        self.crdb_nodes.insert(key(&node.metadata), node);
    }

    pub fn add_pod(&mut self, pod: Pod) {
        self.pods.insert(key(&pod.metadata), pod);
    }

    pub fn add_claim(&mut self, claim: PersistentVolumeClaim) {
        self.claims.insert(key(&claim.metadata), claim);
    }

    pub fn add_secret(&mut self, secret: Secret) {
        self.secrets.insert(key(&secret.metadata), secret);
    }

    pub fn add_config_map(&mut self, cm: ConfigMap) {
        self.config_maps.get_mut().insert(key(&cm.metadata), cm);
    }

    pub fn add_service(&mut self, svc: Service) {
        self.services.insert(key(&svc.metadata), svc);
    }

    /// Names of RBAC objects applied so far.
    #[cfg(test)]
    pub fn applied_rbac(&self) -> Vec<String> {
        self.rbac.borrow().clone()
    }
}

impl ObjectStore for SnapshotStore {
    fn statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(lookup(&self.statefulsets, namespace, name))
    }

    fn crdb_nodes(&self, namespace: &str, cluster: &str) -> Result<Vec<CrdbNode>> {
        Ok(self
            .crdb_nodes
            .iter()
            .filter(|((ns, _), node)| {
                ns == namespace
                    && node
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(CLUSTER_LABEL))
                        .is_some_and(|c| c == cluster)
            })
            .map(|(_, node)| node.clone())
            .collect())
    }

    fn pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(lookup(&self.pods, namespace, name))
    }

    fn claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(lookup(&self.claims, namespace, name))
    }

    fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(lookup(&self.secrets, namespace, name))
    }

    fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(lookup(&*self.config_maps.borrow(), namespace, name))
    }

    fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(lookup(&self.services, namespace, name))
    }

    fn apply_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        let mut cm = config_map.clone();
        cm.metadata.namespace = Some(namespace.to_string());
        self.config_maps.borrow_mut().insert(key(&cm.metadata), cm);
        Ok(())
    }

    fn apply_rbac(&self, namespace: &str, bundle: &RbacBundle) -> Result<()> {
        let mut applied = self.rbac.borrow_mut();
        for name in bundle.object_names() {
            applied.push(format!("{}/{}", namespace, name));
        }
        debug!(namespace, recorded = applied.len(), "recorded RBAC bundle");
        Ok(())
    }
}
