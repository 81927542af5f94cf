// Live platform access through kube, blocking on a runtime handle per request.

use super::ObjectStore;
use crate::error::{MigrateError, Result};
use crate::synth::rbac::RbacBundle;
use crate::types::{CrdbNode, CLUSTER_LABEL, CRDBNODE_KIND, CRDB_GROUP, CRDB_VERSION, FIELD_MANAGER};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tokio::runtime::Handle;
use tracing::{debug, info};

pub struct KubeStore {
    client: Client,
    handle: Handle,
}

impl KubeStore {
    /// Connects with the ambient kubeconfig or in-cluster credentials.
    /// Must not be called from inside an async task; use `spawn_blocking`.
    pub fn connect(handle: Handle) -> Result<Self> {
        let client = handle.block_on(Client::try_default())?;
        Ok(KubeStore { client, handle })
    }

    fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        debug!(kind = %K::kind(&Default::default()), namespace, name, "get");
        Ok(self.handle.block_on(api.get_opt(name))?)
    }

    fn apply<K>(&self, api: Api<K>, object: &K) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        let name = object.meta().name.clone().unwrap_or_default();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.handle
            .block_on(api.patch(&name, &params, &Patch::Apply(object)))?;
        Ok(())
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn crdb_node_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(CRDB_GROUP, CRDB_VERSION, CRDBNODE_KIND))
}

impl ObjectStore for KubeStore {
    fn statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        self.get(namespace, name)
    }

    fn crdb_nodes(&self, namespace: &str, cluster: &str) -> Result<Vec<CrdbNode>> {
        let ar = crdb_node_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let params = ListParams::default().labels(&format!("{}={}", CLUSTER_LABEL, cluster));
        let list = self.handle.block_on(api.list(&params))?;
        list.items
            .into_iter()
            .map(|obj| {
                let value = serde_json::to_value(&obj)?;
                serde_json::from_value::<CrdbNode>(value).map_err(|e| {
                    MigrateError::Validation(format!(
                        "CrdbNode '{}' does not match the expected schema: {}",
                        obj.metadata.name.as_deref().unwrap_or("?"),
                        e
                    ))
                })
            })
            .collect()
    }

    fn pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.get(namespace, name)
    }

    fn claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        self.get(namespace, name)
    }

    fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get(namespace, name)
    }

    fn config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.get(namespace, name)
    }

    fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.get(namespace, name)
    }

    fn apply_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<()> {
        self.apply(self.namespaced::<ConfigMap>(namespace), config_map)?;
        info!(namespace, name = ?config_map.metadata.name, "applied ConfigMap");
        Ok(())
    }

    fn apply_rbac(&self, namespace: &str, bundle: &RbacBundle) -> Result<()> {
        self.apply(self.namespaced::<ServiceAccount>(namespace), &bundle.service_account)?;
        self.apply(self.namespaced::<Role>(namespace), &bundle.role)?;
        self.apply(self.namespaced::<RoleBinding>(namespace), &bundle.role_binding)?;
        self.apply(Api::<ClusterRole>::all(self.client.clone()), &bundle.cluster_role)?;
        self.apply(
            Api::<ClusterRoleBinding>::all(self.client.clone()),
            &bundle.cluster_role_binding,
        )?;
        info!(namespace, "applied RBAC bundle");
        Ok(())
    }
}
