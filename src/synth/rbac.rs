// Service identity and permissions the StatefulSet pods run under.

use crate::error::Result;
use crate::synth::to_document;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_yaml::Value;
use std::collections::BTreeMap;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

#[derive(Debug, Clone, PartialEq)]
pub struct RbacBundle {
    pub service_account: ServiceAccount,
    pub role: Role,
    pub role_binding: RoleBinding,
    pub cluster_role: ClusterRole,
    pub cluster_role_binding: ClusterRoleBinding,
}

fn labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "cockroachdb".to_string()),
        ("app.kubernetes.io/instance".to_string(), cluster.to_string()),
    ])
}

fn meta(name: &str, namespace: Option<&str>, cluster: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(String::from),
        labels: Some(labels(cluster)),
        ..Default::default()
    }
}

fn rule(group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

impl RbacBundle {
    /// Namespaced objects are named after the cluster; cluster-scoped ones
    /// carry the namespace too so two namespaces never collide. The service
    /// account is the one the pods run as.
    pub fn new(cluster: &str, namespace: &str, service_account: &str) -> Self {
        let scoped = format!("{}-{}", namespace, cluster);
        let subject = Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        };
        RbacBundle {
            service_account: ServiceAccount {
                metadata: meta(service_account, Some(namespace), cluster),
                ..Default::default()
            },
            role: Role {
                metadata: meta(cluster, Some(namespace), cluster),
                rules: Some(vec![rule("", &["secrets"], &["create", "get"])]),
            },
            role_binding: RoleBinding {
                metadata: meta(cluster, Some(namespace), cluster),
                role_ref: RoleRef {
                    api_group: RBAC_GROUP.to_string(),
                    kind: "Role".to_string(),
                    name: cluster.to_string(),
                },
                subjects: Some(vec![subject.clone()]),
            },
            cluster_role: ClusterRole {
                metadata: meta(&scoped, None, cluster),
                rules: Some(vec![rule(
                    "certificates.k8s.io",
                    &["certificatesigningrequests"],
                    &["create", "get", "watch"],
                )]),
                ..Default::default()
            },
            cluster_role_binding: ClusterRoleBinding {
                metadata: meta(&scoped, None, cluster),
                role_ref: RoleRef {
                    api_group: RBAC_GROUP.to_string(),
                    kind: "ClusterRole".to_string(),
                    name: scoped.clone(),
                },
                subjects: Some(vec![subject]),
            },
        }
    }

    /// `Kind/name` of every object, in apply order.
    pub fn object_names(&self) -> Vec<String> {
        let name = |m: &ObjectMeta| m.name.clone().unwrap_or_default();
        vec![
            format!("ServiceAccount/{}", name(&self.service_account.metadata)),
            format!("Role/{}", name(&self.role.metadata)),
            format!("RoleBinding/{}", name(&self.role_binding.metadata)),
            format!("ClusterRole/{}", name(&self.cluster_role.metadata)),
            format!("ClusterRoleBinding/{}", name(&self.cluster_role_binding.metadata)),
        ]
    }

    pub fn documents(&self) -> Result<Vec<Value>> {
        Ok(vec![
            to_document(&self.service_account)?,
            to_document(&self.role)?,
            to_document(&self.role_binding)?,
            to_document(&self.cluster_role)?,
            to_document(&self.cluster_role_binding)?,
        ])
    }
}
