// Correlates claim templates with the claims a specific pod actually mounts.
// Three steps per template: volume name match, claim reference follow, host match.

use crate::error::{MigrateError, Result};
use crate::observe::wal_failover::WalFailoverMode;
use crate::types::{SELECTED_NODE_ANNOTATION, FAILOVER_VOLUME};
use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaim, Pod};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// A claim template as declared by the source controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTemplate {
    pub name: String,
    pub storage_class: Option<String>,
}

/// Storage re-attached to one node identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageDescriptor {
    pub name: String,
    pub claim_name: String,
    pub size: String,
    pub storage_class: Option<String>,
    pub mount_path: String,
    pub volume_name: Option<String>,
    pub access_modes: Vec<String>,
}

pub fn claim_templates(templates: &[PersistentVolumeClaim]) -> Vec<ClaimTemplate> {
    templates
        .iter()
        .filter_map(|t| {
            Some(ClaimTemplate {
                name: t.metadata.name.clone()?,
                storage_class: t.spec.as_ref().and_then(|s| s.storage_class_name.clone()),
            })
        })
        .collect()
}

fn mount_path(container: &Container, volume: &str) -> Option<String> {
    container
        .volume_mounts
        .as_ref()?
        .iter()
        .find(|m| m.name == volume)
        .map(|m| m.mount_path.clone())
}

/// Resolves every template to the claim mounted by `pod`, which must be node `index`.
pub fn resolve_node(
    index: usize,
    pod: &Pod,
    container: &Container,
    templates: &[ClaimTemplate],
    claims: &BTreeMap<String, PersistentVolumeClaim>,
) -> Result<Vec<StorageDescriptor>> {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    let spec = pod
        .spec
        .as_ref()
        .ok_or_else(|| MigrateError::not_found("PodSpec", pod_name.as_str()))?;
    let host = spec
        .node_name
        .as_deref()
        .ok_or_else(|| MigrateError::SchedulingIncomplete {
            pod: pod_name.clone(),
        })?;
    let volumes = spec.volumes.as_deref().unwrap_or_default();

    let mut out = Vec::with_capacity(templates.len());
    for template in templates {
        let claim_not_found = || MigrateError::ClaimNotFound {
            node: index,
            pod: pod_name.clone(),
            volume: template.name.clone(),
        };
        let claim_name = volumes
            .iter()
            .find(|v| v.name == template.name)
            .and_then(|v| v.persistent_volume_claim.as_ref())
            .map(|pvc| pvc.claim_name.clone())
            .ok_or_else(claim_not_found)?;
        let claim = claims
            .get(&claim_name)
            .ok_or_else(|| MigrateError::not_found("PersistentVolumeClaim", claim_name.as_str()))?;

        if !claim_name.ends_with(&format!("-{}", pod_name)) {
            return Err(MigrateError::NodeMismatch {
                node: index,
                claim: claim_name,
                reason: format!("is not owned by pod '{}'", pod_name),
            });
        }
        let selected = claim
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(SELECTED_NODE_ANNOTATION));
        if let Some(selected) = selected {
            if selected != host {
                return Err(MigrateError::NodeMismatch {
                    node: index,
                    claim: claim_name,
                    reason: format!(
                        "was provisioned on host '{}' but pod '{}' runs on '{}'",
                        selected, pod_name, host
                    ),
                });
            }
        }

        let claim_spec = claim.spec.as_ref();
        let size = claim_spec
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .map(|q| q.0.clone())
            .ok_or_else(|| {
                MigrateError::Validation(format!(
                    "claim '{}' has no storage request",
                    claim_name
                ))
            })?;
        let mount_path = mount_path(container, &template.name).ok_or_else(claim_not_found)?;

        debug!(node = index, claim = %claim_name, size = %size, path = %mount_path, "resolved claim");
        out.push(StorageDescriptor {
            name: template.name.clone(),
            claim_name,
            size,
            storage_class: claim_spec
                .and_then(|s| s.storage_class_name.clone())
                .or_else(|| template.storage_class.clone()),
            mount_path,
            volume_name: claim_spec.and_then(|s| s.volume_name.clone()),
            access_modes: claim_spec
                .and_then(|s| s.access_modes.clone())
                .unwrap_or_default(),
        });
    }
    Ok(out)
}

/// Picks the failover volume for side-disk mode, with the path taken from the flag.
pub fn failover_descriptor(
    index: usize,
    pod_name: &str,
    mode: &WalFailoverMode,
    descriptors: &[StorageDescriptor],
) -> Result<Option<StorageDescriptor>> {
    let Some(path) = mode.side_disk_path() else {
        return Ok(None);
    };
    let found = descriptors
        .iter()
        .find(|d| d.name == FAILOVER_VOLUME)
        .ok_or_else(|| MigrateError::ClaimNotFound {
            node: index,
            pod: pod_name.to_string(),
            volume: FAILOVER_VOLUME.to_string(),
        })?;
    let mount = found.mount_path.trim_end_matches('/');
    if path != mount && !path.starts_with(&format!("{}/", mount)) {
        return Err(MigrateError::Validation(format!(
            "node {}: failover path '{}' is outside volume '{}' mounted at '{}'",
            index, path, found.name, found.mount_path
        )));
    }
    Ok(Some(StorageDescriptor {
        mount_path: path.to_string(),
        ..found.clone()
    }))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use k8s_openapi::api::core::v1::{
        Container, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
        VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    pub fn claim(name: &str, size: &str, class: &str, host: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: host.map(|h| {
                    BTreeMap::from([(
                        super::SELECTED_NODE_ANNOTATION.to_string(),
                        h.to_string(),
                    )])
                }),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some(class.to_string()),
                volume_name: Some(format!("pv-{}", name)),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(size.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn claim_volume(volume: &str, claim: &str) -> Volume {
        Volume {
            name: volume.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn mount(volume: &str, path: &str) -> VolumeMount {
        VolumeMount {
            name: volume.to_string(),
            mount_path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn pod(
        name: &str,
        host: Option<&str>,
        container: Container,
        volumes: Vec<Volume>,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: host.map(String::from),
                containers: vec![container],
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use k8s_openapi::api::core::v1::Container;

    fn container(mounts: Vec<k8s_openapi::api::core::v1::VolumeMount>) -> Container {
        Container {
            name: "db".to_string(),
            volume_mounts: Some(mounts),
            ..Default::default()
        }
    }

    fn templates(names: &[&str]) -> Vec<ClaimTemplate> {
        names
            .iter()
            .map(|n| ClaimTemplate {
                name: n.to_string(),
                storage_class: None,
            })
            .collect()
    }

    #[test]
    fn test_resolves_each_node_to_its_own_claim() {
        let mut claims = BTreeMap::new();
        for i in 0..3 {
            let name = format!("datadir-crdb-{}", i);
            let host = format!("host-{}", i);
            claims.insert(name.clone(), claim(&name, "100Gi", "standard", Some(host.as_str())));
        }
        for i in 0..3 {
            let c = container(vec![mount("datadir", "/cockroach/cockroach-data")]);
            let p = pod(
                &format!("crdb-{}", i),
                Some(format!("host-{}", i).as_str()),
                c.clone(),
                vec![claim_volume("datadir", &format!("datadir-crdb-{}", i))],
            );
            let got = resolve_node(i, &p, &c, &templates(&["datadir"]), &claims).unwrap();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].claim_name, format!("datadir-crdb-{}", i));
            assert_eq!(got[0].size, "100Gi");
            assert_eq!(got[0].storage_class.as_deref(), Some("standard"));
            assert_eq!(got[0].volume_name, Some(format!("pv-datadir-crdb-{}", i)));
        }
    }

    #[test]
    fn test_claim_of_another_ordinal_is_node_mismatch() {
        let mut claims = BTreeMap::new();
        claims.insert(
            "datadir-crdb-0".to_string(),
            claim("datadir-crdb-0", "1Gi", "standard", None),
        );
        let c = container(vec![mount("datadir", "/data")]);
        let p = pod(
            "crdb-1",
            Some("host-1"),
            c.clone(),
            vec![claim_volume("datadir", "datadir-crdb-0")],
        );
        let err = resolve_node(1, &p, &c, &templates(&["datadir"]), &claims).unwrap_err();
        assert!(matches!(err, MigrateError::NodeMismatch { node: 1, .. }));
    }

    #[test]
    fn test_selected_node_must_match_host() {
        let mut claims = BTreeMap::new();
        claims.insert(
            "datadir-crdb-0".to_string(),
            claim("datadir-crdb-0", "1Gi", "standard", Some("host-9")),
        );
        let c = container(vec![mount("datadir", "/data")]);
        let p = pod(
            "crdb-0",
            Some("host-0"),
            c.clone(),
            vec![claim_volume("datadir", "datadir-crdb-0")],
        );
        let err = resolve_node(0, &p, &c, &templates(&["datadir"]), &claims).unwrap_err();
        assert!(matches!(err, MigrateError::NodeMismatch { .. }));
    }

    #[test]
    fn test_missing_volume_is_claim_not_found() {
        let c = container(vec![mount("datadir", "/data")]);
        let p = pod(
            "crdb-0",
            Some("host-0"),
            c.clone(),
            vec![claim_volume("datadir", "datadir-crdb-0")],
        );
        let mut claims = BTreeMap::new();
        claims.insert(
            "datadir-crdb-0".to_string(),
            claim("datadir-crdb-0", "1Gi", "standard", None),
        );
        let err = resolve_node(0, &p, &c, &templates(&["datadir", "failoverdir"]), &claims)
            .unwrap_err();
        assert!(matches!(err, MigrateError::ClaimNotFound { ref volume, .. } if volume == "failoverdir"));
    }

    #[test]
    fn test_failover_descriptor_uses_flag_path() {
        let descriptors = vec![StorageDescriptor {
            name: "failoverdir".to_string(),
            claim_name: "failoverdir-crdb-0".to_string(),
            size: "50Gi".to_string(),
            storage_class: Some("fast-ssd".to_string()),
            mount_path: "/data".to_string(),
            volume_name: None,
            access_modes: vec![],
        }];
        let mode = WalFailoverMode::SideDisk {
            path: "/data/wal-failover".to_string(),
        };
        let got = failover_descriptor(0, "crdb-0", &mode, &descriptors)
            .unwrap()
            .unwrap();
        assert_eq!(got.mount_path, "/data/wal-failover");

        let outside = WalFailoverMode::SideDisk {
            path: "/elsewhere".to_string(),
        };
        assert!(failover_descriptor(0, "crdb-0", &outside, &descriptors).is_err());
        assert!(failover_descriptor(0, "crdb-0", &mode, &[]).is_err());
        assert!(failover_descriptor(0, "crdb-0", &WalFailoverMode::Disabled, &[])
            .unwrap()
            .is_none());
    }
}
