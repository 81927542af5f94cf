// build_migration_manifests: read, interpret, bridge, synthesize, emit.

use crate::bridge::{self, BridgeOutcome, CertificateRekeyer, ManualRekeyer, SecurityMaterialMap};
use crate::config::MigrationConfig;
use crate::emit;
use crate::error::Result;
use crate::observe;
use crate::platform::{self, KubeStore, ObjectStore, SnapshotStore};
use crate::synth::rbac::RbacBundle;
use crate::synth::{self, Direction};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::runtime::Handle;
use tracing::info;

/// What one invocation did.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub cluster: String,
    pub namespace: String,
    pub direction: Direction,
    pub nodes: usize,
    pub logging: BridgeOutcome,
    pub security: SecurityMaterialMap,
    pub rbac_applied: bool,
    pub files: Vec<PathBuf>,
}

/// Synthesis runs before any write, so a cluster the target cannot express
/// leaves both the source and the output directory untouched.
pub fn build_migration_manifests(
    store: &impl ObjectStore,
    rekeyer: &dyn CertificateRekeyer,
    config: &MigrationConfig,
) -> Result<MigrationReport> {
    let snapshot = platform::read_source(store, config.source, &config.namespace, &config.name)?;
    let observation = observe::observe(&snapshot)?;
    let direction = Direction::for_source(config.source);
    let security = bridge::security_map(store, direction, &observation)?;
    let files = synth::synthesize(direction, &observation, &security, &config.target)?;

    let logging = bridge::bridge_logging(store, direction, &observation)?;
    rekeyer.rekey(&config.namespace, &security)?;
    let rbac_applied = direction == Direction::ToStatefulSet && config.apply_rbac;
    if rbac_applied {
        let bundle = RbacBundle::new(
            &config.name,
            &config.namespace,
            &synth::statefulset::service_account_name(&observation),
        );
        store.apply_rbac(&config.namespace, &bundle)?;
    }
    let written = emit::emit(&config.output_dir, &files)?;

    info!(
        cluster = %config.name,
        direction = ?direction,
        logging = ?logging,
        files = written.len(),
        "migration manifests ready"
    );
    Ok(MigrationReport {
        cluster: config.name.clone(),
        namespace: config.namespace.clone(),
        direction,
        nodes: observation.node_count(),
        logging,
        security,
        rbac_applied,
        files: written,
    })
}

/// Runs against a snapshot dump when one is given, otherwise against the live platform.
/// Blocks on `handle`; call it from a blocking context.
pub fn run(config: &MigrationConfig, snapshot: Option<&Path>, handle: Handle) -> Result<MigrationReport> {
    let rekeyer = ManualRekeyer;
    match snapshot {
        Some(path) => build_migration_manifests(&SnapshotStore::load(path)?, &rekeyer, config),
        None => build_migration_manifests(&KubeStore::connect(handle)?, &rekeyer, config),
    }
}

pub fn report_json(report: &MigrationReport) -> std::result::Result<String, String> {
    serde_json::to_string_pretty(report).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceKind, TargetSettings};
    use crate::error::MigrateError;
    use crate::types::CrdbNode;
    use std::cell::RefCell;
    use std::fs;

    const SCENARIO_A: &str = "--join=a-0:26257,a-1:26257,a-2:26257 --http-port=8080 --port=26257 --cache=25%";
    const HELM_EXTRAS: &str = "--advertise-host=$(hostname).${STATEFULSET_FQDN} --certs-dir=/cockroach/cockroach-certs/ --logtostderr=INFO --log-config-file=/cockroach/log-config/log-config.yaml";

    fn claim(name: &str, i: usize, size: &str, class: &str) -> String {
        format!(
            r#"---
apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: {name}
  namespace: db
  annotations:
    volume.kubernetes.io/selected-node: host-{i}
spec:
  accessModes:
  - ReadWriteOnce
  storageClassName: {class}
  volumeName: pv-{name}
  resources:
    requests:
      storage: {size}
"#
        )
    }

    /// A chart-managed cluster; `failover_on` lists the ordinals mounting `failoverdir`.
    fn legacy_dump(args: &str, replicas: usize, failover_on: &[usize]) -> String {
        let command = format!(
            r#"["/bin/bash", "-ecx", "exec /cockroach/cockroach start {} {}"]"#,
            args, HELM_EXTRAS
        );
        let mut templates = String::from(
            "  - metadata:\n      name: datadir\n    spec:\n      storageClassName: standard\n      accessModes: [ReadWriteOnce]\n      resources:\n        requests:\n          storage: 100Gi\n",
        );
        if !failover_on.is_empty() {
            templates.push_str(
                "  - metadata:\n      name: failoverdir\n    spec:\n      storageClassName: fast-ssd\n      accessModes: [ReadWriteOnce]\n      resources:\n        requests:\n          storage: 50Gi\n",
            );
        }
        let mut out = format!(
            r#"apiVersion: apps/v1
kind: StatefulSet
metadata:
  name: crdb
  namespace: db
spec:
  replicas: {replicas}
  serviceName: crdb
  selector:
    matchLabels:
      app.kubernetes.io/name: cockroachdb
  template:
    metadata:
      labels:
        app.kubernetes.io/name: cockroachdb
        team: data
    spec:
      serviceAccountName: crdb
      terminationGracePeriodSeconds: 300
      containers:
      - name: db
        image: cockroachdb/cockroach:v24.3.1
        command: {command}
  volumeClaimTemplates:
{templates}---
apiVersion: v1
kind: Secret
metadata:
  name: crdb-node-secret
  namespace: db
data:
  ca.crt: Q0E=
---
apiVersion: v1
kind: Secret
metadata:
  name: crdb-client-secret
  namespace: db
data:
  tls.crt: Q0E=
---
apiVersion: v1
kind: Secret
metadata:
  name: crdb-log-config
  namespace: db
data:
  log-config.yaml: UA==
"#
        );
        for i in 0..replicas {
            let failover = failover_on.contains(&i);
            let (mount, volume) = if failover {
                (
                    "    - name: failoverdir\n      mountPath: /data\n".to_string(),
                    format!("  - name: failoverdir\n    persistentVolumeClaim:\n      claimName: failoverdir-crdb-{}\n", i),
                )
            } else {
                (String::new(), String::new())
            };
            out.push_str(&format!(
                r#"---
apiVersion: v1
kind: Pod
metadata:
  name: crdb-{i}
  namespace: db
  labels:
    app.kubernetes.io/name: cockroachdb
    controller-revision-hash: crdb-abc
spec:
  nodeName: host-{i}
  containers:
  - name: db
    image: cockroachdb/cockroach:v24.3.1
    command: {command}
    volumeMounts:
    - name: datadir
      mountPath: /cockroach/cockroach-data
{mount}    - name: log-config
      mountPath: /cockroach/log-config
  volumes:
  - name: datadir
    persistentVolumeClaim:
      claimName: datadir-crdb-{i}
{volume}  - name: log-config
    secret:
      secretName: crdb-log-config
"#
            ));
            out.push_str(&claim(&format!("datadir-crdb-{}", i), i, "100Gi", "standard"));
            if failover {
                out.push_str(&claim(&format!("failoverdir-crdb-{}", i), i, "50Gi", "fast-ssd"));
            }
        }
        out
    }

    /// An operator-managed cluster of `replicas` CrdbNodes.
    fn custom_dump(replicas: usize) -> String {
        let mut out = String::from(
            r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: crdb-log-config
  namespace: db
data:
  logs.yaml: P
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: crdb-ca-crt
  namespace: db
data:
  ca.crt: CA
---
apiVersion: v1
kind: Secret
metadata:
  name: crdb-node-certs
  namespace: db
data:
  tls.crt: Q0E=
---
apiVersion: v1
kind: Secret
metadata:
  name: crdb-client-certs
  namespace: db
data:
  tls.crt: Q0E=
---
apiVersion: v1
kind: Service
metadata:
  name: crdb-public
  namespace: db
  uid: "1234"
  resourceVersion: "99"
spec:
  clusterIP: 10.0.0.1
  selector:
    crdb.cockroachlabs.com/cluster: crdb
  ports:
  - name: sql
    port: 26257
"#,
        );
        for i in 0..replicas {
            out.push_str(&format!(
                r#"---
apiVersion: crdb.cockroachlabs.com/v1alpha1
kind: CrdbNode
metadata:
  name: crdb-{i}
  namespace: db
  labels:
    crdb.cockroachlabs.com/cluster: crdb
spec:
  nodeName: host-{i}
  image: cockroachdb/cockroach:v24.3.1
  loggingConfigMapName: crdb-log-config
  certificates:
    externalCertificates:
      caConfigMapName: crdb-ca-crt
      nodeSecretName: crdb-node-certs
      rootSqlClientSecretName: crdb-client-certs
  dataStores:
  - name: datadir
    volumeClaimTemplate:
      metadata:
        name: datadir
      spec:
        storageClassName: standard
        accessModes: [ReadWriteOnce]
        resources:
          requests:
            storage: 100Gi
---
apiVersion: v1
kind: Pod
metadata:
  name: crdb-{i}
  namespace: db
spec:
  nodeName: host-{i}
  containers:
  - name: cockroachdb
    image: cockroachdb/cockroach:v24.3.1
    command: ["/cockroach/cockroach.sh"]
    args: ["start", "--join=crdb-0.crdb.db:26258", "--listen-addr=:26258", "--sql-addr=:26257", "--http-addr=:8080", "--certs-dir=/cockroach/cockroach-certs", "--cache=25%"]
    volumeMounts:
    - name: datadir
      mountPath: /cockroach/cockroach-data
  volumes:
  - name: datadir
    persistentVolumeClaim:
      claimName: datadir-crdb-{i}
"#
            ));
            out.push_str(&claim(&format!("datadir-crdb-{}", i), i, "100Gi", "standard"));
        }
        out
    }

    fn config(source: SourceKind, dir: &Path) -> MigrationConfig {
        MigrationConfig {
            source,
            name: "crdb".to_string(),
            namespace: "db".to_string(),
            output_dir: dir.to_path_buf(),
            target: TargetSettings {
                region: Some("us-east1".to_string()),
                cloud_provider: Some("gcp".to_string()),
                ..Default::default()
            },
            apply_rbac: true,
        }
    }

    #[derive(Default)]
    struct RecordingRekeyer(RefCell<Vec<String>>);

    impl CertificateRekeyer for RecordingRekeyer {
        fn rekey(&self, _namespace: &str, map: &SecurityMaterialMap) -> Result<()> {
            for rename in map.iter() {
                self.0
                    .borrow_mut()
                    .push(format!("{} -> {}", rename.from.name, rename.to.name));
            }
            Ok(())
        }
    }

    fn read_node(dir: &Path, i: usize) -> CrdbNode {
        let text = fs::read_to_string(dir.join(format!("crdbnode-{}.yaml", i))).unwrap();
        serde_yaml::from_str(&text).unwrap()
    }

    #[test]
    fn test_scenario_a_statefulset_to_crdbnodes() {
        let store = SnapshotStore::from_yaml(&legacy_dump(SCENARIO_A, 3, &[])).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let rekeyer = RecordingRekeyer::default();
        let report =
            build_migration_manifests(&store, &rekeyer, &config(SourceKind::StatefulSet, dir.path()))
                .unwrap();

        assert_eq!(report.direction, Direction::ToCrdbNodes);
        assert_eq!(report.nodes, 3);
        assert!(!report.rbac_applied);
        assert_eq!(report.files.len(), 4);
        for i in 0..3 {
            let node = read_node(dir.path(), i);
            assert_eq!(node.name(), format!("crdb-{}", i));
            assert_eq!(node.spec.sql_port, Some(26257));
            assert_eq!(node.spec.grpc_port, Some(26258));
            assert_eq!(node.spec.http_port, Some(8080));
            assert!(node.spec.wal_failover_spec.is_none());
            let flags: Vec<_> = node.spec.flags.iter().collect();
            assert_eq!(flags, vec![("--cache", "25%")]);
            assert_eq!(node.spec.data_stores[0].volume_claim_template.metadata.name.as_deref(), Some("datadir"));
            assert_eq!(node.spec.pod_labels.get("team").map(String::as_str), Some("data"));
            assert!(!node.spec.pod_labels.contains_key("controller-revision-hash"));
        }
        let certs = read_node(dir.path(), 0)
            .spec
            .certificates
            .and_then(|c| c.external_certificates)
            .unwrap();
        assert_eq!(certs.ca_config_map_name, "crdb-ca-crt");
        assert_eq!(certs.node_secret_name, "crdb-node-certs");
        assert_eq!(rekeyer.0.borrow().len(), 3);

        let values = fs::read_to_string(dir.path().join("values.yaml")).unwrap();
        assert!(values.contains("us-east1"));
        assert!(!values.contains("creationTimestamp"));
    }

    #[test]
    fn test_scenario_b_side_disk_failover() {
        let args = format!("{} --wal-failover=path=/data/wal-failover", SCENARIO_A);
        let store = SnapshotStore::from_yaml(&legacy_dump(&args, 1, &[0])).unwrap();
        let dir = tempfile::tempdir().unwrap();
        build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::StatefulSet, dir.path()))
            .unwrap();
        let wal = read_node(dir.path(), 0).spec.wal_failover_spec.unwrap();
        assert_eq!(wal.name, "failoverdir");
        assert_eq!(wal.path, "/data/wal-failover");
        assert_eq!(wal.size, "50Gi");
        assert_eq!(wal.storage_class_name.as_deref(), Some("fast-ssd"));
    }

    #[test]
    fn test_scenario_b_node_without_failover_claim_fails() {
        let args = format!("{} --wal-failover=path=/data/wal-failover", SCENARIO_A);
        let store = SnapshotStore::from_yaml(&legacy_dump(&args, 2, &[0])).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::StatefulSet, dir.path()))
            .unwrap_err();
        assert!(matches!(err, MigrateError::ClaimNotFound { node: 1, ref volume, .. } if volume == "failoverdir"));
    }

    #[test]
    fn test_scenario_c_among_stores_with_one_store_writes_nothing() {
        let args = format!("{} --wal-failover=among-stores", SCENARIO_A);
        let store = SnapshotStore::from_yaml(&legacy_dump(&args, 3, &[])).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let err = build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::StatefulSet, &out))
            .unwrap_err();
        assert!(matches!(err, MigrateError::Validation(_)));
        assert!(!out.exists());
        assert!(store.config_map("db", "crdb-log-config").unwrap().is_none());
    }

    #[test]
    fn test_scenario_d_log_secret_bridged() {
        let store = SnapshotStore::from_yaml(&legacy_dump(SCENARIO_A, 1, &[])).unwrap();
        let before = store.secret("db", "crdb-log-config").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let report =
            build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::StatefulSet, dir.path()))
                .unwrap();
        assert_eq!(report.logging, BridgeOutcome::Applied);
        let cm = store.config_map("db", "crdb-log-config").unwrap().unwrap();
        assert_eq!(cm.data.unwrap().get("logs.yaml").map(String::as_str), Some("P"));
        assert_eq!(store.secret("db", "crdb-log-config").unwrap(), before);
        assert_eq!(
            read_node(dir.path(), 0).spec.logging_config_map_name.as_deref(),
            Some("crdb-log-config")
        );
    }

    #[test]
    fn test_rerun_is_byte_identical() {
        let store = SnapshotStore::from_yaml(&legacy_dump(SCENARIO_A, 3, &[])).unwrap();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::StatefulSet, first.path()))
            .unwrap();
        let report =
            build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::StatefulSet, second.path()))
                .unwrap();
        assert_eq!(report.logging, BridgeOutcome::Unchanged);
        for file in &report.files {
            let name = file.file_name().unwrap();
            assert_eq!(
                fs::read(first.path().join(name)).unwrap(),
                fs::read(file).unwrap(),
                "{:?} differs between runs",
                name
            );
        }
    }

    #[test]
    fn test_missing_trust_material_is_not_found() {
        let dump = legacy_dump(SCENARIO_A, 1, &[]).replace("name: crdb-client-secret", "name: other");
        let store = SnapshotStore::from_yaml(&dump).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::StatefulSet, dir.path()))
            .unwrap_err();
        assert!(matches!(err, MigrateError::NotFound { kind: "Secret", .. }));
    }

    #[test]
    fn test_unscheduled_pod_is_scheduling_incomplete() {
        let dump = legacy_dump(SCENARIO_A, 2, &[]).replace("  nodeName: host-1\n", "");
        let store = SnapshotStore::from_yaml(&dump).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::StatefulSet, dir.path()))
            .unwrap_err();
        assert!(matches!(err, MigrateError::SchedulingIncomplete { ref pod } if pod == "crdb-1"));
    }

    #[test]
    fn test_crdbnodes_to_statefulset() {
        let store = SnapshotStore::from_yaml(&custom_dump(3)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let rekeyer = RecordingRekeyer::default();
        let report =
            build_migration_manifests(&store, &rekeyer, &config(SourceKind::CrdbNode, dir.path()))
                .unwrap();

        assert_eq!(report.direction, Direction::ToStatefulSet);
        assert_eq!(report.logging, BridgeOutcome::Applied);
        let names: Vec<_> = report
            .files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "persistentvolumeclaim-0.yaml",
                "persistentvolumeclaim-1.yaml",
                "persistentvolumeclaim-2.yaml",
                "values.yaml",
                "public-service.yaml",
                "rbac.yaml",
            ]
        );

        let log = store.config_map("db", "crdb-log-config").unwrap().unwrap().data.unwrap();
        assert_eq!(log.get("log-config.yaml").map(String::as_str), Some("P"));
        assert_eq!(log.get("logs.yaml").map(String::as_str), Some("P"));
        assert_eq!(store.applied_rbac().len(), 5);
        assert!(rekeyer.0.borrow().contains(&"crdb-node-certs -> crdb-node-secret".to_string()));

        let svc = fs::read_to_string(dir.path().join("public-service.yaml")).unwrap();
        assert!(svc.contains("app.kubernetes.io/component: cockroachdb"));
        assert!(!svc.contains("clusterIP"));
        assert!(!svc.contains("resourceVersion"));
        assert!(!svc.contains("crdb.cockroachlabs.com/cluster"));

        let values: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(dir.path().join("values.yaml")).unwrap()).unwrap();
        assert_eq!(values["statefulset"]["replicas"], serde_yaml::Value::from(3u64));
        assert_eq!(values["tls"]["certs"]["nodeSecret"], serde_yaml::Value::from("crdb-node-secret"));
        assert_eq!(
            values["statefulset"]["args"][0],
            serde_yaml::Value::from("--cache=25%")
        );

        let rbac = fs::read_to_string(dir.path().join("rbac.yaml")).unwrap();
        assert_eq!(rbac.matches("\n---\n").count(), 4);
    }

    #[test]
    fn test_rbac_follows_crdbnode_service_account() {
        let dump = custom_dump(2).replace(
            "  image: cockroachdb/cockroach:v24.3.1\n  loggingConfigMapName",
            "  image: cockroachdb/cockroach:v24.3.1\n  serviceAccountName: crdb-sa\n  loggingConfigMapName",
        );
        let store = SnapshotStore::from_yaml(&dump).unwrap();
        let dir = tempfile::tempdir().unwrap();
        build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::CrdbNode, dir.path()))
            .unwrap();

        assert!(store
            .applied_rbac()
            .contains(&"db/ServiceAccount/crdb-sa".to_string()));
        let rbac = fs::read_to_string(dir.path().join("rbac.yaml")).unwrap();
        assert_eq!(rbac.matches("name: crdb-sa").count(), 3);
        let values = fs::read_to_string(dir.path().join("values.yaml")).unwrap();
        assert!(values.contains("name: crdb-sa"));
    }

    #[test]
    fn test_store_attributes_survive_statefulset_to_crdbnodes() {
        let args = format!("{} --store=path=/cockroach/cockroach-data,attrs=ssd", SCENARIO_A);
        let store = SnapshotStore::from_yaml(&legacy_dump(&args, 1, &[])).unwrap();
        let dir = tempfile::tempdir().unwrap();
        build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::StatefulSet, dir.path()))
            .unwrap();
        let node = read_node(dir.path(), 0);
        assert_eq!(node.spec.data_stores[0].options, vec!["attrs=ssd"]);
    }

    #[test]
    fn test_gap_in_crdbnode_ordinals_is_rejected() {
        let dump = custom_dump(3).replace("name: crdb-1\n  namespace: db\n  labels", "name: crdb-7\n  namespace: db\n  labels");
        let store = SnapshotStore::from_yaml(&dump).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::CrdbNode, dir.path()))
            .unwrap_err();
        assert!(matches!(err, MigrateError::Validation(_)));
    }

    #[test]
    fn test_report_serializes() {
        let store = SnapshotStore::from_yaml(&custom_dump(1)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let report =
            build_migration_manifests(&store, &ManualRekeyer, &config(SourceKind::CrdbNode, dir.path()))
                .unwrap();
        let json = report_json(&report).unwrap();
        assert!(json.contains("\"direction\": \"to-stateful-set\""));
        assert!(json.contains("\"logging\": \"applied\""));
    }
}
