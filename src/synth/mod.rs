// Re-expresses a cluster observation as the target scheme's objects.
// Pure: no platform access, and the same observation always yields the same documents.

pub mod crdbnode;
pub mod rbac;
pub mod statefulset;

use crate::bridge::SecurityMaterialMap;
use crate::config::{SourceKind, TargetSettings};
use crate::error::{MigrateError, Result};
use crate::observe::ClusterObservation;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tracing::info;

/// Which way the cluster is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    ToCrdbNodes,
    ToStatefulSet,
}

impl Direction {
    pub fn for_source(source: SourceKind) -> Self {
        match source {
            SourceKind::StatefulSet => Direction::ToCrdbNodes,
            SourceKind::CrdbNode => Direction::ToStatefulSet,
        }
    }
}

/// One output file: a stream of documents in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestFile {
    pub name: String,
    pub documents: Vec<Value>,
}

impl ManifestFile {
    pub fn new(name: impl Into<String>, documents: Vec<Value>) -> Self {
        ManifestFile {
            name: name.into(),
            documents,
        }
    }
}

pub(crate) fn to_document<T: Serialize>(object: &T) -> Result<Value> {
    Ok(serde_yaml::to_value(object)?)
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Sequence(s) => s.is_empty(),
        Value::Mapping(m) => m.is_empty(),
        _ => false,
    }
}

/// Inserts `key` unless the value is null or empty, so values files only carry what was observed.
pub(crate) fn put(map: &mut Mapping, key: &str, value: impl Into<Value>) {
    let value = value.into();
    if !is_empty_value(&value) {
        map.insert(Value::String(key.to_string()), value);
    }
}

pub(crate) fn opt<T: Into<Value>>(value: Option<T>) -> Value {
    value.map(Into::into).unwrap_or(Value::Null)
}

/// Like `put`, for anything serializable.
pub(crate) fn put_serialized<T: Serialize>(map: &mut Mapping, key: &str, value: &T) -> Result<()> {
    put(map, key, to_document(value)?);
    Ok(())
}

/// Platform label key that carries a locality tier.
pub fn locality_label(tier: &str) -> String {
    match tier {
        "region" => "topology.kubernetes.io/region".to_string(),
        "zone" => "topology.kubernetes.io/zone".to_string(),
        other => other.to_string(),
    }
}

/// Builds every target file for the observation.
pub fn synthesize(
    direction: Direction,
    observation: &ClusterObservation,
    security: &SecurityMaterialMap,
    target: &TargetSettings,
) -> Result<Vec<ManifestFile>> {
    if direction != Direction::for_source(observation.source) {
        return Err(MigrateError::Validation(format!(
            "cannot synthesize {:?} from a {:?} source",
            direction, observation.source
        )));
    }
    let files = match direction {
        Direction::ToCrdbNodes => crdbnode::build(observation, security, target)?,
        Direction::ToStatefulSet => statefulset::build(observation, security, target)?,
    };
    info!(
        cluster = %observation.cluster,
        direction = ?direction,
        files = files.len(),
        "synthesized target objects"
    );
    Ok(files)
}
