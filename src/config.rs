// Invocation settings: what to migrate, where to write, and target-only facts
// the running cluster cannot tell us (provider, region, image).

use crate::error::{MigrateError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Management scheme the cluster runs under today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, clap::ValueEnum)]
pub enum SourceKind {
    #[serde(rename = "statefulset")]
    #[value(name = "statefulset")]
    StatefulSet,
    #[serde(rename = "crdbnode")]
    #[value(name = "crdbnode")]
    CrdbNode,
}

/// Facts about the target that are not observable on the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetSettings {
    #[serde(default)]
    pub cloud_provider: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Overrides the image observed on the source.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cluster_domain: Option<String>,
}

impl TargetSettings {
    /// Fills unset fields from `fallback`.
    pub fn or(self, fallback: TargetSettings) -> Self {
        TargetSettings {
            cloud_provider: self.cloud_provider.or(fallback.cloud_provider),
            region: self.region.or(fallback.region),
            image: self.image.or(fallback.image),
            cluster_domain: self.cluster_domain.or(fallback.cluster_domain),
        }
    }
}

/// Optional TOML defaults file; command-line values win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileDefaults {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub cloud_provider: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cluster_domain: Option<String>,
}

impl FileDefaults {
    pub fn target(&self) -> TargetSettings {
        TargetSettings {
            cloud_provider: self.cloud_provider.clone(),
            region: self.region.clone(),
            image: self.image.clone(),
            cluster_domain: self.cluster_domain.clone(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MigrateError::io(path.display().to_string(), e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| MigrateError::Validation(format!("config file: {}", e)))
    }
}

/// One build-manifest invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub source: SourceKind,
    /// StatefulSet name, or the cluster label shared by the CrdbNodes.
    pub name: String,
    pub namespace: String,
    pub output_dir: PathBuf,
    pub target: TargetSettings,
    /// Also apply the RBAC bundle when migrating to a StatefulSet.
    pub apply_rbac: bool,
}
