// WAL failover classification. Every path through the engine uses this one
// classifier, so an unknown value is rejected everywhere instead of read as disabled.

use crate::error::{MigrateError, Result};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum WalFailoverMode {
    Disabled,
    AmongStores,
    /// Side-disk failover; needs a volume mounted at `path`.
    SideDisk { path: String },
}

impl WalFailoverMode {
    pub fn flag_value(&self) -> String {
        match self {
            WalFailoverMode::Disabled => "disabled".to_string(),
            WalFailoverMode::AmongStores => "among-stores".to_string(),
            WalFailoverMode::SideDisk { path } => format!("path={}", path),
        }
    }

    pub fn side_disk_path(&self) -> Option<&str> {
        match self {
            WalFailoverMode::SideDisk { path } => Some(path),
            _ => None,
        }
    }
}

/// Classifies the `--wal-failover` value. No flag at all means disabled.
pub fn classify(value: Option<&str>, store_count: usize) -> Result<WalFailoverMode> {
    let Some(value) = value else {
        return Ok(WalFailoverMode::Disabled);
    };
    match value {
        "disabled" => Ok(WalFailoverMode::Disabled),
        "among-stores" if store_count > 1 => Ok(WalFailoverMode::AmongStores),
        "among-stores" => Err(MigrateError::Validation(format!(
            "--wal-failover=among-stores needs more than one store per node, found {}",
            store_count
        ))),
        v => match v.strip_prefix("path=") {
            Some(path) if path.starts_with('/') => {
                let trimmed = match path.trim_end_matches('/') {
                    "" => "/",
                    t => t,
                };
                Ok(WalFailoverMode::SideDisk {
                    path: trimmed.to_string(),
                })
            }
            Some(path) => Err(MigrateError::parse(
                "--wal-failover",
                format!("failover path '{}' must be absolute", path),
            )),
            None => Err(MigrateError::parse(
                "--wal-failover",
                format!("unrecognized mode '{}'", v),
            )),
        },
    }
}
