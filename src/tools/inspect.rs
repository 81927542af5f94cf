// Offline interpretation helpers (parse_start_command, classify_wal_failover).

use crate::observe::command_line::{self, StartFlags};
use crate::observe::wal_failover::{self, WalFailoverMode};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct Interpretation {
    flags: StartFlags,
    wal_failover: WalFailoverMode,
}

/// Interprets a start command as the engine would read it off a pod.
/// The command is one shell string; its quoted words become the container's
/// command array before parsing, and substitutions are not expanded.
pub fn parse_start_command_json(command: &str) -> Result<String, String> {
    let parts = command_line::tokenize(&[command.to_string()]);
    let flags = command_line::parse_start_command(&parts).map_err(|e| e.to_string())?;
    let wal_failover = wal_failover::classify(flags.wal_failover.as_deref(), flags.store_count())
        .map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&Interpretation {
        flags,
        wal_failover,
    })
    .map_err(|e| e.to_string())
}

pub fn classify_wal_failover_json(value: Option<&str>, store_count: usize) -> Result<String, String> {
    let mode = wal_failover::classify(value, store_count).map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&mode).map_err(|e| e.to_string())
}
