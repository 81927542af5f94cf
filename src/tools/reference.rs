// Reference data for start flags (list_recognized_flags).

use crate::observe::command_line::DROPPED_FLAGS;
use serde_json::{json, Map as JsonMap, Value};

pub fn list_recognized_flags_json() -> String {
    let flags = recognized_flags();
    serde_json::to_string_pretty(&flags).unwrap_or_else(|_| "{}".to_string())
}

fn recognized_flags() -> JsonMap<String, Value> {
    let mut out = JsonMap::new();
    out.insert(
        "interpreted".to_string(),
        json!({
            "--port": "combined SQL and inter-node port; the SQL port when --sql-addr is absent",
            "--sql-addr": "SQL listen address; its port wins over --port (default 26257)",
            "--listen-addr": "inter-node listen address; its port is the gRPC port (default 26258)",
            "--http-port": "HTTP port when --http-addr is absent",
            "--http-addr": "HTTP listen address; its port wins over --http-port (default 8080)",
            "--join": "comma-separated join targets, order kept",
            "--insecure": "bare or =true/false; disables trust material mapping",
            "--locality": "tiers k=v,...; region and zone map to topology labels",
            "--wal-failover": "disabled | among-stores | path=<absolute mount>; anything else is rejected",
            "--store": "repeatable; counted for among-stores and matched to data volumes"
        }),
    );
    out.insert(
        "dropped".to_string(),
        Value::Array(
            DROPPED_FLAGS
                .iter()
                .map(|f| Value::String(f.to_string()))
                .collect(),
        ),
    );
    out.insert(
        "passthrough".to_string(),
        Value::String(
            "any other flag is kept verbatim in first-seen order; a repeated flag keeps its last value"
                .to_string(),
        ),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lists_interpreted_and_dropped_flags() {
        let out = list_recognized_flags_json();
        assert!(out.contains("\"--wal-failover\""));
        assert!(out.contains("\"--certs-dir\""));
        assert!(out.contains("passthrough"));
    }
}
