// Interprets the flattened start command of a database container.

use crate::error::{MigrateError, Result};
use crate::types::{ExtraFlags, DEFAULT_GRPC_PORT, DEFAULT_HTTP_PORT, DEFAULT_SQL_PORT};
use serde::Serialize;

/// Flags the target scheme adds back on its own; dropped on observation.
pub const DROPPED_FLAGS: [&str; 7] = [
    "--advertise-host",
    "--advertise-addr",
    "--certs-dir",
    "--logtostderr",
    "--log-config-file",
    "--log",
    "--log-dir",
];

/// Flags that never take a separate value token.
const BARE_FLAGS: [&str; 3] = ["--insecure", "--logtostderr", "--background"];

const SUBCOMMANDS: [&str; 2] = ["start", "start-single-node"];

/// Flag-derived part of a cluster observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartFlags {
    pub sql_port: u16,
    pub grpc_port: u16,
    pub http_port: u16,
    pub join: Vec<String>,
    pub insecure: bool,
    pub locality: Vec<(String, String)>,
    pub wal_failover: Option<String>,
    pub stores: Vec<String>,
    pub log_config_file: Option<String>,
    pub extra: ExtraFlags,
}

impl StartFlags {
    /// Number of stores the node runs; no `--store` means the single default store.
    pub fn store_count(&self) -> usize {
        self.stores.len().max(1)
    }

    /// `--locality` value as it would be written on a command line.
    pub fn locality_flag(&self) -> Option<String> {
        if self.locality.is_empty() {
            return None;
        }
        Some(
            self.locality
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// Splits on whitespace like a shell would, without expanding anything:
/// quotes are removed, `$(...)` and `${...}` stay in one token.
pub fn tokenize(parts: &[String]) -> Vec<String> {
    let mut tokens = Vec::new();
    for part in parts {
        let mut current = String::new();
        let mut quote: Option<char> = None;
        let mut depth = 0usize;
        let mut chars = part.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\'' | '"' if depth == 0 && quote.is_none() => quote = Some(c),
                q if Some(q) == quote => quote = None,
                '$' if matches!(chars.peek(), Some('(') | Some('{')) => {
                    current.push(c);
                    if let Some(open) = chars.next() {
                        current.push(open);
                    }
                    depth += 1;
                }
                ')' | '}' if depth > 0 => {
                    current.push(c);
                    depth -= 1;
                }
                c if c.is_whitespace() && quote.is_none() && depth == 0 => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
    }
    tokens
}

/// True when the value still carries a runtime substitution token.
pub fn has_substitution(value: &str) -> bool {
    value.contains("$(") || value.contains("${")
}

fn parse_port(flag: &str, value: &str) -> Result<u16> {
    if has_substitution(value) {
        return Err(MigrateError::parse(
            flag,
            format!("port '{}' is not a literal", value),
        ));
    }
    match value.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(MigrateError::parse(
            flag,
            format!("'{}' is not a valid port", value),
        )),
    }
}

/// Port of a `host:port` address, `None` when the address carries no port.
fn parse_addr_port(flag: &str, value: &str) -> Result<Option<u16>> {
    match value.rsplit_once(':') {
        Some((_, port)) if !port.ends_with(']') => parse_port(flag, port).map(Some),
        _ => Ok(None),
    }
}

fn parse_bool(flag: &str, value: &str) -> Result<bool> {
    match value {
        "" | "true" => Ok(true),
        "false" => Ok(false),
        other => Err(MigrateError::parse(
            flag,
            format!("'{}' is not a boolean", other),
        )),
    }
}

fn parse_locality(value: &str) -> Result<Vec<(String, String)>> {
    value
        .split(',')
        .filter(|t| !t.is_empty())
        .map(|tier| {
            tier.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    MigrateError::parse("--locality", format!("tier '{}' has no value", tier))
                })
        })
        .collect()
}

/// Parses a container's `command` + `args` into start flags.
/// Unrecognized flags are kept verbatim; a malformed port is an error, never a default.
pub fn parse_start_command(parts: &[String]) -> Result<StartFlags> {
    let tokens = tokenize(parts);
    let start = tokens
        .iter()
        .position(|t| SUBCOMMANDS.contains(&t.as_str()))
        .map(|i| i + 1)
        .unwrap_or(0);

    let mut port: Option<u16> = None;
    let mut sql_addr_port: Option<u16> = None;
    let mut listen_addr_port: Option<u16> = None;
    let mut http_port: Option<u16> = None;
    let mut http_addr_port: Option<u16> = None;
    let mut join = Vec::new();
    let mut insecure = false;
    let mut locality = Vec::new();
    let mut wal_failover = None;
    let mut stores = Vec::new();
    let mut log_config_file = None;
    let mut extra = ExtraFlags::default();

    let mut i = start;
    while i < tokens.len() {
        let token = &tokens[i];
        i += 1;
        if !token.starts_with('-') {
            return Err(MigrateError::parse(
                token.as_str(),
                "unexpected positional argument",
            ));
        }
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None if !BARE_FLAGS.contains(&token.as_str())
                && i < tokens.len()
                && !tokens[i].starts_with('-') =>
            {
                i += 1;
                (token.clone(), tokens[i - 1].clone())
            }
            None => (token.clone(), String::new()),
        };

        match key.as_str() {
            "--port" => port = Some(parse_port(&key, &value)?),
            "--sql-addr" => sql_addr_port = parse_addr_port(&key, &value)?,
            "--listen-addr" => listen_addr_port = parse_addr_port(&key, &value)?,
            "--http-port" => http_port = Some(parse_port(&key, &value)?),
            "--http-addr" => http_addr_port = parse_addr_port(&key, &value)?,
            "--join" => {
                join = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            "--insecure" => insecure = parse_bool(&key, &value)?,
            "--locality" => locality = parse_locality(&value)?,
            "--wal-failover" => wal_failover = Some(value),
            "--store" | "-s" => stores.push(value),
            "--log-config-file" => log_config_file = Some(value),
            k if DROPPED_FLAGS.contains(&k) => {}
            _ => extra.insert(key, value),
        }
    }

    Ok(StartFlags {
        sql_port: sql_addr_port.or(port).unwrap_or(DEFAULT_SQL_PORT),
        grpc_port: listen_addr_port.unwrap_or(DEFAULT_GRPC_PORT),
        http_port: http_addr_port.or(http_port).unwrap_or(DEFAULT_HTTP_PORT),
        join,
        insecure,
        locality,
        wal_failover,
        stores,
        log_config_file,
        extra,
    })
}

/// Store path of a `--store` value (`path=/x,attrs=ssd` or a bare path).
pub fn store_path(store: &str) -> Option<&str> {
    if !store.contains('=') {
        return Some(store);
    }
    store
        .split(',')
        .find_map(|field| field.strip_prefix("path="))
}

/// Fields of a `--store` value other than its path, in their original order.
pub fn store_options(store: &str) -> Vec<String> {
    if !store.contains('=') {
        return Vec::new();
    }
    store
        .split(',')
        .filter(|field| !field.is_empty() && !field.starts_with("path="))
        .map(String::from)
        .collect()
}
