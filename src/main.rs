//! crdb-migrate: re-express a running CockroachDB cluster under the other management
//! scheme (StatefulSet or CrdbNode), as a CLI or as an MCP server over stdio.

mod bridge;
mod config;
mod emit;
mod error;
mod observe;
mod platform;
mod synth;
mod tools;
mod types;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use config::{FileDefaults, MigrationConfig, SourceKind, TargetSettings};
use rmcp::{
    handler::server::ServerHandler,
    model::{CallToolResult, Content},
    tool, tool_handler, tool_router,
    transport::stdio,
    ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::runtime::Handle;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read a running cluster and write the target scheme's manifests
    BuildManifest(BuildManifestArgs),
    /// Serve the MCP tools over stdio
    Serve,
}

#[derive(Args, Debug, Clone)]
struct BuildManifestArgs {
    /// Scheme the cluster runs under today
    #[arg(long, value_enum, env = "CRDB_MIGRATE_SOURCE")]
    source: SourceKind,

    /// StatefulSet name, or the cluster label of the CrdbNodes
    #[arg(long, env = "CRDB_MIGRATE_NAME")]
    name: String,

    #[arg(long, env = "CRDB_MIGRATE_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long, env = "CRDB_MIGRATE_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// TOML file with defaults; flags given here win
    #[arg(long, env = "CRDB_MIGRATE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CRDB_MIGRATE_CLOUD_PROVIDER")]
    cloud_provider: Option<String>,

    #[arg(long, env = "CRDB_MIGRATE_REGION")]
    region: Option<String>,

    /// Image for the target; defaults to the one the source runs
    #[arg(long)]
    image: Option<String>,

    #[arg(long)]
    cluster_domain: Option<String>,

    /// Read objects from a YAML dump instead of the platform
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Apply the RBAC bundle when migrating to a StatefulSet
    #[arg(long)]
    apply_rbac: bool,
}

impl BuildManifestArgs {
    fn resolve(self) -> anyhow::Result<(MigrationConfig, Option<PathBuf>)> {
        let defaults = match &self.config {
            Some(path) => FileDefaults::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => FileDefaults::default(),
        };
        let target = TargetSettings {
            cloud_provider: self.cloud_provider,
            region: self.region,
            image: self.image,
            cluster_domain: self.cluster_domain,
        }
        .or(defaults.target());
        let output_dir = self
            .output_dir
            .or(defaults.output_dir)
            .context("no output directory: pass --output-dir or set output-dir in the config file")?;
        let config = MigrationConfig {
            source: self.source,
            name: self.name,
            namespace: self
                .namespace
                .or(defaults.namespace)
                .unwrap_or_else(|| "default".to_string()),
            output_dir,
            target,
            apply_rbac: self.apply_rbac,
        };
        Ok((config, self.snapshot))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct BuildParams {
    /// Scheme the cluster runs under today: statefulset or crdbnode
    source: SourceKind,
    /// StatefulSet name, or the cluster label of the CrdbNodes
    name: String,
    /// Namespace (optional, default "default")
    #[serde(default)]
    namespace: Option<String>,
    /// Directory the manifests are written to
    output_dir: String,
    /// Cloud provider for the operator values (optional)
    #[serde(default)]
    cloud_provider: Option<String>,
    /// Region code for the operator values (optional when the cluster has a region locality tier)
    #[serde(default)]
    region: Option<String>,
    /// Target image (optional)
    #[serde(default)]
    image: Option<String>,
    /// Cluster domain (optional)
    #[serde(default)]
    cluster_domain: Option<String>,
    /// Path to a YAML object dump to read instead of the platform (optional)
    #[serde(default)]
    snapshot: Option<String>,
    /// Apply the RBAC bundle when migrating to a StatefulSet (optional)
    #[serde(default)]
    apply_rbac: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct ParseParams {
    /// Full container start command, e.g. the Helm chart's bash wrapper
    command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct ClassifyParams {
    /// Value of --wal-failover; omit when the flag is absent
    #[serde(default)]
    value: Option<String>,
    /// Number of --store flags per node (optional, default 1)
    #[serde(default)]
    store_count: Option<usize>,
}

#[derive(Clone)]
struct CrdbMigrateService {
    tool_router: rmcp::handler::server::tool::ToolRouter<Self>,
}

#[tool_router]
impl CrdbMigrateService {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Read a running cluster and write manifests for the other management scheme")]
    async fn build_migration_manifests(
        &self,
        params: rmcp::handler::server::wrapper::Parameters<BuildParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let p = params.0;
        let config = MigrationConfig {
            source: p.source,
            name: p.name,
            namespace: p.namespace.unwrap_or_else(|| "default".to_string()),
            output_dir: PathBuf::from(p.output_dir),
            target: TargetSettings {
                cloud_provider: p.cloud_provider,
                region: p.region,
                image: p.image,
                cluster_domain: p.cluster_domain,
            },
            apply_rbac: p.apply_rbac.unwrap_or(false),
        };
        let snapshot = p.snapshot.map(PathBuf::from);
        let handle = Handle::current();
        let result = tokio::task::spawn_blocking(move || {
            tools::migrate::run(&config, snapshot.as_deref(), handle)
        })
        .await;
        match result {
            Ok(Ok(report)) => match tools::migrate::report_json(&report) {
                Ok(out) => Ok(CallToolResult::success(vec![Content::text(out)])),
                Err(e) => Ok(CallToolResult::error(vec![Content::text(e)])),
            },
            Ok(Err(e)) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "migration task failed: {}",
                e
            ))])),
        }
    }

    #[tool(description = "Interpret a database container start command: ports, join list, extra flags, WAL failover mode")]
    async fn parse_start_command(
        &self,
        params: rmcp::handler::server::wrapper::Parameters<ParseParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        match tools::inspect::parse_start_command_json(&params.0.command) {
            Ok(out) => Ok(CallToolResult::success(vec![Content::text(out)])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e)])),
        }
    }

    #[tool(description = "Classify a --wal-failover value as disabled, among-stores or side-disk")]
    async fn classify_wal_failover(
        &self,
        params: rmcp::handler::server::wrapper::Parameters<ClassifyParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let p = params.0;
        match tools::inspect::classify_wal_failover_json(p.value.as_deref(), p.store_count.unwrap_or(1)) {
            Ok(out) => Ok(CallToolResult::success(vec![Content::text(out)])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e)])),
        }
    }

    #[tool(description = "List the start flags the interpreter recognizes, drops, or passes through")]
    async fn list_recognized_flags(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let out = tools::reference::list_recognized_flags_json();
        Ok(CallToolResult::success(vec![Content::text(out)]))
    }
}

#[tool_handler]
impl ServerHandler for CrdbMigrateService {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        let mut info = rmcp::model::ServerInfo::default();
        info.instructions = Some(
            "MCP for CockroachDB migration between StatefulSet and CrdbNode management: build manifests and inspect start commands."
                .to_string(),
        );
        info.capabilities = rmcp::model::ServerCapabilities::builder()
            .enable_tools()
            .build();
        info
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the MCP transport, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::BuildManifest(args) => {
            let (config, snapshot) = args.resolve()?;
            let handle = Handle::current();
            let report = tokio::task::spawn_blocking(move || {
                tools::migrate::run(&config, snapshot.as_deref(), handle)
            })
            .await??;
            println!(
                "{}",
                tools::migrate::report_json(&report).map_err(anyhow::Error::msg)?
            );
        }
        Commands::Serve => {
            let service = CrdbMigrateService::new();
            let transport = stdio();
            let server = service.serve(transport).await?;
            server.waiting().await?;
        }
    }
    Ok(())
}
