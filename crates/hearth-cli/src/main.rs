//! Operator command-line interface for the Hearth plugin runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hearth_core::config::env_vars;
use hearth_core::discovery::{self, MANIFEST_FILE};
use hearth_core::plugin::{PluginRegistry, PluginType};
use hearth_core::RuntimeConfig;
use hearth_storage::PluginStore;

/// Hearth - inspect and manage host plugins.
#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Runtime configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manifest commands.
    Manifest {
        #[command(subcommand)]
        cmd: ManifestCommand,
    },
    /// Plugin discovery commands.
    Plugin {
        #[command(subcommand)]
        cmd: PluginCommand,
    },
    /// Durable store commands.
    Store {
        #[command(subcommand)]
        cmd: StoreCommand,
    },
    /// Print the effective runtime configuration.
    Config,
}

#[derive(Subcommand, Debug)]
enum ManifestCommand {
    /// Validate a manifest file or plugin directory.
    Validate {
        #[arg(required = true)]
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum PluginCommand {
    /// List plugins found in plugin directories.
    List {
        /// Directory to scan; repeatable. Defaults to the configured plugin_dirs.
        #[arg(short, long)]
        dir: Vec<PathBuf>,
        /// Plugin type filter.
        #[arg(short, long)]
        ty: Option<String>,
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum StoreCommand {
    /// Show records and configuration kept in a store.
    Inspect {
        #[arg(required = true)]
        path: PathBuf,
    },
    /// Reconcile discovered manifests into a store.
    Sync {
        #[arg(required = true)]
        path: PathBuf,
        /// Directory to scan; repeatable. Defaults to the configured plugin_dirs.
        #[arg(short, long)]
        dir: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = RuntimeConfig::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    match args.command {
        Command::Manifest {
            cmd: ManifestCommand::Validate { path },
        } => validate_manifest(&path),
        Command::Plugin {
            cmd: PluginCommand::List { dir, ty, json },
        } => list_plugins(&config, dir, ty, json),
        Command::Store {
            cmd: StoreCommand::Inspect { path },
        } => inspect_store(&path),
        Command::Store {
            cmd: StoreCommand::Sync { path, dir },
        } => sync_store(&config, &path, dir).await,
        Command::Config => show_config(&config),
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "debug" } else { "warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("hearth={0},hearth_core={0},hearth_storage={0}", default_level))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn scan_dirs(config: &RuntimeConfig, dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    if dirs.is_empty() {
        config.plugin_dirs.clone()
    } else {
        dirs
    }
}

/// Validate a single manifest.
fn validate_manifest(path: &Path) -> Result<()> {
    let file = if path.is_dir() {
        path.join(MANIFEST_FILE)
    } else {
        path.to_path_buf()
    };

    match discovery::read_manifest(&file) {
        Ok(manifest) => {
            println!("valid: {} {} ({})", manifest.id, manifest.version, manifest.plugin_type);
            if !manifest.permissions.is_empty() {
                println!("  permissions: {}", manifest.permissions.join(", "));
            }
            if !manifest.hooks.is_empty() {
                println!("  hooks: {}", manifest.hooks.join(", "));
            }
            if !manifest.dependencies.is_empty() {
                println!("  dependencies: {}", manifest.dependencies.join(", "));
            }
            Ok(())
        }
        Err(reason) => Err(anyhow::anyhow!("{}: {}", file.display(), reason)),
    }
}

/// List discovered plugins.
fn list_plugins(config: &RuntimeConfig, dirs: Vec<PathBuf>, ty: Option<String>, json: bool) -> Result<()> {
    let filter = match ty.as_deref() {
        Some(t) => Some(PluginType::parse(t).with_context(|| {
            let known: Vec<_> = PluginType::ALL.iter().map(|t| t.as_str()).collect();
            format!("Unknown plugin type '{}', expected one of {}", t, known.join(", "))
        })?),
        None => None,
    };

    let dirs = scan_dirs(config, dirs);
    if dirs.is_empty() {
        anyhow::bail!("No plugin directories given; use --dir or set {}", env_vars::PLUGIN_DIRS);
    }

    tracing::debug!(dirs = ?dirs, "Scanning plugin directories");
    let report = discovery::discover(&dirs);
    let accepted: Vec<_> = report
        .accepted
        .iter()
        .filter(|d| filter.map_or(true, |t| d.manifest.plugin_type == t))
        .collect();

    if json {
        let out = serde_json::json!({
            "plugins": accepted.iter().map(|d| serde_json::json!({
                "id": d.manifest.id,
                "name": d.manifest.name,
                "version": d.manifest.version.to_string(),
                "plugin_type": d.manifest.plugin_type,
                "path": d.path,
            })).collect::<Vec<_>>(),
            "rejected": report.rejected.iter().map(|r| serde_json::json!({
                "path": r.path,
                "reason": r.reason,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Discovered Plugins");
    println!("==================\n");
    for d in &accepted {
        println!(
            "{:<24} {:<10} {:<12} {}",
            d.manifest.id,
            d.manifest.version,
            d.manifest.plugin_type,
            d.path.display()
        );
    }
    if accepted.is_empty() {
        println!("(none)");
    }
    if !report.rejected.is_empty() {
        println!("\nRejected");
        println!("--------");
        for r in &report.rejected {
            println!("{}: {}", r.path.display(), r.reason);
        }
    }
    Ok(())
}

/// Print what a store holds.
fn inspect_store(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Store not found: {}", path.display());
    }
    let store = PluginStore::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open store {}: {}", path.display(), e))?;

    let stats = store.stats().map_err(|e| anyhow::anyhow!("{}", e))?;
    println!("Store: {}", path.display());
    println!(
        "records: {}  enabled: {}  configs: {}\n",
        stats.records, stats.enabled, stats.configs
    );

    let mut records = store.load_records().map_err(|e| anyhow::anyhow!("{}", e))?;
    records.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
    for record in records {
        let status = if record.enabled { "enabled" } else { "disabled" };
        println!(
            "{:<24} {:<10} {:<9} updated {}",
            record.manifest.id,
            record.manifest.version,
            status,
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(doc) = store
            .load_config(&record.manifest.id)
            .map_err(|e| anyhow::anyhow!("{}", e))?
        {
            println!("  config: {}", serde_json::Value::Object(doc));
        }
    }
    Ok(())
}

/// Register discovered manifests into a store, keeping enabled flags.
async fn sync_store(config: &RuntimeConfig, path: &Path, dirs: Vec<PathBuf>) -> Result<()> {
    let dirs = scan_dirs(config, dirs);
    let report = discovery::discover(&dirs);

    let store = PluginStore::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open store {}: {}", path.display(), e))?;
    let registry = PluginRegistry::new(Arc::new(store));
    tracing::debug!(store = %path.display(), manifests = report.accepted.len(), "Reconciling store");
    let reconciled = registry
        .reconcile(report.manifests())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to reconcile: {}", e))?;

    println!("registered: {}", reconciled.registered.join(", "));
    println!("restored: {}", reconciled.restored.join(", "));
    for (id, err) in &reconciled.rejected {
        println!("rejected {}: {}", id, err);
    }
    for r in &report.rejected {
        println!("invalid {}: {}", r.path.display(), r.reason);
    }
    Ok(())
}

fn show_config(config: &RuntimeConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
