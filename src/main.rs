use anyhow::Context;
use clap::{Parser, Subcommand};
use map_archive::{ArchiveConfig, ArchiveService, ResourceKey, ResourceKind};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "map-archive", about = "Versioned archive and rollback for maps and layers")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database directory, overrides the config
    #[arg(long)]
    db: Option<PathBuf>,

    /// Principal recorded on audit entries
    #[arg(long)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a MAP or LAYER payload from a JSON file
    Import { file: PathBuf },
    /// Export the live resource or one archived version
    Export {
        kind: String,
        id: String,
        #[arg(long)]
        version: Option<u64>,
    },
    /// Roll a resource back to an archived version
    Rollback {
        kind: String,
        id: String,
        version: u64,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// List archived versions
    Versions { kind: String, id: String },
    /// Archive the current state as a new version
    Bump {
        kind: String,
        id: String,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// List the member layers of a map
    Layers { map_id: String },
    /// Print the audit trail, optionally for one resource
    Audit {
        kind: Option<String>,
        id: Option<String>,
    },
    /// Show an import job
    Job { id: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ArchiveConfig::load(cli.config.as_deref()).context("loading config")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let service = ArchiveService::open(&config)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let actor = cli.actor.as_deref();

    match cli.command {
        Commands::Import { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let payload: serde_json::Value =
                serde_json::from_str(&text).context("payload is not JSON")?;
            print_json(&service.import(payload, actor)?)?;
        }
        Commands::Export { kind, id, version } => {
            print_json(&service.export(&resource_key(&kind, id)?, version, actor)?)?;
        }
        Commands::Rollback {
            kind,
            id,
            version,
            message,
        } => {
            let report = service.rollback(&resource_key(&kind, id)?, version, actor, message.as_deref())?;
            print_json(&report)?;
        }
        Commands::Versions { kind, id } => {
            print_json(&service.versions(&resource_key(&kind, id)?)?)?;
        }
        Commands::Bump { kind, id, message } => {
            let change = service.create_version(&resource_key(&kind, id)?, actor, message.as_deref())?;
            print_json(&change)?;
        }
        Commands::Layers { map_id } => {
            print_json(&service.map_layers(&map_id)?)?;
        }
        Commands::Audit { kind, id } => {
            let entries = match (kind, id) {
                (Some(kind), Some(id)) => service.audit_for(&resource_key(&kind, id)?)?,
                (None, None) => service.audit_log()?,
                _ => anyhow::bail!("audit takes both <kind> and <id>, or neither"),
            };
            print_json(&entries)?;
        }
        Commands::Job { id } => {
            print_json(&service.import_job(&id)?)?;
        }
    }

    service.flush()?;
    Ok(())
}

fn resource_key(kind: &str, id: String) -> anyhow::Result<ResourceKey> {
    let kind = ResourceKind::parse(kind)
        .with_context(|| format!("unknown resource kind {kind:?}, expected map or layer"))?;
    Ok(ResourceKey::new(kind, id))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
