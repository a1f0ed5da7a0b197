use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gundog_daemon::config::DaemonConfig;
use gundog_daemon::registry::{load_project, IndexRegistry};
use gundog_daemon::server::{serve, DaemonState};
use gundog_index::embedding::HttpEmbeddings;
use gundog_index::git::CliGitResolver;
use gundog_index::indexer::{no_stop, IndexBuilder};

#[derive(Parser)]
#[command(name = "gundogd", about = "Gundog daemon and index management", version)]
struct Cli {
    /// Daemon config file (default: ~/.config/gundog/daemon.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Serve,
    /// Register an index.
    Add { name: String, path: PathBuf },
    /// Unregister an index.
    Remove { name: String },
    /// List registered indexes.
    List,
    /// Set the default index.
    Default { name: String },
    /// Ingest a registered index.
    Index {
        name: String,
        /// Wipe the stores and re-embed everything.
        #[arg(long)]
        full: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(DaemonConfig::default_path);

    match cli.command {
        Command::Serve => {
            let config = DaemonConfig::load_or_default(&config_path)?;
            let registry = IndexRegistry::new(config_path, config.clone());
            let state = Arc::new(DaemonState::new(config, registry));
            serve(state).await
        }
        Command::Add { name, path } => {
            let mut registry = IndexRegistry::open(config_path)?;
            registry.add(&name, &path)?;
            println!("registered index '{name}' at {}", path.display());
            Ok(())
        }
        Command::Remove { name } => {
            let mut registry = IndexRegistry::open(config_path)?;
            registry.remove(&name)?;
            println!("removed index '{name}'");
            Ok(())
        }
        Command::List => {
            let registry = IndexRegistry::open(config_path)?;
            let default = registry.default_index().map(String::from);
            for info in registry.list() {
                let marker = if default.as_deref() == Some(info.name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{marker} {} ({} files, {} chunks) {}",
                    info.name, info.file_count, info.chunk_count, info.path
                );
            }
            Ok(())
        }
        Command::Default { name } => {
            let mut registry = IndexRegistry::open(config_path)?;
            registry.set_default(&name)?;
            println!("default index is now '{name}'");
            Ok(())
        }
        Command::Index { name, full } => {
            let registry = IndexRegistry::open(config_path)?;
            let root = registry
                .get(&name)
                .ok_or_else(|| anyhow::anyhow!("unknown index: {name}"))?
                .clone();
            let project = Arc::new(load_project(&root)?);
            let embedder = Arc::new(HttpEmbeddings::from_config(&project.embedding));
            let builder = IndexBuilder::new(project, embedder)
                .with_git(Arc::new(CliGitResolver));

            let stats = builder.build(full, &no_stop()).await?;
            info!(
                added = stats.files_added,
                modified = stats.files_modified,
                removed = stats.files_removed,
                chunks = stats.chunks_indexed,
                duration_ms = stats.duration_ms,
                "ingest finished"
            );
            Ok(())
        }
    }
}
