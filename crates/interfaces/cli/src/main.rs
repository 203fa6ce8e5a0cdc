mod daemon;
mod mirror_cmds;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use markmirror_config::AppConfig;
use markmirror_runtime::DaemonClient;

#[derive(Debug, Parser)]
#[command(
    name = "markmirror",
    version,
    about = "Keeps a local, queryable mirror of a browser bookmark tree"
)]
struct Cli {
    /// Configuration file; missing means built-in defaults.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,
    /// Print query results as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run or manage the mirror daemon.
    Daemon {
        #[command(subcommand)]
        command: Option<DaemonCommands>,
    },
    /// Show the daemon's sync state.
    Status,
    /// Look up one node by id.
    Node { id: String },
    /// List the children of a folder, or the roots when no parent is given.
    Children { parent: Option<String> },
    /// Search titles and URLs.
    Search {
        #[arg(required = true, trailing_var_arg = true)]
        term: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Rebuild the mirror from a fresh read of the provider tree.
    Rebuild,
    /// Feed provider events (one JSON object per line) to the daemon.
    Push {
        #[arg(value_name = "EVENTS_JSONL")]
        path: PathBuf,
    },
    /// Stream sync progress until interrupted.
    Watch,
    /// Ask the daemon to shut down.
    Stop,
    /// Check the mirror's structural invariants (daemon must be stopped).
    Verify,
    /// Count the mirror's contents (daemon must be stopped).
    Stats,
    /// Delete the mirror so the next daemon start rebuilds it.
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum DaemonCommands {
    /// Run in the foreground (the default).
    Run,
    /// Start in the background, logging to `.markmirror/runtime/daemon.log`.
    Start {
        #[arg(long)]
        force: bool,
    },
    Stop,
    Restart,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let client = DaemonClient::new(&config.daemon.socket_path);

    match cli.command {
        Commands::Daemon { command } => match command.unwrap_or(DaemonCommands::Run) {
            DaemonCommands::Run => daemon::run_daemon_process(config).await?,
            DaemonCommands::Start { force } => daemon::daemon_start(&cli.config, &config, force).await?,
            DaemonCommands::Stop => daemon::daemon_stop(&config).await?,
            DaemonCommands::Restart => {
                daemon::daemon_stop(&config).await?;
                daemon::daemon_start(&cli.config, &config, true).await?;
            }
            DaemonCommands::Status => daemon::daemon_status(&config).await?,
        },
        Commands::Status => {
            let status = client.get_status().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                mirror_cmds::print_status(&status);
            }
        }
        Commands::Node { id } => {
            let node = client.get_node(&id).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&node)?);
            } else {
                match node {
                    Some(node) => mirror_cmds::print_node_detail(&node),
                    None => println!("no node with id {id}"),
                }
            }
        }
        Commands::Children { parent } => {
            let nodes = client.get_children(parent.as_deref()).await?;
            mirror_cmds::print_nodes(&nodes, cli.json)?;
        }
        Commands::Search { term, limit } => {
            let nodes = client.search(&term.join(" "), limit).await?;
            mirror_cmds::print_nodes(&nodes, cli.json)?;
        }
        Commands::Rebuild => {
            let msg = client.force_full_sync().await?;
            println!("{msg}");
        }
        Commands::Push { path } => {
            let events = mirror_cmds::read_events(&path)?;
            if events.is_empty() {
                println!("no events in {}", path.display());
                return Ok(());
            }
            let msg = client.push_events(events).await?;
            println!("{msg}");
        }
        Commands::Watch => mirror_cmds::run_watch(&client, cli.json).await?,
        Commands::Stop => daemon::daemon_stop(&config).await?,
        Commands::Verify => mirror_cmds::run_verify(&config)?,
        Commands::Stats => mirror_cmds::run_stats(&config, cli.json)?,
        Commands::Reset { yes } => mirror_cmds::run_reset(&config, yes)?,
    }

    Ok(())
}
