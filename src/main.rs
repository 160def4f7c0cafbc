//! fluxburst-gke CLI - burst Flux jobs onto ephemeral GKE clusters

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use fluxburst_gke::config::settings::Settings;
use fluxburst_gke::utils::errors::{BurstError, display_error_and_exit};
use fluxburst_gke::utils::{dryrun, logger};
use fluxburst_gke::{commands, log_error, log_info};
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fluxburst-gke")]
#[command(author, version, about = "Burst Flux jobs onto ephemeral GKE clusters", long_about = None)]
struct Cli {
    /// Verbose output (can be used multiple times: -v, -vv, -vvv)
    /// -v: INFO, -vv: DEBUG, -vvv: TRACE
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (default: ./.fluxburst.toml, then ~/.config/fluxburst-gke/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Google Cloud project, overrides burst.project
    #[arg(long, global = true, env = "CLOUDSDK_CORE_PROJECT")]
    project: Option<String>,

    /// Compute zone, overrides burst.zone
    #[arg(long, global = true, env = "CLOUDSDK_COMPUTE_ZONE")]
    zone: Option<String>,

    /// Dry-run mode: log cluster and Kubernetes mutations without making them
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Admit jobs from a file and run one burst cycle
    Run {
        /// JSON array of jobs ({"id", "nodes", "tasks", "command"})
        #[arg(short, long)]
        jobs: PathBuf,
    },

    /// Print the MiniCluster YAML each job would be given
    Render {
        #[arg(short, long)]
        jobs: PathBuf,
    },

    /// Check credentials, tools and configuration
    Check,

    /// Manage burst clusters
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell type
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// List GKE clusters in the configured project and zone
    List,

    /// Delete a cluster.
    ///
    /// Clusters are tracked in memory only, so a cluster created by an earlier
    /// run is found again by asking the provider. Without NAME the configured
    /// burst cluster is deleted.
    Delete {
        /// Cluster name
        name: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print an example config file
    Example,

    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logger::init(cli.verbose);

    if cli.dry_run {
        dryrun::set_dry_run(true);
        log_info!("🔍 DRY RUN MODE: No changes will be made");
        println!();
    }

    if let Err(e) = dispatch(cli).await {
        if let Some(err) = e.downcast_ref::<BurstError>() {
            display_error_and_exit(err);
        }
        log_error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Completion { shell } => return handle_completion_command(shell),
        Commands::Version => return handle_version_command(),
        Commands::Config {
            command: ConfigCommands::Example,
        } => return commands::config::example(),
        _ => {}
    }

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(project) = cli.project {
        settings.burst.project = Some(project);
    }
    if let Some(zone) = cli.zone {
        settings.burst.zone = zone;
    }

    match cli.command {
        Commands::Run { jobs } => commands::run::run(&settings, &jobs).await,
        Commands::Render { jobs } => commands::render::render(&settings, &jobs),
        Commands::Check => commands::check::check(&settings).await,
        Commands::Cluster { command } => match command {
            ClusterCommands::List => commands::cluster::list(&settings).await,
            ClusterCommands::Delete { name, yes } => {
                commands::cluster::delete(&settings, name, yes).await
            }
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => commands::config::show(&settings),
            ConfigCommands::Example => commands::config::example(),
        },
        Commands::Completion { .. } | Commands::Version => Ok(()),
    }
}

fn handle_completion_command(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "fluxburst-gke", &mut io::stdout());
    Ok(())
}

fn handle_version_command() -> Result<()> {
    println!("fluxburst-gke {}", env!("CARGO_PKG_VERSION"));
    println!("Burst Flux jobs onto ephemeral GKE clusters");
    Ok(())
}
