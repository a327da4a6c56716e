mod clock;
mod cloud_init;
mod commands;
mod config;
mod domain;
mod errors;
mod fabric;
mod identity;
mod logging;
mod ssh;
mod store;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use commands::power::Action;
use commands::query::Query;
use commands::Session;
use config::DriverConfig;

#[derive(Parser)]
#[command(
    name = "cdi-node-driver",
    version,
    about = "Provision and manage bare-metal nodes on a composable disaggregated infrastructure fabric"
)]
struct Cli {
    /// Path to config file (default: ~/.config/cdi-node-driver/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Name of the node to act on
    #[arg(long, global = true, env = "CDI_MACHINE_NAME")]
    machine_name: String,

    /// Directory holding node records and SSH keys
    #[arg(long, global = true)]
    store_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration, user authorization and tenant
    Check,

    /// Compose a machine, install the OS image and bootstrap it over SSH
    Create,

    /// Power the node on and wait until it runs
    Start,

    /// Gracefully shut the node down
    Stop,

    /// Power the node off immediately
    Kill,

    /// Stop, then start the node
    Restart,

    /// Remove the machine from the fabric and forget the node
    Remove,

    /// Print the node's lifecycle state
    State,

    /// Print the node's primary IP address
    Ip,

    /// Print the node's docker URL
    Url,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => DriverConfig::default_path()?,
    };
    let config = DriverConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    logging::init(&config.log);

    let mut session = Session::open(config, &cli.machine_name, cli.store_path)?;

    match cli.command {
        Commands::Check => commands::check::run(&mut session),
        Commands::Create => commands::create::run(&mut session),
        Commands::Start => commands::power::run(&mut session, Action::Start),
        Commands::Stop => commands::power::run(&mut session, Action::Stop),
        Commands::Kill => commands::power::run(&mut session, Action::Kill),
        Commands::Restart => commands::power::run(&mut session, Action::Restart),
        Commands::Remove => commands::remove::run(&mut session),
        Commands::State => commands::query::run(&mut session, Query::State),
        Commands::Ip => commands::query::run(&mut session, Query::Ip),
        Commands::Url => commands::query::run(&mut session, Query::Url),
    }
}
