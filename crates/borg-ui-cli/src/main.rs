mod cmd;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "borg-ui",
    about = "Borg UI: background schedulers, orphan recovery and the web API",
    version,
    propagate_version = true
)]
struct Cli {
    /// Data directory holding the registry, settings and logs
    #[arg(long, global = true, env = "BORG_UI_DATA_DIR", default_value = "/data")]
    data_dir: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run startup, serve the HTTP API until Ctrl-C, then shut down
    Serve {
        /// Port to listen on
        #[arg(long, env = "BORG_UI_PORT", default_value = "8081")]
        port: u16,

        /// Password for the first admin user (generated when unset)
        #[arg(long, env = "BORG_UI_ADMIN_PASSWORD", hide_env_values = true)]
        admin_password: Option<String>,
    },

    /// Reconcile running jobs and active mounts against the OS once
    Reconcile,

    /// Apply pending registry migrations
    Migrate,

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    let filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    let data_dir = cli.data_dir;
    let result = match cli.command {
        Commands::Serve {
            port,
            admin_password,
        } => cmd::serve::run(&data_dir, port, admin_password),
        Commands::Reconcile => cmd::reconcile::run(&data_dir, cli.json),
        Commands::Migrate => cmd::migrate::run(&data_dir, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&data_dir, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
