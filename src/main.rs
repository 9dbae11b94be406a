mod cli;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plughost")]
#[command(about = "Discover, load and hot-reload host plugins", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load plugins and list active and inactive ones
    List,
    /// Load, then unload and load again under maintenance mode
    Reload {
        /// Repopulate the host app registry even if no app changed
        #[arg(long)]
        full: bool,
    },
    /// Show plugin roots (created if missing)
    Dirs,
    /// Load plugins and print the error log
    Errors,
    /// Call a method on an active plugin
    Call {
        slug: String,
        method: String,
        /// Arguments, parsed as JSON when possible
        args: Vec<String>,
    },
    /// Mark a plugin record active
    Enable { slug: String },
    /// Mark a plugin record inactive
    Disable { slug: String },
    /// Run the configured installer on the plugin file
    Install,
    /// Reload plugins whenever a manifest changes
    Watch {
        /// Poll interval (e.g. 5s, 1m)
        #[arg(short, long, default_value = "5s")]
        interval: String,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    match cli.command {
        Some(Commands::Version) | None => {
            println!("plughost {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::List) => cli::cmd_list()?,
        Some(Commands::Reload { full }) => cli::cmd_reload(full)?,
        Some(Commands::Dirs) => cli::cmd_dirs()?,
        Some(Commands::Errors) => cli::cmd_errors()?,
        Some(Commands::Call { slug, method, args }) => cli::cmd_call(slug, method, args)?,
        Some(Commands::Enable { slug }) => cli::cmd_set_active(slug, true)?,
        Some(Commands::Disable { slug }) => cli::cmd_set_active(slug, false)?,
        Some(Commands::Install) => cli::cmd_install()?,
        Some(Commands::Watch { interval }) => {
            let config = cli::load_config()?;
            cli::watch::cmd_watch(config, interval).await?;
        }
    }

    Ok(())
}
