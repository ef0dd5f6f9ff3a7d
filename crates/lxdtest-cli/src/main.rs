//! lxdtest - LXD test instance driver CLI

use clap::{Parser, Subcommand};
use lxdtest_cli::commands::{self, App};
use lxdtest_config::Config;
use lxdtest_core::{CoreError, InstanceStore};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "lxdtest")]
#[command(author, version, about = "LXD container driver for test instances", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and provision a container, reusing one that already exists
    Create {
        /// Instance name, also used as the container name
        name: String,
        /// Image to launch from (e.g. ubuntu:22.04)
        #[arg(short, long)]
        image: String,
    },

    /// Stop and delete a container
    Destroy {
        /// Instance name
        name: String,
    },

    /// Run a command in a container
    Exec {
        /// Instance name
        name: String,
        /// Command to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        cmd: Vec<String>,
    },

    /// Copy files into a container
    Upload {
        /// Instance name
        name: String,
        /// Destination directory inside the container
        dest: String,
        /// Local files to copy
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List containers
    List {
        /// Only show containers whose name matches
        filter: Option<String>,
    },

    /// Print the command that opens a shell in a container
    Login {
        /// Instance name
        name: String,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        let code = e
            .downcast_ref::<CoreError>()
            .and_then(CoreError::exit_code)
            .filter(|code| *code != 0)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };
    let config = Config::load_from(&config_path)?;

    // Handle config command separately (doesn't need a hypervisor)
    if let Commands::Config = cli.command {
        return commands::config(&config, &config_path);
    }

    // Live command output goes to stdout as it arrives
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{}", line);
        }
    });

    let app = App::new(&config, InstanceStore::open_default()?, Some(tx));
    let result = dispatch(app, cli.command).await;
    let _ = printer.await;
    result
}

/// Runs one command; `app` (and with it the output sender) is dropped on return
async fn dispatch(app: App, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Create { name, image } => {
            commands::create(&app, &name, &image).await?;
        }
        Commands::Destroy { name } => {
            commands::destroy(&app, &name).await?;
        }
        Commands::Exec { name, cmd } => {
            commands::exec(&app, &name, cmd).await?;
        }
        Commands::Upload { name, dest, files } => {
            commands::upload(&app, &name, &dest, &files).await?;
        }
        Commands::List { filter } => {
            commands::list(&app, filter.as_deref()).await?;
        }
        Commands::Login { name } => {
            commands::login(&app, &name)?;
        }
        Commands::Config => unreachable!(), // Handled above
    }
    Ok(())
}
