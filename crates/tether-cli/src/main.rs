mod run_cmd;
mod seed;
mod serve_cmd;
mod settings;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use settings::{CliOverrides, Settings, SettingsFile};

#[derive(Parser)]
#[command(name = "tether", about = "Local control plane for a voice-agent worker process")]
struct Cli {
    /// Settings file (defaults to $XDG_CONFIG_HOME/tether/config.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default settings file
    Init {
        /// Overwrite existing settings file
        #[arg(long)]
        force: bool,
    },
    /// Serve the HTTP control surface
    Serve {
        /// Address to bind (overrides TETHER_BIND)
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides TETHER_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// JSON file applied to the agent config at startup
        #[arg(long)]
        agent_config: Option<PathBuf>,
    },
    /// Run one worker in the foreground and print its output
    Run {
        /// JSON file applied to the agent config before starting
        #[arg(long)]
        agent_config: Option<PathBuf>,
    },
    /// Print the resolved settings
    Config,
}

/// Execute the `tether init` command: write the settings file.
fn cmd_init(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "settings file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    settings::save_settings(path, &SettingsFile::default())?;

    println!("Settings written to {}", path.display());
    println!();
    println!("Next: edit [worker] to point at your pipeline runner, then `tether serve`.");
    Ok(())
}

/// Execute the `tether config` command: print resolved settings as TOML.
fn cmd_config(path: &std::path::Path) -> anyhow::Result<()> {
    let resolved = Settings::resolve(&CliOverrides::default(), path)?;
    println!("# settings file: {}", path.display());
    print!("{}", toml::to_string_pretty(&resolved.to_file())?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.unwrap_or_else(settings::config_path);

    match cli.command {
        Commands::Init { force } => {
            cmd_init(&settings_path, force)?;
        }
        Commands::Serve {
            bind,
            port,
            agent_config,
        } => {
            let resolved = Settings::resolve(&CliOverrides { bind, port }, &settings_path)?;
            let store = seed::seed_store(agent_config.as_deref())?;
            serve_cmd::run_serve(&resolved, store).await?;
        }
        Commands::Run { agent_config } => {
            let resolved = Settings::resolve(&CliOverrides::default(), &settings_path)?;
            let store = seed::seed_store(agent_config.as_deref())?;
            let reason = run_cmd::run_once(&resolved, store).await?;
            if reason.is_crash() {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            cmd_config(&settings_path)?;
        }
    }

    Ok(())
}
