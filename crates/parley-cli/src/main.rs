mod chat;
mod logging;

use clap::{Parser, Subcommand};
use parley_core::config::Config;
use parley_tools::ToolExecutor;
use parley_tools::builtin::register_builtins;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Realtime voice and text sessions with tool calling",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat interactively over a realtime session
    Chat {
        /// Request text-only responses
        #[arg(long)]
        text_only: bool,
    },

    /// List the built-in tools
    Tools,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(Config::expand_path)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    logging::init(&config.logging, cli.verbose)?;
    tracing::debug!(path = %config_path.display(), "Loaded config");

    match cli.command {
        Commands::Chat { text_only } => {
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                anyhow::bail!("invalid config: {}", errors.join("; "));
            }
            chat::run(&config, text_only).await?;
        }
        Commands::Tools => {
            let executor = ToolExecutor::from_config(&config.tools);
            register_builtins(&executor);
            for tool in executor.available_tools() {
                println!("{} ({})", tool.name, tool.category);
                println!("  {}", tool.description);
                println!("  {}", serde_json::to_string(&tool.parameters)?);
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let mut shown = config.clone();
                if shown.connection.api_key.is_some() {
                    shown.connection.api_key = Some("********".into());
                }
                println!("{}", serde_json::to_string_pretty(&shown)?);
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
            ConfigAction::Path => println!("{}", config_path.display()),
        },
    }

    Ok(())
}
