//! Conduit - connect to MCP servers from the command line.
//!
//! This is the main entry point for the conduit CLI.

mod commands;
mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use commands::AuthCommands;
use conduit_auth::{FileCredentialStore, OAuthManager, SystemBrowser};
use conduit_mcp::ConnectionManager;
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about = "Connect to MCP servers over stdio and HTTP", long_about = None)]
struct Cli {
    /// Config file (defaults to conduit.json in the project or config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every configured server and show its state
    Servers,
    /// List the tools of a server
    Tools {
        /// Server id
        id: String,
    },
    /// List the resources of a server
    Resources {
        /// Server id
        id: String,
    },
    /// List the prompts of a server
    Prompts {
        /// Server id
        id: String,
    },
    /// Call a tool
    Call {
        /// Server id
        id: String,
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        arguments: Option<String>,
    },
    /// Render a prompt
    Prompt {
        /// Server id
        id: String,
        /// Prompt name
        name: String,
        /// Arguments as a JSON object of strings
        arguments: Option<String>,
    },
    /// Read a resource
    Read {
        /// Server id
        id: String,
        /// Resource URI
        uri: String,
    },
    /// Connect to a server and print its events until interrupted
    Watch {
        /// Server id
        id: String,
    },
    /// Authorize with OAuth-protected servers
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
}

fn build_manager(config: &Config) -> anyhow::Result<ConnectionManager> {
    let store = FileCredentialStore::new().context("Failed to open credential store")?;
    let oauth = OAuthManager::new(Arc::new(store), Arc::new(SystemBrowser));
    Ok(ConnectionManager::new(
        config.settings.clone(),
        Arc::new(oauth),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_file = commands::init_logging(cli.verbose);
    if let Some(path) = &log_file {
        tracing::debug!(path = %path.display(), "Logging initialized");
    }

    let cwd = std::env::current_dir()?;
    let (config, source) = Config::load(cli.config.as_deref(), &cwd).await?;
    if let Some(source) = &source {
        tracing::info!(path = %source.display(), servers = config.servers.len(), "Loaded config");
    }

    let manager = build_manager(&config)?;
    let json = cli.json;

    match cli.command {
        Commands::Servers => commands::list_servers(&manager, &config).await,
        Commands::Tools { id } => commands::list_tools(&manager, &config, &id, json).await,
        Commands::Resources { id } => commands::list_resources(&manager, &config, &id, json).await,
        Commands::Prompts { id } => commands::list_prompts(&manager, &config, &id, json).await,
        Commands::Call {
            id,
            tool,
            arguments,
        } => commands::call_tool(&manager, &config, &id, &tool, arguments.as_deref(), json).await,
        Commands::Prompt {
            id,
            name,
            arguments,
        } => commands::get_prompt(&manager, &config, &id, &name, arguments.as_deref(), json).await,
        Commands::Read { id, uri } => {
            commands::read_resource(&manager, &config, &id, &uri, json).await
        }
        Commands::Watch { id } => commands::watch(&manager, &config, &id).await,
        Commands::Auth { command } => commands::handle_auth(command, &manager, &config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "conduit",
            "call",
            "fs",
            "read_file",
            r#"{"path":"/a"}"#,
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Call { id, tool, arguments } => {
                assert_eq!(id, "fs");
                assert_eq!(tool, "read_file");
                assert_eq!(arguments.as_deref(), Some(r#"{"path":"/a"}"#));
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn test_parse_auth_callback() {
        let cli = Cli::try_parse_from([
            "conduit",
            "auth",
            "callback",
            "conduit://oauth/callback?code=a&state=b",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Auth {
                command: AuthCommands::Callback { .. }
            }
        ));
    }
}
