//! Authorization command handlers.
//!
//! The redirect after authorization goes to `conduit://oauth/callback`. The
//! host's URI handler (or the user) passes that URL to `conduit auth callback`,
//! which may run in a different process than `login`: the flow record is
//! persisted in the credential store.

use crate::config::Config;
use chrono::Utc;
use clap::Subcommand;
use conduit_mcp::ConnectionManager;
use std::io::{self, BufRead, Write};

/// Authorization subcommands.
#[derive(Subcommand)]
pub enum AuthCommands {
    /// Start authorization for a server
    Login {
        /// Server id
        id: String,
        /// Wait for the redirect URL to be pasted on stdin
        #[arg(long)]
        wait: bool,
    },
    /// Complete authorization with the redirect URL
    Callback {
        /// The full `conduit://oauth/callback?...` URL
        url: String,
    },
    /// Forget stored tokens for a server
    Logout {
        /// Server id
        id: String,
    },
    /// Show stored tokens per server
    Status,
}

/// Handle authorization commands.
pub async fn handle_auth(
    command: AuthCommands,
    manager: &ConnectionManager,
    config: &Config,
) -> anyhow::Result<()> {
    match command {
        AuthCommands::Login { id, wait } => auth_login(manager, config, &id, wait).await,
        AuthCommands::Callback { url } => auth_callback(manager, config, &url).await,
        AuthCommands::Logout { id } => auth_logout(manager, &id).await,
        AuthCommands::Status => auth_status(manager, config).await,
    }
}

fn register_all(manager: &ConnectionManager, config: &Config) {
    for server in config.servers.values() {
        manager.register_server(server.clone());
    }
}

async fn auth_login(
    manager: &ConnectionManager,
    config: &Config,
    id: &str,
    wait: bool,
) -> anyhow::Result<()> {
    manager.register_server(config.server(id)?.clone());
    let url = manager.authenticate(id).await?;

    println!("Opening the browser to authorize '{id}'.");
    println!("If it does not open, visit:");
    println!();
    println!("  {url}");
    println!();

    if !wait {
        println!("Then run `conduit auth callback <redirect-url>`.");
        return Ok(());
    }

    print!("Paste the redirect URL: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;
    auth_callback(manager, config, input.trim()).await
}

async fn auth_callback(
    manager: &ConnectionManager,
    config: &Config,
    url: &str,
) -> anyhow::Result<()> {
    register_all(manager, config);
    let outcome = manager.complete_auth(url).await;
    manager.shutdown().await;

    match outcome.error {
        None => {
            println!("✓ Authorized and connected");
            Ok(())
        }
        Some(error) => Err(anyhow::anyhow!("Authorization failed: {error}")),
    }
}

async fn auth_logout(manager: &ConnectionManager, id: &str) -> anyhow::Result<()> {
    if manager.oauth().logout(id).await? {
        println!("✓ Removed stored tokens for '{id}'");
    } else {
        println!("No stored tokens for '{id}'");
    }
    Ok(())
}

async fn auth_status(manager: &ConnectionManager, config: &Config) -> anyhow::Result<()> {
    let servers: Vec<_> = config
        .servers
        .values()
        .filter(|s| s.auth.is_some())
        .collect();
    if servers.is_empty() {
        println!("No servers with auth configured.");
        return Ok(());
    }

    let now = Utc::now();
    for server in servers {
        let status = match manager.oauth().tokens(&server.id).await? {
            None => "not authorized".to_string(),
            Some(tokens) => match tokens.expires_at {
                Some(at) if at <= now => "expired (will refresh)".to_string(),
                Some(at) => format!("valid for {} min", (at - now).num_minutes()),
                None => "valid (no expiry)".to_string(),
            },
        };
        println!("{:<20} {}", server.id, status);
    }
    Ok(())
}
