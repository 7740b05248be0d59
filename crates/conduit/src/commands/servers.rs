//! Server command handlers.
//!
//! Each command starts the servers it needs, runs, and shuts the manager
//! down again. Nothing is kept running between invocations.

use crate::config::Config;
use anyhow::{anyhow, bail, Context};
use conduit_mcp::{
    ConnectionEvent, ConnectionManager, ConnectionState, ServerConfig, ToolContent,
    TransportConfig,
};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast::error::RecvError;
use tracing::Instrument;

/// Start one server, turning a failed start into an error.
async fn connect(manager: &ConnectionManager, config: &Config, id: &str) -> anyhow::Result<()> {
    let server = config.server(id)?.clone();
    let outcome = manager.start_server(server).await;
    if outcome.success {
        return Ok(());
    }

    let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
    if matches!(manager.state(id), Some(ConnectionState::AuthRequired { .. })) {
        bail!("{error}\nRun `conduit auth login {id}` to authorize.");
    }
    bail!("Failed to start '{id}': {error}")
}

fn describe(server: &ServerConfig) -> (&'static str, String) {
    match &server.transport {
        TransportConfig::Stdio { command, args, .. } => {
            let mut line = command.clone();
            for arg in args {
                line.push(' ');
                line.push_str(arg);
            }
            ("stdio", line)
        }
        TransportConfig::Http { url, .. } => ("http", url.clone()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Start every enabled server and print its state.
pub async fn list_servers(manager: &ConnectionManager, config: &Config) -> anyhow::Result<()> {
    if config.servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    let starts = config.servers.values().map(|server| async move {
        if server.enabled {
            manager.start_server(server.clone()).await;
        } else {
            manager.register_server(server.clone());
        }
    });
    futures::future::join_all(starts).await;

    println!("{:<20} {:<6} {:<14} {}", "ID", "TYPE", "STATE", "ENDPOINT");
    println!("{}", "-".repeat(72));
    for (id, server) in &config.servers {
        let (kind, endpoint) = describe(server);
        let state = match manager.state(id) {
            Some(_) if !server.enabled => "disabled".to_string(),
            Some(state) => state.name().to_string(),
            None => "unknown".to_string(),
        };
        println!("{:<20} {:<6} {:<14} {}", id, kind, state, truncate(&endpoint, 40));

        match manager.state(id) {
            Some(ConnectionState::Error { message }) => println!("    error: {message}"),
            Some(ConnectionState::AuthRequired { message, .. }) => {
                let message = message.unwrap_or_else(|| "authorization required".to_string());
                println!("    {message} (run `conduit auth login {id}`)");
            }
            _ => {}
        }
    }

    manager.shutdown().await;
    Ok(())
}

pub async fn list_tools(
    manager: &ConnectionManager,
    config: &Config,
    id: &str,
    json: bool,
) -> anyhow::Result<()> {
    connect(manager, config, id).await?;
    let tools = manager.list_tools(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else if tools.is_empty() {
        println!("No tools.");
    } else {
        for tool in &tools {
            let description = tool.description.as_deref().unwrap_or("");
            println!("{:<30} {}", tool.name, truncate(description, 60));
        }
    }
    manager.shutdown().await;
    Ok(())
}

pub async fn list_resources(
    manager: &ConnectionManager,
    config: &Config,
    id: &str,
    json: bool,
) -> anyhow::Result<()> {
    connect(manager, config, id).await?;
    let resources = manager.list_resources(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&resources)?);
    } else if resources.is_empty() {
        println!("No resources.");
    } else {
        for resource in &resources {
            println!("{:<40} {}", resource.uri, resource.name);
        }
    }
    manager.shutdown().await;
    Ok(())
}

pub async fn list_prompts(
    manager: &ConnectionManager,
    config: &Config,
    id: &str,
    json: bool,
) -> anyhow::Result<()> {
    connect(manager, config, id).await?;
    let prompts = manager.list_prompts(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&prompts)?);
    } else if prompts.is_empty() {
        println!("No prompts.");
    } else {
        for prompt in &prompts {
            let args: Vec<String> = prompt
                .arguments
                .iter()
                .map(|a| if a.required { a.name.clone() } else { format!("[{}]", a.name) })
                .collect();
            println!("{:<30} {}", prompt.name, args.join(" "));
        }
    }
    manager.shutdown().await;
    Ok(())
}

fn print_content(content: &ToolContent) {
    match content {
        ToolContent::Text { text } => println!("{text}"),
        ToolContent::Image { mime_type, data } => {
            println!("[image {mime_type}, {} bytes base64]", data.len())
        }
        ToolContent::Audio { mime_type, data } => {
            println!("[audio {mime_type}, {} bytes base64]", data.len())
        }
        ToolContent::Resource { resource } => match &resource.text {
            Some(text) => println!("{text}"),
            None => println!("[resource {}]", resource.uri),
        },
        ToolContent::Unknown => println!("[unsupported content]"),
    }
}

fn parse_json_arg(raw: Option<&str>) -> anyhow::Result<Option<Value>> {
    raw.map(|raw| serde_json::from_str(raw).context("Arguments must be valid JSON"))
        .transpose()
}

pub async fn call_tool(
    manager: &ConnectionManager,
    config: &Config,
    id: &str,
    tool: &str,
    arguments: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let arguments = parse_json_arg(arguments)?;
    connect(manager, config, id).await?;
    let result = manager.call_tool(id, tool, arguments).await;
    manager.shutdown().await;
    let result = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        result.content.iter().for_each(print_content);
    }
    if result.is_error {
        bail!("Tool '{tool}' reported an error");
    }
    Ok(())
}

pub async fn get_prompt(
    manager: &ConnectionManager,
    config: &Config,
    id: &str,
    name: &str,
    arguments: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let arguments = match parse_json_arg(arguments)? {
        Some(value) => Some(
            serde_json::from_value::<HashMap<String, String>>(value)
                .context("Prompt arguments must be a JSON object of strings")?,
        ),
        None => None,
    };
    connect(manager, config, id).await?;
    let result = manager.get_prompt(id, name, arguments).await;
    manager.shutdown().await;
    let result = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    if let Some(description) = &result.description {
        println!("# {description}");
    }
    for message in &result.messages {
        println!("[{}]", message.role);
        print_content(&message.content);
    }
    Ok(())
}

pub async fn read_resource(
    manager: &ConnectionManager,
    config: &Config,
    id: &str,
    uri: &str,
    json: bool,
) -> anyhow::Result<()> {
    connect(manager, config, id).await?;
    let result = manager.read_resource(id, uri).await;
    manager.shutdown().await;
    let result = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    for content in &result.contents {
        match (&content.text, &content.blob) {
            (Some(text), _) => println!("{text}"),
            (None, Some(blob)) => println!("[{} bytes base64]", blob.len()),
            (None, None) => println!("[empty {}]", content.uri),
        }
    }
    Ok(())
}

/// Start a server and print its events as JSON lines until interrupted.
pub async fn watch(manager: &ConnectionManager, config: &Config, id: &str) -> anyhow::Result<()> {
    let server = config.server(id)?.clone();
    let mut events = manager.subscribe();

    let watch = async {
        let outcome = manager.start_server(server).await;
        if let Some(error) = &outcome.error {
            eprintln!("start failed: {error}");
        }

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) if event.server_id() == id => print_event(&event)?,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event watcher fell behind");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        anyhow::Ok(())
    };

    let result = watch.instrument(conduit_util::server_span!(id)).await;
    manager.shutdown().await;
    result
}

fn print_event(event: &ConnectionEvent) -> anyhow::Result<()> {
    let line = serde_json::to_string(event).map_err(|e| anyhow!("Failed to encode event: {e}"))?;
    println!("{line}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a long description", 10), "a long ...");
    }

    #[test]
    fn test_describe_stdio() {
        let server = ServerConfig::stdio("fs", "npx", ["-y", "server-fs"]);
        assert_eq!(describe(&server), ("stdio", "npx -y server-fs".to_string()));
    }

    #[test]
    fn test_parse_json_arg() {
        assert_eq!(parse_json_arg(None).unwrap(), None);
        assert_eq!(
            parse_json_arg(Some(r#"{"a": 1}"#)).unwrap(),
            Some(serde_json::json!({"a": 1}))
        );
        assert!(parse_json_arg(Some("{broken")).is_err());
    }
}
