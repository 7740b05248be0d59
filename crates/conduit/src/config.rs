//! Configuration loading.
//!
//! Lookup order (first match wins):
//! 1. `--config <path>` or `CONDUIT_CONFIG`
//! 2. Project config: `conduit.jsonc` or `conduit.json` in the working directory
//! 3. Global config: the same names in the platform config directory
//!
//! Supports JSONC (JSON with comments) and `{env:VAR_NAME}` substitution.

use anyhow::{anyhow, bail, Context};
use conduit_mcp::{ManagerSettings, ServerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "CONDUIT_CONFIG";

const FILE_NAMES: &[&str] = &["conduit.jsonc", "conduit.json"];

/// Contents of `conduit.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Servers keyed by id.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,

    #[serde(default)]
    pub settings: ManagerSettings,
}

impl Config {
    /// Find and load the config file. A missing file yields an empty config.
    pub async fn load(
        explicit: Option<&Path>,
        cwd: &Path,
    ) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        if let Some(path) = explicit {
            let config = Self::load_file(&path).await?;
            return Ok((config, Some(path)));
        }

        let mut dirs = vec![cwd.to_path_buf()];
        dirs.extend(conduit_util::paths::config_dir());
        for dir in dirs {
            for name in FILE_NAMES {
                let path = dir.join(name);
                if path.exists() {
                    let config = Self::load_file(&path).await?;
                    return Ok((config, Some(path)));
                }
            }
        }

        tracing::debug!("No config file found");
        Ok((Self::default(), None))
    }

    pub async fn load_file(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse JSONC content, filling each server's id from its key.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let content = substitute_env(&strip_comments(content))?;
        let mut config: Config = serde_json::from_str(&content)?;
        for (id, server) in config.servers.iter_mut() {
            server.id = id.clone();
        }
        Ok(config)
    }

    pub fn server(&self, id: &str) -> anyhow::Result<&ServerConfig> {
        self.servers
            .get(id)
            .ok_or_else(|| anyhow!("Server '{id}' is not configured"))
    }
}

/// Strip `//` and `/* */` comments outside of strings.
fn strip_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            result.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                result.push(c);
            }
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    // Keep line numbers stable for parse errors.
                    if c == '\n' {
                        result.push('\n');
                    }
                    prev = c;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

/// Replace `{env:NAME}` with the value of `NAME`.
fn substitute_env(input: &str) -> anyhow::Result<String> {
    const OPEN: &str = "{env:";

    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        result.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find('}') else {
            bail!("Unterminated {OPEN} reference");
        };
        let name = &after[..end];
        let value = std::env::var(name)
            .with_context(|| format!("Environment variable '{name}' is not set"))?;
        // The value lands inside a JSON string.
        let escaped = serde_json::to_string(&value)?;
        result.push_str(&escaped[1..escaped.len() - 1]);
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_mcp::TransportConfig;

    #[test]
    fn test_parse_jsonc() {
        let input = r#"{
            // Local filesystem server
            "servers": {
                "fs": {"type": "stdio", "command": "npx", "args": ["-y", "server-fs"]},
                /* remote */
                "remote": {"type": "http", "url": "https://example.com/mcp"}
            },
            "settings": {"spawnGraceMs": 500}
        }"#;
        let config = Config::parse(input).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.server("fs").unwrap().id, "fs");
        assert!(matches!(
            config.server("remote").unwrap().transport,
            TransportConfig::Http { .. }
        ));
        assert_eq!(config.settings.spawn_grace_ms, 500);
        assert_eq!(config.settings.stdio_timeout_secs, 30);
        assert!(config.server("missing").is_err());
    }

    #[test]
    fn test_comment_markers_inside_strings_survive() {
        let input = r#"{"url": "https://example.com/a//b", "note": "/* not a comment */"}"#;
        assert_eq!(strip_comments(input), input);
    }

    #[test]
    fn test_escaped_quote_in_string() {
        let input = "{\"a\": \"say \\\"hi\\\" // still string\"} // gone";
        assert_eq!(
            strip_comments(input),
            "{\"a\": \"say \\\"hi\\\" // still string\"} "
        );
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("CONDUIT_TEST_TOKEN", "se\"cret");
        let out = substitute_env(r#"{"token": "{env:CONDUIT_TEST_TOKEN}"}"#).unwrap();
        assert_eq!(out, r#"{"token": "se\"cret"}"#);
        assert!(substitute_env("{env:CONDUIT_TEST_UNSET_VARIABLE}").is_err());
        assert!(substitute_env("{env:OPEN").is_err());
    }

    #[tokio::test]
    async fn test_load_prefers_project_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("conduit.json"),
            r#"{"servers": {"a": {"type": "stdio", "command": "echo"}}}"#,
        )
        .await
        .unwrap();

        let (config, source) = Config::load(None, dir.path()).await.unwrap();
        assert_eq!(source, Some(dir.path().join("conduit.json")));
        assert!(config.servers.contains_key("a"));
    }

    #[tokio::test]
    async fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(Config::load(Some(missing.as_path()), dir.path()).await.is_err());
    }
}
