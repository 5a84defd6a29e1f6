//! Application configuration.
//!
//! Everything the orchestrator and trigger layer need is carried in one
//! explicit `AppConfig` struct, constructed once at startup and passed down.
//! Steps never read configuration (or secrets) ambiently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub github: GithubConfig,
    pub sandbox: SandboxConfig,
    pub billing: BillingConfig,
    pub webhook: WebhookConfig,
    pub sweep: SweepConfig,
    pub fixer: FixerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            github: GithubConfig::default(),
            sandbox: SandboxConfig::default(),
            billing: BillingConfig::default(),
            webhook: WebhookConfig::default(),
            sweep: SweepConfig::default(),
            fixer: FixerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8720,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".codemend/codemend.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub api_base: String,
    /// Base URL for human-facing links (pull request pages). Differs from
    /// `api_base` on GitHub Enterprise deployments.
    pub web_base: String,
    /// App-level credential used to mint installation access tokens.
    pub app_token: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            web_base: "https://github.com".to_string(),
            app_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub base_url: String,
    pub api_token: String,
    /// Initial lifetime of a leased environment, in seconds.
    pub timeout_secs: u64,
    /// Extra time granted before the AI fixer runs.
    pub ai_extend_secs: u64,
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            api_token: String::new(),
            timeout_secs: 600,
            ai_extend_secs: 600,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub base_url: String,
    pub api_token: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8091".to_string(),
            api_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub secret: String,
    /// Exact comment text (after trim + lowercase) that triggers a review run.
    pub mention_command: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            mention_command: "@codemend review".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Interval between scheduled sweep passes. 0 disables the scheduler.
    pub interval_secs: u64,
    /// Prefix for branches created by sweep runs.
    pub branch_prefix: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            branch_prefix: "codemend/fix".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FixerConfig {
    /// Issue-count cap passed to the bounded AI fixer.
    pub ai_max_issues: u32,
    /// Turn budget passed to the bounded AI fixer.
    pub ai_max_turns: u32,
    pub git_user_name: String,
    pub git_user_email: String,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            ai_max_issues: 5,
            ai_max_turns: 20,
            git_user_name: "codemend[bot]".to_string(),
            git_user_email: "bot@codemend.dev".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file. Returns defaults if the file
    /// doesn't exist; any field may be omitted.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        // Matching is done against the normalized form; normalize once here.
        config.webhook.mention_command = config
            .webhook
            .mention_command
            .trim()
            .to_lowercase();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8720);
        assert_eq!(config.github.web_base, "https://github.com");
        assert_eq!(config.webhook.mention_command, "@codemend review");
        assert_eq!(config.sandbox.timeout_secs, 600);
        assert_eq!(config.fixer.ai_max_issues, 5);
        assert_eq!(config.sweep.interval_secs, 3600);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("codemend.toml")).unwrap();
        assert_eq!(config.server.port, 8720);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codemend.toml");
        fs::write(
            &path,
            r#"
[server]
port = 9000

[webhook]
secret = "s3cret"
mention_command = "  @Codemend Review  "

[sandbox]
timeout_secs = 1200
"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1"); // default
        assert_eq!(config.webhook.secret, "s3cret");
        // Normalized at load time
        assert_eq!(config.webhook.mention_command, "@codemend review");
        assert_eq!(config.sandbox.timeout_secs, 1200);
        assert_eq!(config.sandbox.ai_extend_secs, 600); // default
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codemend.toml");
        fs::write(&path, "not valid toml {{{{").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
