use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::sanitize::Sanitizer;
use crate::schema::CollectionSchema;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Full connection string; set from `DATABASE_URL` and preferred over `path`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/askdata.sqlite")
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_collection")]
    pub name: String,
    /// Spellings the model uses for the collection; each is replaced by the
    /// placeholder before the query is parsed.
    #[serde(default = "default_aliases")]
    pub aliases: Vec<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            name: default_collection(),
            aliases: default_aliases(),
        }
    }
}

fn default_database() -> String {
    "financials".to_string()
}
fn default_collection() -> String {
    "_test".to_string()
}
fn default_aliases() -> Vec<String> {
    vec![
        "db._test".to_string(),
        "db.financials".to_string(),
        "collection".to_string(),
    ]
}

impl CollectionConfig {
    pub fn schema(&self) -> CollectionSchema {
        CollectionSchema::financials(&self.database, &self.name)
    }

    /// A sanitizer for the configured aliases plus `db.<name>` and
    /// `db.<database>`, the spellings the query prompt invites.
    pub fn sanitizer(&self) -> Sanitizer {
        let named = [format!("db.{}", self.name), format!("db.{}", self.database)];
        Sanitizer::new(self.aliases.iter().cloned().chain(named))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Default credential; set from `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Set from `OPENAI_ORGANIZATION`.
    #[serde(default)]
    pub organization: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host(),
            default_model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
            api_key: None,
            organization: None,
        }
    }
}

fn default_api_host() -> String {
    "https://api.openai.com".to_string()
}
fn default_model() -> String {
    "gpt-4".to_string()
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_temperature() -> f32 {
    1.0
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_exec_timeout_secs")]
    pub timeout_secs: u64,
    /// Most rows a query may return.
    #[serde(default = "default_max_documents")]
    pub max_documents: usize,
    /// Most rows a query may read from the store before grouping or sorting.
    #[serde(default = "default_max_scanned_documents")]
    pub max_scanned_documents: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_exec_timeout_secs(),
            max_documents: default_max_documents(),
            max_scanned_documents: default_max_scanned_documents(),
        }
    }
}

fn default_exec_timeout_secs() -> u64 {
    30
}
fn default_max_documents() -> usize {
    10_000
}
fn default_max_scanned_documents() -> usize {
    1_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// When false, callers only see coarse error messages.
    #[serde(default)]
    pub expose_error_detail: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            expose_error_detail: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// Accepted bearer tokens. An empty list disables the gate.
    #[serde(default)]
    pub tokens: Vec<String>,
}

impl AuthConfig {
    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }
}

impl Config {
    /// Applies environment overrides using the given lookup.
    ///
    /// Recognized: `OPENAI_API_KEY`, `OPENAI_ORGANIZATION`, `OPENAI_API_HOST`,
    /// `DATABASE_URL`. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(key) = get("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(org) = get("OPENAI_ORGANIZATION") {
            self.llm.organization = Some(org);
        }
        if let Some(host) = get("OPENAI_API_HOST") {
            self.llm.api_host = host;
        }
        if let Some(url) = get("DATABASE_URL") {
            self.db.url = Some(url);
        }
    }

    /// Connection string for the document store.
    pub fn database_url(&self) -> String {
        self.db
            .url
            .clone()
            .unwrap_or_else(|| format!("sqlite:{}", self.db.path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.llm.max_tokens == 0 {
            anyhow::bail!("llm.max_tokens must be > 0");
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
        }
        if self.execution.max_documents == 0 {
            anyhow::bail!("execution.max_documents must be > 0");
        }
        if self.execution.max_scanned_documents < self.execution.max_documents {
            anyhow::bail!("execution.max_scanned_documents must be >= execution.max_documents");
        }
        if self.execution.timeout_secs == 0 {
            anyhow::bail!("execution.timeout_secs must be > 0");
        }
        if self.collection.name.is_empty() {
            anyhow::bail!("collection.name must not be empty");
        }
        if self.collection.aliases.iter().any(|a| a.trim().is_empty()) {
            anyhow::bail!("collection.aliases must not contain empty entries");
        }
        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Reads, parses and validates the config file, then applies the process
/// environment.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.collection.name, "_test");
        assert_eq!(config.collection.aliases.len(), 3);
        assert_eq!(config.llm.max_tokens, 1000);
        assert!((config.llm.temperature - 1.0).abs() < f32::EPSILON);
        assert!(!config.server.expose_error_detail);
        assert!(!config.auth.is_enabled());
        assert_eq!(config.database_url(), "sqlite:./data/askdata.sqlite");
    }

    #[test]
    fn test_collection_name_is_always_sanitized() {
        let config = parse_config(
            "[collection]\nname = \"sales\"\naliases = [\"collection\"]\n",
        )
        .unwrap();
        let sanitizer = config.collection.sanitizer();
        assert_eq!(
            sanitizer.sanitize("```db.sales.find({})```").unwrap(),
            "__COLLECTION__.find({})"
        );
        assert_eq!(
            sanitizer.sanitize("```db.financials.countDocuments()```").unwrap(),
            "__COLLECTION__.countDocuments()"
        );
        assert_eq!(
            sanitizer.sanitize("```collection.find({})```").unwrap(),
            "__COLLECTION__.find({})"
        );
    }

    #[test]
    fn test_partial_sections() {
        let config = parse_config(
            r#"
[llm]
temperature = 0.2

[server]
bind = "0.0.0.0:8080"
expose_error_detail = true

[auth]
tokens = ["s3cret"]
"#,
        )
        .unwrap();
        assert!((config.llm.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.llm.max_tokens, 1000);
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert!(config.server.expose_error_detail);
        assert!(config.auth.is_enabled());
    }

    #[test]
    fn test_invalid_temperature() {
        let err = parse_config("[llm]\ntemperature = 3.5\n").unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn test_zero_max_documents() {
        assert!(parse_config("[execution]\nmax_documents = 0\n").is_err());
        assert!(parse_config(
            "[execution]\nmax_documents = 10\nmax_scanned_documents = 5\n"
        )
        .is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_ORGANIZATION", "org-1"),
            ("OPENAI_API_HOST", "http://localhost:9999"),
            ("DATABASE_URL", "sqlite::memory:"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.llm.organization.as_deref(), Some("org-1"));
        assert_eq!(config.llm.api_host, "http://localhost:9999");
        assert_eq!(config.database_url(), "sqlite::memory:");
    }

    #[test]
    fn test_empty_env_values_ignored() {
        let mut config = Config::default();
        config.apply_env(|_| Some(String::new()));
        assert!(config.llm.api_key.is_none());
        assert_eq!(config.llm.api_host, "https://api.openai.com");
    }
}
