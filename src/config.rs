//! Configuration for selfpatch
//!
//! Read from TOML (`--config`, `$SELFPATCH_CONFIG`, or
//! `~/.config/selfpatch/config.toml`). Every field has a default that
//! matches a conventional Go layout, so a missing file is a valid setup.

use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "SELFPATCH_CONFIG";
pub const REPO_ROOT_ENV: &str = "SELFPATCH_REPO_ROOT";
const API_KEY_ENVS: [&str; 2] = ["SELFPATCH_API_KEY", "OPENROUTER_API_KEY"];

const KEYRING_SERVICE: &str = "selfpatch";
const KEYRING_USERNAME: &str = "api_key";

const DEFAULT_STATE_DIR: &str = ".selfpatch";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub policy: PolicyConfig,
    pub tools: ToolsConfig,
    pub llm: LlmConfig,
    pub state: StateConfig,
}

/// Which paths a drafted diff may touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Top-level directories a patch may touch. Anything else is rejected.
    pub allowed_roots: Vec<String>,
    /// Dependency manifests, matched by file name at any depth.
    pub manifest_files: Vec<String>,
    /// Refuse to validate against an empty index instead of warning.
    pub require_index: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_roots: vec!["cmd".to_string(), "internal".to_string()],
            manifest_files: vec!["go.mod".to_string(), "go.sum".to_string()],
            require_index: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub git: String,
    /// Program followed by its arguments; exit status decides pass/fail.
    pub test_command: Vec<String>,
    pub git_timeout_secs: u64,
    pub test_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            test_command: vec!["go".to_string(), "test".to_string(), "./...".to_string()],
            git_timeout_secs: 60,
            test_timeout_secs: 900,
        }
    }
}

impl ToolsConfig {
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn test_program(&self) -> &str {
        self.test_command.first().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn test_args(&self) -> &[String] {
        self.test_command.get(1..).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// Index context handed to the drafting call.
    pub context_files: usize,
    pub context_budget_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            model: "anthropic/claude-sonnet-4.5".to_string(),
            max_tokens: 16_384,
            request_timeout_secs: 120,
            context_files: 8,
            context_budget_chars: 6_000,
        }
    }
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Relative paths resolve against the repository root.
    pub dir: Option<PathBuf>,
    pub lock_wait_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: None,
            lock_wait_secs: 5,
        }
    }
}

impl StateConfig {
    pub fn resolve_dir(&self, repo_root: &Path) -> PathBuf {
        match &self.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => repo_root.join(dir),
            None => repo_root.join(DEFAULT_STATE_DIR),
        }
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }
}

impl Config {
    fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("selfpatch").join("config.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist and parse. A corrupt file in the default
    /// location is moved aside and defaults are used.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV).map(PathBuf::from) {
            return Self::load_from(&path);
        }

        let Some(path) = Self::default_path() else {
            return Ok(Self::default());
        };
        let Ok(content) = fs::read_to_string(&path) else {
            return Ok(Self::default());
        };
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                preserve_corrupt_config(&path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.policy.allowed_roots.is_empty() {
            anyhow::bail!("policy.allowed_roots must name at least one directory");
        }
        for root in &self.policy.allowed_roots {
            let bad = root.is_empty()
                || root == "."
                || root == ".."
                || root.contains('/')
                || root.contains('\\');
            if bad {
                anyhow::bail!(
                    "policy.allowed_roots entry {:?} must be a single top-level directory name",
                    root
                );
            }
        }
        if self.policy.manifest_files.iter().any(|m| m.trim().is_empty()) {
            anyhow::bail!("policy.manifest_files must not contain empty names");
        }
        if self.tools.git.trim().is_empty() {
            anyhow::bail!("tools.git must not be empty");
        }
        if self.tools.test_program().trim().is_empty() {
            anyhow::bail!("tools.test_command must name a program");
        }
        if self.tools.git_timeout_secs == 0 || self.tools.test_timeout_secs == 0 {
            anyhow::bail!("tool timeouts must be greater than zero");
        }
        if self.llm.request_timeout_secs == 0 {
            anyhow::bail!("llm.request_timeout_secs must be greater than zero");
        }
        let url = url::Url::parse(&self.llm.api_url)
            .map_err(|e| anyhow::anyhow!("llm.api_url is not a valid URL: {}", e))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("llm.api_url must use http or https");
        }
        if self.llm.model.trim().is_empty() {
            anyhow::bail!("llm.model must not be empty");
        }
        Ok(())
    }

    pub fn config_location() -> String {
        Self::default_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(no config directory)".to_string())
    }
}

/// `$SELFPATCH_REPO_ROOT`, when set and non-empty.
pub fn repo_root_override() -> Option<PathBuf> {
    std::env::var_os(REPO_ROOT_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    let entry = keyring_entry()?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

fn env_api_key(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    API_KEY_ENVS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
}

/// API key for the drafting backend: environment first, then the keychain.
pub fn api_key() -> Option<String> {
    if let Some(key) = env_api_key(|name| std::env::var(name).ok()) {
        return Some(key);
    }
    match read_keyring_key() {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!(error = %err, "failed to read API key from system keychain");
            None
        }
    }
}

/// Store the API key in the system keychain and read it back to confirm.
pub fn store_api_key(key: &str) -> anyhow::Result<()> {
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("API key is empty");
    }
    keyring_entry()
        .and_then(|entry| entry.set_password(key))
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to store API key in system keychain: {}. Set {} instead.",
                e,
                API_KEY_ENVS[0]
            )
        })?;

    match read_keyring_key() {
        Ok(Some(stored)) if stored == key => Ok(()),
        Ok(_) => anyhow::bail!("API key verification failed: keychain did not return the stored key"),
        Err(e) => anyhow::bail!("API key verification failed: {}", e),
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
