use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths::Paths;

/// A list of strings that also accepts a bare string in config files.
///
/// `"allowFrom": "42"` and `"allowFrom": ["42"]` parse to the same value. An
/// empty string parses to an empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FlexibleStringList(pub Vec<String>);

impl FlexibleStringList {
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.0.iter().any(|v| v == value)
    }

    pub fn push(&mut self, value: String) {
        if !self.contains(&value) {
            self.0.push(value);
        }
    }

    pub fn remove(&mut self, value: &str) {
        self.0.retain(|v| v != value);
    }
}

impl From<Vec<String>> for FlexibleStringList {
    fn from(v: Vec<String>) -> Self {
        Self(v)
    }
}

impl<'de> Deserialize<'de> for FlexibleStringList {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
            Null(()),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(s) if s.trim().is_empty() => Self(Vec::new()),
            Raw::One(s) => Self(vec![s.trim().to_string()]),
            Raw::Many(v) => Self(v),
            Raw::Null(()) => Self(Vec::new()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default, alias = "api_key")]
    pub api_key: String,
    #[serde(default, alias = "api_base")]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    /// Explicit provider name. When unset it is inferred from the model
    /// prefix (`openai/gpt-4o` -> `openai`).
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_max_tokens", alias = "max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tool_iterations", alias = "max_tool_iterations")]
    pub max_tool_iterations: u32,
    #[serde(default = "default_max_context_tokens", alias = "max_context_tokens")]
    pub max_context_tokens: u32,
    /// Extra markdown files appended to the persona block, relative to the
    /// workspace unless absolute.
    #[serde(default, alias = "system_prompt_paths")]
    pub system_prompt_paths: FlexibleStringList,
    #[serde(default = "default_llm_max_retries", alias = "llm_max_retries")]
    pub llm_max_retries: u32,
    #[serde(default = "default_llm_retry_delay_ms", alias = "llm_retry_delay_ms")]
    pub llm_retry_delay_ms: u64,
    #[serde(default = "default_llm_timeout_secs", alias = "llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_session_idle_secs", alias = "session_idle_secs")]
    pub session_idle_secs: u64,
    #[serde(default = "default_max_concurrent_turns", alias = "max_concurrent_turns")]
    pub max_concurrent_turns: usize,
}

fn default_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tool_iterations() -> u32 {
    8
}

fn default_max_context_tokens() -> u32 {
    32000
}

fn default_llm_max_retries() -> u32 {
    3
}

fn default_llm_retry_delay_ms() -> u64 {
    2000
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_session_idle_secs() -> u64 {
    3600
}

fn default_max_concurrent_turns() -> usize {
    16
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            provider: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_tool_iterations: default_max_tool_iterations(),
            max_context_tokens: default_max_context_tokens(),
            system_prompt_paths: FlexibleStringList::default(),
            llm_max_retries: default_llm_max_retries(),
            llm_retry_delay_ms: default_llm_retry_delay_ms(),
            llm_timeout_secs: default_llm_timeout_secs(),
            session_idle_secs: default_session_idle_secs(),
            max_concurrent_turns: default_max_concurrent_turns(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default, alias = "allow_from")]
    pub allow_from: FlexibleStringList,
    #[serde(default = "default_telegram_api_base", alias = "api_base")]
    pub api_base: String,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            allow_from: FlexibleStringList::default(),
            api_base: default_telegram_api_base(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "botToken", alias = "bot_token")]
    pub token: String,
    #[serde(default, alias = "allow_from")]
    pub allow_from: FlexibleStringList,
    #[serde(default = "default_discord_api_base", alias = "api_base")]
    pub api_base: String,
}

fn default_discord_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            allow_from: FlexibleStringList::default(),
            api_base: default_discord_api_base(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub enabled: bool,
    /// WebSocket endpoint of the WhatsApp bridge process.
    #[serde(default = "default_whatsapp_bridge_url", alias = "bridge_url")]
    pub bridge_url: String,
    #[serde(default, alias = "allow_from")]
    pub allow_from: FlexibleStringList,
}

fn default_whatsapp_bridge_url() -> String {
    "ws://localhost:3001".to_string()
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bridge_url: default_whatsapp_bridge_url(),
            allow_from: FlexibleStringList::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeishuConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "app_id")]
    pub app_id: String,
    #[serde(default, alias = "app_secret")]
    pub app_secret: String,
    #[serde(default, alias = "encrypt_key")]
    pub encrypt_key: String,
    #[serde(default, alias = "verification_token")]
    pub verification_token: String,
    #[serde(default = "default_listen_host", alias = "listen_host")]
    pub listen_host: String,
    #[serde(default = "default_feishu_port", alias = "listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_feishu_api_base", alias = "api_base")]
    pub api_base: String,
    #[serde(default, alias = "allow_from")]
    pub allow_from: FlexibleStringList,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_feishu_port() -> u16 {
    18791
}

fn default_feishu_api_base() -> String {
    "https://open.feishu.cn/open-apis".to_string()
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            app_id: String::new(),
            app_secret: String::new(),
            encrypt_key: String::new(),
            verification_token: String::new(),
            listen_host: default_listen_host(),
            listen_port: default_feishu_port(),
            api_base: default_feishu_api_base(),
            allow_from: FlexibleStringList::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "bot_token")]
    pub bot_token: String,
    #[serde(default, alias = "verification_token")]
    pub verification_token: String,
    #[serde(default = "default_listen_host", alias = "listen_host")]
    pub listen_host: String,
    #[serde(default = "default_slack_port", alias = "listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_slack_api_base", alias = "api_base")]
    pub api_base: String,
    #[serde(default, alias = "allow_from")]
    pub allow_from: FlexibleStringList,
}

fn default_slack_port() -> u16 {
    18792
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            verification_token: String::new(),
            listen_host: default_listen_host(),
            listen_port: default_slack_port(),
            api_base: default_slack_api_base(),
            allow_from: FlexibleStringList::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub feishu: FeishuConfig,
    #[serde(default)]
    pub slack: SlackConfig,
}

impl ChannelsConfig {
    pub const NAMES: [&'static str; 5] = ["telegram", "discord", "whatsapp", "feishu", "slack"];

    pub fn is_enabled(&self, channel: &str) -> Option<bool> {
        match channel {
            "telegram" => Some(self.telegram.enabled),
            "discord" => Some(self.discord.enabled),
            "whatsapp" => Some(self.whatsapp.enabled),
            "feishu" => Some(self.feishu.enabled),
            "slack" => Some(self.slack.enabled),
            _ => None,
        }
    }

    /// Returns false for an unknown channel name.
    pub fn set_enabled(&mut self, channel: &str, enabled: bool) -> bool {
        match channel {
            "telegram" => self.telegram.enabled = enabled,
            "discord" => self.discord.enabled = enabled,
            "whatsapp" => self.whatsapp.enabled = enabled,
            "feishu" => self.feishu.enabled = enabled,
            "slack" => self.slack.enabled = enabled,
            _ => return false,
        }
        true
    }

    pub fn allow_from(&self, channel: &str) -> Option<&FlexibleStringList> {
        match channel {
            "telegram" => Some(&self.telegram.allow_from),
            "discord" => Some(&self.discord.allow_from),
            "whatsapp" => Some(&self.whatsapp.allow_from),
            "feishu" => Some(&self.feishu.allow_from),
            "slack" => Some(&self.slack.allow_from),
            _ => None,
        }
    }

    pub fn allow_from_mut(&mut self, channel: &str) -> Option<&mut FlexibleStringList> {
        match channel {
            "telegram" => Some(&mut self.telegram.allow_from),
            "discord" => Some(&mut self.discord.allow_from),
            "whatsapp" => Some(&mut self.whatsapp.allow_from),
            "feishu" => Some(&mut self.feishu.allow_from),
            "slack" => Some(&mut self.slack.allow_from),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Bearer token required on `/api/*` when set.
    #[serde(default, alias = "api_token")]
    pub api_token: Option<String>,
    #[serde(default = "default_log_buffer_size", alias = "log_buffer_size")]
    pub log_buffer_size: usize,
    #[serde(default = "default_shutdown_grace_secs", alias = "shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_inbound_buffer", alias = "inbound_buffer")]
    pub inbound_buffer: usize,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18790
}

fn default_log_buffer_size() -> usize {
    100
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_inbound_buffer() -> usize {
    256
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            api_token: None,
            log_buffer_size: default_log_buffer_size(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Directory holding device stores, identities, skills and persona files.
    #[serde(default, alias = "workspace_path")]
    pub workspace_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                api_key: String::new(),
                api_base: Some("https://api.openai.com/v1".to_string()),
            },
        );
        providers.insert(
            "openrouter".to_string(),
            ProviderConfig {
                api_key: String::new(),
                api_base: Some("https://openrouter.ai/api/v1".to_string()),
            },
        );
        providers.insert(
            "ollama".to_string(),
            ProviderConfig {
                api_key: "ollama".to_string(),
                api_base: Some("http://localhost:11434/v1".to_string()),
            },
        );

        Self {
            providers,
            agents: AgentsConfig::default(),
            channels: ChannelsConfig::default(),
            gateway: GatewayConfig::default(),
            workspace_path: None,
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
        };
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Writes through a temp file and renames over the target so readers never
    /// observe a half-written config.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Checks that every enabled channel carries the credentials it needs.
    pub fn validate(&self) -> Result<()> {
        let ch = &self.channels;
        if ch.telegram.enabled && ch.telegram.token.trim().is_empty() {
            return Err(Error::Config("channels.telegram.token is required".into()));
        }
        if ch.discord.enabled && ch.discord.token.trim().is_empty() {
            return Err(Error::Config("channels.discord.token is required".into()));
        }
        if ch.whatsapp.enabled && ch.whatsapp.bridge_url.trim().is_empty() {
            return Err(Error::Config("channels.whatsapp.bridgeUrl is required".into()));
        }
        if ch.feishu.enabled
            && (ch.feishu.app_id.trim().is_empty() || ch.feishu.app_secret.trim().is_empty())
        {
            return Err(Error::Config(
                "channels.feishu.appId and appSecret are required".into(),
            ));
        }
        if ch.slack.enabled && ch.slack.bot_token.trim().is_empty() {
            return Err(Error::Config("channels.slack.botToken is required".into()));
        }
        if self.agents.defaults.max_tool_iterations == 0 {
            return Err(Error::Config(
                "agents.defaults.maxToolIterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolves the workspace directory, expanding a leading `~`.
    pub fn workspace_dir(&self, paths: &Paths) -> PathBuf {
        match self.workspace_path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => expand_home(p),
            _ => paths.workspace(),
        }
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}

fn expand_home(p: &str) -> PathBuf {
    if let Some(rest) = p.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allow_from_accepts_string_or_list() {
        let raw = r#"{
  "channels": {
    "telegram": { "enabled": true, "token": "t", "allowFrom": "42" },
    "discord": { "allowFrom": ["1", "2"] },
    "slack": { "allow_from": "" }
  }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.channels.telegram.allow_from.0, vec!["42".to_string()]);
        assert_eq!(cfg.channels.discord.allow_from.0.len(), 2);
        assert!(cfg.channels.slack.allow_from.is_empty());
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.agents.defaults.max_tool_iterations, 8);
        assert_eq!(cfg.gateway.log_buffer_size, 100);
        assert!(!cfg.channels.whatsapp.enabled);
        assert_eq!(cfg.channels.whatsapp.bridge_url, "ws://localhost:3001");
    }

    #[test]
    fn test_save_then_load_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = Config::default();
        cfg.channels.telegram.enabled = true;
        cfg.channels.telegram.token = "abc".into();
        cfg.channels.telegram.allow_from.push("42".into());
        cfg.workspace_path = Some("/tmp/ws".into());
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_save_then_load_yaml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let mut cfg = Config::default();
        cfg.agents.defaults.model = "openai/gpt-4o".into();
        cfg.channels.slack.enabled = true;
        cfg.channels.slack.bot_token = "xoxb".into();
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_validate_rejects_enabled_channel_without_token() {
        let mut cfg = Config::default();
        cfg.channels.discord.enabled = true;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        cfg.channels.discord.token = "x".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_malformed_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_channel_toggle_and_allow_list_edits() {
        let mut ch = ChannelsConfig::default();
        assert!(ch.set_enabled("feishu", true));
        assert_eq!(ch.is_enabled("feishu"), Some(true));
        assert!(!ch.set_enabled("irc", true));

        let list = ch.allow_from_mut("telegram").unwrap();
        list.push("7".into());
        list.push("7".into());
        assert_eq!(list.0, vec!["7".to_string()]);
        list.remove("7");
        assert!(list.is_empty());
    }
}
