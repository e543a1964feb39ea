use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::StoreBackend;

/// Which idle mumbles are replayed to the oracle as conversation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MumbleContext {
    /// Every mumble, exactly as stored.
    All,
    /// Only the trailing run of mumbles, capped at `max_mumbles_in_context`.
    #[default]
    Recent,
    /// No mumbles at all.
    None,
}

impl MumbleContext {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Some(MumbleContext::All),
            "recent" => Some(MumbleContext::Recent),
            "none" | "off" => Some(MumbleContext::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PetConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub llm_temperature: f32,
    #[serde(default = "default_oracle_timeout_secs")]
    pub oracle_timeout_secs: u64,

    // Persona
    #[serde(default = "default_pet_name")]
    pub pet_name: String,
    #[serde(default = "default_owner_name")]
    pub owner_name: String,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default)]
    pub persona_prompt: Option<String>,

    // Conversation storage
    #[serde(default)]
    pub store_backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_true")]
    pub reset_on_start: bool,

    // Idle chatter
    #[serde(default = "default_true")]
    pub enable_idle_chatter: bool,
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,
    #[serde(default = "default_mumble_lines")]
    pub mumble_lines: Vec<String>,
    #[serde(default)]
    pub mumble_context: MumbleContext,
    #[serde(default = "default_max_mumbles_in_context")]
    pub max_mumbles_in_context: usize,

    // Interactions
    #[serde(default = "default_hug_delay_ms")]
    pub hug_delay_ms: u64,
    #[serde(default)]
    pub hug_message: Option<String>,
    #[serde(default)]
    pub interaction_cooldown_ms: u64,

    // Transport
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_oracle_timeout_secs() -> u64 {
    30
}

fn default_pet_name() -> String {
    "Bobo".to_string()
}

fn default_owner_name() -> String {
    "ZZ".to_string()
}

fn default_greeting() -> String {
    "Hi, I'm BoBo. Nice to meet you.".to_string()
}

fn default_store_path() -> String {
    "conversation.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_idle_poll_interval_ms() -> u64 {
    1000
}

fn default_idle_threshold_ms() -> u64 {
    5000
}

fn default_mumble_lines() -> Vec<String> {
    [
        "Bobo is hungry.",
        "Bobo is lonely.",
        "Bobo has a secret to tell.",
        "It is quiet.",
        "Do you want to play?",
        "Bobo likes you.",
    ]
    .iter()
    .map(|line| line.to_string())
    .collect()
}

fn default_max_mumbles_in_context() -> usize {
    2
}

fn default_hug_delay_ms() -> u64 {
    5000
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for PetConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_temperature: default_temperature(),
            oracle_timeout_secs: default_oracle_timeout_secs(),
            pet_name: default_pet_name(),
            owner_name: default_owner_name(),
            greeting: default_greeting(),
            persona_prompt: None,
            store_backend: StoreBackend::default(),
            store_path: default_store_path(),
            reset_on_start: true,
            enable_idle_chatter: true,
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
            idle_threshold_ms: default_idle_threshold_ms(),
            mumble_lines: default_mumble_lines(),
            mumble_context: MumbleContext::default(),
            max_mumbles_in_context: default_max_mumbles_in_context(),
            hug_delay_ms: default_hug_delay_ms(),
            hug_message: None,
            interaction_cooldown_ms: 0,
            bind_addr: default_bind_addr(),
        }
    }
}

impl PetConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `BOBO_CONFIG` if set, otherwise bobo_config.toml next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("BOBO_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join("bobo_config.toml"),
        }
    }

    /// Load config from file, then apply env var overrides on top.
    pub fn load() -> Self {
        let path = Self::config_path();

        let base = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<PetConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        base.with_env_overrides()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY").or_else(|_| env::var("OPENAI_API_KEY")) {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }

        if let Ok(backend) = env::var("BOBO_STORE") {
            match StoreBackend::parse(&backend) {
                Some(parsed) => self.store_backend = parsed,
                None => tracing::warn!("Ignoring unknown BOBO_STORE '{}'", backend),
            }
        }

        if let Ok(path) = env::var("BOBO_STORE_PATH") {
            if !path.trim().is_empty() {
                self.store_path = path;
            }
        }

        if let Ok(ms) = env::var("BOBO_IDLE_THRESHOLD_MS") {
            if let Ok(ms) = ms.parse() {
                self.idle_threshold_ms = ms;
            }
        }

        if let Ok(ms) = env::var("BOBO_HUG_DELAY_MS") {
            if let Ok(ms) = ms.parse() {
                self.hug_delay_ms = ms;
            }
        }

        if let Ok(enabled) = env::var("BOBO_ENABLE_IDLE_CHATTER") {
            self.enable_idle_chatter = parse_flag(&enabled);
        }

        if let Ok(enabled) = env::var("BOBO_RESET_ON_START") {
            self.reset_on_start = parse_flag(&enabled);
        }

        if let Ok(mode) = env::var("BOBO_MUMBLE_CONTEXT") {
            if let Some(parsed) = MumbleContext::parse(&mode) {
                self.mumble_context = parsed;
            }
        }

        if let Ok(bind) = env::var("BOBO_BACKEND_BIND") {
            if !bind.trim().is_empty() {
                self.bind_addr = bind;
            }
        }

        self
    }

    /// The synthetic owner utterance a hug turns into.
    pub fn hug_utterance(&self) -> String {
        self.hug_message
            .clone()
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| format!("{} hugs {}.", self.owner_name, self.pet_name))
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms.max(1))
    }

    pub fn hug_delay(&self) -> Duration {
        Duration::from_millis(self.hug_delay_ms)
    }

    pub fn interaction_cooldown(&self) -> Duration {
        Duration::from_millis(self.interaction_cooldown_ms)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs.max(1))
    }
}

fn parse_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}
