use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use url::Url;

use crate::llm::GenerationParams;

const DEFAULT_START_MESSAGE: &str =
    "Welcome to the Dream Villa Bot! Send /villa to design your dream villa.";
const DEFAULT_HELP_MESSAGE: &str = "Dream Villa Bot commands:

/villa - Design your dream villa: pick a budget, location, style and camera angle
/cancel - Drop the questionnaire in progress
/info - Check whether the image service is available
/help - Show this help message";
const DEFAULT_INFO_MESSAGE: &str = "Dream Villa Bot";
const DEFAULT_WELCOME_MESSAGE: &str = "Welcome to the group!";

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub generation_api_url: String,
    pub generation_gen_path: String,
    pub generation_health_path: String,
    pub generation_timeout_seconds: u64,
    pub generation_resolution: String,
    pub perplexity_api_key: String,
    pub perplexity_base_url: String,
    pub perplexity_model: String,
    pub villa_catalog_path: String,
    pub session_idle_timeout_seconds: u64,
    pub session_sweep_interval_seconds: u64,
    pub start_message: String,
    pub help_message: String,
    pub info_message: String,
    pub welcome_message: String,
}

static CONFIG: OnceCell<Config> = OnceCell::new();

/// Loads the environment once; later calls return the same instance.
pub fn init_config() -> Result<&'static Config> {
    CONFIG.get_or_try_init(Config::load)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_message(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|value| value.replace("\\n", "\n"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(anyhow!("BOT_TOKEN is required"));
        }

        let generation_api_url = env_string("GENERATION_API_URL", "http://127.0.0.1:5000")
            .trim()
            .to_string();
        Url::parse(&generation_api_url)
            .with_context(|| format!("GENERATION_API_URL is not a valid URL: {generation_api_url}"))?;

        let generation_timeout_seconds = env_u64("GENERATION_TIMEOUT_SECONDS", 180);
        if generation_timeout_seconds == 0 {
            return Err(anyhow!("GENERATION_TIMEOUT_SECONDS must be positive"));
        }

        Ok(Config {
            bot_token,
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            generation_api_url,
            generation_gen_path: env_string("GENERATION_API_GEN_PATH", "/gen"),
            generation_health_path: env_string("GENERATION_API_HEALTH_PATH", "/prompts"),
            generation_timeout_seconds,
            generation_resolution: env_string("GENERATION_RESOLUTION", "").trim().to_string(),
            perplexity_api_key: env_string("PERPLEXITY_API_KEY", ""),
            perplexity_base_url: env_string("PERPLEXITY_BASE_URL", "https://api.perplexity.ai"),
            perplexity_model: env_string("PERPLEXITY_MODEL", "sonar"),
            villa_catalog_path: env_string("VILLA_CATALOG_PATH", "villa_catalog.json"),
            session_idle_timeout_seconds: env_u64("SESSION_IDLE_TIMEOUT_SECONDS", 1800),
            session_sweep_interval_seconds: env_u64("SESSION_SWEEP_INTERVAL_SECONDS", 60).max(1),
            start_message: env_message("START_MESSAGE", DEFAULT_START_MESSAGE),
            help_message: env_message("HELP_MESSAGE", DEFAULT_HELP_MESSAGE),
            info_message: env_message("INFO_MESSAGE", DEFAULT_INFO_MESSAGE),
            welcome_message: env_message("WELCOME_MESSAGE", DEFAULT_WELCOME_MESSAGE),
        })
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_seconds)
    }

    /// `None` disables idle expiry.
    pub fn session_idle_timeout(&self) -> Option<Duration> {
        match self.session_idle_timeout_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        }
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_seconds)
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            resolution: Some(self.generation_resolution.clone())
                .filter(|resolution| !resolution.is_empty()),
        }
    }
}

#[cfg(test)]
impl Config {
    pub(crate) fn for_tests() -> Self {
        Config {
            bot_token: "token".to_string(),
            log_level: "info".to_string(),
            generation_api_url: "http://127.0.0.1:5000".to_string(),
            generation_gen_path: "/gen".to_string(),
            generation_health_path: "/prompts".to_string(),
            generation_timeout_seconds: 180,
            generation_resolution: String::new(),
            perplexity_api_key: String::new(),
            perplexity_base_url: "https://api.perplexity.ai".to_string(),
            perplexity_model: "sonar".to_string(),
            villa_catalog_path: "villa_catalog.json".to_string(),
            session_idle_timeout_seconds: 1800,
            session_sweep_interval_seconds: 60,
            start_message: DEFAULT_START_MESSAGE.to_string(),
            help_message: DEFAULT_HELP_MESSAGE.to_string(),
            info_message: DEFAULT_INFO_MESSAGE.to_string(),
            welcome_message: DEFAULT_WELCOME_MESSAGE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_idle_timeout_disables_expiry() {
        let mut config = Config::for_tests();
        assert_eq!(
            config.session_idle_timeout(),
            Some(Duration::from_secs(1800))
        );
        config.session_idle_timeout_seconds = 0;
        assert_eq!(config.session_idle_timeout(), None);
    }

    #[test]
    fn empty_resolution_is_not_sent() {
        let mut config = Config::for_tests();
        assert_eq!(config.generation_params().resolution, None);
        config.generation_resolution = "1024x768".to_string();
        assert_eq!(
            config.generation_params().resolution.as_deref(),
            Some("1024x768")
        );
    }

    #[test]
    fn help_message_lists_every_command() {
        for command in ["/villa", "/cancel", "/info", "/help"] {
            assert!(DEFAULT_HELP_MESSAGE.contains(command));
        }
    }
}
