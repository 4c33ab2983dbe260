use std::time::Duration;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::llm::media::truncate_for_log;
use crate::utils::http::get_http_client;
use crate::utils::timing::log_service_timing;

pub const DEFAULT_TITLE: &str = "your dream villa";
const ENHANCE_TIMEOUT: Duration = Duration::from_secs(60);

static PROMPT_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<stable_diffusion_prompt>(.*?)</stable_diffusion_prompt>")
        .expect("prompt tag pattern")
});
static TITLE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<title>(.*?)</title>").expect("title tag pattern"));

const SYSTEM_PROMPT: &str = "You are an artificial intelligence assistant and you need to engage in a helpful, detailed, polite conversation with a user.";

const INSTRUCTION_TEMPLATE: &str = r#"You turn short villa briefs into Stable Diffusion prompts for an architecture studio. The images are shown to customers and architects, so favour light, airy structures.

<text_input>{prompt}</text_input>

1. Read the brief: pick out the key elements, the mood and the setting.
2. Write a Stable Diffusion prompt with specific, descriptive language for style, mood, lighting and composition.
3. Keep it clear, concise and in Stable Diffusion friendly terms.
4. Give the work a 5-10 word title describing what the image shows. It is used as the photo caption; a little humour is welcome.

Answer in exactly this format:
<result><analysis>[your analysis]</analysis><stable_diffusion_prompt>[the prompt]</stable_diffusion_prompt><title>[the title]</title></result>"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedPrompt {
    pub prompt: String,
    pub title: String,
}

impl EnhancedPrompt {
    pub fn unchanged(prompt: &str) -> Self {
        EnhancedPrompt {
            prompt: prompt.to_string(),
            title: DEFAULT_TITLE.to_string(),
        }
    }
}

/// Optional rewrite of the composed prompt through an OpenAI-compatible
/// chat completion endpoint (Perplexity by default).
pub struct PromptEnhancer {
    api_key: String,
    base_url: String,
    model: String,
}

impl PromptEnhancer {
    pub fn from_config(config: &Config) -> Option<Self> {
        if config.perplexity_api_key.trim().is_empty() {
            return None;
        }
        Some(PromptEnhancer {
            api_key: config.perplexity_api_key.clone(),
            base_url: config.perplexity_base_url.clone(),
            model: config.perplexity_model.clone(),
        })
    }

    /// Never fails: any error falls back to the original prompt.
    pub async fn enhance(&self, prompt: &str) -> EnhancedPrompt {
        match self.request_completion(prompt).await {
            Ok(content) => parse_enhancement(&content, prompt),
            Err(err) => {
                warn!("Error generating enhanced prompt: {}", err);
                EnhancedPrompt::unchanged(prompt)
            }
        }
    }

    async fn request_completion(&self, prompt: &str) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": INSTRUCTION_TEMPLATE.replace("{prompt}", prompt) },
            ],
        });
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let value = log_service_timing("perplexity", &self.model, "enhance_prompt", None, || async {
            let response = get_http_client()
                .post(&url)
                .bearer_auth(&self.api_key)
                .timeout(ENHANCE_TIMEOUT)
                .json(&payload)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(anyhow!(
                    "enhancer request failed with status {}: {}",
                    status,
                    truncate_for_log(&body, 500)
                ));
            }
            Ok(response.json::<Value>().await?)
        })
        .await?;

        let content = value
            .pointer("/choices/0/message/content")
            .and_then(|content| content.as_str())
            .ok_or_else(|| anyhow!("enhancer response has no message content"))?;
        debug!("Enhancer answered: {}", truncate_for_log(content, 400));
        Ok(content.to_string())
    }
}

pub fn parse_enhancement(content: &str, fallback_prompt: &str) -> EnhancedPrompt {
    let extract = |pattern: &Regex| {
        pattern
            .captures(content)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|value| !value.is_empty())
    };

    EnhancedPrompt {
        prompt: extract(&PROMPT_TAG).unwrap_or_else(|| fallback_prompt.to_string()),
        title: extract(&TITLE_TAG).unwrap_or_else(|| DEFAULT_TITLE.to_string()),
    }
}
