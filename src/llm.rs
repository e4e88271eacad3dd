use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::LlmError;
use crate::models::Note;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

const CODE_KEYWORDS: [&str; 11] = [
    "function", "variable", "class", "method", "code", "javascript", "python", "const", "let",
    "var", "return",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    OpenRouter,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::OpenRouter => "openrouter",
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            Provider::Ollama => Duration::from_secs(30),
            Provider::OpenRouter => Duration::from_secs(10),
        }
    }
}

impl FromStr for Provider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Provider::Ollama),
            "openrouter" => Ok(Provider::OpenRouter),
            other => Err(LlmError::UnsupportedProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Generation,
    Evaluation,
    Hint,
}

/// Model names per task for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSet {
    pub generation: String,
    pub evaluation: String,
    pub hint: String,
    pub code: String,
}

impl ModelSet {
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::Ollama => Self {
                generation: "gpt-oss".into(),
                evaluation: "gpt-oss".into(),
                hint: "gpt-oss".into(),
                code: "hir0rameel/qwen-claude".into(),
            },
            Provider::OpenRouter => {
                let model = "google/gemini-flash-1.5-8b".to_string();
                Self {
                    generation: model.clone(),
                    evaluation: model.clone(),
                    hint: model.clone(),
                    code: model,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: Provider,
    pub models: ModelSet,
    pub timeout: Duration,
    /// Model used for the single retry after a non-timeout failure.
    pub fallback_model: String,
    pub ollama_url: String,
    pub openrouter_api_key: Option<String>,
}

impl LlmConfig {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            models: ModelSet::for_provider(provider),
            timeout: provider.default_timeout(),
            fallback_model: ModelSet::for_provider(Provider::Ollama).generation,
            ollama_url: "http://localhost:11434".into(),
            openrouter_api_key: None,
        }
    }
}

/// Public view of the AI configuration, safe to expose over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct AiConfigView {
    pub provider: Provider,
    pub models: ModelSet,
    pub timeout_ms: u128,
    pub fallback_model: String,
    pub has_api_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub question: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub is_correct: bool,
    pub feedback: String,
}

/// A text-completion backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TextGenerator for OllamaClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });

        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await?;
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(LlmError::ModelNotFound(model.to_string()));
            }
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let ollama_resp: OllamaResponse = resp.json().await?;
        non_empty(ollama_resp.response)
    }
}

#[derive(Clone)]
pub struct OpenRouterClient {
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

impl OpenRouterClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TextGenerator for OpenRouterClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::MissingApiKey(Provider::OpenRouter.as_str().to_string()))?;

        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await?;
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: error_text,
            });
        }

        let chat: ChatResponse = resp.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse)?;
        non_empty(content)
    }
}

fn non_empty(text: String) -> Result<String, LlmError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    Ok(trimmed.to_string())
}

pub struct LlmService {
    config: LlmConfig,
    primary: Arc<dyn TextGenerator>,
    /// Backend used for the retry; Ollama in every provider setup.
    fallback: Arc<dyn TextGenerator>,
}

impl LlmService {
    pub fn new(config: LlmConfig, primary: Arc<dyn TextGenerator>, fallback: Arc<dyn TextGenerator>) -> Self {
        Self {
            config,
            primary,
            fallback,
        }
    }

    /// Builds the HTTP clients for the configured provider.
    pub fn from_config(config: LlmConfig) -> Self {
        let ollama: Arc<dyn TextGenerator> = Arc::new(OllamaClient::new(config.ollama_url.clone()));
        let primary: Arc<dyn TextGenerator> = match config.provider {
            Provider::Ollama => ollama.clone(),
            Provider::OpenRouter => Arc::new(OpenRouterClient::new(config.openrouter_api_key.clone())),
        };
        Self::new(config, primary, ollama)
    }

    pub fn config(&self) -> AiConfigView {
        AiConfigView {
            provider: self.config.provider,
            models: self.config.models.clone(),
            timeout_ms: self.config.timeout.as_millis(),
            fallback_model: self.config.fallback_model.clone(),
            has_api_key: match self.config.provider {
                Provider::Ollama => true,
                Provider::OpenRouter => self.config.openrouter_api_key.is_some(),
            },
        }
    }

    /// Model for `task`. Code-like notes get the code model for question
    /// generation on Ollama.
    pub fn select_model(&self, task: Task, note: Option<&Note>) -> &str {
        let models = &self.config.models;
        match task {
            Task::Generation => {
                let is_code = self.config.provider == Provider::Ollama && note.is_some_and(looks_like_code);
                if is_code {
                    &models.code
                } else {
                    &models.generation
                }
            }
            Task::Evaluation => &models.evaluation,
            Task::Hint => &models.hint,
        }
    }

    pub async fn generate_question(&self, note: &Note) -> Result<GeneratedQuestion, LlmError> {
        let model = self.select_model(Task::Generation, Some(note));
        let title = note
            .title
            .as_deref()
            .map(|t| format!("Title: {}\n", t))
            .unwrap_or_default();

        let prompt = format!(
            "You are an examiner. Write ONE short, precise question that tests the learner's understanding.\n\n\
             {}Content: {}\n\n\
             Answer ONLY with the question, without introduction or explanation.",
            title, note.description
        );

        let (question, model) = self.complete(model, &prompt).await?;
        Ok(GeneratedQuestion { question, model })
    }

    pub async fn evaluate_answer(
        &self,
        question: &str,
        user_answer: &str,
        context: &str,
    ) -> Result<Evaluation, LlmError> {
        let model = self.select_model(Task::Evaluation, None);
        let prompt = format!(
            "Evaluate this student answer.\n\n\
             Question: {}\n\
             Expected content: {}\n\
             Student answer: {}\n\n\
             Reply in at most 2 lines:\n\
             1. First line: CORRECT or INCORRECT\n\
             2. A short explanation (1 sentence)",
            question, context, user_answer
        );

        let (response, _) = self.complete(model, &prompt).await?;
        Ok(Evaluation {
            is_correct: parse_verdict(&response),
            feedback: response,
        })
    }

    pub async fn generate_hint(&self, note: &Note) -> Result<String, LlmError> {
        let model = self.select_model(Task::Hint, Some(note));
        let prompt = format!(
            "Give ONE short hint (1 sentence) to help answer a question about this topic:\n\n{}\n\nHint:",
            note.description
        );

        let (hint, _) = self.complete(model, &prompt).await?;
        Ok(hint)
    }

    /// Runs `prompt` on `model`, retrying once on the fallback model.
    /// Returns the text and the model that produced it.
    async fn complete(&self, model: &str, prompt: &str) -> Result<(String, String), LlmError> {
        let started = Instant::now();
        match self.call(self.primary.as_ref(), model, prompt).await {
            Ok(text) => {
                log::debug!(
                    "{} answered with {} in {:.2}s",
                    self.config.provider.as_str(),
                    model,
                    started.elapsed().as_secs_f64()
                );
                Ok((text, model.to_string()))
            }
            Err(e) if e.is_timeout() => {
                log::error!("LLM call on {} timed out: {}", model, e);
                Err(e)
            }
            Err(e) => {
                let fallback_model = self.config.fallback_model.as_str();
                log::warn!("LLM call on {} failed ({}), retrying with {}", model, e, fallback_model);
                let text = self.call(self.fallback.as_ref(), fallback_model, prompt).await?;
                Ok((text, fallback_model.to_string()))
            }
        }
    }

    async fn call(&self, generator: &dyn TextGenerator, model: &str, prompt: &str) -> Result<String, LlmError> {
        let timeout = self.config.timeout;
        tokio::time::timeout(timeout, generator.generate(model, prompt))
            .await
            .map_err(|_| LlmError::Timeout(timeout))?
    }
}

fn looks_like_code(note: &Note) -> bool {
    let content = format!("{} {}", note.title.as_deref().unwrap_or(""), note.description).to_lowercase();
    CODE_KEYWORDS.iter().any(|k| content.contains(k))
}

/// Reads the CORRECT / INCORRECT verdict from the first line that opens with one.
/// A response with no leading verdict counts as incorrect.
pub fn parse_verdict(response: &str) -> bool {
    response
        .to_uppercase()
        .lines()
        .map(|line| line.trim_start_matches(|c: char| !c.is_alphabetic()))
        .find_map(|line| {
            if line.starts_with("INCORRECT") || line.starts_with("NOT CORRECT") {
                Some(false)
            } else if line.starts_with("CORRECT") {
                Some(true)
            } else {
                None
            }
        })
        .unwrap_or(false)
}
