//! The model gateway seen by attempt executors.
//!
//! An executor only needs "send this prompt to this model, get text back
//! with whatever usage and cost telemetry exists". Live providers and
//! replayed responses both sit behind [`ModelGateway`] so the executor
//! treats them identically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cost::PricingTable;
use super::litellm::{GenerationRequest, LlmProvider, Message, Usage};
use crate::error::LlmError;
use crate::prompts::SYSTEM_PROMPT;

/// Sampling parameters for one completion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Generated text plus telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Usage>,
    pub cost_usd: Option<f64>,
    pub latency: Duration,
}

/// Sends prompts to models.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Complete `prompt` with `model`. No retries are attempted.
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        params: CompletionParams,
    ) -> Result<Completion, LlmError>;

    /// Name reported in the run's `init` event.
    fn provider_name(&self) -> &str;
}

/// Gateway backed by a chat-completions provider.
pub struct ProviderGateway {
    provider: Arc<dyn LlmProvider>,
    name: String,
    pricing: PricingTable,
    system_prompt: String,
}

impl ProviderGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
            pricing: PricingTable::new(),
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }
}

#[async_trait]
impl ModelGateway for ProviderGateway {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        params: CompletionParams,
    ) -> Result<Completion, LlmError> {
        let request = GenerationRequest::new(
            model,
            vec![
                Message::system(self.system_prompt.clone()),
                Message::user(prompt),
            ],
        )
        .with_temperature(params.temperature)
        .with_max_tokens(params.max_tokens);

        let started = Instant::now();
        let response = self.provider.generate(request).await?;
        let latency = started.elapsed();

        let text = response
            .first_content()
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::EmptyResponse(model.to_string()))?
            .to_string();
        let cost_usd = response
            .usage
            .as_ref()
            .and_then(|usage| self.pricing.cost_for(model, usage));

        debug!(
            model = model,
            latency_secs = latency.as_secs_f64(),
            prompt_tokens = response.usage.map(|u| u.prompt_tokens),
            completion_tokens = response.usage.map(|u| u.completion_tokens),
            "Model completion received"
        );

        Ok(Completion {
            text,
            usage: response.usage,
            cost_usd,
            latency,
        })
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}

/// Gateway that answers every prompt with the same stored response.
#[derive(Debug, Clone)]
pub struct ReplayGateway {
    text: String,
}

impl ReplayGateway {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Load the stored response from a file.
    pub async fn from_file(path: &std::path::Path) -> Result<Self, LlmError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LlmError::Replay(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(text))
    }
}

#[async_trait]
impl ModelGateway for ReplayGateway {
    async fn complete(
        &self,
        _prompt: &str,
        _model: &str,
        _params: CompletionParams,
    ) -> Result<Completion, LlmError> {
        Ok(Completion {
            text: self.text.clone(),
            usage: None,
            cost_usd: None,
            latency: Duration::ZERO,
        })
    }

    fn provider_name(&self) -> &str {
        "replay"
    }
}
