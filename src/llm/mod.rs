//! Model access.
//!
//! - [`litellm`]: OpenAI-compatible chat-completions client and the
//!   [`LlmProvider`] trait it implements
//! - [`cost`]: per-token pricing tables fetched from the provider
//! - [`gateway`]: the [`ModelGateway`] seam used by attempt executors,
//!   with a provider-backed and a replay implementation
//!
//! ```ignore
//! use codebench::llm::{LiteLlmClient, PricingTable, ProviderGateway};
//! use std::sync::Arc;
//!
//! let client = LiteLlmClient::from_env()?;
//! let pricing = PricingTable::fetch(&client, &models).await;
//! let gateway = ProviderGateway::new(Arc::new(client), "openrouter").with_pricing(pricing);
//! ```

pub mod cost;
pub mod gateway;
pub mod litellm;

pub use cost::{ModelPricing, PricingTable};
pub use gateway::{Completion, CompletionParams, ModelGateway, ProviderGateway, ReplayGateway};
pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message,
    ModelListing, Usage, DEFAULT_API_BASE,
};
