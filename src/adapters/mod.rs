//! Adapter interfaces for external systems.
//!
//! Adapters provide a unified interface for the services a run depends on:
//! model providers, credential sources and usage accounting.

pub mod cost;
pub mod credentials;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cost::{CostTracker, InMemoryCostTracker, ModelPrice, PricingTable, UsageRecord};
pub use credentials::{
    CredentialChain, CredentialRequest, CredentialResolver, Credentials, EnvironmentCredentials,
    InlineConfigCredentials, UserCredentialStore,
};
pub use http::HttpProviderGateway;

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Generation parameters passed through to the provider
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

/// Token usage reported by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Output from a provider call
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// The content returned by the model
    pub content: String,

    pub usage: TokenUsage,
}

/// Provider failures, classified for the caller
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("rate limited")]
    RateLimit { retry_after: Option<std::time::Duration> },

    #[error("{message}")]
    Provider { message: String },
}

/// Trait for model provider access
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Run a chat generation against `provider`
    async fn generate(
        &self,
        provider: &str,
        credentials: &Credentials,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Generation, ProviderError>;
}
