//! Provider credential resolution.
//!
//! Credentials are looked up through an ordered chain of resolvers. The
//! first resolver that returns something wins:
//! 1. Inline step config (`api_key`), for test setups only
//! 2. Per-user credentials
//! 3. Process environment (`<PROVIDER>_API_KEY`)

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Provider credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    pub base_url: Option<String>,
    pub organization: Option<String>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            organization: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("organization", &self.organization)
            .finish()
    }
}

/// What a resolver is asked for
#[derive(Debug, Clone, Copy)]
pub struct CredentialRequest<'a> {
    pub provider: &'a str,
    pub user_id: &'a str,
    pub step_config: &'a Map<String, Value>,
}

/// A single credential source
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Look up credentials, `Ok(None)` when this source has none
    async fn resolve(&self, request: &CredentialRequest<'_>) -> Result<Option<Credentials>>;
}

/// Ordered list of resolvers
#[derive(Clone, Default)]
pub struct CredentialChain {
    resolvers: Vec<Arc<dyn CredentialResolver>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inline config, then `users`, then the environment
    pub fn standard(users: Arc<UserCredentialStore>) -> Self {
        Self::new()
            .with(Arc::new(InlineConfigCredentials))
            .with(users)
            .with(Arc::new(EnvironmentCredentials::new()))
    }

    /// Append a resolver at the lowest precedence
    pub fn with(mut self, resolver: Arc<dyn CredentialResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

#[async_trait]
impl CredentialResolver for CredentialChain {
    fn name(&self) -> &str {
        "chain"
    }

    async fn resolve(&self, request: &CredentialRequest<'_>) -> Result<Option<Credentials>> {
        for resolver in &self.resolvers {
            if let Some(credentials) = resolver.resolve(request).await? {
                debug!(
                    provider = %request.provider,
                    source = resolver.name(),
                    "Resolved provider credentials"
                );
                return Ok(Some(credentials));
            }
        }
        Ok(None)
    }
}

/// Cleartext `api_key` embedded in the step config
pub struct InlineConfigCredentials;

#[async_trait]
impl CredentialResolver for InlineConfigCredentials {
    fn name(&self) -> &str {
        "inline_config"
    }

    async fn resolve(&self, request: &CredentialRequest<'_>) -> Result<Option<Credentials>> {
        let Some(api_key) = request
            .step_config
            .get("api_key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
        else {
            return Ok(None);
        };

        warn!(
            provider = %request.provider,
            "Using API key embedded in step config; this is insecure and intended for tests only"
        );

        let mut credentials = Credentials::new(api_key);
        credentials.base_url = request
            .step_config
            .get("base_url")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Some(credentials))
    }
}

/// Per-user credentials keyed by `(user_id, provider)`
#[derive(Default)]
pub struct UserCredentialStore {
    entries: RwLock<HashMap<(String, String), Credentials>>,
}

impl UserCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store credentials for a user, replacing any previous entry
    pub async fn insert(&self, user_id: impl Into<String>, provider: impl Into<String>, credentials: Credentials) {
        self.entries
            .write()
            .await
            .insert((user_id.into(), provider.into()), credentials);
    }

    /// Remove a user's credentials for a provider
    pub async fn remove(&self, user_id: &str, provider: &str) -> Option<Credentials> {
        self.entries
            .write()
            .await
            .remove(&(user_id.to_string(), provider.to_string()))
    }
}

#[async_trait]
impl CredentialResolver for UserCredentialStore {
    fn name(&self) -> &str {
        "user_store"
    }

    async fn resolve(&self, request: &CredentialRequest<'_>) -> Result<Option<Credentials>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(request.user_id.to_string(), request.provider.to_string()))
            .cloned())
    }
}

/// `<PROVIDER>_API_KEY` / `<PROVIDER>_BASE_URL` from the process environment
#[derive(Default)]
pub struct EnvironmentCredentials {
    prefix: Option<String>,
}

impl EnvironmentCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix variable names, e.g. `PIPEWRIGHT_` -> `PIPEWRIGHT_OPENAI_API_KEY`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    fn var_name(&self, provider: &str, suffix: &str) -> String {
        let provider = provider.to_uppercase().replace(['-', '.'], "_");
        format!("{}{}_{}", self.prefix.as_deref().unwrap_or(""), provider, suffix)
    }
}

#[async_trait]
impl CredentialResolver for EnvironmentCredentials {
    fn name(&self) -> &str {
        "environment"
    }

    async fn resolve(&self, request: &CredentialRequest<'_>) -> Result<Option<Credentials>> {
        let key = match std::env::var(self.var_name(request.provider, "API_KEY")) {
            Ok(key) if !key.is_empty() => key,
            _ => return Ok(None),
        };

        let mut credentials = Credentials::new(key);
        credentials.base_url = std::env::var(self.var_name(request.provider, "BASE_URL")).ok();
        Ok(Some(credentials))
    }
}
