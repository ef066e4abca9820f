//! Where key sets come from.
//!
//! [`KeySetSource`] is the seam between the cache and the network. The
//! production implementation, [`HttpKeySetSource`], fetches the issuer's
//! published document over HTTPS; tests substitute in-memory sources.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::ACCEPT};

use crate::{error::AuthError, key_set::SigningKeySet};

/// Default IAP key-set endpoint (JSON Web Key Set).
pub const IAP_JWK_URL: &str = "https://www.gstatic.com/iap/verify/public_key-jwk";

/// Legacy IAP key-set endpoint (kid to PEM public key map).
pub const IAP_PEM_URL: &str = "https://www.gstatic.com/iap/verify/public_key";

/// Upper bound on a key-set document. Published sets are a few KiB.
pub const MAX_KEY_SET_SIZE: usize = 512 * 1024;

/// Fetches an issuer's current signing-key set.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    /// Identifies the source in logs, typically the endpoint URL.
    fn endpoint(&self) -> &str;

    /// Fetch and parse the current key set.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySetUnavailable`] on transport failures,
    /// non-success responses, or unusable documents.
    async fn fetch(&self) -> Result<SigningKeySet, AuthError>;
}

/// Fetches a key set over HTTPS with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpKeySetSource {
    client: Client,
    url: String,
}

impl HttpKeySetSource {
    /// Creates a source for `url` whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySetUnavailable`] if the HTTP client cannot be
    /// constructed (for example, TLS initialisation failure).
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            AuthError::key_set_unavailable_with_source("failed to build HTTP client", e)
        })?;
        Ok(Self::with_client(client, url))
    }

    /// Creates a source that uses an existing client.
    #[must_use]
    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    fn endpoint(&self) -> &str {
        &self.url
    }

    #[tracing::instrument(skip(self), fields(endpoint = %self.url))]
    async fn fetch(&self) -> Result<SigningKeySet, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| AuthError::key_set_unavailable_with_source("key set request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::key_set_unavailable(format!(
                "key set endpoint returned HTTP {status}"
            )));
        }

        if let Some(length) = response.content_length()
            && length > MAX_KEY_SET_SIZE as u64
        {
            return Err(AuthError::key_set_unavailable(format!(
                "key set document too large: {length} bytes"
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            AuthError::key_set_unavailable_with_source("failed to read key set response", e)
        })?;
        if body.len() > MAX_KEY_SET_SIZE {
            return Err(AuthError::key_set_unavailable(format!(
                "key set document too large: {} bytes",
                body.len()
            )));
        }

        let set = SigningKeySet::from_json(&body)?;
        tracing::debug!(keys = set.len(), "fetched key set");
        Ok(set)
    }
}
