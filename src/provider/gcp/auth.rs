//! Access token resolution
//!
//! Bearer tokens are resolved from, in order: the
//! `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable, the GCE metadata
//! server, and finally `gcloud auth print-access-token`. Tokens are cached
//! until shortly before expiry.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use crate::provider::ProviderError;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the reported expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(120);

/// Lifetime assumed for tokens from sources that do not report one
const ASSUMED_LIFETIME: Duration = Duration::from_secs(1800);

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

/// Caching token source
pub struct TokenSource {
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenSource {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, refreshing if the cached one is near expiry.
    pub async fn token(&self, http: &reqwest::Client) -> Result<String, ProviderError> {
        if let Some((token, expiry)) = self.cached.lock().unwrap().clone() {
            if Instant::now() + EXPIRY_MARGIN < expiry {
                return Ok(token);
            }
        }

        let (token, expiry) = self.resolve(http).await?;
        *self.cached.lock().unwrap() = Some((token.clone(), expiry));
        Ok(token)
    }

    async fn resolve(&self, http: &reqwest::Client) -> Result<(String, Instant), ProviderError> {
        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            if !token.is_empty() {
                debug!("Using access token from environment");
                return Ok((token, Instant::now() + ASSUMED_LIFETIME));
            }
        }

        if let Some(result) = self.from_metadata_server(http).await {
            debug!("Using access token from metadata server");
            return Ok(result);
        }

        self.from_gcloud().await
    }

    async fn from_metadata_server(
        &self,
        http: &reqwest::Client,
    ) -> Option<(String, Instant)> {
        let response = http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;
        let token: MetadataToken = response.json().await.ok()?;
        let expiry = Instant::now() + Duration::from_secs(token.expires_in);
        Some((token.access_token, expiry))
    }

    async fn from_gcloud(&self) -> Result<(String, Instant), ProviderError> {
        debug!("Requesting access token from gcloud");
        let output = tokio::process::Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|e| {
                ProviderError::PermissionDenied(format!(
                    "no access token available: gcloud not runnable ({e})"
                ))
            })?;

        if !output.status.success() {
            return Err(ProviderError::PermissionDenied(format!(
                "gcloud auth print-access-token failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(ProviderError::PermissionDenied(
                "gcloud returned an empty access token".to_string(),
            ));
        }
        Ok((token, Instant::now() + ASSUMED_LIFETIME))
    }
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::new()
    }
}
