//! Token refresh protocol
//!
//! Resolves a usable access token for a tenant, refreshing proactively
//! when the stored token is inside the expiry buffer. Refresh tokens
//! are treated as single-use: the rotated token is persisted through
//! the vault's atomic upsert before the new access token is handed out,
//! so a crash after refresh can never strand the only working token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ProviderConfig;
use crate::crypto::TokenCipher;
use crate::error::{ConfigError, Result, TokenError};
use crate::types::Credential;
use crate::vault::CredentialSource;

/// Refresh this far before actual expiry
pub const REFRESH_BUFFER: Duration = Duration::from_secs(60);

/// Result of a successful refresh call
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Rotated refresh token, when the provider issues one
    pub refresh_token: Option<String>,
    /// Lifetime of the new access token, seconds
    pub expires_in: i64,
    pub scopes: Option<String>,
}

/// Access token plus the provider identity to publish as
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub access_token: String,
    pub external_id: String,
}

/// OAuth refresh seam. Production uses `HttpOAuth`; tests script
/// outcomes with `mock::MockOAuth`.
#[async_trait]
pub trait OAuthApi: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken>;
}

pub struct TokenService {
    source: Arc<dyn CredentialSource>,
    oauth: Arc<dyn OAuthApi>,
    provider: String,
    refresh_buffer: Duration,
}

impl TokenService {
    pub fn new(
        source: Arc<dyn CredentialSource>,
        oauth: Arc<dyn OAuthApi>,
        provider: String,
    ) -> Self {
        Self {
            source,
            oauth,
            provider,
            refresh_buffer: REFRESH_BUFFER,
        }
    }

    pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    /// Resolve a valid access token for a tenant.
    ///
    /// Every failure here is terminal for the current publish attempt;
    /// none of the `TokenError` cases resolve themselves on retry.
    pub async fn access_token_for(&self, tenant_id: &str) -> Result<ResolvedToken> {
        let credential = self
            .source
            .get(tenant_id, &self.provider)
            .await?
            .ok_or_else(|| TokenError::NotConnected(tenant_id.to_string()))?;

        if credential.access_token.is_empty() {
            return Err(TokenError::NotConnected(tenant_id.to_string()).into());
        }

        let now = chrono::Utc::now().timestamp();
        let needs_refresh = credential
            .expires_at
            .map(|expires_at| expires_at - now <= self.refresh_buffer.as_secs() as i64)
            .unwrap_or(false);

        if !needs_refresh {
            debug!(
                tenant_id,
                token = %TokenCipher::mask(&credential.access_token),
                "stored access token still valid"
            );
            return Ok(ResolvedToken {
                access_token: credential.access_token,
                external_id: credential.external_id,
            });
        }

        self.refresh_and_persist(credential, now).await
    }

    async fn refresh_and_persist(
        &self,
        credential: Credential,
        now: i64,
    ) -> Result<ResolvedToken> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(TokenError::RefreshUnavailable)?
            .to_string();

        let refreshed = self.oauth.refresh(&refresh_token).await?;

        // Persist before returning. The old refresh token may already
        // be dead on the provider side.
        let rotated = Credential {
            access_token: refreshed.access_token.clone(),
            refresh_token: refreshed.refresh_token.clone().or(Some(refresh_token)),
            expires_at: Some(now + refreshed.expires_in),
            scopes: refreshed.scopes.clone().or(credential.scopes),
            ..credential
        };
        self.source.save(&rotated).await?;

        info!(
            tenant_id = %rotated.tenant_id,
            expires_at = ?rotated.expires_at,
            "refreshed access token"
        );

        Ok(ResolvedToken {
            access_token: refreshed.access_token,
            external_id: rotated.external_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
    scope: Option<String>,
}

/// Refresh client against the provider's OAuth token endpoint
pub struct HttpOAuth {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpOAuth {
    /// Fails at construction when the OAuth client is not configured,
    /// so a misconfigured daemon dies at startup instead of at the
    /// first due post.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        if config.client_id.is_empty() {
            return Err(ConfigError::MissingField("provider.client_id".to_string()).into());
        }
        if config.client_secret.is_empty() {
            return Err(ConfigError::MissingField("provider.client_secret".to_string()).into());
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.token_timeout_secs))
            .build()
            .map_err(|e| TokenError::RefreshFailed(e.to_string()))?;

        Ok(Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }
}

#[async_trait]
impl OAuthApi for HttpOAuth {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TokenError::RefreshFailed("token endpoint timed out".to_string())
                } else {
                    TokenError::RefreshFailed(format!("token endpoint unreachable: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::RefreshFailed(format!(
                "status {}: {}",
                status.as_u16(),
                truncate(&body, 200)
            ))
            .into());
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::RefreshFailed(format!("malformed token response: {}", e)))?;

        Ok(RefreshedToken {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_in: body.expires_in,
            scopes: body.scope,
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Scripted OAuth client for tests
pub mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{OAuthApi, RefreshedToken};
    use crate::error::{Result, TokenError};

    enum Scripted {
        Succeed(RefreshedToken),
        Fail(String),
    }

    pub struct MockOAuth {
        script: Mutex<Scripted>,
        calls: AtomicUsize,
        seen_refresh_tokens: Mutex<Vec<String>>,
    }

    impl MockOAuth {
        pub fn succeed(token: RefreshedToken) -> Self {
            Self {
                script: Mutex::new(Scripted::Succeed(token)),
                calls: AtomicUsize::new(0),
                seen_refresh_tokens: Mutex::new(Vec::new()),
            }
        }

        pub fn fail(detail: &str) -> Self {
            Self {
                script: Mutex::new(Scripted::Fail(detail.to_string())),
                calls: AtomicUsize::new(0),
                seen_refresh_tokens: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn seen_refresh_tokens(&self) -> Vec<String> {
            self.seen_refresh_tokens.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OAuthApi for MockOAuth {
        async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_refresh_tokens
                .lock()
                .unwrap()
                .push(refresh_token.to_string());

            match &*self.script.lock().unwrap() {
                Scripted::Succeed(token) => Ok(token.clone()),
                Scripted::Fail(detail) => Err(TokenError::RefreshFailed(detail.clone()).into()),
            }
        }
    }
}
