use crate::config::Config;
use crate::error::Error;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const ADS_SCOPE: &str = "https://ads.microsoft.com/msads.manage offline_access";

/// OAuth client registration plus the tokens issued to it.
#[derive(Clone)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    pub developer_token: String,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("client_id", &self.client_id)
            .field("tenant_id", &self.tenant_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// Whether the access token is usable for at least `margin` past `now`.
    fn is_fresh(&self, margin: TimeDelta, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => expires_at - margin > now,
            _ => false,
        }
    }

    fn apply(&mut self, grant: TokenGrant, now: DateTime<Utc>) {
        self.access_token = Some(grant.access_token);
        self.expires_at = Some(now + TimeDelta::seconds(grant.expires_in));
        if let Some(rotated) = grant.refresh_token.filter(|t| !t.is_empty()) {
            self.refresh_token = rotated;
        }
    }
}

/// Successful response of the token endpoint.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Exchanges the credential's refresh token for a new access token.
    async fn refresh(&self, credential: &Credential) -> Result<TokenGrant, Error>;
}

/// Token endpoint of the Microsoft identity platform.
pub struct MicrosoftIdentity {
    client: Client,
    auth_url: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct TokenError {
    error: String,
    error_description: String,
}

impl MicrosoftIdentity {
    pub fn new(config: &Config) -> Self {
        MicrosoftIdentity {
            client: Client::new(),
            auth_url: config.auth_url.to_string(),
        }
    }

    fn token_url(&self, tenant_id: &str) -> Result<Url, Error> {
        let mut url = Url::parse(&self.auth_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(&[tenant_id, "oauth2", "v2.0", "token"]);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl IdentityProvider for MicrosoftIdentity {
    async fn refresh(&self, credential: &Credential) -> Result<TokenGrant, Error> {
        let url = self.token_url(&credential.tenant_id)?;
        let form = [
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", credential.refresh_token.as_str()),
            ("scope", ADS_SCOPE),
        ];

        let resp = self.client.post(url).form(&form).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json::<TokenGrant>().await?);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(map_token_failure(status, &body))
    }
}

fn map_token_failure(status: StatusCode, body: &str) -> Error {
    let failure: TokenError = serde_json::from_str(body).unwrap_or_default();
    let message = if failure.error.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", failure.error, failure.error_description)
    };

    match failure.error.as_str() {
        "invalid_grant" | "invalid_client" | "unauthorized_client" | "interaction_required" => {
            Error::Authentication(message)
        }
        _ if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
            Error::Authentication(message)
        }
        _ if status == StatusCode::TOO_MANY_REQUESTS => Error::RateLimited {
            retry_after: None,
            message,
        },
        _ if status.is_server_error() => Error::TransientNetwork(message),
        _ => Error::Authentication(message),
    }
}

/// Token cache file layout, shared with the operator's consent tooling.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct CachedTokens {
    refresh_token: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    /// Configured refresh token the cached chain started from.
    #[serde(default)]
    seeded_from: Option<String>,
}

/// Sole owner of the mutable [`Credential`].
///
/// The credential sits behind one async mutex that is held for the whole
/// refresh, so a manager never has more than one refresh in flight and
/// callers queued behind it observe the refreshed token.
pub struct TokenManager {
    provider: Arc<dyn IdentityProvider>,
    credential: Mutex<Credential>,
    refresh_margin: TimeDelta,
    tokens_file: Option<PathBuf>,
    seeded_from: Option<String>,
}

impl TokenManager {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        credential: Credential,
        refresh_margin: TimeDelta,
        tokens_file: Option<PathBuf>,
    ) -> Self {
        TokenManager {
            provider,
            credential: Mutex::new(credential),
            refresh_margin,
            tokens_file,
            seeded_from: None,
        }
    }

    /// Builds the credential from configuration, letting the token cache
    /// file override the configured refresh token. A cache seeded from a
    /// different configured token is stale (the operator re-consented) and
    /// is ignored.
    pub async fn from_config(
        config: &Config,
        provider: Arc<dyn IdentityProvider>,
    ) -> Result<Self, Error> {
        let configured = config.refresh_token.clone().filter(|t| !t.is_empty());
        let mut credential = Credential {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            tenant_id: config.tenant_id.clone(),
            developer_token: config.developer_token.clone(),
            refresh_token: config.refresh_token.clone().unwrap_or_default(),
            access_token: None,
            expires_at: None,
        };

        if let Some(path) = &config.tokens_file {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => {
                    let cached: CachedTokens = serde_json::from_str(&contents).map_err(|e| {
                        Error::Configuration(format!(
                            "token cache {} is unreadable: {e}",
                            path.display()
                        ))
                    })?;
                    if configured.is_some() && cached.seeded_from != configured {
                        info!(
                            "configured refresh token differs from the one {} was seeded from, ignoring the cache",
                            path.display()
                        );
                    } else {
                        debug!("loaded cached tokens from {}", path.display());
                        credential.refresh_token = cached.refresh_token;
                        credential.access_token = cached.access_token;
                        credential.expires_at = cached.expires_at;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("no token cache at {}", path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }

        if credential.refresh_token.is_empty() {
            return Err(Error::Configuration(
                "no refresh token configured; complete the consent flow first".to_string(),
            ));
        }

        let mut manager = TokenManager::new(
            provider,
            credential,
            TimeDelta::seconds(config.refresh_margin_secs as i64),
            config.tokens_file.clone(),
        );
        manager.seeded_from = configured;
        Ok(manager)
    }

    /// Returns an access token valid for at least the refresh margin,
    /// refreshing it first when needed.
    pub async fn get_valid_token(&self) -> Result<String, Error> {
        let mut credential = self.credential.lock().await;

        if credential.is_fresh(self.refresh_margin, Utc::now()) {
            if let Some(token) = &credential.access_token {
                return Ok(token.clone());
            }
        }

        debug!("access token missing or near expiry, refreshing");
        let grant = self.provider.refresh(&credential).await.map_err(|e| {
            warn!("token refresh failed: {}", e);
            e
        })?;
        credential.apply(grant, Utc::now());
        info!(
            "refreshed access token, valid until {}",
            credential
                .expires_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        );

        if let Some(path) = &self.tokens_file {
            let cached = CachedTokens {
                refresh_token: credential.refresh_token.clone(),
                access_token: credential.access_token.clone(),
                expires_at: credential.expires_at,
                seeded_from: self.seeded_from.clone(),
            };
            if let Err(e) = write_cache(path, &cached).await {
                warn!("failed to write token cache {}: {}", path.display(), e);
            }
        }

        credential
            .access_token
            .clone()
            .ok_or_else(|| Error::Authentication("token endpoint returned no access token".into()))
    }
}

async fn write_cache(path: &std::path::Path, cached: &CachedTokens) -> Result<(), Error> {
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, serde_json::to_vec_pretty(cached)?).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn fresh_token_manager() -> Arc<TokenManager> {
    let credential = Credential {
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        tenant_id: "common".to_string(),
        developer_token: "dev".to_string(),
        refresh_token: "refresh".to_string(),
        access_token: Some("access".to_string()),
        expires_at: Some(Utc::now() + TimeDelta::days(1)),
    };
    Arc::new(TokenManager::new(
        Arc::new(MockIdentityProvider::new()),
        credential,
        TimeDelta::minutes(5),
        None,
    ))
}
