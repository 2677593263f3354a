// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jsonwebtoken as jwt;
use openidconnect::{
    core::{CoreAuthenticationFlow, CoreClient, CoreJsonWebKeySet, CoreProviderMetadata},
    reqwest, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointMaybeSet,
    EndpointNotSet, EndpointSet, IssuerUrl, JsonWebKeySetUrl, Nonce, RedirectUrl, Scope,
    TokenResponse as _,
};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// Unknown KIDs trigger at most one JWKS download per interval.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Tokens returned by the provider's token endpoint that we care about.
#[derive(Debug, Default)]
pub struct ProviderTokens {
    pub id_token: Option<String>,
}

/// Claims of a verified identity token.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IdentityClaims {
    #[serde(default)]
    pub email: Option<String>,
}

/// The identity provider as seen by the login flow.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Where to send the browser to start an authorization-code login.
    fn authorize_url(&self, state: &str) -> Url;

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens>;

    /// Verify the signature, audience and issuer of an identity token.
    async fn validate_id_token(&self, id_token: &str) -> Result<IdentityClaims>;
}

type DiscoveredClient = CoreClient<
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointMaybeSet,
    EndpointMaybeSet,
>;

/// Somewhere to download the provider's signing keys from.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch(&self) -> Result<jwt::jwk::JwkSet>;
}

/// The JWKS endpoint advertised by discovery.
struct RemoteKeys {
    uri: JsonWebKeySetUrl,
    http_client: reqwest::Client,
}

#[async_trait]
impl KeySource for RemoteKeys {
    async fn fetch(&self) -> Result<jwt::jwk::JwkSet> {
        let jwks = CoreJsonWebKeySet::fetch_async(&self.uri, &self.http_client)
            .await
            .context("Could not download JWKS.")?;
        Ok(convert_jwks(&jwks))
    }
}

/// Convert from `openidconnect` to `jsonwebtoken`, skipping keys it cannot represent.
fn convert_jwks(jwks: &CoreJsonWebKeySet) -> jwt::jwk::JwkSet {
    let keys = jwks
        .keys()
        .iter()
        .filter_map(|k| {
            serde_json::to_value(k)
                .and_then(serde_json::from_value)
                .inspect_err(|e| warn!("Skipping unusable JWK: {e}"))
                .ok()
        })
        .collect();
    jwt::jwk::JwkSet { keys }
}

struct CachedKeys {
    set: jwt::jwk::JwkSet,
    refreshed_at: Option<Instant>,
}

/// Signing keys, downloaded again when a token names a KID we have not seen.
pub struct KeyCache {
    keys: RwLock<CachedKeys>,
    source: Box<dyn KeySource>,
}

impl KeyCache {
    pub fn new(initial: jwt::jwk::JwkSet, source: Box<dyn KeySource>) -> Self {
        Self {
            keys: RwLock::new(CachedKeys {
                set: initial,
                refreshed_at: None,
            }),
            source,
        }
    }

    pub async fn find(&self, kid: &str) -> Result<jwt::jwk::Jwk> {
        if let Some(jwk) = self.keys.read().await.set.find(kid) {
            return Ok(jwk.clone());
        }

        let mut keys = self.keys.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(jwk) = keys.set.find(kid) {
            return Ok(jwk.clone());
        }
        if keys
            .refreshed_at
            .is_some_and(|at| at.elapsed() < MIN_REFRESH_INTERVAL)
        {
            bail!("Could not find JWK matching KID.");
        }
        keys.refreshed_at = Some(Instant::now());
        debug!(kid, "Unknown KID, downloading the JWKS again.");
        keys.set = self.source.fetch().await?;
        keys.set
            .find(kid)
            .cloned()
            .context("Could not find JWK matching KID.")
    }
}

/// An OpenID Connect provider located by discovery.
pub struct OidcProvider {
    client: DiscoveredClient,
    provider_metadata: CoreProviderMetadata,
    keys: KeyCache,
    http_client: reqwest::Client,
}

impl OidcProvider {
    pub async fn discover(
        issuer: Url,
        client_id: String,
        client_secret: String,
        redirect_uri: Url,
    ) -> Result<Self> {
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Could not build HTTP client.")?;

        info!("Trying to access the OIDC endpoints.");
        let provider_metadata =
            CoreProviderMetadata::discover_async(IssuerUrl::from_url(issuer), &http_client)
                .await
                .context("Could not get OIDC metadata.")?;

        let client = CoreClient::from_provider_metadata(
            provider_metadata.clone(),
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
        )
        .set_redirect_uri(RedirectUrl::from_url(redirect_uri));

        let keys = KeyCache::new(
            convert_jwks(provider_metadata.jwks()),
            Box::new(RemoteKeys {
                uri: provider_metadata.jwks_uri().clone(),
                http_client: http_client.clone(),
            }),
        );

        Ok(Self {
            client,
            provider_metadata,
            keys,
            http_client,
        })
    }

    /// Google sometimes issues tokens with the bare host as issuer.
    fn issuers(&self) -> Vec<String> {
        let issuer = self.provider_metadata.issuer();
        let mut issuers = vec![issuer.as_str().to_string()];
        if let Some(host) = issuer.url().host_str() {
            issuers.push(host.to_string());
        }
        issuers
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    fn authorize_url(&self, state: &str) -> Url {
        let state = state.to_string();
        let (url, _csrf_token, _nonce) = self
            .client
            .authorize_url(
                CoreAuthenticationFlow::AuthorizationCode,
                move || CsrfToken::new(state),
                Nonce::new_random,
            )
            .add_scope(Scope::new("email".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .url();
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens> {
        let token_response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .context("Provider has no token endpoint.")?
            .request_async(&self.http_client)
            .await
            .context("Could not exchange authorization code.")?;
        Ok(ProviderTokens {
            id_token: token_response.id_token().map(ToString::to_string),
        })
    }

    async fn validate_id_token(&self, id_token: &str) -> Result<IdentityClaims> {
        let header = jwt::decode_header(id_token).context("Could not decode ID token header")?;
        if header.alg != jwt::Algorithm::RS256 {
            bail!("Unexpected ID token signing algorithm {:?}.", header.alg);
        }
        let kid = header.kid.context("Could not decode KID.")?;
        let jwk = self.keys.find(&kid).await?;
        let mut validation = jwt::Validation::new(jwt::Algorithm::RS256);
        validation.set_audience(&[self.client.client_id().as_str()]);
        validation.set_issuer(&self.issuers());
        let token_data = jwt::decode::<IdentityClaims>(
            id_token,
            &jwt::DecodingKey::from_jwk(&jwk)?,
            &validation,
        )
        .context("Could not decode ID token.")?;

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    /// Serves a fixed key set and counts downloads.
    struct FixedKeys {
        set: jwt::jwk::JwkSet,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl KeySource for FixedKeys {
        async fn fetch(&self) -> Result<jwt::jwk::JwkSet> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.set.clone())
        }
    }

    fn key_set(kids: &[&str]) -> jwt::jwk::JwkSet {
        let keys: Vec<_> = kids
            .iter()
            .map(|kid| {
                serde_json::json!({
                    "kty": "RSA",
                    "kid": kid,
                    "use": "sig",
                    "alg": "RS256",
                    "n": "AQAB",
                    "e": "AQAB",
                })
            })
            .collect();
        #[allow(clippy::expect_used)]
        serde_json::from_value(serde_json::json!({ "keys": keys })).expect("valid JWKS")
    }

    fn cache(initial: &[&str], served: &[&str]) -> (KeyCache, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let cache = KeyCache::new(
            key_set(initial),
            Box::new(FixedKeys {
                set: key_set(served),
                fetches: fetches.clone(),
            }),
        );
        (cache, fetches)
    }

    #[tokio::test]
    async fn known_kid_needs_no_download() -> Result<()> {
        let (cache, fetches) = cache(&["old"], &["old", "new"]);

        let jwk = cache.find("old").await?;

        assert_eq!(jwk.common.key_id.as_deref(), Some("old"));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn rotated_key_is_found_after_download() -> Result<()> {
        let (cache, fetches) = cache(&["old"], &["new"]);

        let jwk = cache.find("new").await?;

        assert_eq!(jwk.common.key_id.as_deref(), Some("new"));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        // The downloaded set replaces the discovered one.
        assert!(cache.find("new").await.is_ok());
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_kids_are_rate_limited() {
        let (cache, fetches) = cache(&["old"], &["old"]);

        assert!(cache.find("forged-1").await.is_err());
        assert!(cache.find("forged-2").await.is_err());

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }
}
