// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

//! Single sign-on through an OpenID Connect authorization-code login.
//!
//! A successful login ends with a session token bound to the verified e-mail
//! address, which [`crate::auth::session::SessionAuthorizer`] later accepts on
//! `/sign`. The CSRF state travels in a one-shot cookie and must be echoed by
//! the provider in the `state` query parameter.

pub mod domains;
pub mod provider;

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use axum::{
    extract::{RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand_core::{OsRng, RngCore as _};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use self::{
    domains::{is_allowed_email_domain, AllowedDomains},
    provider::IdentityProvider,
};
use crate::{
    auth::{session::SessionAuthorizer, Principal},
    error::{AppError, Status},
    server::AppState,
};

pub const STATE_COOKIE: &str = "oauth_state";
const STATE_COOKIE_MAX_AGE: time::Duration = time::Duration::seconds(600);
pub const SESSION_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// OAuth client settings.
#[derive(Clone, Debug)]
pub struct SsoSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Url,
    pub allowed_domains: AllowedDomains,
}

pub struct SsoController {
    settings: SsoSettings,
    sessions: Arc<SessionAuthorizer>,
    provider: Option<Arc<dyn IdentityProvider>>,
}

impl SsoController {
    pub fn new(
        settings: SsoSettings,
        sessions: Arc<SessionAuthorizer>,
        provider: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        Self {
            settings,
            sessions,
            provider,
        }
    }

    fn has_credentials(&self) -> bool {
        !self.settings.client_id.is_empty() && !self.settings.client_secret.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.has_credentials() && self.provider.is_some()
    }

    fn state_cookie(&self, value: String) -> Cookie<'static> {
        Cookie::build((STATE_COOKIE, value))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.settings.redirect_uri.scheme() == "https")
            .max_age(STATE_COOKIE_MAX_AGE)
            .build()
    }

    fn expired_state_cookie(&self) -> Cookie<'static> {
        let mut cookie = self.state_cookie(String::new());
        cookie.set_max_age(time::Duration::ZERO);
        cookie
    }

    /// The CSRF check: cookie and query parameter must both be present and equal.
    fn verify_state(&self, jar: &CookieJar, state_param: &str) -> Result<(), AppError> {
        if !self.sessions.is_configured() {
            warn!("SSO callback reached but APP_JWT_SECRET is not set.");
            return Err(AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "SSO not configured",
            ));
        }
        let Some(state_cookie) = jar.get(STATE_COOKIE) else {
            warn!("SSO callback without a state cookie.");
            return Err(AppError::new(StatusCode::BAD_REQUEST, "missing state"));
        };
        if state_param.is_empty() {
            return Err(AppError::new(StatusCode::BAD_REQUEST, "missing state"));
        }
        if state_cookie.value() != state_param {
            warn!("SSO callback state mismatch.");
            return Err(AppError::new(StatusCode::BAD_REQUEST, "invalid state"));
        }
        Ok(())
    }

    /// Everything after the state check: code exchange, identity
    /// verification, the domain gate and minting of the session token.
    async fn complete_login(&self, code: &str) -> Result<LoginResponse, AppError> {
        if code.is_empty() {
            return Err(AppError::new(StatusCode::BAD_REQUEST, "missing code"));
        }
        let provider = self
            .provider
            .as_ref()
            .context("No identity provider available.")
            .context("exchange failed")
            .status(StatusCode::UNAUTHORIZED)?;

        let tokens = provider
            .exchange_code(code)
            .await
            .context("exchange failed")
            .status(StatusCode::UNAUTHORIZED)?;
        let id_token = tokens
            .id_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("ID token missing in the token response."))
            .context("no id token")
            .status(StatusCode::UNAUTHORIZED)?;
        let claims = provider
            .validate_id_token(&id_token)
            .await
            .context("invalid id token")
            .status(StatusCode::UNAUTHORIZED)?;

        let Some(email) = claims.email.filter(|e| !e.is_empty()) else {
            warn!("ID token has no email claim.");
            return Err(AppError::new(StatusCode::FORBIDDEN, "email not in token"));
        };
        if self.settings.allowed_domains.is_empty() {
            warn!("No SSO domains are allowed, rejecting all logins.");
            return Err(AppError::new(
                StatusCode::FORBIDDEN,
                "email domain not allowed",
            ));
        }
        if !is_allowed_email_domain(&email, &self.settings.allowed_domains) {
            info!(%email, "SSO login from a domain that is not allowed.");
            return Err(AppError::new(
                StatusCode::FORBIDDEN,
                "email domain not allowed",
            ));
        }

        let token = self
            .sessions
            .mint(vec![Principal::new(email.clone())], SESSION_TOKEN_LIFETIME)
            .context("internal error")
            .status(StatusCode::INTERNAL_SERVER_ERROR)?;
        info!(%email, "Issued a session token.");
        Ok(LoginResponse { token, email })
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    token: String,
    email: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct CallbackParams {
    state: String,
    code: String,
}

impl CallbackParams {
    /// The first `state` and `code` win when a key is repeated.
    fn from_query(query: &str) -> Self {
        let mut state = None;
        let mut code = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "state" => state = state.or(Some(value.into_owned())),
                "code" => code = code.or(Some(value.into_owned())),
                _ => {}
            }
        }
        Self {
            state: state.unwrap_or_default(),
            code: code.unwrap_or_default(),
        }
    }
}

#[tracing::instrument(skip_all)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<impl IntoResponse, AppError> {
    let sso = &state.sso;
    let provider = match &sso.provider {
        Some(provider) if sso.has_credentials() => provider,
        _ => {
            warn!("SSO login requested but SSO is not configured.");
            return Err(AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "SSO not configured",
            ));
        }
    };

    let mut state_bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut state_bytes)
        .context("Could not generate OAuth state.")
        .context("internal error")
        .status(StatusCode::INTERNAL_SERVER_ERROR)?;
    let state_value = URL_SAFE_NO_PAD.encode(state_bytes);

    let authorize_url = provider.authorize_url(&state_value);
    debug!("Redirecting to the identity provider.");
    Ok((
        StatusCode::FOUND,
        jar.add(sso.state_cookie(state_value)),
        [(header::LOCATION, authorize_url.to_string())],
    ))
}

#[tracing::instrument(skip_all)]
pub async fn callback(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    RawQuery(query): RawQuery,
) -> Response {
    let params = CallbackParams::from_query(query.as_deref().unwrap_or_default());
    let sso = &state.sso;
    if let Err(err) = sso.verify_state(&jar, &params.state) {
        return err.into_response();
    }
    // The state is single use, whatever happens next.
    let jar = jar.add(sso.expired_state_cookie());
    (jar, sso.complete_login(&params.code).await.map(Json)).into_response()
}

#[tracing::instrument(skip_all)]
pub async fn logout() -> Json<serde_json::Value> {
    Json(json!({"message": "delete token client-side"}))
}
