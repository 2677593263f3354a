// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use std::time::Duration;

use anyhow::{bail, Context, Result};
use jsonwebtoken as jwt;
use serde::{Deserialize, Serialize};

use super::{bearer_token, AuthError, Authorizer, Principal};
use crate::clock::{self, unix_seconds, Clock};

/// Claims carried by a session token issued after SSO login.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct SessionClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default)]
    pub principals: Vec<Principal>,
}

/// Mints and verifies HS256 session tokens with a shared secret.
///
/// With an empty secret nothing is minted and every header is rejected with
/// [`AuthError::NotConfigured`].
pub struct SessionAuthorizer {
    secret: Vec<u8>,
    clock: Clock,
}

impl SessionAuthorizer {
    pub fn new<S: Into<Vec<u8>>>(secret: S) -> Self {
        Self {
            secret: secret.into(),
            clock: clock::system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.secret.is_empty()
    }

    pub fn mint(&self, principals: Vec<Principal>, ttl: Duration) -> Result<String> {
        if !self.is_configured() {
            bail!(AuthError::NotConfigured);
        }
        let issued_at = unix_seconds((self.clock)());
        let claims = SessionClaims {
            iat: Some(issued_at),
            exp: Some(issued_at + ttl.as_secs()),
            principals,
        };
        jwt::encode(
            &jwt::Header::new(jwt::Algorithm::HS256),
            &claims,
            &jwt::EncodingKey::from_secret(&self.secret),
        )
        .context("Could not encode session token.")
    }

    fn decode(&self, token: &str) -> Result<SessionClaims, AuthError> {
        // Only ever verify with HMAC, whatever the header asks for.
        let header = jwt::decode_header(token).map_err(AuthError::InvalidToken)?;
        if header.alg != jwt::Algorithm::HS256 {
            return Err(AuthError::UnexpectedSigningMethod(header.alg));
        }

        let mut validation = jwt::Validation::new(jwt::Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        let token_data = jwt::decode::<SessionClaims>(
            token,
            &jwt::DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(AuthError::InvalidToken)?;
        Ok(token_data.claims)
    }
}

impl Authorizer for SessionAuthorizer {
    fn kind(&self) -> &'static str {
        "session"
    }

    fn authorize(&self, authorization_header: &str) -> Result<Vec<Principal>, AuthError> {
        if authorization_header.trim().is_empty() {
            return Err(AuthError::MissingHeader);
        }
        let token = bearer_token(authorization_header)?;
        if token.is_empty() {
            return Err(AuthError::InvalidSyntax);
        }
        if !self.is_configured() {
            return Err(AuthError::NotConfigured);
        }

        let claims = self.decode(token)?;
        if let Some(expires_at) = claims.exp {
            if unix_seconds((self.clock)()) >= expires_at {
                return Err(AuthError::Expired);
            }
        }
        if claims.principals.is_empty() {
            return Err(AuthError::NoPrincipals);
        }
        Ok(claims.principals)
    }
}
