// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

//! Mapping of an `Authorization` header to the principals a certificate may
//! be issued for.
//!
//! Every scheme implements [`Authorizer`]. [`chain::ChainAuthorizer`] is itself
//! an authorizer that tries a list of them in order, so the HTTP layer only
//! ever holds one.

pub mod chain;
pub mod session;
pub mod static_token;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A prinipal as put in the SSH certificate
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Deserialize, Serialize)]
pub struct Principal(String);

impl Principal {
    pub fn new<S: Into<String>>(principal: S) -> Self {
        Self(principal.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Principals established by the authorization middleware for one request.
#[derive(Clone, Debug)]
pub struct Principals(pub Vec<Principal>);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingHeader,
    #[error("invalid auth token syntax")]
    InvalidSyntax,
    #[error("access token not valid or has no principals")]
    UnknownToken,
    #[error("session tokens not configured")]
    NotConfigured,
    #[error("unexpected signing method: {0:?}")]
    UnexpectedSigningMethod(jsonwebtoken::Algorithm),
    #[error("invalid token: {0}")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),
    #[error("token expired")]
    Expired,
    #[error("token has no principals")]
    NoPrincipals,
    #[error("{}", describe_failures(.0))]
    Unauthorized(Vec<Failure>),
}

/// One rejection inside a chain, tagged with the authorizer that produced it.
#[derive(Debug)]
pub struct Failure {
    pub authorizer: &'static str,
    pub error: AuthError,
}

fn describe_failures(failures: &[Failure]) -> String {
    if failures.is_empty() {
        return "unauthorized".to_string();
    }
    let reasons = failures
        .iter()
        .map(|f| format!("{}: {}", f.authorizer, f.error))
        .collect::<Vec<_>>()
        .join(" | ");
    format!("unauthorized: {reasons}")
}

pub trait Authorizer: Send + Sync {
    /// Short name used to tag this authorizer's failures.
    fn kind(&self) -> &'static str;

    /// Validate the raw value of an `Authorization` header.
    fn authorize(&self, authorization_header: &str) -> Result<Vec<Principal>, AuthError>;
}

/// Strip the literal, case-sensitive `Bearer ` prefix.
pub fn bearer_token(authorization_header: &str) -> Result<&str, AuthError> {
    authorization_header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidSyntax)
}
