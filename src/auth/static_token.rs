// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use super::{bearer_token, AuthError, Authorizer, Principal};

/// Token to principals, as parsed from `CA_ACCESS_TOKEN`.
pub type StaticTokens = HashMap<String, Vec<Principal>>;

/// Validates bearer tokens against a fixed table.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    tokens: StaticTokens,
}

impl StaticAuthorizer {
    pub fn new(tokens: StaticTokens) -> Self {
        Self { tokens }
    }
}

impl Authorizer for StaticAuthorizer {
    fn kind(&self) -> &'static str {
        "static"
    }

    fn authorize(&self, authorization_header: &str) -> Result<Vec<Principal>, AuthError> {
        let token = bearer_token(authorization_header)?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::UnknownToken)
    }
}
