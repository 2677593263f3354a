// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use super::{AuthError, Authorizer, Failure, Principal};

/// Tries each authorizer in order and returns the first success.
///
/// This is a fallback, not a consensus: a rejection from one scheme does not
/// veto another. Absent entries are skipped.
#[derive(Default)]
pub struct ChainAuthorizer {
    authorizers: Vec<Arc<dyn Authorizer>>,
}

impl ChainAuthorizer {
    pub fn new<I>(authorizers: I) -> Self
    where
        I: IntoIterator<Item = Option<Arc<dyn Authorizer>>>,
    {
        Self {
            authorizers: authorizers.into_iter().flatten().collect(),
        }
    }
}

impl Authorizer for ChainAuthorizer {
    fn kind(&self) -> &'static str {
        "chain"
    }

    fn authorize(&self, authorization_header: &str) -> Result<Vec<Principal>, AuthError> {
        let mut failures = Vec::with_capacity(self.authorizers.len());
        for authorizer in &self.authorizers {
            match authorizer.authorize(authorization_header) {
                Ok(principals) => return Ok(principals),
                Err(error) => failures.push(Failure {
                    authorizer: authorizer.kind(),
                    error,
                }),
            }
        }
        Err(AuthError::Unauthorized(failures))
    }
}
