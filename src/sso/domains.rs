// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use std::{collections::HashSet, sync::LazyLock};

use regex::Regex;

use crate::config::PolicyError;

/// Lowercased e-mail domains permitted to log in via SSO.
pub type AllowedDomains = HashSet<String>;

#[allow(clippy::expect_used)]
static EMAIL_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("E-mail pattern is valid")
});

/// Parse a comma-separated domain list into a trimmed, lowercased set.
pub fn parse_allowed_domains(value: &str) -> Result<AllowedDomains, PolicyError> {
    let domains: AllowedDomains = value
        .split(',')
        .map(|d| d.trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .collect();
    if domains.is_empty() {
        return Err(PolicyError::NoAllowedDomains);
    }
    Ok(domains)
}

/// Whether `email` is well formed and its domain is allowed verbatim.
///
/// Subdomains of an allowed domain are not accepted.
pub fn is_allowed_email_domain(email: &str, allowed: &AllowedDomains) -> bool {
    if allowed.is_empty() {
        return false;
    }
    let email = email.trim().to_lowercase();
    if !EMAIL_FORMAT.is_match(&email) {
        return false;
    }
    match email.split_once('@') {
        Some((_, domain)) if !domain.is_empty() && !domain.contains('@') => {
            allowed.contains(domain)
        }
        _ => false,
    }
}
