// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use config::builder::{ConfigBuilder, DefaultState};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    auth::{static_token::StaticTokens, Principal},
    signer::DEFAULT_CERT_VALIDITY,
    sso::domains::{parse_allowed_domains, AllowedDomains},
};

/// Service configuration: an optional TOML file overlaid by the environment.
///
/// Environment variables are unprefixed, so `CA_ACCESS_TOKEN` sets
/// `ca_access_token` and so on.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Static bearer tokens, `token:principal,principal;token:principal`
    #[serde(default)]
    pub ca_access_token: String,
    /// Comma-separated e-mail domains allowed to log in via SSO
    #[serde(default)]
    pub sso_allowed_domains: String,
    /// HMAC secret for session tokens, used verbatim
    #[serde(default)]
    pub app_jwt_secret: String,
    #[serde(default)]
    pub google_client_id: String,
    #[serde(default)]
    pub google_client_secret: String,
    #[serde(default = "default_oidc_issuer")]
    pub oidc_issuer: Url,
    /// The externally visible base URL of this service
    #[serde(default = "default_public_url")]
    pub public_url: Url,
    #[serde(default = "default_ca_key_path")]
    pub ca_key_path: PathBuf,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: PathBuf,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: PathBuf,
    #[serde(default = "default_cert_validity_secs")]
    pub cert_validity_secs: u64,
    /// Extensions granted on every certificate, e.g. `permit-pty`
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Full,
    Json,
}

const SECRETS_DIR: &str = "/run/ca-service";

fn default_oidc_issuer() -> Url {
    #[allow(clippy::expect_used)]
    Url::parse("https://accounts.google.com").expect("Default issuer is a valid URL")
}

fn default_public_url() -> Url {
    #[allow(clippy::expect_used)]
    Url::parse("https://localhost:8443").expect("Default public URL is a valid URL")
}

fn default_ca_key_path() -> PathBuf {
    Path::new(SECRETS_DIR).join("ssh/ca_key")
}

fn default_tls_cert_path() -> PathBuf {
    Path::new(SECRETS_DIR).join("https/ca-service-local.cert.pem")
}

fn default_tls_key_path() -> PathBuf {
    Path::new(SECRETS_DIR).join("https/ca-service-local.key.pem")
}

fn default_cert_validity_secs() -> u64 {
    DEFAULT_CERT_VALIDITY.as_secs()
}

impl Config {
    pub fn load(config_file_path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(config_file_path) = config_file_path {
            builder = builder.add_source(config::File::from(config_file_path));
        };
        Self::build(builder.add_source(config::Environment::default()))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("Could not build config description.")?
            .try_deserialize()
            .context("Could not build config.")
    }

    /// Whether OAuth client credentials were provided.
    pub fn has_sso_credentials(&self) -> bool {
        !self.google_client_id.is_empty() && !self.google_client_secret.is_empty()
    }

    /// The callback below `public_url`, which is treated as a directory.
    pub fn redirect_uri(&self) -> Result<Url> {
        let mut base = self.public_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join("auth/google/callback")
            .context("Could not build the OAuth redirect URI.")
    }

    pub fn load_ca_key(&self) -> Result<ssh_key::PrivateKey> {
        ssh_key::PrivateKey::read_openssh_file(&self.ca_key_path).with_context(|| {
            format!(
                "Could not load CA key from `{}`.",
                self.ca_key_path.display()
            )
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("CA_ACCESS_TOKEN is empty")]
    EmptyAccessTokens,
    #[error("invalid token principals format")]
    InvalidTokenFormat,
    #[error("SSO_ALLOWED_DOMAINS is empty or has no valid domains")]
    NoAllowedDomains,
}

/// Parse `token:principal,principal;token:principal`.
///
/// Empty principals are kept as they are (`t:a,,b` gives `["a", "", "b"]`).
pub fn parse_static_tokens(value: &str) -> Result<StaticTokens, PolicyError> {
    if value.trim().is_empty() {
        return Err(PolicyError::EmptyAccessTokens);
    }
    value
        .split(';')
        .map(|entry| {
            let (token, principals) = entry
                .split_once(':')
                .filter(|(_, principals)| !principals.contains(':'))
                .ok_or(PolicyError::InvalidTokenFormat)?;
            if token.is_empty() {
                return Err(PolicyError::InvalidTokenFormat);
            }
            Ok((
                token.to_string(),
                principals.split(',').map(Principal::new).collect(),
            ))
        })
        .collect()
}

/// Who may ask for certificates, as configured at startup.
#[derive(Debug, Default)]
pub struct AccessPolicy {
    pub static_tokens: StaticTokens,
    /// Empty when SSO domain parsing failed, which rejects every SSO login
    pub allowed_domains: AllowedDomains,
}

impl AccessPolicy {
    /// Parse both access lists. A list that fails to parse disables its
    /// login route; it is an error only if both fail.
    pub fn from_env_strings(ca_access_token: &str, sso_allowed_domains: &str) -> Result<Self> {
        let static_tokens = parse_static_tokens(ca_access_token);
        match &static_tokens {
            Ok(tokens) => info!(
                count = tokens.len(),
                "Static tokens parsed from CA_ACCESS_TOKEN."
            ),
            Err(e) => error!(env = "CA_ACCESS_TOKEN", "Static token parser failed: {e}"),
        }

        let allowed_domains = parse_allowed_domains(sso_allowed_domains);
        match &allowed_domains {
            Ok(domains) => info!(
                count = domains.len(),
                "SSO allowed domains parsed from SSO_ALLOWED_DOMAINS."
            ),
            Err(e) => error!(
                env = "SSO_ALLOWED_DOMAINS",
                "SSO allowed domains parser failed: {e}"
            ),
        }

        match (static_tokens, allowed_domains) {
            (Err(token_err), Err(domain_err)) => {
                bail!("Neither static tokens nor SSO domains are usable: {token_err}; {domain_err}")
            }
            (static_tokens, allowed_domains) => {
                let policy = Self {
                    static_tokens: static_tokens.unwrap_or_default(),
                    allowed_domains: allowed_domains.unwrap_or_default(),
                };
                if policy.allowed_domains.is_empty() {
                    warn!("SSO logins will be rejected.");
                }
                Ok(policy)
            }
        }
    }
}

#[allow(clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tokens(entries: Vec<(&str, Vec<&str>)>) -> StaticTokens {
        entries
            .into_iter()
            .map(|(token, principals)| {
                (
                    token.to_string(),
                    principals.iter().map(|p| Principal::new(*p)).collect(),
                )
            })
            .collect()
    }

    #[rstest::rstest]
    #[case("token1:user1", vec![("token1", vec!["user1"])])]
    #[case("token1:user1,admin,root", vec![("token1", vec!["user1", "admin", "root"])])]
    #[case(
        "token1:user1,admin;token2:user2",
        vec![("token1", vec!["user1", "admin"]), ("token2", vec!["user2"])]
    )]
    #[case("token1:", vec![("token1", vec![""])])]
    #[case("token1:user1,,user2", vec![("token1", vec!["user1", "", "user2"])])]
    #[case(
        "token1:user1;token2:user2,admin;token3:root",
        vec![("token1", vec!["user1"]), ("token2", vec!["user2", "admin"]), ("token3", vec!["root"])]
    )]
    fn parses_static_tokens(#[case] value: &str, #[case] expected: Vec<(&str, Vec<&str>)>) {
        assert_eq!(
            parse_static_tokens(value).expect("Should parse."),
            tokens(expected)
        );
    }

    #[rstest::rstest]
    #[case("", PolicyError::EmptyAccessTokens)]
    #[case("  \t ", PolicyError::EmptyAccessTokens)]
    #[case("token1user1", PolicyError::InvalidTokenFormat)]
    #[case("token1:user1:extra", PolicyError::InvalidTokenFormat)]
    #[case(":user1", PolicyError::InvalidTokenFormat)]
    #[case("token1:user1;", PolicyError::InvalidTokenFormat)]
    #[case("token1:user1;token2", PolicyError::InvalidTokenFormat)]
    fn rejects_bad_static_tokens(#[case] value: &str, #[case] expected: PolicyError) {
        assert_eq!(parse_static_tokens(value), Err(expected));
    }

    #[test]
    fn messages_name_the_variables() {
        assert_eq!(
            PolicyError::EmptyAccessTokens.to_string(),
            "CA_ACCESS_TOKEN is empty"
        );
        assert_eq!(
            PolicyError::InvalidTokenFormat.to_string(),
            "invalid token principals format"
        );
    }

    #[test]
    fn both_lists_usable() -> Result<()> {
        let policy = AccessPolicy::from_env_strings("t:alice", "example.com")?;

        assert_eq!(policy.static_tokens, tokens(vec![("t", vec!["alice"])]));
        assert!(policy.allowed_domains.contains("example.com"));

        Ok(())
    }

    #[test]
    fn static_tokens_alone_are_enough() -> Result<()> {
        let policy = AccessPolicy::from_env_strings("t:alice", "")?;

        assert_eq!(policy.static_tokens.len(), 1);
        assert!(policy.allowed_domains.is_empty());

        Ok(())
    }

    #[test]
    fn sso_domains_alone_are_enough() -> Result<()> {
        let policy = AccessPolicy::from_env_strings("not a token table", "example.com")?;

        assert!(policy.static_tokens.is_empty());
        assert_eq!(policy.allowed_domains.len(), 1);

        Ok(())
    }

    #[test]
    fn failing_both_is_fatal() {
        assert!(AccessPolicy::from_env_strings("", " , ").is_err());
    }

    fn from_toml(toml: &str) -> Result<Config> {
        Config::build(
            config::Config::builder()
                .add_source(config::File::from_str(toml, config::FileFormat::Toml)),
        )
    }

    #[test]
    fn defaults() -> Result<()> {
        let config = from_toml("")?;

        assert_eq!(
            config.redirect_uri()?.as_str(),
            "https://localhost:8443/auth/google/callback"
        );
        assert_eq!(config.oidc_issuer.as_str(), "https://accounts.google.com/");
        assert_eq!(config.ca_key_path, PathBuf::from("/run/ca-service/ssh/ca_key"));
        assert_eq!(config.cert_validity_secs, 1800);
        assert_eq!(config.log_format, LogFormat::Full);
        assert!(config.extensions.is_empty());
        assert!(!config.has_sso_credentials());

        Ok(())
    }

    #[rstest::rstest]
    #[case("https://ca.example.com", "https://ca.example.com/auth/google/callback")]
    #[case("https://h.example.com/ca", "https://h.example.com/ca/auth/google/callback")]
    #[case("https://h.example.com/ca/", "https://h.example.com/ca/auth/google/callback")]
    fn redirect_uri_keeps_public_url_path(
        #[case] public_url: &str,
        #[case] expected: &str,
    ) -> Result<()> {
        let config = from_toml(&format!("public_url = \"{public_url}\""))?;

        assert_eq!(config.redirect_uri()?.as_str(), expected);

        Ok(())
    }

    #[test]
    fn file_values() -> Result<()> {
        let config = from_toml(
            r#"
            ca_access_token = "t:alice"
            google_client_id = "id"
            google_client_secret = "secret"
            public_url = "https://ca.example.com/"
            cert_validity_secs = 600
            extensions = ["permit-pty"]
            log_format = "json"
            "#,
        )?;

        assert_eq!(config.ca_access_token, "t:alice");
        assert!(config.has_sso_credentials());
        assert_eq!(
            config.redirect_uri()?.as_str(),
            "https://ca.example.com/auth/google/callback"
        );
        assert_eq!(config.cert_validity_secs, 600);
        assert_eq!(config.extensions, vec!["permit-pty".to_string()]);
        assert_eq!(config.log_format, LogFormat::Json);

        Ok(())
    }
}
