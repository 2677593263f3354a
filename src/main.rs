// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use crate::{
    auth::{
        chain::ChainAuthorizer, session::SessionAuthorizer, static_token::StaticAuthorizer,
        Authorizer,
    },
    config::{AccessPolicy, Config, LogFormat},
    server::AppState,
    signer::SshSigner,
    sso::{
        provider::{IdentityProvider, OidcProvider},
        SsoController, SsoSettings,
    },
};

mod auth;
mod clock;
mod config;
mod error;
mod server;
mod signer;
mod sso;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn version() -> &'static str {
    built_info::GIT_VERSION.unwrap_or(built_info::PKG_VERSION)
}

#[derive(Parser)]
#[command(version = version(), about, long_about = None)]
/// SSH user certificate authority
struct Args {
    /// the config file
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// the port to open the service on
    #[arg(long, default_value_t = 8443)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let sub = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env());
    match config.log_format {
        LogFormat::Full => sub.init(),
        LogFormat::Json => sub.json().init(),
    };
    info!("Starting SSH CA {}", version());

    let policy =
        AccessPolicy::from_env_strings(&config.ca_access_token, &config.sso_allowed_domains)?;

    let ca_key = config.load_ca_key()?;
    info!(
        fingerprint = %ca_key.fingerprint(Default::default()),
        "Loaded the CA key."
    );
    let signer = SshSigner::new(Some(ca_key))
        .with_validity(Duration::from_secs(config.cert_validity_secs))
        .with_extensions(config.extensions.clone());

    let sessions = Arc::new(SessionAuthorizer::new(config.app_jwt_secret.as_str()));
    if !sessions.is_configured() {
        warn!("APP_JWT_SECRET is not set, session tokens are disabled.");
    }
    let authorizer = ChainAuthorizer::new([
        Some(sessions.clone() as Arc<dyn Authorizer>),
        Some(Arc::new(StaticAuthorizer::new(policy.static_tokens)) as Arc<dyn Authorizer>),
    ]);

    let redirect_uri = config.redirect_uri()?;
    let provider: Option<Arc<dyn IdentityProvider>> = if config.has_sso_credentials() {
        match OidcProvider::discover(
            config.oidc_issuer.clone(),
            config.google_client_id.clone(),
            config.google_client_secret.clone(),
            redirect_uri.clone(),
        )
        .await
        {
            Ok(provider) => Some(Arc::new(provider)),
            Err(e) => {
                warn!("SSO disabled, provider discovery failed: {e:?}");
                None
            }
        }
    } else {
        info!("No OAuth client credentials configured, SSO is disabled.");
        None
    };
    let sso = SsoController::new(
        SsoSettings {
            client_id: config.google_client_id.clone(),
            client_secret: config.google_client_secret.clone(),
            redirect_uri,
            allowed_domains: policy.allowed_domains,
        },
        sessions,
        provider,
    );
    if sso.is_enabled() {
        info!("SSO login is enabled.");
    }

    let state = Arc::new(AppState {
        signer: Arc::new(signer),
        authorizer: Arc::new(authorizer),
        sso,
    });
    let app = server::router(state);
    let addr = std::net::SocketAddr::new("::".parse()?, args.port);
    server::serve(app, addr, &config.tls_cert_path, &config.tls_key_path).await?;

    info!("Exiting.");
    Ok(())
}
