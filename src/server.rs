// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use axum_extra::{headers::UserAgent, TypedHeader};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use hyper_util::{
    rt::{TokioExecutor, TokioTimer},
    server::conn::auto,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use ssh_key::{Algorithm, PublicKey};
use tower_http::{
    timeout::{RequestBodyTimeoutLayer, TimeoutError, TimeoutLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};

use crate::{
    auth::{Authorizer, Principals},
    error::{AppError, Status},
    signer::CertificateSigner,
    sso::{self, SsoController},
};

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(2);
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(1);
const HANDLER_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HTTP2_STREAMS: u32 = 16;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Everything the handlers share. Immutable once the server is running.
pub struct AppState {
    pub signer: Arc<dyn CertificateSigner>,
    pub authorizer: Arc<dyn Authorizer>,
    pub sso: SsoController,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/auth/google/login",
            get(sso::login).fallback(method_not_allowed),
        )
        .route(
            "/auth/google/callback",
            get(sso::callback).fallback(method_not_allowed),
        )
        .route(
            "/auth/logout",
            post(sso::logout).fallback(method_not_allowed),
        )
        .route(
            "/sign",
            post(sign)
                .route_layer(middleware::from_fn_with_state(state.clone(), authorize))
                .fallback(method_not_allowed),
        )
        .route("/health", get(health).fallback(method_not_allowed))
        .route("/public_key", get(public_key).fallback(method_not_allowed))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(RequestBodyTimeoutLayer::new(BODY_READ_TIMEOUT))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            HANDLER_TIMEOUT,
        ))
        .layer(middleware::map_response(timeout_as_json))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Load the TLS certificate chain and key. Only HTTP/1.1 is offered over
/// ALPN, as HTTP/2 has no header-read timer.
async fn load_tls(tls_cert: &Path, tls_key: &Path) -> Result<RustlsConfig> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        debug!("A rustls crypto provider was already installed.");
    }
    let tls_config = RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .with_context(|| {
            format!(
                "Could not load TLS materials from `{}` and `{}`.",
                tls_cert.display(),
                tls_key.display()
            )
        })?;
    let mut server_config = (*tls_config.get_inner()).clone();
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    tls_config.reload_from_config(Arc::new(server_config));
    Ok(tls_config)
}

fn configure_connections(builder: &mut auto::Builder<TokioExecutor>) {
    // Also closes idle keep-alive connections.
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    // HTTP/2 is only reachable with prior knowledge.
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(IDLE_TIMEOUT)
        .keep_alive_timeout(KEEP_ALIVE_ACK_TIMEOUT)
        .max_concurrent_streams(MAX_HTTP2_STREAMS);
}

/// Serve over TLS until SIGINT or SIGTERM.
pub async fn serve(
    app: Router,
    addr: SocketAddr,
    tls_cert: &Path,
    tls_key: &Path,
) -> Result<()> {
    let tls_config = load_tls(tls_cert, tls_key).await?;

    let handle = Handle::new();
    tokio::spawn(graceful_shutdown(handle.clone()));

    let mut server = axum_server::bind_rustls(addr, tls_config).handle(handle);
    configure_connections(server.http_builder());

    info!(%addr, "Starting server.");
    server
        .serve(app.into_make_service())
        .await
        .context("Server failed.")?;
    Ok(())
}

async fn graceful_shutdown(handle: Handle) {
    shutdown_signal().await;
    info!("Shutting down.");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[allow(clippy::expect_used)]
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        #[allow(clippy::expect_used)]
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Run the authorizer on the raw `Authorization` header and attach the
/// principals to the request.
async fn authorize(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();
    match state.authorizer.authorize(&authorization) {
        Ok(principals) => {
            request.extensions_mut().insert(Principals(principals));
            next.run(request).await
        }
        Err(err) => {
            info!("Request rejected by the authorizer: {err}");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignRequest {
    public_key: String,
}

#[derive(Debug, Serialize)]
struct SignResponse {
    signed_cert: String,
}

#[tracing::instrument(
    err(Debug),
    skip_all,
    fields(
        user_agent = &user_agent.map(|h| h.0.to_string()),
        fingerprint = tracing::field::Empty,
    )
)]
async fn sign(
    State(state): State<Arc<AppState>>,
    principals: Option<Extension<Principals>>,
    user_agent: Option<TypedHeader<UserAgent>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<SignResponse>, AppError> {
    let Some(Extension(Principals(principals))) = principals else {
        return Err(AppError::new(StatusCode::UNAUTHORIZED, "unauthorized"));
    };
    let body = body.map_err(body_read_error)?;
    let payload: SignRequest = serde_json::from_slice(&body)
        .context("failed to decode request body")
        .status(StatusCode::BAD_REQUEST)?;
    let user_key = PublicKey::from_openssh(payload.public_key.trim())
        .context("failed to parse public key")
        .status(StatusCode::BAD_REQUEST)?;
    tracing::Span::current().record(
        "fingerprint",
        tracing::field::display(user_key.fingerprint(Default::default())),
    );
    if user_key.algorithm() != Algorithm::Ed25519 {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "only ed25519 keys are supported",
        ));
    }

    debug!("Signing an SSH key");
    let certificate = state
        .signer
        .sign_user_key(&user_key, &principals)
        .context("failed to sign certificate")
        .status(StatusCode::INTERNAL_SERVER_ERROR)?;
    let signed_cert = certificate
        .to_openssh()
        .context("failed to sign certificate")
        .status(StatusCode::INTERNAL_SERVER_ERROR)?;
    info!(
        valid_after = certificate.valid_after(),
        valid_before = certificate.valid_before(),
        principals = ?certificate.valid_principals(),
        serial = certificate.serial(),
        "Signed a certificate."
    );
    Ok(Json(SignResponse { signed_cert }))
}

fn body_read_error(rejection: BytesRejection) -> AppError {
    let timed_out = std::iter::successors(
        Some(&rejection as &(dyn std::error::Error + 'static)),
        |e| e.source(),
    )
    .any(|e| e.is::<TimeoutError>());
    if timed_out {
        return AppError(
            anyhow::Error::new(rejection).context("request timed out"),
            Some(StatusCode::REQUEST_TIMEOUT),
        );
    }
    let status = rejection.status();
    AppError(
        anyhow::Error::new(rejection).context("failed to decode request body"),
        Some(status),
    )
}

/// The CA public key in OpenSSH form, for `TrustedUserCAKeys`.
#[tracing::instrument(skip_all)]
async fn public_key(State(state): State<Arc<AppState>>) -> Result<String, AppError> {
    Ok(state
        .signer
        .ca_public_key()
        .context("No CA key is loaded.")?
        .to_openssh()?)
}

#[tracing::instrument(skip_all)]
async fn health() -> Json<serde_json::Value> {
    Json(json!({}))
}

/// The timeout layers answer with an empty body.
async fn timeout_as_json(response: Response) -> Response {
    if response.status() == StatusCode::REQUEST_TIMEOUT
        && !response.headers().contains_key(header::CONTENT_TYPE)
    {
        return AppError::new(StatusCode::REQUEST_TIMEOUT, "request timed out").into_response();
    }
    response
}

async fn method_not_allowed() -> AppError {
    AppError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

async fn not_found() -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not found")
}
