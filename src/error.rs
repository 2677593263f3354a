// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, error};

/// An error answered as `{"error": "<message>"}`.
///
/// Only the outermost context of the wrapped error reaches the client. The
/// full chain is logged, at `error` for server faults.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error, pub Option<StatusCode>);

impl AppError {
    pub fn new(status: StatusCode, message: &'static str) -> Self {
        Self(anyhow::anyhow!(message), Some(status))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.1.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(%status, "Request failed: {:?}", self.0);
        } else {
            debug!(%status, "Request rejected: {:?}", self.0);
        }
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

pub trait Status<T> {
    /// Add a HTTP status code to an error.
    fn status(self, status: StatusCode) -> Result<T, AppError>;
}

impl<T> Status<T> for anyhow::Result<T> {
    fn status(self, status: StatusCode) -> Result<T, AppError> {
        self.map_err(|e| AppError(e, Some(status)))
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into(), None)
    }
}
