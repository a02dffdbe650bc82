//! Request authentication
//!
//! Selected at startup: none, TLS client certificates (enforced by the TLS
//! listener), bearer token, or an API key header.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::config::AuthMode;
use crate::error::DaemonError;

use super::router::ApiState;

pub async fn require_auth(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, DaemonError> {
    let api = &state.config.api;

    match api.auth {
        // TLS client-cert auth happens at the listener; nothing to check here
        AuthMode::None | AuthMode::Tls => {}
        AuthMode::Bearer => {
            let authorized = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|token| !api.auth_token.is_empty() && token == api.auth_token)
                .unwrap_or(false);
            if !authorized {
                return Err(DaemonError::new(
                    crate::error::ErrorKind::PermissionDenied,
                    "auth",
                    "missing or invalid bearer token",
                ));
            }
        }
        AuthMode::ApiKey => {
            let authorized = request
                .headers()
                .get(api.api_key_header.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|key| !api.auth_token.is_empty() && key == api.auth_token)
                .unwrap_or(false);
            if !authorized {
                return Err(DaemonError::new(
                    crate::error::ErrorKind::PermissionDenied,
                    "auth",
                    "missing or invalid api key",
                ));
            }
        }
    }

    Ok(next.run(request).await)
}
