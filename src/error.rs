//! Daemon-wide error taxonomy
//!
//! Every user-visible failure is classified into one of the kinds below so
//! that the CRI and REST surfaces can map it to a stable status code. Messages
//! carry the operation and the affected id, never a backtrace.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Classification of a daemon error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No such container/image/sandbox/volume
    NotFound,

    /// Name or id already in use; incompatible state
    Conflict,

    /// Operation not permitted in the current state
    InvalidState,

    /// Validation failure on input
    InvalidArgument,

    /// Referenced entity prevents deletion
    InUse,

    /// Privilege, capability, or policy refusal
    PermissionDenied,

    /// Deadline exceeded
    Timeout,

    /// VM down, provider not ready
    Unavailable,

    /// Unexpected invariant violation
    Internal,

    /// Disk or network failure
    Io,
}

impl ErrorKind {
    /// Stable tag included in user-visible messages
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::InUse => "IN_USE",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Io => "IO",
        }
    }

    /// HTTP status for the REST and CRI surfaces
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidState => StatusCode::CONFLICT,
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::InUse => StatusCode::CONFLICT,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal | ErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a bounded local retry is worthwhile
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Io | ErrorKind::Unavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A classified daemon error with operation context
#[derive(Debug, Error)]
#[error("{op}: {message} [{kind}]")]
pub struct DaemonError {
    /// Error classification
    pub kind: ErrorKind,

    /// The operation that failed, e.g. `start_container`
    pub op: String,

    /// Affected entity id, if any
    pub id: Option<String>,

    /// Human-readable detail
    pub message: String,
}

impl DaemonError {
    pub fn new(kind: ErrorKind, op: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            op: op.into(),
            id: None,
            message: message.into(),
        }
    }

    /// Attach the affected entity id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn not_found(op: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(ErrorKind::NotFound, op, format!("no such entity: {}", id)).with_id(id)
    }

    pub fn conflict(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, op, message)
    }

    pub fn invalid_state(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, op, message)
    }

    pub fn invalid_argument(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, op, message)
    }

    pub fn in_use(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InUse, op, message)
    }

    pub fn timeout(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, op, message)
    }

    pub fn unavailable(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, op, message)
    }

    pub fn internal(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, op, message)
    }

    pub fn io(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, op, message)
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorKind::Conflict,
            _ => ErrorKind::Io,
        };
        Self::new(kind, "io", e.to_string())
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        let body = Json(json!({
            "error": true,
            "kind": self.kind.tag(),
            "op": self.op,
            "id": self.id,
            "message": self.message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Retry an async operation for transient kinds only.
///
/// At most 3 attempts within a 5 second budget; all other kinds surface
/// immediately.
pub async fn retry_transient<T, F, Fut>(op_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    let policy = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_elapsed_time(Some(Duration::from_secs(5)))
        .build();

    let attempts = AtomicU32::new(1);
    backoff::future::retry(policy, || {
        let future = f();
        let attempts = &attempts;
        async move {
            match future.await {
                Ok(v) => Ok(v),
                Err(e) if e.kind.is_transient() && attempts.load(Ordering::SeqCst) < 3 => {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(
                        "transient failure in {} (attempt {}): {}, retrying",
                        op_name,
                        attempt,
                        e
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_status_mapping() {
        assert_eq!(ErrorKind::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::InvalidState.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorKind::InvalidArgument.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ErrorKind::PermissionDenied.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ErrorKind::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ErrorKind::Unavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorKind::Internal.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_message_carries_kind_tag() {
        let err = DaemonError::not_found("start_container", "abc123");
        let rendered = err.to_string();
        assert!(rendered.contains("start_container"));
        assert!(rendered.contains("NOT_FOUND"));
        assert_eq!(err.id.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_retry_transient_gives_up_on_permanent() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<()> = retry_transient("op", move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(DaemonError::invalid_argument("op", "bad input"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_transient_retries_io() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<u32> = retry_transient("op", move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(DaemonError::io("op", "flaky disk"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }
}
