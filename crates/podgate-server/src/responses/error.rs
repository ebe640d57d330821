use std::borrow::Cow;

use podgate_controller::error::{Error, ErrorKind as ControllerErrorKind};

use axum::{
    extract::Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use serde::Serialize;

use tracing::{error, warn};

/// All possible errors that may cause a request to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Some data sent along with the request is invalid or malformed.
    InvalidData,
    /// The requested pod or device does not exist.
    NotFound,
    /// The remote registry, or another remote service, failed.
    Upstream,
    /// An internal error has occurred while handling the request.
    Internal,
}

impl ErrorKind {
    /// Returns the status code associated with the error kind.
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::InvalidData => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Upstream => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorKind,
    description: &'a str,
    info: Option<&'a str>,
}

/// A response providing details about an error encountered while handling
/// a request.
///
/// Contains an [`ErrorKind`], a general error description,
/// and optional information about the encountered error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    kind: ErrorKind,
    description: Cow<'static, str>,
    info: Option<String>,
}

impl ErrorResponse {
    /// Generates an [`ErrorResponse`].
    ///
    /// Requires specifying an [`ErrorKind`] and a general description.
    #[must_use]
    #[inline]
    pub fn with_description(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
            info: None,
        }
    }

    /// Generates an [`ErrorResponse`].
    ///
    /// Requires specifying an [`ErrorKind`], a general error
    /// description, and optional information about the encountered error.
    #[must_use]
    #[inline]
    pub fn with_description_error(
        kind: ErrorKind,
        description: impl Into<Cow<'static, str>>,
        info: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            description: description.into(),
            info: Some(info.into()),
        }
    }

    /// Generates an [`ErrorResponse`] for invalid data.
    #[must_use]
    #[inline]
    pub fn invalid_data(description: impl Into<Cow<'static, str>>) -> Self {
        Self::with_description(ErrorKind::InvalidData, description)
    }

    /// Generates an [`ErrorResponse`] for invalid data along with
    /// information about the encountered error.
    #[must_use]
    #[inline]
    pub fn invalid_data_with_error(
        description: impl Into<Cow<'static, str>>,
        info: impl Into<String>,
    ) -> Self {
        Self::with_description_error(ErrorKind::InvalidData, description, info)
    }

    /// Generates an [`ErrorResponse`] for a missing resource.
    #[must_use]
    #[inline]
    pub fn not_found(description: impl Into<Cow<'static, str>>) -> Self {
        Self::with_description(ErrorKind::NotFound, description)
    }

    /// Generates an [`ErrorResponse`] for an internal error along with
    /// information about the encountered error.
    #[must_use]
    #[inline]
    pub fn internal_with_error(
        description: impl Into<Cow<'static, str>>,
        info: impl Into<String>,
    ) -> Self {
        Self::with_description_error(ErrorKind::Internal, description, info)
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<Error> for ErrorResponse {
    fn from(e: Error) -> Self {
        let (kind, description) = match e.kind() {
            ControllerErrorKind::Ingestion => (ErrorKind::InvalidData, "Invalid device list"),
            ControllerErrorKind::Command => (ErrorKind::InvalidData, "Invalid device command"),
            ControllerErrorKind::Remote => (ErrorKind::Upstream, "Remote service failure"),
            ControllerErrorKind::Request | ControllerErrorKind::JsonResponse => {
                (ErrorKind::Upstream, "Remote service unreachable")
            }
            ControllerErrorKind::Configuration
            | ControllerErrorKind::Dispatch
            | ControllerErrorKind::StreamSession => (ErrorKind::Internal, "Internal failure"),
        };

        Self::with_description_error(kind, description, e.to_string())
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let info = self.info.as_deref().unwrap_or_default();

        if status.is_server_error() {
            error!("{}: {info}", self.description);
        } else {
            warn!("{}: {info}", self.description);
        }

        let body = ErrorBody {
            error: self.kind,
            description: &self.description,
            info: self.info.as_deref(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use podgate_controller::error::{Error, ErrorKind as ControllerErrorKind};

    use serde_json::{Value, json};

    use super::{ErrorKind, ErrorResponse};

    async fn body(response: ErrorResponse) -> (StatusCode, Value) {
        let response = response.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn controller_errors() {
        let cases = [
            (Error::new(ControllerErrorKind::Ingestion, "bad"), ErrorKind::InvalidData),
            (Error::new(ControllerErrorKind::Command, "big"), ErrorKind::InvalidData),
            (Error::new(ControllerErrorKind::JsonResponse, "garbled"), ErrorKind::Upstream),
            (Error::new(ControllerErrorKind::StreamSession, "closed"), ErrorKind::Internal),
            (Error::remote(401, "Unauthorized"), ErrorKind::Upstream),
            (Error::new(ControllerErrorKind::Request, "timeout"), ErrorKind::Upstream),
            (Error::new(ControllerErrorKind::Dispatch, "stopped"), ErrorKind::Internal),
        ];

        for (error, kind) in cases {
            assert_eq!(ErrorResponse::from(error).kind(), kind);
        }
    }

    #[tokio::test]
    async fn remote_error_body() {
        let (status, body) = body(Error::remote(500, "registry failure").into()).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(
            body,
            json!({
                "error": "Upstream",
                "description": "Remote service failure",
                "info": "Remote Registry (500): registry failure",
            })
        );
    }

    #[tokio::test]
    async fn plain_error_body() {
        let (status, body) = body(ErrorResponse::not_found("Pod not found")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body,
            json!({ "error": "NotFound", "description": "Pod not found", "info": null })
        );
    }
}
