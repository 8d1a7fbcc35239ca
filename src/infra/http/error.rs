use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use vitae_api_types::{Envelope, codes};

use crate::application::cv::transfer::TransferError;
use crate::application::cv::{BackendError, CvServiceError};
use crate::application::error::ErrorReport;

/// An error rendered as a failure envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    detail: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            detail: None,
        }
    }

    /// Extra diagnostic for the logs; never sent to the client.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHORIZED,
            "Admin token required",
        )
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, codes::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message)
    }

    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::INVALID_DOCUMENT, message)
    }

    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::UNSUPPORTED_FORMAT, message)
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            codes::PAYLOAD_TOO_LARGE,
            format!("Request body exceeds {limit} bytes"),
        )
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, codes::UPSTREAM, message)
    }

    pub fn upstream_timeout() -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            codes::UPSTREAM_TIMEOUT,
            "Storage did not respond in time",
        )
    }
}

impl From<CvServiceError> for ApiError {
    fn from(err: CvServiceError) -> Self {
        let mapped = match err.backend() {
            Some(BackendError::NotFound) => Self::not_found("CV document not found"),
            Some(BackendError::Invalid(message)) => Self::invalid_document(message.clone()),
            Some(BackendError::Timeout(_)) => Self::upstream_timeout(),
            Some(BackendError::Unavailable(_)) => Self::upstream("CV storage is not available"),
            Some(BackendError::Unauthorized(_) | BackendError::Upstream { .. }) => {
                Self::upstream("CV storage request failed")
            }
            None => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::UNKNOWN,
                "Unexpected error occurred",
            ),
        };
        mapped.with_detail(err.to_string())
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        let mapped = match &err {
            TransferError::Invalid(domain) => Self::invalid_document(domain.to_string()),
            TransferError::Parse { .. } => Self::bad_request(err.to_string()),
            TransferError::Unrecognized => Self::unsupported_format(err.to_string()),
            TransferError::EncodeJson(_) | TransferError::EncodeYaml(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::UNKNOWN,
                "Document could not be serialized",
            ),
        };
        mapped.with_detail(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.detail.as_deref().unwrap_or(&self.message);
        let report = ErrorReport::from_message(
            "infra::http::api",
            self.status,
            format!("{}: {}", self.code, detail),
        );
        let body: Envelope<()> = Envelope::failure(self.code, self.message);
        let mut response = (self.status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}
