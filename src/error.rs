//! Error taxonomy shared by the HTTP and gRPC adapters
//!
//! Every failure a request can hit is a [`ServingError`]. Its [`Code`] is the
//! single place where failures are translated into HTTP statuses and gRPC codes.

use crate::api::json;
use crate::session::{SessionCode, SessionError};
use crate::tensor::MarshalError;
use axum::extract::rejection::BytesRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use thiserror::Error;
use tonic::metadata::MetadataMap;

/// Protocol-neutral status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArgument,
    NotFound,
    MethodNotAllowed,
    AlreadyExists,
    FailedPrecondition,
    Internal,
    Unimplemented,
    ResourceExhausted,
    PayloadTooLarge,
    DeadlineExceeded,
}

impl Code {
    pub fn http_status(self) -> StatusCode {
        match self {
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Code::AlreadyExists => StatusCode::CONFLICT,
            Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            Code::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Code::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn grpc_code(self) -> tonic::Code {
        match self {
            Code::InvalidArgument => tonic::Code::InvalidArgument,
            Code::NotFound => tonic::Code::NotFound,
            Code::MethodNotAllowed | Code::Unimplemented => tonic::Code::Unimplemented,
            Code::AlreadyExists => tonic::Code::AlreadyExists,
            Code::FailedPrecondition => tonic::Code::FailedPrecondition,
            Code::Internal => tonic::Code::Internal,
            Code::ResourceExhausted | Code::PayloadTooLarge => tonic::Code::ResourceExhausted,
            Code::DeadlineExceeded => tonic::Code::DeadlineExceeded,
        }
    }
}

impl From<SessionCode> for Code {
    fn from(code: SessionCode) -> Self {
        match code {
            SessionCode::InvalidArgument => Code::InvalidArgument,
            SessionCode::NoSuchFile | SessionCode::NoModel => Code::FailedPrecondition,
            SessionCode::NotImplemented => Code::Unimplemented,
            SessionCode::Fail
            | SessionCode::EngineError
            | SessionCode::RuntimeException
            | SessionCode::InvalidGraph => Code::Internal,
        }
    }
}

/// Request-level failure
#[derive(Debug, Error)]
pub enum ServingError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("duplicate input name: {0}")]
    AlreadyExists(String),

    #[error("{0}")]
    ResourceExhausted(String),

    #[error("request body too large: {0}")]
    PayloadTooLarge(String),

    #[error("no route for {0}")]
    NotFound(String),

    #[error("method {method} is not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("model run exceeded the {}ms deadline", .0.as_millis())]
    DeadlineExceeded(Duration),

    #[error("Run() failed: {0}")]
    Session(#[from] SessionError),

    #[error("{0}")]
    Internal(String),
}

impl ServingError {
    pub fn code(&self) -> Code {
        match self {
            ServingError::InvalidArgument(_) => Code::InvalidArgument,
            ServingError::AlreadyExists(_) => Code::AlreadyExists,
            ServingError::ResourceExhausted(_) => Code::ResourceExhausted,
            ServingError::PayloadTooLarge(_) => Code::PayloadTooLarge,
            ServingError::NotFound(_) => Code::NotFound,
            ServingError::MethodNotAllowed { .. } => Code::MethodNotAllowed,
            ServingError::DeadlineExceeded(_) => Code::DeadlineExceeded,
            ServingError::Session(err) => err.code.into(),
            ServingError::Internal(_) => Code::Internal,
        }
    }

    /// Classify a marshaling failure of the named input
    pub fn from_marshal(input: &str, err: MarshalError) -> Self {
        match err {
            MarshalError::Allocation(_) => {
                ServingError::ResourceExhausted(format!("input '{input}': {err}"))
            }
            _ => ServingError::InvalidArgument(format!("input '{input}': {err}")),
        }
    }

    /// Classify a request body that could not be buffered
    pub fn from_body_rejection(rejection: BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServingError::PayloadTooLarge(rejection.body_text())
        } else {
            ServingError::InvalidArgument(rejection.body_text())
        }
    }

    /// gRPC status carrying `metadata` as trailers
    pub fn to_status(&self, metadata: MetadataMap) -> tonic::Status {
        tonic::Status::with_metadata(self.code().grpc_code(), self.to_string(), metadata)
    }
}

impl IntoResponse for ServingError {
    fn into_response(self) -> Response {
        let status = self.code().http_status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }

        let mut response = (status, json::encode_error(status, &self.to_string())).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorError;

    #[test]
    fn test_translation_table() {
        let cases = [
            (Code::InvalidArgument, 400, tonic::Code::InvalidArgument),
            (Code::NotFound, 404, tonic::Code::NotFound),
            (Code::MethodNotAllowed, 405, tonic::Code::Unimplemented),
            (Code::AlreadyExists, 409, tonic::Code::AlreadyExists),
            (Code::FailedPrecondition, 412, tonic::Code::FailedPrecondition),
            (Code::Internal, 500, tonic::Code::Internal),
            (Code::Unimplemented, 501, tonic::Code::Unimplemented),
            (Code::ResourceExhausted, 503, tonic::Code::ResourceExhausted),
            (Code::PayloadTooLarge, 413, tonic::Code::ResourceExhausted),
            (Code::DeadlineExceeded, 504, tonic::Code::DeadlineExceeded),
        ];

        for (code, http, grpc) in cases {
            assert_eq!(code.http_status().as_u16(), http, "{code:?}");
            assert_eq!(code.grpc_code(), grpc, "{code:?}");
        }
    }

    #[test]
    fn test_session_codes() {
        let code = |session: SessionCode| {
            ServingError::from(SessionError::new(session, "boom")).code()
        };

        assert_eq!(code(SessionCode::InvalidArgument), Code::InvalidArgument);
        assert_eq!(code(SessionCode::NoSuchFile), Code::FailedPrecondition);
        assert_eq!(code(SessionCode::NoModel), Code::FailedPrecondition);
        assert_eq!(code(SessionCode::NotImplemented), Code::Unimplemented);
        assert_eq!(code(SessionCode::RuntimeException), Code::Internal);
        assert_eq!(code(SessionCode::Fail), Code::Internal);
    }

    #[test]
    fn test_session_message_preserved() {
        let err = ServingError::from(SessionError::new(
            SessionCode::RuntimeException,
            "Non-zero status code returned while running Add node",
        ));
        assert!(err.to_string().contains("Non-zero status code returned"));
    }

    #[test]
    fn test_marshal_classification() {
        let err = ServingError::from_marshal("X", MarshalError::InvalidType(42));
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.to_string().starts_with("input 'X':"));

        let err = ServingError::from_marshal(
            "X",
            MarshalError::Allocation(AllocatorError::BudgetExceeded {
                requested: 10,
                available: 0,
                budget: 8,
            }),
        );
        assert_eq!(err.code(), Code::ResourceExhausted);
    }

    #[test]
    fn test_grpc_status_keeps_metadata() {
        let mut metadata = MetadataMap::new();
        metadata.insert("x-ms-request-id", "abc".parse().unwrap());

        let status = ServingError::InvalidArgument("bad".to_string()).to_status(metadata);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "bad");
        assert_eq!(status.metadata().get("x-ms-request-id").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_http_response() {
        use http_body_util::BodyExt;

        let response = ServingError::AlreadyExists("X".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            &body[..],
            b"{\"error_code\": 409, \"error_message\": \"duplicate input name: X\"}\n"
        );
    }
}
