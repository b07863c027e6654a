//! S3-compatible error types.
//!
//! Every variant maps to a well-known S3 error code with a fixed HTTP
//! status.  Variants carrying a `message` let handlers substitute a more
//! specific text (for example the backend's own error message) while
//! keeping the code and status.  The enum implements
//! [`axum::response::IntoResponse`]; dispatch code prefers
//! [`S3Error::into_response_for`] so the `Resource` element names the
//! request path.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::backend::{BackendError, BackendErrorKind};
use crate::xml::render_error;

/// Value of the `Server` response header.
pub const SERVER_NAME: &str = "cloudmux";

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    #[error("{message}")]
    AccessDenied { message: String },

    #[error("The specified bucket does not exist")]
    NoSuchBucket,

    #[error("The specified key does not exist.")]
    NoSuchKey,

    #[error("The AWS Access Key Id you provided does not exist in our records.")]
    InvalidAccessKeyId,

    #[error("The request signature we calculated does not match the signature you provided. Check your key and signing method.")]
    SignatureDoesNotMatch,

    /// Catch-all; carries the underlying (often backend) message.
    #[error("{message}")]
    InternalError { message: String },

    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    #[error("{message}")]
    InvalidPart { message: String },

    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload,

    #[error("{message}")]
    InvalidRequest { message: String },

    #[error("You must provide the Content-Length HTTP header.")]
    MissingContentLength,

    #[error("Part number must be an integer between 1 and 10000, inclusive.")]
    InvalidPartNumber,

    #[error("Your proposed upload exceeds the maximum allowed object size.")]
    EntityTooLarge,

    #[error("The requested range is not satisfiable")]
    InvalidRange,

    #[error("The requested bucket name is not available. The bucket namespace is shared by all users of the system. Please select a different name and try again.")]
    BucketAlreadyExists,

    #[error("The specified method is not allowed against this resource.")]
    MethodNotAllowed,
}

impl S3Error {
    pub fn access_denied() -> Self {
        S3Error::AccessDenied {
            message: "Access Denied".to_string(),
        }
    }

    pub fn internal() -> Self {
        S3Error::InternalError {
            message: "We encountered an internal error. Please try again.".to_string(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        S3Error::InvalidRequest {
            message: message.into(),
        }
    }

    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::AccessDenied { .. } => "AccessDenied",
            S3Error::NoSuchBucket => "NoSuchBucket",
            S3Error::NoSuchKey => "NoSuchKey",
            S3Error::InvalidAccessKeyId => "InvalidAccessKeyId",
            S3Error::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            S3Error::InternalError { .. } => "InternalError",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::InvalidPart { .. } => "InvalidPart",
            S3Error::NoSuchUpload => "NoSuchUpload",
            S3Error::InvalidRequest { .. } => "InvalidRequest",
            S3Error::MissingContentLength => "MissingContentLength",
            S3Error::InvalidPartNumber => "InvalidPartNumber",
            S3Error::EntityTooLarge => "EntityTooLarge",
            S3Error::InvalidRange => "InvalidRange",
            S3Error::BucketAlreadyExists => "BucketAlreadyExists",
            S3Error::MethodNotAllowed => "MethodNotAllowed",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        status_for_code(self.code())
    }

    /// Render the XML error envelope with `resource` as the `Resource` element.
    pub fn into_response_for(self, resource: &str) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        let body = render_error(self.code(), &self.to_string(), resource, &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
                ("date", date),
                ("server", SERVER_NAME.to_string()),
            ],
            body,
        )
            .into_response()
    }
}

/// HTTP status for an S3 error code. Unknown codes map to 500.
pub fn status_for_code(code: &str) -> StatusCode {
    match code {
        "NoSuchBucket" | "NoSuchKey" | "NoSuchUpload" => StatusCode::NOT_FOUND,
        "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" => StatusCode::FORBIDDEN,
        "MalformedXML" | "InvalidPart" | "InvalidRequest" | "InvalidPartNumber"
        | "EntityTooLarge" => StatusCode::BAD_REQUEST,
        "MissingContentLength" => StatusCode::LENGTH_REQUIRED,
        "InvalidRange" => StatusCode::RANGE_NOT_SATISFIABLE,
        "BucketAlreadyExists" => StatusCode::CONFLICT,
        "MethodNotAllowed" => StatusCode::METHOD_NOT_ALLOWED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        self.into_response_for("")
    }
}

impl From<anyhow::Error> for S3Error {
    fn from(err: anyhow::Error) -> Self {
        S3Error::InternalError {
            message: err.to_string(),
        }
    }
}

impl From<BackendError> for S3Error {
    fn from(err: BackendError) -> Self {
        match err.kind() {
            BackendErrorKind::NoSuchKey | BackendErrorKind::NotFound => S3Error::NoSuchKey,
            BackendErrorKind::NoSuchUpload => S3Error::NoSuchUpload,
            BackendErrorKind::InvalidPart => S3Error::InvalidPart {
                message: err.message,
            },
            BackendErrorKind::InvalidRange => S3Error::InvalidRange,
            BackendErrorKind::Other => S3Error::InternalError {
                message: err.message,
            },
        }
    }
}
