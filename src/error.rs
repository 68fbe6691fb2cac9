use bytes::Bytes;
use http::StatusCode;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::descriptor::Credential;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of transport-level failures, used by retry
/// decisions and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Error raised by a [`Transport`](crate::transport::Transport)
/// implementation. Carried opaquely through the task engine.
#[derive(Debug, Error)]
#[error("transport error ({kind}): {source}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    #[source]
    pub source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUrl,
    FailedResponse,
    Unauthorized,
    Forbidden,
    UnexpectedContentType,
    UnexpectedNoContent,
    UnexpectedRedirect,
    Transport,
    Parse,
    BodyEncode,
    SerializeQuery,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::FailedResponse => "failed_response",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::UnexpectedContentType => "unexpected_content_type",
            Self::UnexpectedNoContent => "unexpected_no_content",
            Self::UnexpectedRedirect => "unexpected_redirect",
            Self::Transport => "transport",
            Self::Parse => "parse",
            Self::BodyEncode => "body_encode",
            Self::SerializeQuery => "serialize_query",
        }
    }
}

/// Error taxonomy for request tasks.
///
/// Response-shaped failures (`FailedResponse`, `Unauthorized`, `Forbidden`,
/// `UnexpectedRedirect`) carry the raw body bytes and, when the response
/// declared a JSON content type and the body parsed, the decoded JSON value.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("cannot resolve request url: {url}")]
    InvalidUrl { url: String },
    #[error("request failed with http status {status}")]
    FailedResponse {
        status: StatusCode,
        body: Bytes,
        body_json: Option<Value>,
    },
    #[error("401 unauthorized")]
    Unauthorized {
        credential: Option<Credential>,
        status: StatusCode,
        body: Bytes,
        body_json: Option<Value>,
    },
    #[error("403 forbidden")]
    Forbidden {
        credential: Option<Credential>,
        status: StatusCode,
        body: Bytes,
        body_json: Option<Value>,
    },
    #[error("response has unexpected content type {content_type:?}")]
    UnexpectedContentType { content_type: String, body: Bytes },
    #[error("response returned 204 no content where an entity was expected")]
    UnexpectedNoContent,
    #[error("unexpected redirect ({status}) to {location:?}")]
    UnexpectedRedirect {
        status: StatusCode,
        location: Option<Url>,
        body: Bytes,
    },
    #[error("transport error ({kind}): {source}")]
    Transport {
        kind: TransportErrorKind,
        #[source]
        source: BoxError,
    },
    #[error("response parse error: {source}")]
    Parse {
        #[source]
        source: BoxError,
    },
    #[error("failed to encode request body: {source}")]
    BodyEncode {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize query parameters: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            Self::FailedResponse { .. } => ErrorCode::FailedResponse,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::Forbidden { .. } => ErrorCode::Forbidden,
            Self::UnexpectedContentType { .. } => ErrorCode::UnexpectedContentType,
            Self::UnexpectedNoContent => ErrorCode::UnexpectedNoContent,
            Self::UnexpectedRedirect { .. } => ErrorCode::UnexpectedRedirect,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Parse { .. } => ErrorCode::Parse,
            Self::BodyEncode { .. } => ErrorCode::BodyEncode,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
        }
    }

    /// True if the error represents a failed response with the given
    /// status code. Asking about 401 also matches `Unauthorized`, and 403
    /// also matches `Forbidden`.
    pub fn is_failed_response(&self, status_code: u16) -> bool {
        match self {
            Self::FailedResponse { status, .. } => status.as_u16() == status_code,
            Self::Unauthorized { status, .. } => status.as_u16() == status_code,
            Self::Forbidden { status, .. } => status.as_u16() == status_code,
            _ => false,
        }
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Self::Transport {
            kind: error.kind,
            source: error.source,
        }
    }
}
