use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_encode};
use serde_json::Value;

use crate::error::Error;

/// Characters left unescaped when form-encoding parameter names and values:
/// the URL-query-allowed set minus `&` and `=`. Space encodes as `%20`.
const FORM_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'$')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b'-')
    .remove(b'.')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'?')
    .remove(b'@')
    .remove(b'_')
    .remove(b'~');

/// Content of one multipart part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartContent {
    Text(String),
    Data(Bytes),
}

/// One `form-data` part of a multipart body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    /// Defaults to `text/plain; charset=utf-8` for text content and
    /// `application/octet-stream` for data content.
    pub content_type: Option<String>,
    pub content: PartContent,
}

impl MultipartPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            content: PartContent::Text(value.into()),
        }
    }

    pub fn data(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            content: PartContent::Data(data.into()),
        }
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A one-shot asynchronous producer of multipart parts, memoized so the
/// producer runs at most once even when multiple readers wait on it (the
/// same body may be re-materialized for a retry).
#[derive(Clone)]
pub struct DeferredParts {
    future: Shared<BoxFuture<'static, Vec<MultipartPart>>>,
}

impl DeferredParts {
    pub fn new<F>(producer: F) -> Self
    where
        F: Future<Output = Vec<MultipartPart>> + Send + 'static,
    {
        Self {
            future: producer.boxed().shared(),
        }
    }

    fn start(&self) -> Shared<BoxFuture<'static, Vec<MultipartPart>>> {
        self.future.clone()
    }
}

impl std::fmt::Debug for DeferredParts {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("DeferredParts(..)")
    }
}

/// A multipart body element: either immediately available or deferred.
#[derive(Clone, Debug)]
pub enum PartSource {
    Known(MultipartPart),
    Deferred(DeferredParts),
}

/// Tagged description of how to materialize a request body.
#[derive(Clone, Debug, Default)]
pub enum BodyKind {
    #[default]
    None,
    Raw {
        data: Bytes,
        content_type: Option<String>,
    },
    /// Form-urlencoded body built from the descriptor's query parameters.
    FormUrlEncoded,
    Json(Value),
    Multipart {
        boundary: String,
        parts: Vec<PartSource>,
    },
}

impl BodyKind {
    pub(crate) fn empty_multipart() -> Self {
        Self::Multipart {
            boundary: generate_boundary(),
            parts: Vec::new(),
        }
    }

    /// The computed `Content-Type` for this body, or `None` when the
    /// request carries no `Content-Type` header at all.
    pub(crate) fn content_type(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Raw { content_type, .. } => content_type.clone(),
            Self::FormUrlEncoded => Some("application/x-www-form-urlencoded".to_owned()),
            Self::Json(_) => Some("application/json".to_owned()),
            Self::Multipart { boundary, .. } => {
                Some(format!("multipart/form-data; boundary={boundary}"))
            }
        }
    }

    /// True when the descriptor's query parameters are consumed by the body
    /// instead of being appended to the request URL.
    pub(crate) fn consumes_params(&self) -> bool {
        matches!(self, Self::FormUrlEncoded | Self::Multipart { .. })
    }

    /// Materializes the body to bytes. Every deferred multipart producer is
    /// started before any is awaited, then their parts are consumed in
    /// declaration order.
    pub(crate) async fn materialize(&self, params: &[(String, String)]) -> Result<Bytes, Error> {
        match self {
            Self::None => Ok(Bytes::new()),
            Self::Raw { data, .. } => Ok(data.clone()),
            Self::FormUrlEncoded => Ok(Bytes::from(form_urlencode(params).into_bytes())),
            Self::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|source| Error::BodyEncode { source }),
            Self::Multipart { boundary, parts } => {
                let deferred = join_all(parts.iter().filter_map(|part| match part {
                    PartSource::Known(_) => None,
                    PartSource::Deferred(deferred) => Some(deferred.start()),
                }))
                .await;
                let mut deferred = deferred.into_iter();
                let mut resolved = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        PartSource::Known(part) => resolved.push(part.clone()),
                        PartSource::Deferred(_) => {
                            resolved.extend(deferred.next().unwrap_or_default());
                        }
                    }
                }
                Ok(render_multipart(boundary, params, &resolved))
            }
        }
    }
}

/// Percent-encodes `name=value` pairs and joins them with `&`. An empty
/// parameter list yields an empty body.
pub(crate) fn form_urlencode(params: &[(String, String)]) -> String {
    let mut encoded = String::new();
    for (name, value) in params {
        if !encoded.is_empty() {
            encoded.push('&');
        }
        encoded.extend(percent_encode(name.as_bytes(), FORM_ENCODE_SET));
        encoded.push('=');
        encoded.extend(percent_encode(value.as_bytes(), FORM_ENCODE_SET));
    }
    encoded
}

/// WebKit-compatible quoting for `name`/`filename` values: `"`, CR, and LF
/// become percent escapes rather than RFC 2231 encoded words.
fn quote_disposition_value(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len());
    for character in value.chars() {
        match character {
            '"' => quoted.push_str("%22"),
            '\r' => quoted.push_str("%0D"),
            '\n' => quoted.push_str("%0A"),
            other => quoted.push(other),
        }
    }
    quoted
}

fn render_multipart(
    boundary: &str,
    params: &[(String, String)],
    parts: &[MultipartPart],
) -> Bytes {
    let mut body = Vec::new();

    for (name, value) in params {
        append_part_header(
            &mut body,
            boundary,
            name,
            None,
            "text/plain; charset=utf-8",
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    for part in parts {
        let default_content_type = match part.content {
            PartContent::Text(_) => "text/plain; charset=utf-8",
            PartContent::Data(_) => "application/octet-stream",
        };
        let content_type = part.content_type.as_deref().unwrap_or(default_content_type);
        append_part_header(
            &mut body,
            boundary,
            &part.name,
            part.filename.as_deref(),
            content_type,
        );
        match &part.content {
            PartContent::Text(text) => body.extend_from_slice(text.as_bytes()),
            PartContent::Data(data) => body.extend_from_slice(data),
        }
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Bytes::from(body)
}

fn append_part_header(
    body: &mut Vec<u8>,
    boundary: &str,
    name: &str,
    filename: Option<&str>,
    content_type: &str,
) {
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"",
            quote_disposition_value(name)
        )
        .as_bytes(),
    );
    if let Some(filename) = filename {
        body.extend_from_slice(
            format!("; filename=\"{}\"", quote_disposition_value(filename)).as_bytes(),
        );
    }
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
    body.extend_from_slice(b"\r\n");
}

/// Process-unique multipart boundary. Uniqueness within the process is what
/// matters; the suffix mixes a subsecond timestamp with a counter.
fn generate_boundary() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or(0);
    format!("reqflow.boundary.{nanos:08x}{counter:08x}")
}
