use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue};
use http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::ReqflowResult;
use crate::body::{BodyKind, DeferredParts, MultipartPart, PartSource};
use crate::error::Error;
use crate::headers::HeaderSet;
use crate::mock::MockHandler;
use crate::retry::RetryBehavior;
use crate::transport::PreparedRequest;

/// The closed set of HTTP methods a descriptor can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Default idempotence per RFC 7231: GET, HEAD, PUT, DELETE, OPTIONS
    /// and TRACE are idempotent; of the methods in this set that leaves
    /// POST and PATCH as non-idempotent.
    pub const fn is_idempotent_by_default(self) -> bool {
        matches!(self, Self::Get | Self::Put | Self::Delete)
    }

    pub fn as_http(self) -> http::Method {
        match self {
            Self::Get => http::Method::GET,
            Self::Post => http::Method::POST,
            Self::Put => http::Method::PUT,
            Self::Patch => http::Method::PATCH,
            Self::Delete => http::Method::DELETE,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_http().as_str())
    }
}

/// Credential attached to a request. Only password-based credentials are
/// supported; assigning any other kind logs a warning and clears the
/// credential.
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Credential {
    Basic { username: String, password: String },
    ClientCertificate { identity: String },
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub(crate) fn is_password_based(&self) -> bool {
        matches!(self, Self::Basic { .. })
    }

    fn authorization_value(&self) -> Option<HeaderValue> {
        let Self::Basic { username, password } = self else {
            return None;
        };
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        let mut value = HeaderValue::from_str(&format!("Basic {encoded}")).ok()?;
        value.set_sensitive(true);
        Some(value)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic { username, .. } => formatter
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::ClientCertificate { identity } => formatter
                .debug_struct("ClientCertificate")
                .field("identity", identity)
                .finish(),
        }
    }
}

/// Advisory request cache policy, forwarded to the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    #[default]
    UseProtocolCachePolicy,
    ReloadIgnoringLocalCache,
    ReturnCacheDataElseLoad,
    ReturnCacheDataDontLoad,
}

/// Advisory response cache storage policy, forwarded to the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheStoragePolicy {
    #[default]
    Allowed,
    AllowedInMemoryOnly,
    NotAllowed,
}

/// The server environment requests are issued against: a normalized base
/// URL whose path always ends in `/` and carries no query or fragment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Environment {
    base: Url,
}

impl Environment {
    pub fn new(base_url: impl AsRef<str>) -> ReqflowResult<Self> {
        let raw = base_url.as_ref();
        let mut base = Url::parse(raw).map_err(|_| Error::InvalidUrl {
            url: raw.to_owned(),
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl {
                url: raw.to_owned(),
            });
        }
        base.set_query(None);
        base.set_fragment(None);
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolves a request path against the environment. Absolute
    /// `http`/`https` URLs pass through; anything else resolves relative to
    /// the base URL (a leading `/` is host-relative, per URL semantics).
    pub(crate) fn resolve(&self, path: &str) -> ReqflowResult<Url> {
        match Url::parse(path) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
            Ok(_) => Err(Error::InvalidUrl {
                url: path.to_owned(),
            }),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                self.base.join(path).map_err(|_| Error::InvalidUrl {
                    url: path.to_owned(),
                })
            }
            Err(_) => Err(Error::InvalidUrl {
                url: path.to_owned(),
            }),
        }
    }

    /// If `url` lives under this environment's base URL, returns its path
    /// relative to the base (no leading `/`).
    pub(crate) fn relative_path_of(&self, url: &Url) -> Option<String> {
        if url.scheme() != self.base.scheme()
            || url.host_str() != self.base.host_str()
            || url.port_or_known_default() != self.base.port_or_known_default()
        {
            return None;
        }
        url.path()
            .strip_prefix(self.base.path())
            .map(ToOwned::to_owned)
    }
}

/// Declarative description of an HTTP request: method, URL composition,
/// headers, credential, body specification, and policy flags.
///
/// Descriptors have value semantics: deriving a parse request or
/// dispatching a task snapshots the descriptor, so later mutation never
/// affects work already derived from it.
#[derive(Clone)]
pub struct RequestDescriptor {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) params: Vec<(String, String)>,
    pub(crate) headers: HeaderSet,
    pub(crate) credential: Option<Credential>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cache_policy: Option<CachePolicy>,
    pub(crate) cache_storage_policy: CacheStoragePolicy,
    pub(crate) follow_redirects: bool,
    pub(crate) allows_cellular_access: bool,
    pub(crate) user_initiated: bool,
    pub(crate) is_idempotent: bool,
    pub(crate) retry_behavior: Option<RetryBehavior>,
    pub(crate) mock: Option<MockHandler>,
    pub(crate) body: BodyKind,
}

impl std::fmt::Debug for RequestDescriptor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestDescriptor")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("params", &self.params)
            .field("headers", &self.headers)
            .field("credential", &self.credential)
            .field("timeout", &self.timeout)
            .field("is_idempotent", &self.is_idempotent)
            .field("retry_behavior", &self.retry_behavior)
            .field("mocked", &self.mock.is_some())
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl RequestDescriptor {
    pub(crate) fn new(method: Method, path: impl Into<String>) -> Self {
        let body = match method {
            Method::Post | Method::Put | Method::Patch => BodyKind::FormUrlEncoded,
            Method::Get | Method::Delete => BodyKind::None,
        };
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            headers: HeaderSet::new(),
            credential: None,
            timeout: None,
            cache_policy: None,
            cache_storage_policy: CacheStoragePolicy::default(),
            follow_redirects: true,
            allows_cellular_access: true,
            user_initiated: false,
            is_idempotent: method.is_idempotent_by_default(),
            retry_behavior: None,
            mock: None,
            body,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn headers(&self) -> &HeaderSet {
        &self.headers
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Appends one query parameter. Parameters keep their insertion order;
    /// for form and multipart uploads they become the body instead of the
    /// URL query.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn params<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.params.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    /// Appends query parameters from any `Serialize` value.
    pub fn query<T>(mut self, params: &T) -> ReqflowResult<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::SerializeQuery { source })?;
        self.params.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    /// Attaches a credential. Only password-based credentials are
    /// supported; any other kind is rejected with a logged warning and the
    /// credential is reset to none.
    pub fn credential(mut self, credential: Credential) -> Self {
        if credential.is_password_based() {
            self.credential = Some(credential);
        } else {
            warn!(
                credential = ?credential,
                "only password-based credentials are supported; credential cleared"
            );
            self.credential = None;
        }
        self
    }

    pub fn no_credential(mut self) -> Self {
        self.credential = None;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = Some(cache_policy);
        self
    }

    pub fn cache_storage_policy(mut self, policy: CacheStoragePolicy) -> Self {
        self.cache_storage_policy = policy;
        self
    }

    /// Whether the transport follows redirects transparently (default
    /// true). When disabled, a redirect surfaces as the 3xx response
    /// itself (network request) or an `UnexpectedRedirect` error (parse
    /// request).
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn allows_cellular_access(mut self, allows: bool) -> Self {
        self.allows_cellular_access = allows;
        self
    }

    pub fn user_initiated(mut self, user_initiated: bool) -> Self {
        self.user_initiated = user_initiated;
        self
    }

    /// Overrides the per-method idempotence default, which controls
    /// whether retry behaviors fire for this request.
    pub fn idempotent(mut self, is_idempotent: bool) -> Self {
        self.is_idempotent = is_idempotent;
        self
    }

    pub fn retry_behavior(mut self, behavior: RetryBehavior) -> Self {
        self.retry_behavior = Some(behavior);
        self
    }

    /// Replaces the body with raw bytes and an explicit content type.
    pub fn raw_body(mut self, data: impl Into<Bytes>, content_type: Option<String>) -> Self {
        self.body = BodyKind::Raw {
            data: data.into(),
            content_type,
        };
        self
    }

    /// Replaces the body with a JSON value, transmitted compactly.
    pub fn json_body(mut self, value: Value) -> Self {
        self.body = BodyKind::Json(value);
        self
    }

    /// Adds a multipart part, promoting a form-urlencoded body to
    /// `multipart/form-data`.
    pub fn multipart_part(mut self, part: MultipartPart) -> Self {
        self.push_part(PartSource::Known(part));
        self
    }

    /// Adds a deferred producer of multipart parts, evaluated at most once
    /// when the body is first materialized.
    pub fn deferred_multipart_parts<F>(mut self, producer: F) -> Self
    where
        F: Future<Output = Vec<MultipartPart>> + Send + 'static,
    {
        self.push_part(PartSource::Deferred(DeferredParts::new(producer)));
        self
    }

    fn push_part(&mut self, source: PartSource) {
        if let BodyKind::Multipart { parts, .. } = &mut self.body {
            parts.push(source);
            return;
        }
        let mut body = BodyKind::empty_multipart();
        if let BodyKind::Multipart { parts, .. } = &mut body {
            parts.push(source);
        }
        self.body = body;
    }

    /// Attaches a mock handler that intercepts this request instead of
    /// performing real I/O. Takes precedence over the manager's registry.
    pub fn mock_with(mut self, handler: MockHandler) -> Self {
        self.mock = Some(handler);
        self
    }

    /// Mocks this request with a canned JSON response.
    pub fn mock_json(self, status: u16, value: Value) -> Self {
        self.mock_with(crate::mock::json_handler(status, value))
    }

    /// Composes the final transport request: resolved URL with merged
    /// query, normalized headers with the computed `Content-Type`
    /// (caller-supplied `Content-Type`/`Content-Length` are stripped), and
    /// `Authorization: Basic` when a credential is present. The body is
    /// materialized separately by the dispatcher.
    pub(crate) fn prepare_for_transport(
        &self,
        environment: &Environment,
    ) -> ReqflowResult<PreparedRequest> {
        let mut url = environment.resolve(&self.path)?;
        if !self.body.consumes_params() && !self.params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (name, value) in &self.params {
                query.append_pair(name, value);
            }
            drop(query);
        }

        let mut headers = self.headers.clone();
        headers.remove("Content-Length");
        headers.remove("Content-Type");
        if let Some(content_type) = self.body.content_type() {
            headers.set("Content-Type", content_type);
        }

        let mut header_map = HeaderMap::new();
        for (name, value) in headers.iter() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    header_map.insert(name, value);
                }
                _ => warn!(header = name, "skipping header with invalid name or value"),
            }
        }
        if let Some(credential) = &self.credential
            && let Some(value) = credential.authorization_value()
        {
            header_map.insert(AUTHORIZATION, value);
        }

        Ok(PreparedRequest {
            method: self.method.as_http(),
            url,
            headers: header_map,
            body: Bytes::new(),
            timeout: self.timeout,
            cache_policy: self.cache_policy,
            cache_storage_policy: self.cache_storage_policy,
            follow_redirects: self.follow_redirects,
            allows_cellular_access: self.allows_cellular_access,
            user_initiated: self.user_initiated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment() -> Environment {
        Environment::new("https://api.example.com/v1").expect("environment")
    }

    #[test]
    fn environment_normalizes_trailing_slash_and_strips_query() {
        let environment = Environment::new("https://api.example.com/v1?x=1#frag").expect("env");
        assert_eq!(environment.base_url().as_str(), "https://api.example.com/v1/");
    }

    #[test]
    fn environment_rejects_non_http_schemes() {
        assert!(Environment::new("ftp://example.com").is_err());
    }

    #[test]
    fn resolve_joins_relative_paths_under_the_base() {
        let url = environment().resolve("users/42").expect("resolve");
        assert_eq!(url.as_str(), "https://api.example.com/v1/users/42");
    }

    #[test]
    fn resolve_treats_leading_slash_as_host_relative() {
        let url = environment().resolve("/health").expect("resolve");
        assert_eq!(url.as_str(), "https://api.example.com/health");
    }

    #[test]
    fn resolve_passes_absolute_urls_through() {
        let url = environment().resolve("https://other.test/a").expect("resolve");
        assert_eq!(url.as_str(), "https://other.test/a");
    }

    #[test]
    fn relative_path_of_requires_matching_origin() {
        let environment = environment();
        let inside = Url::parse("https://api.example.com/v1/users/42").expect("url");
        let outside = Url::parse("https://other.test/v1/users/42").expect("url");
        assert_eq!(
            environment.relative_path_of(&inside).as_deref(),
            Some("users/42")
        );
        assert_eq!(environment.relative_path_of(&outside), None);
    }

    #[test]
    fn prepare_merges_query_params_with_existing_query() {
        let descriptor =
            RequestDescriptor::new(Method::Get, "search?query=cats").param("page", "2");
        let prepared = descriptor
            .prepare_for_transport(&environment())
            .expect("prepare");
        assert_eq!(
            prepared.url.as_str(),
            "https://api.example.com/v1/search?query=cats&page=2"
        );
    }

    #[test]
    fn prepare_strips_caller_content_headers_and_applies_computed_type() {
        let descriptor = RequestDescriptor::new(Method::Post, "items")
            .header("Content-Length", "999")
            .header("content-type", "text/plain");
        let prepared = descriptor
            .prepare_for_transport(&environment())
            .expect("prepare");
        assert!(prepared.headers.get(http::header::CONTENT_LENGTH).is_none());
        assert_eq!(
            prepared
                .headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn get_requests_carry_no_content_type() {
        let descriptor = RequestDescriptor::new(Method::Get, "items").header("Content-Type", "x");
        let prepared = descriptor
            .prepare_for_transport(&environment())
            .expect("prepare");
        assert!(prepared.headers.get(http::header::CONTENT_TYPE).is_none());
    }

    #[test]
    fn credential_injects_basic_authorization_overriding_existing() {
        let descriptor = RequestDescriptor::new(Method::Get, "items")
            .header("Authorization", "Bearer stale")
            .credential(Credential::basic("user", "pass"));
        let prepared = descriptor
            .prepare_for_transport(&environment())
            .expect("prepare");
        let value = prepared
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .expect("authorization header");
        assert_eq!(value, "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn unsupported_credential_kinds_are_cleared() {
        let descriptor = RequestDescriptor::new(Method::Get, "items")
            .credential(Credential::ClientCertificate {
                identity: "client".to_owned(),
            });
        assert!(descriptor.credential.is_none());
    }

    #[test]
    fn unresolvable_path_is_a_construction_time_error() {
        let error = RequestDescriptor::new(Method::Get, "ftp://example.com/a")
            .prepare_for_transport(&environment())
            .expect_err("non-http absolute url");
        assert!(matches!(error, Error::InvalidUrl { .. }));
    }

    #[test]
    fn idempotence_defaults_follow_the_method() {
        assert!(RequestDescriptor::new(Method::Get, "a").is_idempotent);
        assert!(RequestDescriptor::new(Method::Delete, "a").is_idempotent);
        assert!(!RequestDescriptor::new(Method::Post, "a").is_idempotent);
        assert!(!RequestDescriptor::new(Method::Patch, "a").is_idempotent);
        assert!(
            RequestDescriptor::new(Method::Post, "a")
                .idempotent(true)
                .is_idempotent
        );
    }

    #[test]
    fn multipart_parts_promote_the_form_body() {
        let descriptor = RequestDescriptor::new(Method::Post, "upload")
            .multipart_part(MultipartPart::text("note", "hi"));
        let content_type = descriptor.body.content_type().expect("content type");
        assert!(content_type.starts_with("multipart/form-data; boundary="));
    }
}
