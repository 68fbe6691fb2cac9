use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::Value;
use tracing::warn;
use url::Url;

use crate::descriptor::{Environment, Method};
use crate::transport::PreparedRequest;

/// A substitute async handler invoked instead of real network I/O.
pub type MockHandler =
    Arc<dyn Fn(MockRequest) -> BoxFuture<'static, MockResponse> + Send + Sync>;

/// View of the intercepted request handed to a mock handler.
#[derive(Clone, Debug)]
pub struct MockRequest {
    pub method: http::Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Values captured by `:name` wildcards in the matched pattern. Empty
    /// for per-request mock overrides.
    pub path_parameters: BTreeMap<String, String>,
}

/// Canned response produced by a mock handler.
#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl MockResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A JSON response with `Content-Type: application/json`.
    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status)
            .header("content-type", "application/json")
            .body(value.to_string())
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Handler returning the same canned JSON response for every invocation.
pub fn json_handler(status: u16, value: Value) -> MockHandler {
    let response = MockResponse::json(status, &value);
    Arc::new(move |_request| {
        let response = response.clone();
        async move { response }.boxed()
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Parameter(String),
}

#[derive(Clone, Debug)]
enum MockPattern {
    /// Matched against the environment-relative portion of the request URL.
    Relative { segments: Vec<Segment> },
    /// Matched against the full request URL.
    Absolute { origin: Url, segments: Vec<Segment> },
}

fn parse_segments<'a>(raw: impl Iterator<Item = &'a str>) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    for segment in raw {
        if let Some(name) = segment.strip_prefix(':') {
            if name.is_empty() {
                return None;
            }
            segments.push(Segment::Parameter(name.to_owned()));
        } else {
            segments.push(Segment::Literal(segment.to_owned()));
        }
    }
    Some(segments)
}

fn parse_pattern(pattern: &str) -> Option<MockPattern> {
    if pattern.contains("://") {
        let url = Url::parse(pattern).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let segments = parse_segments(url.path_segments()?.filter(|item| !item.is_empty()))?;
        let mut origin = url.clone();
        origin.set_path("/");
        origin.set_query(None);
        origin.set_fragment(None);
        return Some(MockPattern::Absolute { origin, segments });
    }
    let trimmed = pattern.trim_matches('/');
    parse_segments(trimmed.split('/').filter(|item| !item.is_empty()))
        .map(|segments| MockPattern::Relative { segments })
}

fn match_segments(
    pattern: &[Segment],
    path: &str,
) -> Option<BTreeMap<String, String>> {
    let path_segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    if path_segments.len() != pattern.len() {
        return None;
    }
    let mut parameters = BTreeMap::new();
    for (segment, value) in pattern.iter().zip(path_segments) {
        match segment {
            Segment::Literal(literal) => {
                if literal != value {
                    return None;
                }
            }
            Segment::Parameter(name) => {
                parameters.insert(name.clone(), value.to_owned());
            }
        }
    }
    Some(parameters)
}

struct MockEntry {
    method: http::Method,
    pattern: MockPattern,
    handler: MockHandler,
}

/// Registry of mock handlers consulted before the transport is invoked.
/// Entries are matched most-recently-added-first.
#[derive(Default)]
pub struct MockRegistry {
    entries: Mutex<Vec<MockEntry>>,
}

impl MockRegistry {
    /// Registers a handler for requests matching `pattern`: either an
    /// absolute URL or an environment-relative path, with `:name` segment
    /// wildcards. Malformed patterns are warned about and ignored.
    pub fn add(&self, method: Method, pattern: &str, handler: MockHandler) {
        let Some(pattern) = parse_pattern(pattern) else {
            warn!(pattern, "ignoring malformed mock url pattern");
            return;
        };
        lock_unpoisoned(&self.entries).push(MockEntry {
            method: method.as_http(),
            pattern,
            handler,
        });
    }

    /// Registers a canned JSON response for matching requests.
    pub fn add_json(&self, method: Method, pattern: &str, status: u16, value: Value) {
        self.add(method, pattern, json_handler(status, value));
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }

    pub(crate) fn resolve(
        &self,
        request: &PreparedRequest,
        environment: &Environment,
    ) -> Option<(MockHandler, BTreeMap<String, String>)> {
        let relative_path = environment.relative_path_of(&request.url);
        let entries = lock_unpoisoned(&self.entries);
        for entry in entries.iter().rev() {
            if entry.method != request.method {
                continue;
            }
            let matched = match &entry.pattern {
                MockPattern::Relative { segments } => relative_path
                    .as_deref()
                    .and_then(|path| match_segments(segments, path)),
                MockPattern::Absolute { origin, segments } => {
                    if request.url.scheme() == origin.scheme()
                        && request.url.host_str() == origin.host_str()
                        && request.url.port_or_known_default()
                            == origin.port_or_known_default()
                    {
                        match_segments(segments, request.url.path())
                    } else {
                        None
                    }
                }
            };
            if let Some(parameters) = matched {
                return Some((Arc::clone(&entry.handler), parameters));
            }
        }
        None
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
