use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;
use url::Url;

use crate::ReqflowResult;
use crate::descriptor::{CachePolicy, CacheStoragePolicy};
use crate::error::{TransportError, TransportErrorKind};

/// Fully composed request handed to a [`Transport`]. Everything the
/// dispatcher computes from a descriptor ends up here; transports must not
/// consult the descriptor again.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Option<Duration>,
    pub cache_policy: Option<CachePolicy>,
    pub cache_storage_policy: CacheStoragePolicy,
    pub follow_redirects: bool,
    pub allows_cellular_access: bool,
    pub user_initiated: bool,
}

/// Raw exchange result before any validation or parsing.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Media type without parameters, lowercased, when the server declared
    /// one.
    pub mime_type: Option<String>,
    /// Final URL after any transport-level redirects.
    pub url: Url,
}

/// Pluggable network layer. The stock implementation is [`HyperTransport`];
/// tests substitute their own to script failures.
pub trait Transport: Send + Sync {
    fn perform(
        &self,
        request: PreparedRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>>;
}

/// Media type with parameters stripped, e.g. `application/json` out of
/// `application/json; charset=utf-8`.
pub(crate) fn mime_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let essence = value.split(';').next()?.trim();
    if essence.is_empty() {
        None
    } else {
        Some(essence.to_ascii_lowercase())
    }
}

pub(crate) fn classify_transport_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    if error.is_connect() {
        let text = error.to_string().to_ascii_lowercase();
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    let text = error.to_string().to_ascii_lowercase();
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

/// Tuning knobs for [`HyperTransport`].
#[derive(Clone, Copy, Debug)]
pub struct TransportConfig {
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    /// Ceiling on followed redirects per exchange.
    pub max_redirects: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 16,
            max_redirects: 10,
        }
    }
}

type HyperClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Stock transport over hyper with rustls (ring provider, webpki roots).
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
    config: TransportConfig,
}

impl HyperTransport {
    pub fn try_new() -> ReqflowResult<Self> {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> ReqflowResult<Self> {
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| {
                TransportError::new(TransportErrorKind::Tls, source)
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build(https);
        Ok(Self { client, config })
    }

    async fn exchange_once(
        client: &HyperClient,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<http::Response<hyper::body::Incoming>, TransportError> {
        let uri: Uri = url.as_str().parse().map_err(|source| {
            TransportError::new(TransportErrorKind::Other, source)
        })?;
        let mut builder = Request::builder().method(method.clone()).uri(uri);
        if let Some(map) = builder.headers_mut() {
            *map = headers.clone();
        }
        let request = builder.body(Full::new(body)).map_err(|source| {
            TransportError::new(TransportErrorKind::Other, source)
        })?;
        client
            .request(request)
            .await
            .map_err(|source| {
                let kind = classify_transport_error(&source);
                TransportError::new(kind, source)
            })
    }

    async fn perform_inner(
        client: HyperClient,
        config: TransportConfig,
        request: PreparedRequest,
    ) -> Result<TransportResponse, TransportError> {
        let mut url = request.url;
        let mut method = request.method;
        let mut headers = request.headers;
        let mut body = request.body;
        let mut redirects = 0usize;

        loop {
            let response =
                Self::exchange_once(&client, &method, &url, &headers, body.clone()).await?;
            let status = response.status();

            if request.follow_redirects
                && status.is_redirection()
                && status != StatusCode::NOT_MODIFIED
                && redirects < config.max_redirects
                && let Some(target) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| url.join(value).ok())
            {
                debug!(status = status.as_u16(), target = %target, "following redirect");
                // 307/308 replay the request as-is; everything else degrades
                // to a bodyless GET.
                if !matches!(
                    status,
                    StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
                ) {
                    method = Method::GET;
                    body = Bytes::new();
                    headers.remove(CONTENT_TYPE);
                }
                if target.host_str() != url.host_str() {
                    headers.remove(AUTHORIZATION);
                }
                url = target;
                redirects += 1;
                continue;
            }

            let response_headers = response.headers().clone();
            let mime_type = mime_from_headers(&response_headers);
            let mut collected = BytesMut::new();
            let mut incoming = response.into_body();
            while let Some(frame) = incoming.frame().await {
                let frame = frame.map_err(|source| {
                    TransportError::new(TransportErrorKind::Read, source)
                })?;
                if let Some(data) = frame.data_ref() {
                    collected.extend_from_slice(data);
                }
            }

            return Ok(TransportResponse {
                status,
                headers: response_headers,
                body: collected.freeze(),
                mime_type,
                url,
            });
        }
    }
}

impl Transport for HyperTransport {
    fn perform(
        &self,
        request: PreparedRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        let client = self.client.clone();
        let config = self.config;
        let deadline = request.timeout;
        async move {
            let exchange = Self::perform_inner(client, config, request);
            match deadline {
                Some(deadline) => tokio::time::timeout(deadline, exchange)
                    .await
                    .map_err(|source| {
                        TransportError::new(TransportErrorKind::Timeout, source)
                    })?,
                None => exchange.await,
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn mime_strips_parameters_and_lowercases() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("Application/JSON; charset=utf-8"),
        );
        assert_eq!(
            mime_from_headers(&headers).as_deref(),
            Some("application/json")
        );
    }

    #[test]
    fn missing_or_empty_content_type_yields_none() {
        assert_eq!(mime_from_headers(&HeaderMap::new()), None);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("; charset=utf-8"));
        assert_eq!(mime_from_headers(&headers), None);
    }
}
