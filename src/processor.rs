use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use serde_json::Value;
use url::Url;

use crate::descriptor::{Credential, RequestDescriptor};
use crate::error::Error;
use crate::headers::HeaderSet;
use crate::transport::TransportResponse;

/// Response metadata surfaced to parse handlers and task results.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderSet,
    /// Media type inferred by the transport, parameters stripped.
    pub mime_type: Option<String>,
    /// Final URL after redirects.
    pub url: Url,
}

impl HttpResponse {
    pub(crate) fn from_transport(response: &TransportResponse) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self {
            status: response.status,
            headers,
            mime_type: response.mime_type.clone(),
            url: response.url.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChainMode {
    /// Plain requests: any non-error status is acceptable, including
    /// redirects delivered with redirect-following disabled.
    Network,
    /// Parse requests: strict 2xx discipline with dedicated errors for
    /// redirects and missing content.
    Parse,
}

type FinishFn<T> = Arc<dyn Fn(&HttpResponse, &Bytes) -> Result<T, Error> + Send + Sync>;

/// Validation plus decoding applied to a transport response before the task
/// completes.
pub(crate) struct Chain<T> {
    pub(crate) mode: ChainMode,
    pub(crate) expected_content_types: Vec<String>,
    pub(crate) finish: FinishFn<T>,
}

impl<T> Clone for Chain<T> {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            expected_content_types: self.expected_content_types.clone(),
            finish: Arc::clone(&self.finish),
        }
    }
}

impl Chain<Bytes> {
    pub(crate) fn network() -> Self {
        Self {
            mode: ChainMode::Network,
            expected_content_types: Vec::new(),
            finish: Arc::new(|_, body| Ok(body.clone())),
        }
    }
}

impl<T> Chain<T> {
    /// Value for a synthesized `Accept` header, or `None` when the chain
    /// declares no content-type expectations.
    pub(crate) fn accept_header_value(&self) -> Option<String> {
        if self.expected_content_types.is_empty() {
            None
        } else {
            Some(self.expected_content_types.join(", "))
        }
    }

    pub(crate) fn validate(
        &self,
        credential: Option<&Credential>,
        response: &HttpResponse,
        body: &Bytes,
    ) -> Result<(), Error> {
        let status = response.status;
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized {
                credential: credential.cloned(),
                status,
                body: body.clone(),
                body_json: body_json_if_json(response.mime_type.as_deref(), body),
            });
        }
        if status == StatusCode::FORBIDDEN {
            return Err(Error::Forbidden {
                credential: credential.cloned(),
                status,
                body: body.clone(),
                body_json: body_json_if_json(response.mime_type.as_deref(), body),
            });
        }
        match self.mode {
            ChainMode::Network => {
                if !(status.is_success() || status.is_redirection()) {
                    return Err(Error::FailedResponse {
                        status,
                        body: body.clone(),
                        body_json: body_json_if_json(response.mime_type.as_deref(), body),
                    });
                }
            }
            ChainMode::Parse => {
                if status.is_redirection() {
                    let location = response
                        .headers
                        .get("Location")
                        .and_then(|value| response.url.join(value).ok());
                    return Err(Error::UnexpectedRedirect {
                        status,
                        location,
                        body: body.clone(),
                    });
                }
                if !status.is_success() {
                    return Err(Error::FailedResponse {
                        status,
                        body: body.clone(),
                        body_json: body_json_if_json(response.mime_type.as_deref(), body),
                    });
                }
                if status == StatusCode::NO_CONTENT {
                    return Err(Error::UnexpectedNoContent);
                }
                self.check_content_type(response, body)?;
            }
        }
        Ok(())
    }

    fn check_content_type(&self, response: &HttpResponse, body: &Bytes) -> Result<(), Error> {
        if self.expected_content_types.is_empty() {
            return Ok(());
        }
        let declared = response
            .headers
            .get("Content-Type")
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_owned());
        let inferred = response.mime_type.as_deref();
        let candidates: Vec<&str> = declared
            .as_deref()
            .into_iter()
            .chain(inferred)
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        let acceptable = candidates.iter().any(|candidate| {
            self.expected_content_types
                .iter()
                .any(|expected| mime_matches(expected, candidate))
        });
        if acceptable {
            Ok(())
        } else {
            Err(Error::UnexpectedContentType {
                content_type: candidates[0].to_owned(),
                body: body.clone(),
            })
        }
    }
}

/// Loose media-type comparison: parameters are ignored, matching is
/// case-insensitive, and either side of the expected pattern may be `*`.
pub(crate) fn mime_matches(expected: &str, actual: &str) -> bool {
    let strip = |value: &str| -> Option<(String, String)> {
        let essence = value.split(';').next()?.trim().to_ascii_lowercase();
        let (kind, subtype) = essence.split_once('/')?;
        Some((kind.to_owned(), subtype.to_owned()))
    };
    let (Some((expected_kind, expected_subtype)), Some((actual_kind, actual_subtype))) =
        (strip(expected), strip(actual))
    else {
        return false;
    };
    (expected_kind == "*" || expected_kind == actual_kind)
        && (expected_subtype == "*" || expected_subtype == actual_subtype)
}

/// Decodes the body as JSON when the media type says it is JSON; used to
/// attach structured detail to failure errors.
pub(crate) fn body_json_if_json(mime_type: Option<&str>, body: &Bytes) -> Option<Value> {
    let mime = mime_type?;
    if mime_matches("application/json", mime) || mime_matches("text/json", mime) {
        serde_json::from_slice(body).ok()
    } else {
        None
    }
}

/// A request paired with a decode step; produced by
/// [`RequestDescriptor::parse_with`] or [`RequestDescriptor::parse_as_json`].
pub struct ParseRequest<T> {
    pub(crate) descriptor: RequestDescriptor,
    pub(crate) chain: Chain<T>,
}

impl<T> ParseRequest<T> {
    /// Replaces the media types the response is expected to carry. An
    /// `Accept` header is synthesized from these at dispatch time unless one
    /// was set explicitly.
    pub fn expect_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chain.expected_content_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }
}

impl RequestDescriptor {
    /// Attaches a decode handler run after validation succeeds. The handler
    /// executes off the caller's task and must be cheap enough to run inline.
    pub fn parse_with<T, F>(self, finish: F) -> ParseRequest<T>
    where
        F: Fn(&HttpResponse, &Bytes) -> Result<T, Error> + Send + Sync + 'static,
    {
        ParseRequest {
            descriptor: self,
            chain: Chain {
                mode: ChainMode::Parse,
                expected_content_types: Vec::new(),
                finish: Arc::new(finish),
            },
        }
    }

    /// Decodes the body as JSON, expecting `application/json` or
    /// `text/json`.
    pub fn parse_as_json(self) -> ParseRequest<Value> {
        self.parse_with(|_, body| {
            serde_json::from_slice(body).map_err(|source| Error::Parse {
                source: Box::new(source),
            })
        })
        .expect_content_types(["application/json", "text/json"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Method;

    fn response(status: u16, mime: Option<&str>) -> HttpResponse {
        let mut headers = HeaderSet::new();
        if let Some(mime) = mime {
            headers.set("Content-Type", mime);
        }
        HttpResponse {
            status: StatusCode::from_u16(status).expect("status"),
            headers,
            mime_type: mime.map(|value| {
                value.split(';').next().unwrap_or(value).trim().to_ascii_lowercase()
            }),
            url: Url::parse("https://api.example.com/v1/search").expect("url"),
        }
    }

    fn parse_chain() -> Chain<Value> {
        RequestDescriptor::new(Method::Get, "search")
            .parse_as_json()
            .chain
    }

    #[test]
    fn network_chain_accepts_redirect_statuses() {
        let chain = Chain::network();
        let body = Bytes::new();
        assert!(chain.validate(None, &response(302, None), &body).is_ok());
        assert!(matches!(
            chain.validate(None, &response(500, None), &body),
            Err(Error::FailedResponse { status, .. }) if status.as_u16() == 500
        ));
    }

    #[test]
    fn parse_chain_rejects_redirects_with_resolved_location() {
        let chain = parse_chain();
        let mut redirect = response(302, None);
        redirect.headers.set("Location", "/v2/search");
        let error = chain
            .validate(None, &redirect, &Bytes::new())
            .expect_err("redirect should fail");
        match error {
            Error::UnexpectedRedirect { status, location, .. } => {
                assert_eq!(status.as_u16(), 302);
                assert_eq!(location.expect("location").path(), "/v2/search");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_chain_rejects_no_content() {
        let chain = parse_chain();
        assert!(matches!(
            chain.validate(None, &response(204, None), &Bytes::new()),
            Err(Error::UnexpectedNoContent)
        ));
    }

    #[test]
    fn unauthorized_carries_credential_and_json_detail() {
        let chain = parse_chain();
        let credential = Credential::basic("user", "pass");
        let body = Bytes::from_static(br#"{"error":"expired"}"#);
        let error = chain
            .validate(
                Some(&credential),
                &response(401, Some("application/json")),
                &body,
            )
            .expect_err("401 should fail");
        match error {
            Error::Unauthorized { credential, body_json, .. } => {
                assert!(credential.is_some());
                assert_eq!(body_json.expect("json")["error"], "expired");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn forbidden_carries_credential_and_json_detail() {
        let chain = parse_chain();
        let credential = Credential::basic("user", "pass");
        let body = Bytes::from_static(br#"{"error":"no access"}"#);
        let error = chain
            .validate(
                Some(&credential),
                &response(403, Some("application/json")),
                &body,
            )
            .expect_err("403 should fail");
        match error {
            Error::Forbidden { credential, status, body_json, .. } => {
                assert_eq!(status.as_u16(), 403);
                assert!(credential.is_some());
                assert_eq!(body_json.expect("json")["error"], "no access");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn content_type_mismatch_is_rejected() {
        let chain = parse_chain();
        let body = Bytes::from_static(b"<html></html>");
        assert!(matches!(
            chain.validate(None, &response(200, Some("text/html")), &body),
            Err(Error::UnexpectedContentType { content_type, .. }) if content_type == "text/html"
        ));
    }

    #[test]
    fn content_type_check_applies_to_empty_bodies() {
        let chain = parse_chain();
        assert!(matches!(
            chain.validate(None, &response(200, Some("text/html")), &Bytes::new()),
            Err(Error::UnexpectedContentType { content_type, .. }) if content_type == "text/html"
        ));
    }

    #[test]
    fn content_type_check_skips_undeclared_types() {
        let chain = parse_chain();
        let body = Bytes::from_static(b"{}");
        assert!(chain.validate(None, &response(200, None), &body).is_ok());
    }

    #[test]
    fn mime_matching_is_loose() {
        assert!(mime_matches("application/json", "Application/JSON; charset=utf-8"));
        assert!(mime_matches("application/*", "application/problem"));
        assert!(mime_matches("*/*", "text/plain"));
        assert!(!mime_matches("application/json", "text/json"));
        assert!(!mime_matches("application/json", "nonsense"));
    }

    #[test]
    fn accept_header_joins_expected_types() {
        assert_eq!(
            parse_chain().accept_header_value().as_deref(),
            Some("application/json, text/json")
        );
        assert_eq!(Chain::network().accept_header_value(), None);
    }
}
