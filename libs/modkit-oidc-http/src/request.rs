use crate::client::{BufferedService, map_buffer_error};
use crate::error::HttpError;
use crate::response::HttpResponse;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Method, Request, Uri};
use http_body_util::Full;
use serde::Serialize;
use tower::{Service, ServiceExt};

/// Request being prepared on an [`HttpClient`](crate::HttpClient).
///
/// Header errors are deferred to [`send`](Self::send) so calls can be chained.
#[must_use = "RequestBuilder does nothing until .send() is called"]
pub struct RequestBuilder {
    service: BufferedService,
    max_body_size: usize,
    method: Method,
    url: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
    content_type: Option<&'static str>,
    error: Option<HttpError>,
}

impl RequestBuilder {
    pub(crate) fn new(
        service: BufferedService,
        max_body_size: usize,
        method: Method,
        url: String,
    ) -> Self {
        Self {
            service,
            max_body_size,
            method,
            url,
            headers: Vec::new(),
            body: Bytes::new(),
            content_type: None,
            error: None,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_none() {
            match parse_header(name, value) {
                Ok(header) => self.headers.push(header),
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            if self.error.is_some() {
                break;
            }
            self = self.header(name.as_ref(), value.as_ref());
        }
        self
    }

    /// JSON body with `Content-Type: application/json` unless set explicitly.
    ///
    /// # Errors
    /// Returns a deferred header error or `HttpError::Json` if serialization fails.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.body = Bytes::from(serde_json::to_vec(body)?);
        self.content_type = Some("application/json");
        Ok(self)
    }

    /// URL-encoded form body, as used by token introspection.
    ///
    /// # Errors
    /// Returns a deferred header error or `HttpError::FormEncode` if encoding fails.
    pub fn form<T: Serialize + ?Sized>(mut self, fields: &T) -> Result<Self, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.body = Bytes::from(serde_urlencoded::to_string(fields)?);
        self.content_type = Some("application/x-www-form-urlencoded");
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.content_type = None;
        self
    }

    /// Send the request through the client's handler stack.
    ///
    /// Every HTTP status is returned as `Ok`; use
    /// [`HttpResponse::error_for_status`] or the checked readers for 2xx-only
    /// handling. Dropping the returned future cancels the in-flight attempt
    /// and any pending retry.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidUri` for relative or non-http(s) URLs and the
    /// terminal transport, timeout or size error of the last attempt.
    pub async fn send(mut self) -> Result<HttpResponse, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let uri = parse_absolute_uri(&self.url)?;

        let mut builder = Request::builder().method(self.method).uri(uri);
        let explicit_content_type = self.headers.iter().any(|(name, _)| name == CONTENT_TYPE);
        if let Some(content_type) = self.content_type
            && !explicit_content_type
        {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }
        let request = builder.body(Full::new(self.body))?;

        let inner = self
            .service
            .ready()
            .await
            .map_err(map_buffer_error)?
            .call(request)
            .await
            .map_err(map_buffer_error)?;

        Ok(HttpResponse {
            inner,
            max_body_size: self.max_body_size,
        })
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), HttpError> {
    Ok((HeaderName::try_from(name)?, HeaderValue::try_from(value)?))
}

fn parse_absolute_uri(url: &str) -> Result<Uri, HttpError> {
    let invalid = |reason: String| HttpError::InvalidUri {
        url: url.to_owned(),
        reason,
    };

    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;
    match uri.scheme_str() {
        Some("http" | "https") => {}
        Some(other) => return Err(invalid(format!("unsupported scheme '{other}'"))),
        None => return Err(invalid("missing scheme".to_owned())),
    }
    if uri.authority().is_none() {
        return Err(invalid("missing host".to_owned()));
    }
    Ok(uri)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn absolute_http_and_https_urls_are_accepted() {
        assert!(parse_absolute_uri("https://idp.example.com/.well-known/jwks.json").is_ok());
        assert!(parse_absolute_uri("http://127.0.0.1:8080/introspect").is_ok());
    }

    #[test]
    fn relative_and_foreign_urls_are_rejected() {
        for url in ["/jwks", "idp.example.com/jwks", "ftp://idp.example.com/", "not a url"] {
            let err = parse_absolute_uri(url).unwrap_err();
            assert!(
                matches!(&err, HttpError::InvalidUri { url: u, .. } if u == url),
                "{url}: {err}"
            );
        }
    }

    #[test]
    fn header_parsing_reports_the_bad_part() {
        assert!(matches!(
            parse_header("bad header", "v"),
            Err(HttpError::InvalidHeaderName(_))
        ));
        assert!(matches!(
            parse_header("x-ok", "bad\nvalue"),
            Err(HttpError::InvalidHeaderValue(_))
        ));
    }
}
