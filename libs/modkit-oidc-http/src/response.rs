use crate::error::HttpError;
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use http_body::Frame;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

/// How much of a non-2xx body is kept in [`HttpError::HttpStatus`] (8 KiB).
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// Type-erased response body flowing through the client stack.
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Parse `Retry-After` as delay-seconds or an HTTP-date.
///
/// Returns `None` when the header is missing, malformed, negative or in the past.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    let value = value.trim();

    if let Ok(seconds) = value.parse::<i64>() {
        return u64::try_from(seconds).ok().map(Duration::from_secs);
    }

    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(SystemTime::now()).ok()
}

/// Map a boxed body error back into an `HttpError`.
///
/// [`LimitedBody`] inside the stack reports `BodyTooLarge` through the boxed
/// error channel; it must surface as-is, not as a transport failure.
pub fn body_error(err: Box<dyn std::error::Error + Send + Sync>) -> HttpError {
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(other) => HttpError::Transport(other),
    }
}

pin_project! {
    /// Streaming body that fails with [`HttpError::BodyTooLarge`] once more
    /// than `limit` bytes have been read.
    pub struct LimitedBody {
        #[pin]
        inner: ResponseBody,
        limit: usize,
        read: usize,
    }
}

impl LimitedBody {
    #[must_use]
    pub fn new(inner: ResponseBody, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }

    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl http_body::Body for LimitedBody {
    type Data = Bytes;
    type Error = HttpError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    *this.read += data.len();
                    if *this.read > *this.limit {
                        return Poll::Ready(Some(Err(HttpError::BodyTooLarge {
                            limit: *this.limit,
                            actual: *this.read,
                        })));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(body_error(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

/// Response returned by [`HttpClient`](crate::HttpClient).
///
/// Every buffered read (`bytes`, `checked_bytes`, `json`, `text`) enforces the
/// client's `max_response_buffer_size`.
#[derive(Debug)]
pub struct HttpResponse {
    pub(crate) inner: Response<ResponseBody>,
    pub(crate) max_body_size: usize,
}

impl HttpResponse {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    #[must_use]
    pub fn into_inner(self) -> Response<ResponseBody> {
        self.inner
    }

    /// Return `HttpError::HttpStatus` for a non-2xx response without reading the body.
    ///
    /// # Errors
    /// Returns `HttpError::HttpStatus` if the status is not 2xx.
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.inner.status().is_success() {
            return Ok(self);
        }

        Err(HttpError::HttpStatus {
            status: self.inner.status(),
            body_preview: String::new(),
            content_type: content_type(self.inner.headers()),
            retry_after: parse_retry_after(self.inner.headers()),
        })
    }

    /// Read the whole body without checking the status.
    ///
    /// # Errors
    /// Returns `HttpError::BodyTooLarge` if the body exceeds the cap.
    pub async fn bytes(self) -> Result<Bytes, HttpError> {
        read_limited(self.inner, self.max_body_size).await
    }

    /// Read the whole body of a 2xx response.
    ///
    /// # Errors
    /// Returns `HttpError::HttpStatus` (with a body preview) for non-2xx,
    /// `HttpError::BodyTooLarge` if the body exceeds the cap.
    pub async fn checked_bytes(self) -> Result<Bytes, HttpError> {
        read_checked(self.inner, self.max_body_size).await
    }

    /// Parse a 2xx body as JSON.
    ///
    /// # Errors
    /// Returns `HttpError::HttpStatus` for non-2xx, `HttpError::BodyTooLarge`
    /// if the body exceeds the cap, `HttpError::Json` if parsing fails.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let body = read_checked(self.inner, self.max_body_size).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Read a 2xx body as UTF-8 (lossy).
    ///
    /// # Errors
    /// Returns `HttpError::HttpStatus` for non-2xx, `HttpError::BodyTooLarge`
    /// if the body exceeds the cap.
    pub async fn text(self) -> Result<String, HttpError> {
        let body = read_checked(self.inner, self.max_body_size).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Stream the body with the size cap enforced per frame.
    #[must_use]
    pub fn into_limited_body(self) -> LimitedBody {
        LimitedBody::new(self.inner.into_body(), self.max_body_size)
    }

    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn read_checked(
    response: Response<ResponseBody>,
    max_body_size: usize,
) -> Result<Bytes, HttpError> {
    let status = response.status();
    if status.is_success() {
        return read_limited(response, max_body_size).await;
    }

    let content_type = content_type(response.headers());
    let retry_after = parse_retry_after(response.headers());
    let preview_limit = max_body_size.min(ERROR_BODY_PREVIEW_LIMIT);
    let body_preview = match read_limited(response, preview_limit).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(HttpError::BodyTooLarge { .. }) => "<body too large for preview>".to_owned(),
        Err(e) => return Err(e),
    };

    Err(HttpError::HttpStatus {
        status,
        body_preview,
        content_type,
        retry_after,
    })
}

pub async fn read_limited(
    response: Response<ResponseBody>,
    limit: usize,
) -> Result<Bytes, HttpError> {
    let mut body = std::pin::pin!(response.into_body());
    let mut collected = Vec::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(body_error)?;
        if let Some(chunk) = frame.data_ref() {
            let actual = collected.len() + chunk.len();
            if actual > limit {
                return Err(HttpError::BodyTooLarge { limit, actual });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}
