use crate::error::HttpError;
use crate::response::{ResponseBody, body_error};
use bytes::Bytes;
use http::{Request, Response};
use http_body::Frame;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep, sleep_until, timeout_at};
use tower::{Layer, Service};

/// Tower layer bounding one attempt, response body included, by a single
/// deadline.
///
/// The deadline starts when the attempt is issued. Waiting for headers and
/// every later body read share it, so a server trickling bytes fails with
/// [`HttpError::Timeout`] instead of holding the caller indefinitely.
#[derive(Clone, Copy, Debug)]
pub struct AttemptDeadlineLayer {
    timeout: Duration,
}

impl AttemptDeadlineLayer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for AttemptDeadlineLayer {
    type Service = AttemptDeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AttemptDeadlineService {
            inner,
            timeout: self.timeout,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AttemptDeadlineService<S> {
    inner: S,
    timeout: Duration,
}

impl<S, ReqBody> Service<Request<ReqBody>> for AttemptDeadlineService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResponseBody>, Error = HttpError>,
    S::Future: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;
        let fut = self.inner.call(req);

        Box::pin(async move {
            let response = timeout_at(deadline, fut)
                .await
                .map_err(|_| HttpError::Timeout(timeout))??;

            let (parts, body) = response.into_parts();
            let body: ResponseBody = DeadlineBody::new(body, deadline, timeout)
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
                .boxed();
            Ok(Response::from_parts(parts, body))
        })
    }
}

pin_project! {
    /// Streaming body that fails with [`HttpError::Timeout`] once the attempt
    /// deadline has passed.
    pub struct DeadlineBody {
        #[pin]
        inner: ResponseBody,
        #[pin]
        sleep: Sleep,
        timeout: Duration,
    }
}

impl DeadlineBody {
    #[must_use]
    pub fn new(inner: ResponseBody, deadline: Instant, timeout: Duration) -> Self {
        Self {
            inner,
            sleep: sleep_until(deadline),
            timeout,
        }
    }
}

impl http_body::Body for DeadlineBody {
    type Data = Bytes;
    type Error = HttpError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        if this.sleep.poll(cx).is_ready() {
            return Poll::Ready(Some(Err(HttpError::Timeout(*this.timeout))));
        }

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
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
