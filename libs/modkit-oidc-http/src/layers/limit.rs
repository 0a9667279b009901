use crate::error::HttpError;
use crate::response::{LimitedBody, ResponseBody};
use http::{Request, Response};
use http_body_util::BodyExt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Tower layer enforcing the response buffer cap on every attempt.
///
/// A declared `Content-Length` above the limit fails the attempt before any
/// byte is read; otherwise the body is wrapped in a [`LimitedBody`] so that
/// chunked or lying responses fail once the limit is crossed.
#[derive(Clone, Copy, Debug)]
pub struct ResponseLimitLayer {
    limit: usize,
}

impl ResponseLimitLayer {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl<S> Layer<S> for ResponseLimitLayer {
    type Service = ResponseLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ResponseLimitService {
            inner,
            limit: self.limit,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResponseLimitService<S> {
    inner: S,
    limit: usize,
}

impl<S, ReqBody> Service<Request<ReqBody>> for ResponseLimitService<S>
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
        let limit = self.limit;
        let fut = self.inner.call(req);

        Box::pin(async move {
            let response = fut.await?;

            let declared = response
                .headers()
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<usize>().ok());
            if let Some(actual) = declared
                && actual > limit
            {
                return Err(HttpError::BodyTooLarge { limit, actual });
            }

            let (parts, body) = response.into_parts();
            let body: ResponseBody = LimitedBody::new(body, limit)
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
                .boxed();
            Ok(Response::from_parts(parts, body))
        })
    }
}
