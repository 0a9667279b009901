//! Tower layers of the client stack
//!
//! - [`ResiliencyLayer`] - re-issues requests as a [`RetryPolicy`](crate::RetryPolicy) decides
//! - [`ResponseLimitLayer`] - caps response bodies at the client's buffer size
//! - [`AttemptDeadlineLayer`] - bounds each attempt, body included, by the client timeout
//! - [`CookieLayer`] - per-handler cookie jar, installed only when cookies are enabled
//! - [`DefaultHeadersLayer`] - adds default headers (User-Agent) when absent

mod cookies;
mod deadline;
mod headers;
mod limit;
mod resiliency;

pub use cookies::{CookieJar, CookieLayer, CookieService};
pub use deadline::{AttemptDeadlineLayer, AttemptDeadlineService, DeadlineBody};
pub use headers::{DefaultHeadersLayer, DefaultHeadersService};
pub use limit::{ResponseLimitLayer, ResponseLimitService};
pub use resiliency::{RETRY_ATTEMPT_HEADER, ResiliencyLayer, ResiliencyService};
