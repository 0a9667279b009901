//! Non-negotiable defaults for the back-channel client.
//!
//! [`harden_client`] and [`harden_handler`] run before any user action;
//! [`verify`] runs after all of them and fails the build if the hardened
//! primary transport is gone.

use crate::config::{MAX_RESPONSE_BUFFER_SIZE, REQUEST_TIMEOUT};
use crate::error::ConfigError;
use crate::handler::{ClientSettings, HandlerBuilder};

/// Cap the response buffer at 10 MiB and each attempt at 60 s.
pub fn harden_client(settings: &mut ClientSettings) {
    settings.timeout = REQUEST_TIMEOUT;
    settings.max_response_buffer_size = MAX_RESPONSE_BUFFER_SIZE;
}

/// Disable the cookie jar on the primary transport and mark it hardened.
///
/// # Errors
/// Returns `ConfigError::UnexpectedTransport` if the primary is not the hyper
/// transport; hardening is never skipped silently.
pub fn harden_handler(handler: &mut HandlerBuilder) -> Result<(), ConfigError> {
    let transport = handler.hyper_transport_mut()?;
    transport.use_cookies = false;
    transport.mark_hardened();
    Ok(())
}

/// Check the outcome of a hardened build.
///
/// Explicitly raised limits and re-enabled cookies are honoured but logged.
///
/// # Errors
/// Returns `ConfigError::PrimaryReplaced` if the primary is no longer the
/// transport [`harden_handler`] hardened.
pub fn verify(settings: &ClientSettings, handler: &HandlerBuilder) -> Result<(), ConfigError> {
    let client = handler.client_name();
    let Some(transport) = handler.hyper_transport().filter(|t| t.is_hardened()) else {
        return Err(ConfigError::PrimaryReplaced {
            client: client.clone(),
        });
    };

    if transport.use_cookies {
        tracing::warn!(%client, "cookie jar re-enabled on hardened client");
    }
    if settings.timeout > REQUEST_TIMEOUT {
        tracing::warn!(
            %client,
            timeout = ?settings.timeout,
            hardened = ?REQUEST_TIMEOUT,
            "request timeout raised above hardened default"
        );
    }
    if settings.max_response_buffer_size > MAX_RESPONSE_BUFFER_SIZE {
        tracing::warn!(
            %client,
            max_response_buffer_size = settings.max_response_buffer_size,
            hardened = MAX_RESPONSE_BUFFER_SIZE,
            "response buffer cap raised above hardened default"
        );
    }
    Ok(())
}
