//! TLS connector construction for the hyper transport.
//!
//! The OS certificate store is read at most once per process; every handler
//! rebuild after that reuses the cached roots.

use crate::config::{TlsRootConfig, TransportSecurity};
use crate::error::ConfigError;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};

static NATIVE_ROOTS: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS.get_or_init(|| {
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            tracing::warn!(error = %err, "error loading native root certificate");
        }
        tracing::debug!(count = loaded.certs.len(), "loaded native root certificates");
        loaded.certs
    })
}

/// The process-wide rustls provider if one is installed, aws-lc-rs otherwise.
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn native_client_config() -> Result<rustls::ClientConfig, ConfigError> {
    let certs = native_root_certs();
    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if added == 0 {
        return Err(ConfigError::Tls(
            format!(
                "no usable native root CA certificates (found {}, {ignored} unparsable)",
                certs.len()
            )
            .into(),
        ));
    }

    Ok(rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(Box::new(e)))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// HTTPS connector advertising h2 and http/1.1 via ALPN.
///
/// Plain `http://` URIs are refused unless `security` allows them.
///
/// # Errors
/// Returns `ConfigError::Tls` when the crypto provider rejects the protocol
/// versions or, for [`TlsRootConfig::Native`], when the OS store yields no
/// usable certificate.
pub fn https_connector(
    roots: TlsRootConfig,
    security: TransportSecurity,
) -> Result<HttpsConnector<HttpConnector>, ConfigError> {
    let builder = match roots {
        TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(crypto_provider())
            .map_err(|e| ConfigError::Tls(Box::new(e)))?,
        TlsRootConfig::Native => {
            hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(native_client_config()?)
        }
    };

    let connector = match security {
        TransportSecurity::AllowInsecureHttp => builder.https_or_http().enable_all_versions().build(),
        TransportSecurity::TlsOnly => builder.https_only().enable_all_versions().build(),
    };
    Ok(connector)
}
