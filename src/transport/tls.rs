//! TLS client configuration for the SSLRequest upgrade.
//!
//! Semantics follow libpq: `prefer`/`require`/`allow` encrypt without
//! certificate verification, `verify-ca`/`verify-full` verify against the
//! webpki-roots CA bundle.

use std::sync::Arc;

use tokio_rustls::TlsConnector;

use crate::config::SslMode;
use crate::error::{Error, Result};

pub(crate) fn server_name(host: &str) -> Result<rustls::pki_types::ServerName<'static>> {
    host.to_string()
        .try_into()
        .map_err(|e| Error::Config(format!("invalid server name '{host}': {e}")))
}

/// Builds a TLS connector for the given SSL mode.
pub(crate) fn connector(ssl_mode: SslMode) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let config = match ssl_mode {
        SslMode::Disable => {
            return Err(Error::Config(
                "TLS connector requested with sslmode=disable".into(),
            ))
        }
        SslMode::Allow | SslMode::Prefer | SslMode::Require => build_no_verify_config(&provider)?,
        SslMode::VerifyCa | SslMode::VerifyFull => build_webpki_config(&provider)?,
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Build a ClientConfig that skips certificate verification (dangerous!).
fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ClientConfig> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("failed to set TLS versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();

    Ok(config)
}

/// Build a ClientConfig using the webpki-roots CA bundle.
fn build_webpki_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ClientConfig> {
    use rustls::RootCertStore;

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("failed to set TLS versions: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}
