//! rustls client configuration built from [`TlsOptions`]

use crate::error::{BackendError, ConnectStep};
use relay_types::{Material, TlsOptions};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tracing::{debug, warn};

/// Address schemes that imply an encrypted transport
const TLS_SCHEMES: &[&str] = &["tls", "ssl", "mqtts", "wss"];

/// Whether a connection should be wrapped in TLS
pub fn wants_tls(scheme: &str, options: &TlsOptions) -> bool {
    options.use_tls || TLS_SCHEMES.contains(&scheme)
}

fn tls_error(message: impl std::fmt::Display) -> BackendError {
    BackendError::connect(ConnectStep::Tls, message)
}

/// Parse every certificate in a PEM bundle
pub fn load_certs(material: &Material) -> Result<Vec<CertificateDer<'static>>, BackendError> {
    let pem = material.load_bytes().map_err(tls_error)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("invalid certificate PEM: {e}")))?;

    if certs.is_empty() {
        return Err(tls_error("no certificates found in PEM material"));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM bundle
pub fn load_private_key(material: &Material) -> Result<PrivateKeyDer<'static>, BackendError> {
    let pem = material.load_bytes().map_err(tls_error)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| tls_error(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| tls_error("no private key found in PEM material"))
}

fn root_store(options: &TlsOptions) -> Result<RootCertStore, BackendError> {
    let mut store = RootCertStore::empty();

    match &options.ca_cert {
        Some(ca) => {
            for cert in load_certs(ca)? {
                store
                    .add(cert)
                    .map_err(|e| tls_error(format!("unable to add CA certificate: {e}")))?;
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    debug!(roots = store.len(), "Built TLS root store");
    Ok(store)
}

/// Build a client config honoring CA, client certificate and skip-verify settings
pub fn client_config(options: &TlsOptions) -> Result<ClientConfig, BackendError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let builder = if options.skip_verify {
        warn!("TLS server verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification::new(provider)))
    } else {
        builder.with_root_certificates(root_store(options)?)
    };

    match (&options.client_cert, &options.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| tls_error(format!("invalid client certificate: {e}"))),
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct NoServerVerification(Arc<CryptoProvider>);

impl NoServerVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self(provider)
    }
}

impl ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
