//! Server certificate validation hooks for the backchannel.
//!
//! A [`CertificateValidator`] sees the certificate chain presented by the
//! metadata host together with the outcome of standard WebPKI verification,
//! and makes the final accept/reject decision. It is installed into rustls
//! through [`tls_config_with_validator`].

use std::{collections::HashSet, fmt, sync::Arc};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::ring::default_provider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use sha2::{Digest, Sha256};
use webpki_roots::TLS_SERVER_ROOTS;

use super::middleware::ConfigurationError;

/// What a validator gets to look at for one TLS handshake.
pub struct CertificateValidationContext<'a> {
    pub server_name: &'a ServerName<'a>,
    pub end_entity: &'a CertificateDer<'a>,
    pub intermediates: &'a [CertificateDer<'a>],
    /// Error from WebPKI chain verification, if the chain did not verify.
    pub chain_error: Option<&'a rustls::Error>,
}

impl CertificateValidationContext<'_> {
    pub fn chain_is_valid(&self) -> bool {
        self.chain_error.is_none()
    }

    /// End-entity certificate followed by the intermediates, as DER.
    pub fn chain(&self) -> impl Iterator<Item = &[u8]> {
        std::iter::once(&self.end_entity[..]).chain(self.intermediates.iter().map(|c| &c[..]))
    }
}

/// Decides whether the backchannel trusts a server certificate.
pub trait CertificateValidator: Send + Sync + fmt::Debug {
    fn validate(&self, context: &CertificateValidationContext<'_>) -> bool;
}

/// Accepts a verified chain when any certificate in it has a pinned SHA-256
/// thumbprint.
#[derive(Debug, Clone)]
pub struct ThumbprintCertificateValidator {
    thumbprints: HashSet<String>,
}

impl ThumbprintCertificateValidator {
    pub fn new(thumbprints: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self {
            thumbprints: thumbprints
                .into_iter()
                .map(|t| t.as_ref().trim().replace(':', "").to_ascii_lowercase())
                .collect(),
        }
    }
}

impl CertificateValidator for ThumbprintCertificateValidator {
    fn validate(&self, context: &CertificateValidationContext<'_>) -> bool {
        if !context.chain_is_valid() {
            return false;
        }
        context
            .chain()
            .any(|der| self.thumbprints.contains(&hex::encode(Sha256::digest(der))))
    }
}

/// Adapts a closure into a [`CertificateValidator`].
pub struct FnCertificateValidator<F>(F);

impl<F> fmt::Debug for FnCertificateValidator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnCertificateValidator")
    }
}

impl<F> CertificateValidator for FnCertificateValidator<F>
where
    F: Fn(&CertificateValidationContext<'_>) -> bool + Send + Sync,
{
    fn validate(&self, context: &CertificateValidationContext<'_>) -> bool {
        (self.0)(context)
    }
}

pub fn certificate_validator_fn<F>(f: F) -> Arc<dyn CertificateValidator>
where
    F: Fn(&CertificateValidationContext<'_>) -> bool + Send + Sync + 'static,
{
    Arc::new(FnCertificateValidator(f))
}

/// rustls verifier that runs WebPKI verification and then defers to the
/// configured validator. Signature checks stay with WebPKI.
#[derive(Debug)]
struct CallbackServerCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    validator: Arc<dyn CertificateValidator>,
}

impl ServerCertVerifier for CallbackServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let chain_error = self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            .err();

        let context = CertificateValidationContext {
            server_name,
            end_entity,
            intermediates,
            chain_error: chain_error.as_ref(),
        };

        if self.validator.validate(&context) {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(
                server_name = ?server_name,
                chain_error = ?chain_error,
                "Backchannel certificate rejected by validator"
            );
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Build a rustls client config (webpki roots, ring provider) whose server
/// certificate decision is delegated to `validator`.
pub fn tls_config_with_validator(
    validator: Arc<dyn CertificateValidator>,
) -> Result<ClientConfig, ConfigurationError> {
    let provider = Arc::new(default_provider());

    let mut root_store = RootCertStore::empty();
    root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(root_store), provider.clone())
        .build()
        .map_err(|e| ConfigurationError::Tls(e.to_string()))?;

    let verifier = Arc::new(CallbackServerCertVerifier { inner, validator });

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigurationError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(config)
}
