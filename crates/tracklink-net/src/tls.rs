//! TLS client setup and certificate policy.
//!
//! Chain and name checks are performed by rustls' webpki verifier. Its
//! verdict is translated into [`PolicyErrors`] and handed to a
//! [`CertificateValidator`], which has the final say.

use std::fmt;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::Result;

/// Problems found while checking a peer certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyErrors {
    /// The peer presented no certificate.
    pub not_available: bool,
    /// The certificate does not cover the requested host name.
    pub name_mismatch: bool,
    /// The chain could not be built to a trusted root, or a certificate in
    /// it is expired, revoked or malformed.
    pub chain_errors: bool,
}

impl PolicyErrors {
    /// No problems at all.
    pub const NONE: Self = Self {
        not_available: false,
        name_mismatch: false,
        chain_errors: false,
    };

    /// Returns true if no problem was found.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.not_available && !self.name_mismatch && !self.chain_errors
    }

    /// Returns true if the name mismatch is the only problem.
    #[must_use]
    pub const fn is_name_mismatch_only(&self) -> bool {
        self.name_mismatch && !self.not_available && !self.chain_errors
    }

    fn from_rustls(error: &rustls::Error) -> Self {
        match error {
            rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            ) => Self {
                name_mismatch: true,
                ..Self::NONE
            },
            rustls::Error::NoCertificatesPresented => Self {
                not_available: true,
                ..Self::NONE
            },
            _ => Self {
                chain_errors: true,
                ..Self::NONE
            },
        }
    }
}

impl fmt::Display for PolicyErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names = [
            (self.not_available, "certificate not available"),
            (self.name_mismatch, "name mismatch"),
            (self.chain_errors, "chain errors"),
        ];
        let mut first = true;
        for (_, name) in names.iter().filter(|(set, _)| *set) {
            if !first {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

/// Decides whether a peer certificate is trusted.
pub trait CertificateValidator: Send + Sync + fmt::Debug {
    /// Returns true to accept the certificate despite `errors`.
    fn validate(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        errors: &PolicyErrors,
    ) -> bool;
}

/// Accepts certificates with no problems, or whose only problem is a host
/// name mismatch.
///
/// This is deliberately permissive: a trusted chain issued for a different
/// name is accepted. Use [`StrictValidator`] to reject those too.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValidator;

impl CertificateValidator for DefaultValidator {
    fn validate(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        errors: &PolicyErrors,
    ) -> bool {
        errors.is_empty() || errors.is_name_mismatch_only()
    }
}

/// Accepts only certificates with no problems at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictValidator;

impl CertificateValidator for StrictValidator {
    fn validate(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        errors: &PolicyErrors,
    ) -> bool {
        errors.is_empty()
    }
}

/// rustls verifier that defers the final decision to a [`CertificateValidator`].
#[derive(Debug)]
struct PolicyVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    validator: Arc<dyn CertificateValidator>,
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let verdict = self.webpki.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );
        let errors = verdict
            .as_ref()
            .map_or_else(PolicyErrors::from_rustls, |_| PolicyErrors::NONE);

        if self.validator.validate(end_entity, intermediates, &errors) {
            if !errors.is_empty() {
                tracing::debug!(server = ?server_name, %errors, "certificate accepted by policy");
            }
            return Ok(ServerCertVerified::assertion());
        }

        tracing::warn!(server = ?server_name, %errors, "certificate rejected by policy");
        match verdict {
            Err(e) => Err(e),
            Ok(_) => Err(rustls::Error::General(
                "certificate rejected by validator".to_string(),
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

/// Creates a TLS connector trusting the webpki roots plus `extra_roots`,
/// with `validator` making the final trust decision.
///
/// # Errors
///
/// Returns an error if a root certificate cannot be parsed or the verifier
/// cannot be built.
pub fn create_tls_connector(
    validator: Arc<dyn CertificateValidator>,
    extra_roots: &[CertificateDer<'static>],
) -> Result<TlsConnector> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    for cert in extra_roots {
        roots.add(cert.clone())?;
    }

    let webpki = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| rustls::Error::General(e.to_string()))?;

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PolicyVerifier { webpki, validator }))
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parses `host` into a TLS server name. IP literals are accepted.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok(ServerName::try_from(bare.to_string())?)
}
