//! Serving certificate for the admission webhook.
//!
//! The controller agent regenerates a self-signed certificate on every
//! start and publishes its CA bundle into the validating webhook
//! configuration, so no external certificate machinery is required.

use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};

use crate::error::Error;

/// A freshly generated self-signed serving certificate.
pub struct WebhookCertificate {
    /// PEM-encoded certificate; also the webhook's caBundle.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Generate a self-signed certificate for the webhook service.
///
/// The subject alternative names cover every DNS name under which the
/// in-cluster service is reachable.
pub fn generate_webhook_certificate(
    service: &str,
    namespace: &str,
) -> Result<WebhookCertificate, Error> {
    let sans = vec![
        service.to_string(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
        format!("{service}.{namespace}.svc.cluster.local"),
    ];

    let mut params = CertificateParams::new(sans)
        .map_err(|e| Error::internal(format!("certificate parameters: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(format!("{service}.{namespace}.svc")),
    );
    params.distinguished_name = dn;

    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2034, 1, 1);

    let key_pair =
        KeyPair::generate().map_err(|e| Error::internal(format!("key generation: {e}")))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::internal(format!("certificate generation: {e}")))?;

    Ok(WebhookCertificate {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_certificates_are_pem_encoded() {
        let cert = generate_webhook_certificate("pav-webhook", "pav").unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn each_generation_produces_a_distinct_key() {
        let a = generate_webhook_certificate("pav-webhook", "pav").unwrap();
        let b = generate_webhook_certificate("pav-webhook", "pav").unwrap();
        assert_ne!(a.key_pem, b.key_pem);
    }
}
