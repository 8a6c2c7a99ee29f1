//! Turns a profile's [`TlsSettings`] into a `rumqttc` transport.
//!
//! Broken TLS material never stops a connection attempt. An unreadable CA file falls back
//! to the platform roots, and unreadable client credentials mean connecting without
//! client authentication. Each degradation is returned as a [`CoreError::Tls`] so the
//! caller can show it. Certificate verification is only switched off when the settings
//! say so; the client certificate is still presented then.

use super::config::TlsSettings;
use crate::error::CoreError;
use rumqttc::tokio_rustls::rustls;
use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, ServerName, UnixTime,
};
use rumqttc::tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};
use rumqttc::{TlsConfiguration, Transport};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// A transport plus the problems met while building it
pub struct TransportPlan {
    pub transport: Transport,
    pub warnings: Vec<CoreError>,
}

impl TransportPlan {
    fn new(transport: Transport, warnings: Vec<CoreError>) -> Self {
        for warning in &warnings {
            warn!("{}", warning);
        }
        TransportPlan {
            transport,
            warnings,
        }
    }
}

fn read(path: &Path, what: &str, warnings: &mut Vec<CoreError>) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(content) => Some(content),
        Err(e) => {
            warnings.push(CoreError::Tls(format!(
                "cannot read {} {}: {}",
                what,
                path.display(),
                e
            )));
            None
        }
    }
}

pub fn transport(settings: Option<&TlsSettings>) -> TransportPlan {
    let Some(settings) = settings else {
        return TransportPlan::new(Transport::Tcp, Vec::new());
    };

    let mut warnings = Vec::new();
    let client_auth = client_auth(settings, &mut warnings);

    if !settings.verify {
        warn!("Broker certificate verification is disabled");
        let transport = insecure_transport(client_auth, &mut warnings);
        return TransportPlan::new(transport, warnings);
    }

    let ca = settings
        .ca_file
        .as_deref()
        .and_then(|path| read(path, "CA file", &mut warnings));

    let transport = match ca {
        Some(ca) => Transport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }),
        None => {
            if client_auth.is_some() {
                warnings.push(CoreError::Tls(
                    "client certificate needs a CA file, connecting without it".into(),
                ));
            }
            Transport::tls_with_default_config()
        }
    };

    TransportPlan::new(transport, warnings)
}

/// PEM contents of the client certificate and key, when both are given and readable
fn client_auth(
    settings: &TlsSettings,
    warnings: &mut Vec<CoreError>,
) -> Option<(Vec<u8>, Vec<u8>)> {
    match (settings.cert_file.as_deref(), settings.key_file.as_deref()) {
        (Some(cert), Some(key)) => {
            let cert = read(cert, "client certificate", warnings);
            let key = read(key, "client key", warnings);
            cert.zip(key)
        }
        (None, None) => None,
        _ => {
            warnings.push(CoreError::Tls(
                "client certificate and key must be given together".into(),
            ));
            None
        }
    }
}

fn parse_client_auth(
    cert: &[u8],
    key: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), String> {
    let certs = rustls_pemfile::certs(&mut &cert[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("client certificate is not PEM: {}", e))?;
    if certs.is_empty() {
        return Err("no certificate in the client certificate file".into());
    }
    let key = rustls_pemfile::private_key(&mut &key[..])
        .map_err(|e| format!("client key is not PEM: {}", e))?
        .ok_or_else(|| "no private key in the client key file".to_string())?;
    Ok((certs, key))
}

/// Skips server verification but still presents the client certificate if there is one
fn insecure_transport(
    client_auth: Option<(Vec<u8>, Vec<u8>)>,
    warnings: &mut Vec<CoreError>,
) -> Transport {
    let builder = || {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
    };

    let config = match client_auth {
        None => builder().with_no_client_auth(),
        Some((cert, key)) => match parse_client_auth(&cert, &key)
            .and_then(|(certs, key)| {
                builder()
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| e.to_string())
            }) {
            Ok(config) => config,
            Err(e) => {
                warnings.push(CoreError::Tls(format!(
                    "{}, connecting without client certificate",
                    e
                )));
                builder().with_no_client_auth()
            }
        },
    };
    Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Accepts whatever the broker presents
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
