/**
 * TLS MQTT - Transport chiffré vers le broker
 *
 * RÔLE : Construire le `Transport` rumqttc selon la config :
 * - CA fourni : configuration simple avec ce CA (+ certificat client optionnel)
 * - pas de CA : racines du système, ou racines Mozilla si un certificat
 *   client doit être présenté
 * - mode insecure : aucun contrôle du certificat serveur
 */

use super::PublishError;
use crate::config::TlsSettings;
use rumqttc::tokio_rustls::rustls;
use rumqttc::{TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub fn transport(settings: &TlsSettings) -> Result<Transport, PublishError> {
    if settings.insecure {
        warn!("MQTT TLS certificate verification disabled");
        return Ok(Transport::tls_with_config(insecure_config(settings)?));
    }

    match &settings.ca_cert {
        Some(ca_path) => {
            let ca = read(ca_path)?;
            let client_auth = match (&settings.client_cert, &settings.client_key) {
                (Some(cert), Some(key)) => Some((read(cert)?, read(key)?)),
                _ => None,
            };
            Ok(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }))
        }
        None => match (&settings.client_cert, &settings.client_key) {
            (Some(cert), Some(key)) => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                let config = rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                    .map_err(|e| PublishError::Tls(e.to_string()))?;
                Ok(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config))))
            }
            // racines du système
            _ => Ok(Transport::tls_with_default_config()),
        },
    }
}

fn insecure_config(settings: &TlsSettings) -> Result<TlsConfiguration, PublishError> {
    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));

    let config = match (&settings.client_cert, &settings.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| PublishError::Tls(e.to_string()))?,
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

fn read(path: &Path) -> Result<Vec<u8>, PublishError> {
    std::fs::read(path).map_err(|e| PublishError::Tls(format!("{}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, PublishError> {
    let pem = read(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PublishError::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(PublishError::Tls(format!("{}: no certificate found", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, PublishError> {
    let pem = read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| PublishError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| PublishError::Tls(format!("{}: no private key found", path.display())))
}

/// Accepte n'importe quel certificat serveur (MQTT_TLS_INSECURE).
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
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
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insecure_mode_builds_without_any_files() {
        let settings = TlsSettings { insecure: true, ..Default::default() };
        assert!(transport(&settings).is_ok());
    }

    #[test]
    fn insecure_mode_still_needs_readable_client_keys() {
        let settings = TlsSettings {
            insecure: true,
            client_cert: Some("/nonexistent/client.pem".into()),
            client_key: Some("/nonexistent/client.key".into()),
            ..Default::default()
        };
        assert!(matches!(transport(&settings), Err(PublishError::Tls(_))));
    }

    #[test]
    fn client_keys_are_loaded_without_a_ca() {
        let settings = TlsSettings {
            client_cert: Some("/nonexistent/client.pem".into()),
            client_key: Some("/nonexistent/client.key".into()),
            ..Default::default()
        };
        match transport(&settings) {
            Err(PublishError::Tls(msg)) => assert!(msg.contains("/nonexistent/client.pem")),
            other => panic!("expected a TLS error, got {:?}", other.map(|_| ())),
        }
    }
}
