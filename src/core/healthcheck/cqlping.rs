// src/core/healthcheck/cqlping.rs

//! Minimal CQL liveness probe: send an OPTIONS frame and wait for any frame
//! header back, optionally over TLS.

use crate::core::errors::ManagerError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// CQL v4 OPTIONS request frame: version, flags, stream, opcode, empty body.
const OPTIONS_FRAME: [u8; 9] = [0x04, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00];
/// A CQL frame header is always 9 bytes.
const FRAME_HEADER_LEN: usize = 9;

pub struct PingConfig {
    pub addr: String,
    pub timeout: Duration,
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

/// Performs the handshake and returns the measured round-trip time.
pub async fn ping(config: &PingConfig) -> Result<Duration, ManagerError> {
    let start = Instant::now();
    tokio::time::timeout(config.timeout, async {
        let stream = TcpStream::connect(&config.addr).await?;
        match &config.tls {
            None => handshake(stream).await,
            Some(tls) => {
                let connector = TlsConnector::from(tls.clone());
                let host = config.addr.split(':').next().unwrap_or_default();
                let name = ServerName::try_from(host.to_string()).map_err(|e| {
                    ManagerError::Validation(format!("invalid server name {host:?}: {e}"))
                })?;
                let stream = connector.connect(name, stream).await?;
                handshake(stream).await
            }
        }
    })
    .await
    .map_err(|_| ManagerError::Transient(format!("ping {}: timed out", config.addr)))??;

    Ok(start.elapsed())
}

async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) -> Result<(), ManagerError> {
    stream.write_all(&OPTIONS_FRAME).await?;
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    Ok(())
}

/// Accepts any server certificate. Node-internal CQL endpoints routinely run
/// self-signed certificates, so the probe verifies liveness, not identity.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS configuration without server verification or client auth.
pub fn insecure_config() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth(),
    )
}

/// TLS configuration presenting the cluster's client-auth key pair.
pub fn insecure_config_with_identity(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<rustls::ClientConfig>, ManagerError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut Cursor::new(cert_pem))
        .collect::<Result<_, _>>()
        .map_err(|e| ManagerError::Validation(format!("invalid TLS user cert: {e}")))?;
    let key = rustls_pemfile::private_key(&mut Cursor::new(key_pem))
        .map_err(|e| ManagerError::Validation(format!("invalid TLS user key: {e}")))?
        .ok_or_else(|| ManagerError::Validation("no private key found".into()))?;

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_client_auth_cert(certs, key)
        .map_err(|e| ManagerError::Validation(format!("invalid TLS user key pair: {e}")))?;
    Ok(Arc::new(config))
}
