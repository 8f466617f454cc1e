//! Transport session: SOCKS5 dial, optional TLS, and the line-oriented
//! read/write halves the session engine runs on.
//!
//! All connections go through the configured SOCKS5 proxy. TLS uses rustls
//! with webpki roots (or an insecure verifier when explicitly requested)
//! and an optional client certificate for SASL EXTERNAL.
//!
//! Every outbound line goes through [`LineWriter`], which serializes writes
//! behind a mutex — the read-dispatch loop's automatic replies and the
//! foreground input loop share one stream, so there must be exactly one
//! write path. Closing is guarded to happen once.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

use crate::config::Config;

/// Byte-stream duplex the session engine runs on. Anything satisfying this
/// works: a proxied TCP stream, a TLS stream, or an in-memory duplex in
/// tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Dial the proxy, negotiate SOCKS5 to the target, and wrap in TLS when
/// configured. Returns the connected stream plus the informational lines
/// (cipher, certificate fingerprints) to show once the session starts.
pub async fn connect(cfg: &Config) -> Result<(BoxStream, Vec<String>)> {
    let mut info = vec![format!(
        "Connecting to {}:{} over {}, tls: {}...",
        cfg.server, cfg.port, cfg.proxy, cfg.tls
    )];

    let mut tcp = TcpStream::connect(&cfg.proxy)
        .await
        .with_context(|| format!("connect to proxy {} failed", cfg.proxy))?;
    socks5_connect(&mut tcp, cfg).await?;
    tracing::debug!(server = %cfg.server, proxy = %cfg.proxy, "SOCKS5 tunnel established");

    if !cfg.tls {
        return Ok((Box::new(tcp), info));
    }

    let tls_config = tls_client_config(cfg)?;
    let connector = TlsConnector::from(Arc::new(tls_config));
    let dns_name = rustls::pki_types::ServerName::try_from(cfg.server.clone())
        .map_err(|e| anyhow!("invalid server name {}: {e}", cfg.server))?;
    let tls = connector
        .connect(dns_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {} failed", cfg.server))?;

    {
        let (_, conn) = tls.get_ref();
        if let Some(suite) = conn.negotiated_cipher_suite() {
            info.push(format!("Cipher: {:?}", suite.suite()));
        }
        if let Some(certs) = conn.peer_certificates() {
            for (k, cert) in certs.iter().enumerate() {
                info.push(format!("Cert chain {k} fingerprint: {}", fingerprint(cert)));
            }
        }
    }
    tracing::debug!(server = %cfg.server, "TLS handshake complete");
    Ok((Box::new(tls), info))
}

/// SHA-256 fingerprint of a DER certificate, colon-separated hex.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn tls_client_config(cfg: &Config) -> Result<rustls::ClientConfig> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let builder = if cfg.tls_insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
    } else {
        let roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder().with_root_certificates(roots)
    };

    let config = match &cfg.sasl_cert {
        Some(prefix) => {
            let (certs, key) = load_client_cert(prefix)?;
            builder.with_client_auth_cert(certs, key)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Load `<prefix>.crt` / `<prefix>.key` for SASL EXTERNAL client auth.
fn load_client_cert(
    prefix: &str,
) -> Result<(
    Vec<rustls::pki_types::CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
)> {
    let cert_path = format!("{prefix}.crt");
    let key_path = format!("{prefix}.key");
    let cert_pem = std::fs::read(&cert_path).with_context(|| format!("read {cert_path}"))?;
    let key_pem = std::fs::read(&key_path).with_context(|| format!("read {key_path}"))?;

    let certs = rustls_pemfile::certs(&mut io::Cursor::new(cert_pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("parse {cert_path}"))?;
    let key = rustls_pemfile::private_key(&mut io::Cursor::new(key_pem))
        .with_context(|| format!("parse {key_path}"))?
        .ok_or_else(|| anyhow!("no private key in {key_path}"))?;
    Ok((certs, key))
}

/// Accepts any certificate. Only reachable via the explicit insecure flag.
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

// ── SOCKS5 (RFC 1928 / RFC 1929) ───────────────────────────────────

/// Negotiate a SOCKS5 CONNECT to `cfg.server:cfg.port` over an open proxy
/// connection, with username/password auth when credentials are set.
async fn socks5_connect(stream: &mut TcpStream, cfg: &Config) -> Result<()> {
    // Method selection.
    let methods: &[u8] = if cfg.proxy_auth.is_some() {
        &[0x00, 0x02]
    } else {
        &[0x00]
    };
    let mut greeting = vec![0x05, methods.len() as u8];
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        bail!("proxy is not SOCKS5");
    }
    match choice[1] {
        0x00 => {}
        0x02 => {
            let auth = cfg
                .proxy_auth
                .as_ref()
                .ok_or_else(|| anyhow!("proxy requires auth but none configured"))?;
            let mut req = vec![0x01, auth.username.len() as u8];
            req.extend_from_slice(auth.username.as_bytes());
            req.push(auth.password.len() as u8);
            req.extend_from_slice(auth.password.as_bytes());
            stream.write_all(&req).await?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                bail!("proxy rejected credentials");
            }
        }
        0xff => bail!("proxy accepted none of our auth methods"),
        m => bail!("proxy chose unsupported auth method {m:#04x}"),
    }

    // CONNECT request with a domain-type address: the proxy resolves the
    // name, so no local DNS leak.
    if cfg.server.len() > 255 {
        bail!("server name too long for SOCKS5");
    }
    let mut req = vec![0x05, 0x01, 0x00, 0x03, cfg.server.len() as u8];
    req.extend_from_slice(cfg.server.as_bytes());
    req.extend_from_slice(&cfg.port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        bail!("SOCKS5 connect failed: {}", socks5_error(head[1]));
    }
    // Consume the bound address so the stream starts at the payload.
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        t => bail!("unexpected SOCKS5 address type {t:#04x}"),
    };
    let mut skip = vec![0u8; addr_len + 2];
    stream.read_exact(&mut skip).await?;
    Ok(())
}

fn socks5_error(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

// ── Line halves ────────────────────────────────────────────────────

/// Splits a connected stream into the session's read/write halves.
pub struct Transport {
    reader: LineReader,
    writer: LineWriter,
}

impl Transport {
    pub fn new(stream: BoxStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: LineReader {
                inner: BufReader::new(read),
                buf: String::new(),
            },
            writer: LineWriter {
                inner: Arc::new(tokio::sync::Mutex::new(write)),
                closed: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    pub fn split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }
}

/// Exclusive read half; one owner, the read-dispatch loop.
pub struct LineReader {
    inner: BufReader<ReadHalf<BoxStream>>,
    buf: String,
}

impl LineReader {
    /// Read one protocol line, stripped of its terminator. `None` at EOF.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        let n = self.inner.read_line(&mut self.buf).await?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(self.buf.trim_end_matches(['\r', '\n']).to_string()))
        }
    }
}

/// Shared write half. Cloneable; every component that emits protocol lines
/// holds one of these, and the mutex serializes the actual writes.
#[derive(Clone)]
pub struct LineWriter {
    inner: Arc<tokio::sync::Mutex<WriteHalf<BoxStream>>>,
    closed: Arc<AtomicBool>,
}

impl LineWriter {
    /// Write one line with CRLF termination.
    pub async fn send_line(&self, line: &str) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        let mut w = self.inner.lock().await;
        w.write_all(line.as_bytes()).await?;
        w.write_all(b"\r\n").await?;
        w.flush().await
    }

    /// Shut the write side down. Idempotent: the first caller performs the
    /// shutdown, later (or concurrent) callers are no-ops.
    pub async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut w = self.inner.lock().await;
        w.shutdown().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
