//! Transport streams to Mariadb/Mysql and establishing them
use std::{
    collections::BTreeSet,
    io,
    net::IpAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    time::Instant,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{
        self, CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore,
        SignatureScheme,
        client::{
            WebPkiServerVerifier,
            danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        },
        crypto::{CryptoProvider, ring},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};
use tracing::debug;

use crate::{
    error::{ConnectionError, ConnectionErrorContent, ConnectionResult},
    options::{ConnectionOptions, SslMode},
};

/// A connection to Mariadb/Mysql over TCP, TLS, a unix socket or a named pipe
pub(crate) enum Stream {
    /// Plain TCP
    Tcp(TcpStream),
    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
    /// Unix domain socket
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    /// Windows named pipe
    #[cfg(windows)]
    Pipe(tokio::net::windows::named_pipe::NamedPipeClient),
}

impl Stream {
    /// Return true if the stream can not be read by others
    ///
    /// Local sockets and pipes count as secure
    pub(crate) fn is_secure(&self) -> bool {
        !matches!(self, Stream::Tcp(_))
    }

    /// Return true if the stream can be upgraded to TLS
    pub(crate) fn is_tcp(&self) -> bool {
        matches!(self, Stream::Tcp(_))
    }

    /// Perform a TLS handshake over the TCP stream
    pub(crate) async fn upgrade(
        self,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    ) -> ConnectionResult<Self> {
        let Stream::Tcp(tcp) = self else {
            return Err(ConnectionErrorContent::Tls(
                "TLS is only supported over TCP".to_string(),
            )
            .into());
        };
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ConnectionErrorContent::Tls(format!("handshake failed: {e}")))?;
        Ok(Stream::Tls(Box::new(tls)))
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(windows)]
            Stream::Pipe(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(windows)]
            Stream::Pipe(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
            #[cfg(windows)]
            Stream::Pipe(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(windows)]
            Stream::Pipe(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// The addresses a host name resolved to when a session was opened
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedHost {
    /// The host name as configured
    pub host: String,
    /// All addresses the host resolved to
    pub addresses: BTreeSet<IpAddr>,
}

/// A freshly established stream
pub(crate) struct Connected {
    /// The stream
    pub(crate) stream: Stream,
    /// The host we connected to, if we used TCP
    pub(crate) resolved: Option<ResolvedHost>,
}

/// Resolve host to the set of addresses it currently points at
pub(crate) async fn resolve(host: &str, port: u16) -> io::Result<BTreeSet<IpAddr>> {
    Ok(tokio::net::lookup_host((host, port))
        .await?
        .map(|a| a.ip())
        .collect())
}

/// Connect to Mariadb/Mysql as described by the options
///
/// Every address of every host is tried in order until one accepts the connection
/// or [ConnectionOptions::connect_timeout] has passed in total.
pub(crate) async fn connect(options: &ConnectionOptions) -> ConnectionResult<Connected> {
    if let Some(path) = &options.socket {
        return connect_socket(path, options).await;
    }
    if let Some(pipe) = &options.pipe {
        return connect_pipe(pipe);
    }

    let deadline = Instant::now() + options.connect_timeout;
    let mut attempted = Vec::new();
    let mut last_error: Option<ConnectionError> = None;
    'hosts: for host in options.ordered_hosts() {
        let addrs: Vec<_> = match tokio::time::timeout_at(
            deadline,
            tokio::net::lookup_host((host, options.port)),
        )
        .await
        {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => {
                debug!(host, error = %e, "Unable to resolve host");
                attempted.push(format!("{host}:{}", options.port));
                last_error = Some(e.into());
                continue;
            }
            Err(_) => {
                attempted.push(format!("{host}:{}", options.port));
                last_error = Some(ConnectionErrorContent::Timeout("resolving host").into());
                break;
            }
        };
        let resolved = ResolvedHost {
            host: host.to_string(),
            addresses: addrs.iter().map(|a| a.ip()).collect(),
        };
        for addr in addrs {
            attempted.push(addr.to_string());
            match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    debug!(host, %addr, "Connected");
                    return Ok(Connected {
                        stream: Stream::Tcp(stream),
                        resolved: Some(resolved),
                    });
                }
                Ok(Err(e)) => {
                    debug!(host, %addr, error = %e, "Unable to connect");
                    last_error = Some(e.into());
                }
                Err(_) => {
                    last_error = Some(ConnectionErrorContent::Timeout("connecting").into());
                    break 'hosts;
                }
            }
        }
    }
    let source = last_error.unwrap_or_else(|| {
        ConnectionErrorContent::InvalidOption("no addresses to connect to".to_string()).into()
    });
    Err(ConnectionErrorContent::UnableToConnect {
        attempted: attempted.join(", "),
        source: Box::new(source),
    }
    .into())
}

/// Connect to a unix domain socket
#[cfg(unix)]
async fn connect_socket(
    path: &std::path::Path,
    options: &ConnectionOptions,
) -> ConnectionResult<Connected> {
    let stream = match tokio::time::timeout(
        options.connect_timeout,
        tokio::net::UnixStream::connect(path),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(ConnectionErrorContent::UnableToConnect {
                attempted: path.display().to_string(),
                source: Box::new(e.into()),
            }
            .into());
        }
        Err(_) => return Err(ConnectionErrorContent::Timeout("connecting").into()),
    };
    debug!(socket = %path.display(), "Connected");
    Ok(Connected {
        stream: Stream::Unix(stream),
        resolved: None,
    })
}

/// Unix sockets are not available on this platform
#[cfg(not(unix))]
async fn connect_socket(
    _path: &std::path::Path,
    _options: &ConnectionOptions,
) -> ConnectionResult<Connected> {
    Err(ConnectionErrorContent::InvalidOption(
        "unix sockets are not supported on this platform".to_string(),
    )
    .into())
}

/// Connect to a named pipe
#[cfg(windows)]
fn connect_pipe(name: &str) -> ConnectionResult<Connected> {
    let path = if name.starts_with(r"\\") {
        name.to_string()
    } else {
        format!(r"\\.\pipe\{name}")
    };
    let client = tokio::net::windows::named_pipe::ClientOptions::new()
        .open(&path)
        .map_err(|e| ConnectionErrorContent::UnableToConnect {
            attempted: path.clone(),
            source: Box::new(e.into()),
        })?;
    debug!(pipe = %path, "Connected");
    Ok(Connected {
        stream: Stream::Pipe(client),
        resolved: None,
    })
}

/// Named pipes are not available on this platform
#[cfg(not(windows))]
fn connect_pipe(_name: &str) -> ConnectionResult<Connected> {
    Err(ConnectionErrorContent::InvalidOption(
        "named pipes are not supported on this platform".to_string(),
    )
    .into())
}

/// Accepts any certificate, but still checks the handshake signatures
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
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

/// Verifies the certificate chain but not that it was issued for the host name
#[derive(Debug)]
struct CaOnlyVerification(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for CaOnlyVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.0.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            r => r,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

/// Load the trusted roots, from the configured pem file or the system store
fn root_store(options: &ConnectionOptions) -> ConnectionResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match &options.ssl_ca {
        Some(path) => {
            let pem = std::fs::read(path)?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                roots.add(cert?).map_err(|e| {
                    ConnectionErrorContent::Tls(format!(
                        "invalid certificate in {}: {e}",
                        path.display()
                    ))
                })?;
            }
        }
        None => {
            let certs = rustls_native_certs::load_native_certs();
            for e in &certs.errors {
                debug!(error = %e, "Unable to load native certificate");
            }
            for cert in certs.certs {
                let _ = roots.add(cert);
            }
        }
    }
    if roots.is_empty() {
        return Err(ConnectionErrorContent::Tls("no trusted certificates found".to_string()).into());
    }
    Ok(roots)
}

/// Build the TLS connector for the configured [SslMode]
pub(crate) fn tls_connector(options: &ConnectionOptions) -> ConnectionResult<TlsConnector> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectionErrorContent::Tls(e.to_string()))?;
    let config = match options.ssl_mode {
        SslMode::VerifyFull => builder
            .with_root_certificates(root_store(options)?)
            .with_no_client_auth(),
        SslMode::VerifyCa => {
            let verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(root_store(options)?), provider)
                    .build()
                    .map_err(|e| ConnectionErrorContent::Tls(e.to_string()))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(CaOnlyVerification(verifier)))
                .with_no_client_auth()
        }
        SslMode::Disabled | SslMode::Preferred | SslMode::Required => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
            .with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// The name to present and verify in the TLS handshake
pub(crate) fn server_name(host: &str) -> ConnectionResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ConnectionErrorContent::Tls(format!("invalid server name {host:?}")).into())
}
