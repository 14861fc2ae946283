//! Transport: plain TCP or TLS over TCP.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use log::debug;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use super::error::{PgError, PgResult};
use super::protocol::{FrontendMessage, SslRequestMessage};
use super::settings::{ConnectionSettings, SslMode};
use super::types::ProtocolVersion;

pin_project! {
    #[project = PgStreamProj]
    #[derive(Debug)]
    pub enum PgStream {
        Plain {
            #[pin]
            stream: TcpStream,
        },
        Tls {
            #[pin]
            stream: tokio_native_tls::TlsStream<TcpStream>,
        },
    }
}

impl PgStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, PgStream::Tls { .. })
    }
}

impl AsyncRead for PgStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            PgStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            PgStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PgStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.project() {
            PgStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            PgStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.project() {
            PgStreamProj::Plain { stream } => stream.poll_flush(cx),
            PgStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.project() {
            PgStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            PgStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

/// Open a transport to the configured server, bounded by `settings.timeout`.
///
/// Nothing protocol-level is sent except the SSLRequest when TLS is wanted.
pub async fn connect(settings: &ConnectionSettings) -> PgResult<PgStream> {
    match tokio::time::timeout(settings.timeout, connect_inner(settings)).await {
        Ok(result) => result,
        Err(_) => Err(PgError::Timeout),
    }
}

async fn connect_inner(settings: &ConnectionSettings) -> PgResult<PgStream> {
    let mut tcp = connect_tcp(&settings.host, settings.port).await?;
    tcp.set_nodelay(true)?;

    if settings.ssl_mode == SslMode::Disable {
        return Ok(PgStream::Plain { stream: tcp });
    }

    // Request a TLS connection
    let request = SslRequestMessage.encode(ProtocolVersion::V3)?;
    tcp.write_all(&request).await?;
    tcp.flush().await?;

    match tcp.read_u8().await? {
        // Server supports TLS
        b'S' => {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(settings.trust_server_certificate)
                .danger_accept_invalid_hostnames(settings.trust_server_certificate)
                .build()?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let stream = connector.connect(&settings.host, tcp).await?;
            debug!("TLS established with {}", settings.display_target());
            Ok(PgStream::Tls { stream })
        }
        // Server does not support TLS
        b'N' if settings.ssl_mode == SslMode::Prefer => {
            debug!(
                "{} refused TLS, continuing unencrypted",
                settings.display_target()
            );
            Ok(PgStream::Plain { stream: tcp })
        }
        b'N' => Err(PgError::Unsupported(
            "Server does not support SSL and sslmode is require".to_string(),
        )),
        m => Err(PgError::Protocol(format!(
            "Received unexpected response '{}' (ASCII: {}) during TLS negotiation",
            m as char, m
        ))),
    }
}

/// Dotted addresses connect directly; names go through the resolver and
/// each address is tried in turn.
async fn connect_tcp(host: &str, port: u16) -> PgResult<TcpStream> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(TcpStream::connect(SocketAddr::new(ip, port)).await?);
    }

    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!("Connect to {} failed: {}", addr, err);
                last_err = Some(err);
            }
        }
    }
    Err(PgError::Io(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("No addresses found for host {}", host),
        )
    })))
}

/// Read whatever is available into `buf`; zero bytes means the peer closed.
pub(crate) async fn read_into(stream: &mut PgStream, buf: &mut BytesMut) -> PgResult<()> {
    if buf.capacity() - buf.len() < 4096 {
        buf.reserve(8192);
    }
    let n = stream.read_buf(buf).await?;
    if n == 0 {
        return Err(PgError::ConnectionClosed);
    }
    Ok(())
}
