//! TCP/TLS transport for the protobuf endpoint.

pub mod endpoints;
pub mod frame;

pub use frame::FrameCodec;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use log::info;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::config::SessionConfig;
use crate::error::{CTraderError, Result};

/// A TCP stream that is either plain or wrapped in TLS.
///
/// The production endpoint requires TLS; the plain variant exists so tests
/// can run the full session against an in-process stub server.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Opens the TCP connection described by `config`, performing the TLS
/// handshake when `use_tls` is set. The whole dial is bounded by
/// `connect_timeout`.
pub(crate) async fn connect(config: &SessionConfig) -> Result<MaybeTlsStream> {
    let host = config.host();
    let addr = (host.as_str(), config.port);

    if config.connection_debug {
        info!(
            "Connecting to {}:{} (tls={})...",
            host, config.port, config.use_tls
        );
    }

    let dial = async {
        let tcp = TcpStream::connect(addr).await.map_err(|e| {
            CTraderError::ConnectionFailed(format!(
                "failed to connect to {}:{}: {}",
                host, config.port, e
            ))
        })?;
        tcp.set_nodelay(true)?;

        if !config.use_tls {
            return Ok(MaybeTlsStream::Plain(tcp));
        }

        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| CTraderError::ConnectionFailed(format!("invalid DNS name: {}", host)))?;
        let tls = tls_connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| CTraderError::ConnectionFailed(format!("TLS handshake failed: {}", e)))?;
        Ok(MaybeTlsStream::Tls(Box::new(tls)))
    };

    match tokio::time::timeout(config.connect_timeout(), dial).await {
        Ok(result) => {
            if result.is_ok() {
                info!("Connected to {}:{}", host, config.port);
            }
            result
        }
        Err(_) => Err(CTraderError::ConnectionFailed(format!(
            "connection to {}:{} timed out after {:?}",
            host,
            config.port,
            config.connect_timeout()
        ))),
    }
}
