//! Byte transport between sensor and receiver: a TCP stream, optionally
//! wrapped in TLS, authenticated during connection setup when enabled.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use ps_config::Config;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::frame::CONN_TIMEOUT;
use crate::{auth, tls, StreamError};

pub enum Transport {
    Plain(TcpStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dial the configured downstream server, run the optional TLS and auth
/// setup, and hand back a ready transport.
pub async fn connect(config: &Config) -> Result<Transport, StreamError> {
    let server = config
        .output
        .server
        .as_ref()
        .ok_or(StreamError::NoServerOutput)?;
    let port = server.port.ok_or(StreamError::NoServerOutput)?;
    let addr = format!("{}:{}", server.address, port);

    let tcp = tokio::time::timeout(CONN_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| StreamError::Timeout)??;

    let mut transport = if config.tls.enable {
        let tls_config = tls::client_config(&config.tls.cert_file, &config.tls.key_file)?;
        let server_name = ServerName::try_from(server.address.clone())
            .map_err(|e| StreamError::Tls(e.to_string()))?;
        let stream = TlsConnector::from(Arc::clone(&tls_config))
            .connect(server_name, tcp)
            .await
            .map_err(|e| StreamError::Tls(e.to_string()))?;
        Transport::TlsClient(Box::new(stream))
    } else {
        log::info!("Connection established, TLS disabled: {}", addr);
        Transport::Plain(tcp)
    };

    if config.auth.enable {
        auth::client_handshake(&mut transport, &config.auth.key).await?;
    }

    Ok(transport)
}
