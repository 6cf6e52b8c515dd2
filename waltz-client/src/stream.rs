//! Plain TCP or TLS transport for client connections.

use crate::connection::ConnectionConfig;
use crate::error::ClientError;
use crate::tls::{create_insecure_tls_connector, create_tls_connector};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;

pin_project! {
    /// Transport under an RPC connection.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

impl ClientStream {
    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

/// Opens the transport described by `config`, upgrading to TLS when enabled.
pub async fn connect_stream(config: &ConnectionConfig) -> Result<ClientStream, ClientError> {
    tracing::debug!("Connecting to {}...", config.addr);

    let tcp_stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
        .await
        .map_err(|_| ClientError::Timeout)??;
    tcp_stream.set_nodelay(true).ok();

    let tls_config = match config.tls {
        Some(ref tls) if tls.enabled => tls,
        _ => return Ok(ClientStream::Plain { stream: tcp_stream }),
    };

    let host = config.addr.ip().to_string();
    let (connector, server_name) = if tls_config.insecure {
        tracing::warn!("Using insecure TLS (certificate verification disabled)");
        create_insecure_tls_connector(tls_config, &host)?
    } else {
        create_tls_connector(tls_config, &host)?
    };

    let stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
    tracing::debug!("TLS handshake with {} complete", config.addr);
    Ok(ClientStream::Tls { stream })
}

/// Forwards a poll call to whichever transport is underneath.
macro_rules! delegate {
    ($self:ident.$method:ident($($arg:expr),*)) => {
        match $self.project() {
            ClientStreamProj::Plain { stream } => stream.$method($($arg),*),
            ClientStreamProj::Tls { stream } => stream.$method($($arg),*),
        }
    };
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self.poll_read(cx, buf))
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        delegate!(self.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self.poll_shutdown(cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ConnectionConfig::new(listener.local_addr().unwrap());

        let stream = connect_stream(&config).await.unwrap();
        assert!(!stream.is_tls());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect_stream(&ConnectionConfig::new(addr)).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
