//! The transport owns the socket: address selection, the optional TLS
//! upgrade, and buffered byte I/O.
//!
//! Reading is pull-based: the engine only calls [`Transport::read_into`]
//! while its `want_read` flag is on, which is how consumer-side flow
//! control stops bytes being pulled from the socket.

mod tls;

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::messages::frontend::SSL_REQUEST;

/// Where the configured host points, per libpq conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

/// Applies the libpq address selection rules to a host string.
pub(crate) fn socket_target(host: &str, port: u16) -> Target {
    if host.is_empty() {
        Target::Unix(PathBuf::from(format!("/var/run/postgresql/.s.PGSQL.{port}")))
    } else if host.starts_with('/') || host.starts_with('@') {
        Target::Unix(PathBuf::from(format!("{host}/.s.PGSQL.{port}")))
    } else {
        Target::Tcp {
            host: host.to_string(),
            port,
        }
    }
}

/// A connected byte stream: plain TCP, a UNIX socket, or TLS over TCP.
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
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
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// The engine's byte transport.
pub struct Transport {
    stream: Stream,
    read_chunk: usize,
}

impl Transport {
    /// Establishes the underlying stream for `config`, performing the
    /// SSLRequest negotiation when the SSL mode calls for it.
    ///
    /// UNIX-socket targets skip TLS entirely, matching libpq.
    pub async fn connect(config: &Config) -> Result<Self> {
        let read_chunk = config.read_buffer_size.max(4096);
        let stream = match socket_target(&config.host, config.port) {
            Target::Tcp { host, port } => {
                debug!(%host, port, "connecting");
                let tcp = TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(Error::ConnectFailed)?;
                tcp.set_nodelay(true).ok();

                if config.ssl_mode.should_try_ssl() {
                    negotiate_ssl(tcp, config).await?
                } else {
                    Stream::Tcp(tcp)
                }
            }
            #[cfg(unix)]
            Target::Unix(path) => {
                debug!(path = %path.display(), "connecting");
                let socket = UnixStream::connect(&path)
                    .await
                    .map_err(Error::ConnectFailed)?;
                Stream::Unix(socket)
            }
            #[cfg(not(unix))]
            Target::Unix(path) => {
                return Err(Error::Config(format!(
                    "UNIX socket {} is not supported on this platform",
                    path.display()
                )))
            }
        };

        Ok(Transport { stream, read_chunk })
    }

    /// Whether the stream was upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    /// Pulls available bytes from the socket into `buf`.
    ///
    /// Returns the number of bytes read; zero means EOF. The engine only
    /// calls this while reads are wanted.
    pub async fn read_into(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        if buf.capacity() - buf.len() < 4096 {
            buf.reserve(self.read_chunk);
        }
        let n = self.stream.read_buf(buf).await?;
        trace!(bytes = n, "read");
        Ok(n)
    }

    /// Writes the given bytes and flushes the stream.
    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        trace!(bytes = bytes.len(), "flushed");
        Ok(())
    }

    /// Shuts the stream down; errors are ignored, the socket is closing
    /// anyway.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Runs the SSLRequest exchange on a fresh TCP stream.
async fn negotiate_ssl(mut tcp: TcpStream, config: &Config) -> Result<Stream> {
    tcp.write_all(SSL_REQUEST).await?;
    tcp.flush().await?;

    let mut buf = [0u8; 1];
    if let Err(e) = tcp.read_exact(&mut buf).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(Error::ServerClosedDuringSsl);
        }
        return Err(Error::Io(e));
    }

    match buf[0] {
        b'S' => {
            debug!(host = %config.host, "server accepted TLS, upgrading");
            let connector = tls::connector(config.ssl_mode)?;
            let name = tls::server_name(&config.host)?;
            let stream = connector
                .connect(name, tcp)
                .await
                .map_err(|e| Error::Io(io::Error::other(format!("TLS handshake failed: {e}"))))?;
            Ok(Stream::Tls(Box::new(stream)))
        }
        b'N' => {
            if config.ssl_mode.is_required() {
                return Err(Error::TlsRefused);
            }
            debug!("server declined TLS, continuing in plaintext");
            Ok(Stream::Tcp(tcp))
        }
        other => Err(Error::UnexpectedSslResponse(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_target_for_plain_host() {
        assert_eq!(
            socket_target("db.example.com", 5432),
            Target::Tcp {
                host: "db.example.com".into(),
                port: 5432
            }
        );
    }

    #[test]
    fn empty_host_selects_default_socket_dir() {
        assert_eq!(
            socket_target("", 5433),
            Target::Unix(PathBuf::from("/var/run/postgresql/.s.PGSQL.5433"))
        );
    }

    #[test]
    fn path_host_selects_socket_in_dir() {
        assert_eq!(
            socket_target("/tmp", 5432),
            Target::Unix(PathBuf::from("/tmp/.s.PGSQL.5432"))
        );
        assert_eq!(
            socket_target("@abstract", 5432),
            Target::Unix(PathBuf::from("@abstract/.s.PGSQL.5432"))
        );
    }
}
