//! TCP listener shared by every labwire server.
//!
//! Accepts connections, optionally completes a TLS handshake, and runs one
//! task per connection. Stopping the listener cancels every connection task
//! and releases the socket.

use crate::error::Result;
use crate::tls::SslConfig;
use crate::transport::{configure_socket, BoxedStream};
use async_trait::async_trait;
use socket2::SockRef;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

/// Protocol logic run for each accepted connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one connection until it ends.
    async fn handle(&self, stream: BoxedStream, peer: SocketAddr);
}

/// Time a TLS client has to complete its handshake.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound listener. Dropping it stops accepting and cancels all connections.
pub struct Listener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind `addr` and start accepting connections for `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] with the unmodified bind error and
    /// [`crate::Error::Tls`] if the certificate material cannot be loaded.
    pub async fn bind<A, H>(addr: A, ssl: Option<&SslConfig>, handler: Arc<H>) -> Result<Self>
    where
        A: ToSocketAddrs,
        H: ConnectionHandler,
    {
        Self::bind_with_handshake_timeout(addr, ssl, handler, TLS_HANDSHAKE_TIMEOUT).await
    }

    async fn bind_with_handshake_timeout<A, H>(
        addr: A,
        ssl: Option<&SslConfig>,
        handler: Arc<H>,
        handshake_timeout: Duration,
    ) -> Result<Self>
    where
        A: ToSocketAddrs,
        H: ConnectionHandler,
    {
        let acceptor = ssl.map(SslConfig::acceptor).transpose()?;
        let listener = TcpListener::bind(addr).await.map_err(crate::Error::Io)?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(addr = %local_addr, tls = acceptor.is_some(), "Listening");

        let task = tokio::spawn(accept_loop(listener, acceptor, handshake_timeout, handler, shutdown_rx));
        Ok(Self {
            local_addr,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, cancel all connections and wait until the socket is closed.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::info!(addr = %self.local_addr, "Listener stopped");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_configured(listener: &TcpListener) -> std::io::Result<(TcpStream, SocketAddr)> {
    let (tcp, peer) = listener.accept().await?;
    if let Err(e) = configure_socket(SockRef::from(&tcp)) {
        tracing::debug!(%peer, error = %e, "Cannot set socket options");
    }
    Ok((tcp, peer))
}

async fn accept_loop<H: ConnectionHandler>(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    handler: Arc<H>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = accept_configured(&listener) => match accepted {
                Ok((tcp, peer)) => {
                    let acceptor = acceptor.clone();
                    let handler = Arc::clone(&handler);
                    connections.spawn(async move {
                        let stream: BoxedStream = match acceptor {
                            Some(acceptor) => {
                                match tokio::time::timeout(handshake_timeout, acceptor.accept(tcp)).await {
                                    Ok(Ok(tls)) => Box::new(tls),
                                    Ok(Err(e)) => {
                                        tracing::warn!(%peer, error = %e, "TLS handshake failed");
                                        return;
                                    }
                                    Err(_) => {
                                        tracing::warn!(%peer, "TLS handshake timed out");
                                        return;
                                    }
                                }
                            }
                            None => Box::new(tcp),
                        };
                        tracing::debug!(%peer, "Connection accepted");
                        handler.handle(stream, peer).await;
                        tracing::debug!(%peer, "Connection closed");
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Connection task panicked");
                    }
                }
            }
        }
    }
    connections.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    #[async_trait]
    impl ConnectionHandler for Echo {
        async fn handle(&self, mut stream: BoxedStream, _peer: SocketAddr) {
            let mut buf = [0u8; 64];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn echo_then_stop() {
        let listener = Listener::bind("127.0.0.1:0", None, Arc::new(Echo)).await.unwrap();
        let addr = listener.local_addr();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        listener.stop().await;
        // Connection tasks are cancelled with the listener.
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn bind_failure_is_returned_unmodified() {
        let first = Listener::bind("127.0.0.1:0", None, Arc::new(Echo)).await.unwrap();
        let err = Listener::bind(first.local_addr(), None, Arc::new(Echo))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, crate::Error::Io(ref e) if e.kind() == std::io::ErrorKind::AddrInUse));
    }

    #[tokio::test]
    async fn accepted_sockets_use_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (tcp, _) = accept_configured(&listener).await.unwrap();
        let socket = SockRef::from(&tcp);
        assert!(socket.keepalive().unwrap());
        assert!(socket.nodelay().unwrap());
    }

    fn write_pair(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let cert_path = dir.join(format!("{name}.pem"));
        let key_path = dir.join(format!("{name}.key"));
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[tokio::test]
    async fn silent_tls_client_is_dropped_after_the_handshake_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (server_cert, server_key) = write_pair(dir.path(), "server");
        let (client_cert, _) = write_pair(dir.path(), "client");
        let ssl = SslConfig::new(&server_cert, &server_key, &client_cert);
        let listener =
            Listener::bind_with_handshake_timeout("127.0.0.1:0", Some(&ssl), Arc::new(Echo), Duration::from_millis(100))
                .await
                .unwrap();

        // Plain TCP, never sends a ClientHello.
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("server kept the silent connection open")
            .unwrap_or(0);
        assert_eq!(n, 0);
        listener.stop().await;
    }
}
