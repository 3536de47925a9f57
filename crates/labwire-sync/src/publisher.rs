//! Serves notifiers to subscribers.
//!
//! Per connection: the subscriber sends [`MAGIC_SYNC`] and the encoded name
//! of a notifier. The publisher answers with an `init` mod carrying a
//! snapshot, then forwards every later mod of that notifier in order. An
//! unknown name closes the connection.

use crate::mods::Mod;
use crate::notifier::{Notifier, DEFAULT_QUEUE_CAPACITY};
use async_trait::async_trait;
use labwire_codec::decode;
use labwire_rpc::transport::{read_line, read_magic, write_value, BoxedStream, SERVER_LINE_LIMIT};
use labwire_rpc::{ConnectionHandler, Listener, SslConfig};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::ToSocketAddrs;

/// Magic sent by subscribers.
pub const MAGIC_SYNC: [u8; 4] = *b"SYN1";

/// A set of named notifiers to publish.
#[derive(Debug, Default)]
pub struct Publisher {
    notifiers: BTreeMap<String, Notifier>,
    queue_capacity: Option<usize>,
}

impl Publisher {
    /// A publisher without notifiers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `notifier` as `name`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, notifier: Notifier) -> Self {
        self.notifiers.insert(name.into(), notifier);
        self
    }

    /// Mods buffered per subscriber before it is disconnected.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Bind and start publishing.
    ///
    /// # Errors
    ///
    /// Returns the bind error unmodified, or a TLS configuration error.
    pub async fn bind<A: ToSocketAddrs>(self, addr: A, ssl: Option<&SslConfig>) -> labwire_rpc::Result<RunningPublisher> {
        let handler = Arc::new(PublishHandler {
            notifiers: self.notifiers,
            capacity: self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
        });
        let listener = Listener::bind(addr, ssl, handler).await?;
        Ok(RunningPublisher { listener })
    }
}

/// A publisher accepting subscribers.
pub struct RunningPublisher {
    listener: Listener,
}

impl RunningPublisher {
    /// Address the publisher is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Disconnect all subscribers and close the socket.
    pub async fn stop(self) {
        self.listener.stop().await;
    }
}

struct PublishHandler {
    notifiers: BTreeMap<String, Notifier>,
    capacity: usize,
}

#[async_trait]
impl ConnectionHandler for PublishHandler {
    async fn handle(&self, stream: BoxedStream, peer: SocketAddr) {
        if let Err(e) = self.serve(stream, peer).await {
            if !e.is_connection_error() {
                tracing::debug!(%peer, error = %e, "Subscriber connection ended with error");
            }
        }
    }
}

impl PublishHandler {
    async fn serve(&self, stream: BoxedStream, peer: SocketAddr) -> labwire_rpc::Result<()> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        if read_magic(&mut reader).await? != MAGIC_SYNC {
            tracing::debug!(%peer, "Unrecognized magic, closing");
            return Ok(());
        }
        let Some(line) = read_line(&mut reader, SERVER_LINE_LIMIT).await? else {
            return Ok(());
        };
        let name = decode(&line)?.as_str().map(str::to_string).unwrap_or_default();
        let Some(notifier) = self.notifiers.get(&name) else {
            tracing::debug!(%peer, notifier = %name, "Unknown notifier requested");
            return Ok(());
        };

        let (snapshot, mut mods) = notifier.attach(self.capacity);
        write_value(&mut writer, &Mod::Init(snapshot).to_value()).await?;
        tracing::info!(%peer, notifier = %name, "Subscriber attached");

        // Subscribers never send after the name; any read result means they left.
        let mut hangup = [0u8; 1];
        loop {
            tokio::select! {
                m = mods.recv() => match m {
                    Some(m) => write_value(&mut writer, &m.to_value()).await?,
                    None => {
                        tracing::warn!(%peer, notifier = %name, "Subscriber fell behind, disconnecting");
                        return Ok(());
                    }
                },
                _ = reader.read(&mut hangup) => {
                    tracing::info!(%peer, notifier = %name, "Subscriber left");
                    return Ok(());
                }
            }
        }
    }
}
