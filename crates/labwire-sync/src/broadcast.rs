//! Fire-and-forget object broadcast.
//!
//! Receivers send [`MAGIC_BROADCAST`] and a channel name; every object later
//! broadcast on that name is sent to them as one encoded line. Each receiver
//! has a bounded queue and misses objects while it is full. Broadcasting
//! never waits and never fails.

use crate::error::Result;
use async_trait::async_trait;
use labwire_codec::{decode, encode, Value};
use labwire_rpc::transport::{
    connect, read_line, read_magic, write_line, write_value, BoxedStream, CLIENT_LINE_LIMIT, SERVER_LINE_LIMIT,
};
use labwire_rpc::{ConnectionHandler, Listener, SslConfig};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::ToSocketAddrs;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Magic sent by receivers.
pub const MAGIC_BROADCAST: [u8; 4] = *b"BCS1";

/// Objects queued per receiver before new ones are dropped for it.
pub const DEFAULT_QUEUE_LIMIT: usize = 1024;

type Recipients = BTreeMap<String, Vec<mpsc::Sender<Arc<str>>>>;

/// Sends objects to every receiver of a channel name.
///
/// Clones share their receivers; bind once and broadcast from anywhere.
#[derive(Clone)]
pub struct Broadcaster {
    recipients: Arc<Mutex<Recipients>>,
    queue_limit: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("channels", &self.lock().len())
            .field("queue_limit", &self.queue_limit)
            .finish()
    }
}

impl Broadcaster {
    /// A broadcaster with [`DEFAULT_QUEUE_LIMIT`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_limit(DEFAULT_QUEUE_LIMIT)
    }

    /// A broadcaster queueing at most `limit` objects per receiver.
    #[must_use]
    pub fn with_queue_limit(limit: usize) -> Self {
        Self {
            recipients: Arc::default(),
            queue_limit: limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Recipients> {
        self.recipients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `obj` to the receivers of `name`.
    pub fn broadcast(&self, name: &str, obj: &Value) {
        let mut recipients = self.lock();
        let Some(queues) = recipients.get_mut(name) else {
            return;
        };
        let line: Arc<str> = encode(obj).into();
        // No logging here: log records may themselves be broadcast.
        queues.retain(|tx| match tx.try_send(Arc::clone(&line)) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Number of receivers of `name`.
    #[must_use]
    pub fn receiver_count(&self, name: &str) -> usize {
        self.lock()
            .get(name)
            .map_or(0, |queues| queues.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Start accepting receivers.
    ///
    /// # Errors
    ///
    /// Returns the bind error unmodified, or a TLS configuration error.
    pub async fn bind<A: ToSocketAddrs>(&self, addr: A, ssl: Option<&SslConfig>) -> labwire_rpc::Result<Listener> {
        Listener::bind(addr, ssl, Arc::new(self.clone())).await
    }

    fn register(&self, name: &str) -> mpsc::Receiver<Arc<str>> {
        let (tx, rx) = mpsc::channel(self.queue_limit);
        self.lock().entry(name.to_string()).or_default().push(tx);
        rx
    }

    fn prune(&self, name: &str) {
        let mut recipients = self.lock();
        if let Some(queues) = recipients.get_mut(name) {
            queues.retain(|tx| !tx.is_closed());
            if queues.is_empty() {
                recipients.remove(name);
            }
        }
    }

    async fn serve(&self, stream: BoxedStream, peer: SocketAddr) -> labwire_rpc::Result<()> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        if read_magic(&mut reader).await? != MAGIC_BROADCAST {
            return Ok(());
        }
        let Some(line) = read_line(&mut reader, SERVER_LINE_LIMIT).await? else {
            return Ok(());
        };
        let name = decode(&line)?.as_str().map(str::to_string).unwrap_or_default();
        tracing::debug!(%peer, channel = %name, "Broadcast receiver attached");

        let mut queue = self.register(&name);
        let mut hangup = [0u8; 1];
        let result = loop {
            tokio::select! {
                next = queue.recv() => match next {
                    Some(line) => {
                        if let Err(e) = write_line(&mut writer, &line).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                _ = reader.read(&mut hangup) => break Ok(()),
            }
        };
        drop(queue);
        self.prune(&name);
        result
    }
}

#[async_trait]
impl ConnectionHandler for Broadcaster {
    async fn handle(&self, stream: BoxedStream, peer: SocketAddr) {
        if let Err(e) = self.serve(stream, peer).await {
            tracing::debug!(%peer, error = %e, "Broadcast receiver connection ended with error");
        }
    }
}

type NotifyFn = Box<dyn Fn(&Value) + Send + Sync>;
type DisconnectFn = Box<dyn Fn() + Send + Sync>;

/// Configuration of a broadcast receiver.
pub struct Receiver {
    name: String,
    notify: Vec<NotifyFn>,
    on_disconnect: Option<DisconnectFn>,
    ssl: Option<SslConfig>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("callbacks", &self.notify.len())
            .finish_non_exhaustive()
    }
}

impl Receiver {
    /// Receive objects broadcast as `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            notify: Vec::new(),
            on_disconnect: None,
            ssl: None,
            timeout: None,
        }
    }

    /// Call `f` with every received object.
    #[must_use]
    pub fn on_notify(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.notify.push(Box::new(f));
        self
    }

    /// Call `f` when the connection ends, but not on [`ReceiverHandle::close`].
    #[must_use]
    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    /// Use mutual TLS.
    #[must_use]
    pub fn ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = Some(ssl);
        self
    }

    /// Bound the connection attempt.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Connect and start receiving.
    ///
    /// # Errors
    ///
    /// Returns connection and TLS errors.
    pub async fn connect(self, host: &str, port: u16) -> Result<ReceiverHandle> {
        let (stream, _) = connect(host, port, self.ssl.as_ref(), self.timeout).await?;
        let (reader, mut writer) = tokio::io::split(stream);
        writer.write_all(&MAGIC_BROADCAST).await?;
        write_value(&mut writer, &Value::from(self.name.as_str())).await?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let _writer = writer;
            let ended = tokio::select! {
                ended = receive(&mut reader, &self.notify) => ended,
                _ = shutdown_rx.changed() => return,
            };
            if let Err(e) = ended {
                tracing::warn!(channel = %self.name, error = %e, "Broadcast reception failed");
            }
            if let Some(on_disconnect) = &self.on_disconnect {
                on_disconnect();
            }
        });
        Ok(ReceiverHandle {
            shutdown_tx,
            task: Some(task),
        })
    }
}

async fn receive<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R, notify: &[NotifyFn]) -> Result<()> {
    while let Some(line) = read_line(reader, CLIENT_LINE_LIMIT).await? {
        let obj = decode(&line)?;
        for f in notify {
            f(&obj);
        }
    }
    Ok(())
}

/// A running broadcast receiver.
#[derive(Debug)]
pub struct ReceiverHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ReceiverHandle {
    /// Stop receiving. The disconnect callback is not called.
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_drops_for_that_receiver_only() {
        let broadcaster = Broadcaster::with_queue_limit(2);
        let mut slow = broadcaster.register("log");
        let mut fast = broadcaster.register("log");
        let mut other = broadcaster.register("other");

        for i in 0..3 {
            broadcaster.broadcast("log", &Value::from(i));
            if i == 0 {
                assert_eq!(fast.recv().await.as_deref(), Some("0"));
            }
        }
        assert_eq!(fast.recv().await.as_deref(), Some("1"));
        assert_eq!(fast.recv().await.as_deref(), Some("2"));
        assert_eq!(slow.recv().await.as_deref(), Some("0"));
        assert_eq!(slow.recv().await.as_deref(), Some("1"));
        assert!(slow.try_recv().is_err());
        assert!(other.try_recv().is_err());

        // Still attached: later objects arrive again.
        broadcaster.broadcast("log", &Value::from("again"));
        assert_eq!(slow.recv().await.as_deref(), Some("\"again\""));
        assert_eq!(broadcaster.receiver_count("log"), 2);
    }

    #[test]
    fn closed_receivers_are_pruned() {
        let broadcaster = Broadcaster::new();
        let rx = broadcaster.register("x");
        assert_eq!(broadcaster.receiver_count("x"), 1);
        drop(rx);
        broadcaster.prune("x");
        assert_eq!(broadcaster.receiver_count("x"), 0);
        broadcaster.broadcast("x", &Value::None);
    }
}
