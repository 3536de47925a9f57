//! Replicas of published structures.
//!
//! A [`Subscription`] runs two tasks per connection: a network task that
//! reads and decodes mods, and the supervisor that applies them to the
//! replica and runs the callbacks. They are joined by an ordered channel, so
//! slow callbacks never stall the socket reader. When the connection ends
//! the supervisor reports it, waits as told by the [`Backoff`] policy and
//! subscribes again from a fresh snapshot.

use crate::error::{Error, ModError, Result};
use crate::mods::{apply_mod, Mod};
use crate::publisher::MAGIC_SYNC;
use labwire_codec::{decode, Value};
use labwire_rpc::transport::{connect, read_line, write_value, BoxedStream, CLIENT_LINE_LIMIT};
use labwire_rpc::SslConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

const MOD_QUEUE: usize = 1024;

/// When to retry after a subscription is lost.
pub trait Backoff: Send + Sync + 'static {
    /// Delay before reconnection attempt `attempt` (0-based), or `None` to
    /// give up.
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

/// Retry forever at a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay(pub Duration);

impl Backoff for FixedDelay {
    fn delay(&self, _attempt: u32) -> Option<Duration> {
        Some(self.0)
    }
}

/// Doubling delays between `initial` and `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    /// First delay
    pub initial: Duration,
    /// Upper bound of every delay
    pub max: Duration,
    /// Give up after this many attempts
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        Some(self.initial.saturating_mul(2u32.saturating_pow(attempt)).min(self.max))
    }
}

type NotifyFn = Box<dyn Fn(&Mod, &Value) + Send + Sync>;
type DisconnectFn = Box<dyn Fn() + Send + Sync>;

/// Configuration of a subscription.
pub struct Subscriber {
    name: String,
    notify: Vec<NotifyFn>,
    on_disconnect: Option<DisconnectFn>,
    backoff: Option<Box<dyn Backoff>>,
    ssl: Option<SslConfig>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("name", &self.name)
            .field("callbacks", &self.notify.len())
            .field("reconnect", &self.backoff.is_some())
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Subscribe to the notifier published as `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            notify: Vec::new(),
            on_disconnect: None,
            backoff: None,
            ssl: None,
            timeout: None,
        }
    }

    /// Call `f` after the snapshot and after every mod, with the mod and the
    /// updated replica.
    ///
    /// Callbacks run with the replica locked; they must not call
    /// [`Subscription::replica`].
    #[must_use]
    pub fn on_notify(mut self, f: impl Fn(&Mod, &Value) + Send + Sync + 'static) -> Self {
        self.notify.push(Box::new(f));
        self
    }

    /// Call `f` when the connection is lost, but not on [`Subscription::close`].
    #[must_use]
    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    /// Reconnect after a loss, waiting as `backoff` says.
    #[must_use]
    pub fn reconnect(mut self, backoff: impl Backoff) -> Self {
        self.backoff = Some(Box::new(backoff));
        self
    }

    /// Use mutual TLS.
    #[must_use]
    pub fn ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = Some(ssl);
        self
    }

    /// Bound each connection attempt, up to the snapshot.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Connect, receive the snapshot and keep the replica up to date.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTarget`] if the publisher closes the
    /// connection before sending a snapshot, and transport errors. Later
    /// losses are handled in the background.
    pub async fn connect(self, host: &str, port: u16) -> Result<Subscription> {
        let config = Arc::new(self);
        let mut first = establish(&config, host, port).await?;
        let shared = Arc::new(Shared {
            replica: Mutex::new(Value::None),
            connected: AtomicBool::new(true),
        });
        // The replica is complete once connect returns.
        if let Some(snapshot) = first.snapshot.take() {
            shared.apply(&Mod::Init(snapshot), &config)?;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            config,
            host.to_string(),
            port,
            first,
            Arc::clone(&shared),
            shutdown_rx,
        ));
        Ok(Subscription {
            shared,
            shutdown_tx,
            task: Some(task),
        })
    }
}

struct Shared {
    replica: Mutex<Value>,
    connected: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Value> {
        self.replica.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, m: &Mod, config: &Subscriber) -> Result<()> {
        let mut replica = self.lock();
        apply_mod(&mut replica, m)?;
        for notify in &config.notify {
            notify(m, &replica);
        }
        Ok(())
    }
}

/// A live replica of a published structure.
///
/// Dropping it stops replication like [`Subscription::close`].
pub struct Subscription {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Copy of the replica.
    #[must_use]
    pub fn replica(&self) -> Value {
        self.shared.lock().clone()
    }

    /// Run `f` on the replica without copying it.
    pub fn read<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.shared.lock())
    }

    /// Whether a connection is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Stop replicating. The disconnect callback is not called.
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Connection {
    reader: BufReader<ReadHalf<BoxedStream>>,
    writer: WriteHalf<BoxedStream>,
    snapshot: Option<Value>,
    session: Uuid,
}

async fn establish(config: &Subscriber, host: &str, port: u16) -> Result<Connection> {
    match config.timeout {
        Some(limit) => tokio::time::timeout(limit, handshake(config, host, port))
            .await
            .map_err(|_| Error::Transport(labwire_rpc::Error::Timeout))?,
        None => handshake(config, host, port).await,
    }
}

async fn handshake(config: &Subscriber, host: &str, port: u16) -> Result<Connection> {
    let (stream, _) = connect(host, port, config.ssl.as_ref(), config.timeout).await?;
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    writer.write_all(&MAGIC_SYNC).await?;
    write_value(&mut writer, &Value::from(config.name.as_str())).await?;

    let line = match read_line(&mut reader, CLIENT_LINE_LIMIT).await {
        Ok(Some(line)) => line,
        Ok(None) | Err(labwire_rpc::Error::ConnectionLost) => {
            return Err(Error::UnknownTarget(config.name.clone()));
        }
        Err(e) => return Err(e.into()),
    };
    match Mod::from_value(&decode(&line)?)? {
        Mod::Init(snapshot) => Ok(Connection {
            reader,
            writer,
            snapshot: Some(snapshot),
            session: Uuid::new_v4(),
        }),
        other => Err(ModError::Malformed(format!("expected init, got {}", other.action())).into()),
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn supervise(
    config: Arc<Subscriber>,
    host: String,
    port: u16,
    first: Connection,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next = Some(first);
    let mut attempt = 0u32;
    loop {
        if let Some(connection) = next.take() {
            attempt = 0;
            let session = connection.session;
            let outcome = tokio::select! {
                outcome = run_session(connection, &config, &shared) => outcome,
                _ = shutdown.changed() => return,
            };
            shared.connected.store(false, Ordering::SeqCst);
            match outcome {
                Ok(()) => tracing::info!(%session, notifier = %config.name, "Publisher closed the subscription"),
                Err(e) => tracing::warn!(%session, notifier = %config.name, error = %e, "Subscription lost"),
            }
            if let Some(on_disconnect) = &config.on_disconnect {
                on_disconnect();
            }
        }

        let Some(delay) = config.backoff.as_ref().and_then(|b| b.delay(attempt)) else {
            return;
        };
        attempt = attempt.saturating_add(1);
        let reconnect = async {
            tokio::time::sleep(delay).await;
            establish(&config, &host, port).await
        };
        let reconnected = tokio::select! {
            reconnected = reconnect => reconnected,
            _ = shutdown.changed() => return,
        };
        match reconnected {
            Ok(connection) => {
                shared.connected.store(true, Ordering::SeqCst);
                next = Some(connection);
            }
            Err(e) => tracing::debug!(%host, port, attempt, error = %e, "Reconnection failed"),
        }
    }
}

async fn run_session(connection: Connection, config: &Subscriber, shared: &Shared) -> Result<()> {
    let Connection {
        reader,
        writer,
        snapshot,
        session,
    } = connection;
    if let Some(snapshot) = snapshot {
        shared.apply(&Mod::Init(snapshot), config)?;
    }
    tracing::info!(%session, notifier = %config.name, "Subscribed");

    let (tx, mut rx) = mpsc::channel(MOD_QUEUE);
    let _network = AbortOnDrop(tokio::spawn(receive(reader, tx)));
    while let Some(next) = rx.recv().await {
        shared.apply(&next?, config)?;
    }
    drop(writer);
    Ok(())
}

async fn receive(mut reader: BufReader<ReadHalf<BoxedStream>>, tx: mpsc::Sender<Result<Mod>>) {
    loop {
        let next = match read_line(&mut reader, CLIENT_LINE_LIMIT).await {
            Ok(Some(line)) => decode(&line)
                .map_err(Error::from)
                .and_then(|value| Ok(Mod::from_value(&value)?)),
            Ok(None) => return,
            Err(e) => Err(e.into()),
        };
        let failed = next.is_err();
        if tx.send(next).await.is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_up_to_max() {
        let backoff = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            max_attempts: Some(5),
        };
        let delays: Vec<_> = (0..6).map(|a| backoff.delay(a)).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 500, 500]
                .map(|ms| Some(Duration::from_millis(ms)))
                .into_iter()
                .chain([None])
                .collect::<Vec<_>>()
        );
        assert_eq!(
            ExponentialBackoff::default().delay(40),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn fixed_delay_never_gives_up() {
        assert_eq!(FixedDelay(Duration::from_secs(1)).delay(u32::MAX), Some(Duration::from_secs(1)));
    }
}
