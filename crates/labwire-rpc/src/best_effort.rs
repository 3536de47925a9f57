//! Client that keeps going when the server is away.

use crate::client::{Client, ClientOptions};
use crate::error::Result;
use crate::protocol::CallArgs;
use labwire_codec::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Timeout of the first connection attempt when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between reconnection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

struct Shared {
    host: String,
    port: u16,
    options: ClientOptions,
    retry: Duration,
    client: Mutex<Option<Client>>,
    /// Mirrors `client.is_some()`, readable while a call holds the lock.
    connected: AtomicBool,
    terminate: AtomicBool,
}

impl Shared {
    fn client(&self) -> MutexGuard<'_, Option<Client>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, client: Client) {
        let mut slot = self.client();
        *slot = Some(client);
        self.connected.store(true, Ordering::SeqCst);
    }

    fn discard(&self, slot: &mut MutexGuard<'_, Option<Client>>) -> Option<Client> {
        self.connected.store(false, Ordering::SeqCst);
        slot.take()
    }
}

/// A blocking client whose calls become no-ops while disconnected.
///
/// Connection failures and mid-call connection loss hand the connection over
/// to a background thread that retries at a fixed interval. Meanwhile
/// [`BestEffortClient::call`] returns `Ok(None)` immediately. Errors raised by
/// the remote method itself are still returned.
///
/// Calls share one connection and therefore run one at a time: a call made
/// while another is waiting for its reply waits for it. Only the
/// disconnected state is checked without waiting.
pub struct BestEffortClient {
    shared: Arc<Shared>,
    reconnector: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for BestEffortClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BestEffortClient")
            .field("host", &self.shared.host)
            .field("port", &self.shared.port)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl BestEffortClient {
    /// Try to connect once, then keep retrying in the background.
    ///
    /// Never fails: an unreachable server only means calls are skipped until
    /// it comes up.
    #[must_use]
    pub fn connect(host: &str, port: u16, options: ClientOptions) -> Self {
        Self::with_retry_interval(host, port, options, DEFAULT_RETRY_INTERVAL)
    }

    /// Like [`BestEffortClient::connect`] with a custom retry interval.
    #[must_use]
    pub fn with_retry_interval(host: &str, port: u16, mut options: ClientOptions, retry: Duration) -> Self {
        options.timeout.get_or_insert(DEFAULT_CONNECT_TIMEOUT);
        let first = Client::connect_with(host, port, &options);
        if let Err(e) = &first {
            tracing::warn!(%host, port, error = %e, "Best-effort client could not connect, retrying in background");
        }
        let connected = first.is_ok();
        let shared = Arc::new(Shared {
            host: host.to_string(),
            port,
            options,
            retry,
            client: Mutex::new(first.ok()),
            connected: AtomicBool::new(connected),
            terminate: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let reconnector = thread::Builder::new()
            .name("labwire-reconnect".to_string())
            .spawn(move || reconnect_loop(&worker));
        let reconnector = match reconnector {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "Cannot start reconnection thread");
                None
            }
        };
        Self { shared, reconnector }
    }

    /// Whether a connection is currently established.
    ///
    /// Does not wait for a call in progress.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Call `method` if connected.
    ///
    /// Returns `Ok(None)` without contacting anyone while disconnected, and
    /// when the connection drops during the call.
    ///
    /// # Errors
    ///
    /// Returns every error that is not a connection problem, in particular
    /// [`crate::Error::Remote`] and [`crate::Error::UnknownMethod`].
    pub fn call(&self, method: &str, args: CallArgs) -> Result<Option<Value>> {
        if !self.is_connected() {
            return Ok(None);
        }
        let mut slot = self.shared.client();
        let Some(client) = slot.as_mut() else {
            return Ok(None);
        };
        match client.call(method, args) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_connection_error() => {
                tracing::warn!(method, error = %e, "Connection lost, reconnecting in background");
                self.shared.discard(&mut slot);
                drop(slot);
                self.wake();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop retrying and close the connection, silently.
    pub fn close(self) {
        drop(self);
    }

    fn wake(&self) {
        if let Some(handle) = &self.reconnector {
            handle.thread().unpark();
        }
    }
}

impl Drop for BestEffortClient {
    fn drop(&mut self) {
        self.shared.terminate.store(true, Ordering::SeqCst);
        self.wake();
        if let Some(handle) = self.reconnector.take() {
            let _ = handle.join();
        }
        let client = self.shared.discard(&mut self.shared.client());
        if let Some(client) = client {
            client.close();
        }
    }
}

fn reconnect_loop(shared: &Shared) {
    while !shared.terminate.load(Ordering::SeqCst) {
        if shared.connected.load(Ordering::SeqCst) {
            thread::park();
            continue;
        }
        match Client::connect_with(&shared.host, shared.port, &shared.options) {
            Ok(client) => {
                tracing::info!(host = %shared.host, port = shared.port, "Best-effort client reconnected");
                shared.install(client);
            }
            Err(e) => {
                tracing::debug!(host = %shared.host, port = shared.port, error = %e, "Reconnection failed");
                thread::park_timeout(shared.retry);
            }
        }
    }
}
