//! Event-driven RPC client.
//!
//! Requests from any number of tasks are funnelled through one writer task.
//! The writer records a reply slot for every request that expects an answer
//! before the request hits the wire, and the reader task fills those slots in
//! order as responses arrive. When the connection ends, every outstanding
//! slot fails with [`Error::ConnectionLost`].

use crate::client::ClientOptions;
use crate::error::{Error, Result};
use crate::protocol::{
    parse_response, CallArgs, Identification, Request, TargetDescription, TargetSelector, MAGIC_RPC,
};
use crate::transport::{connect, handshake, read_line, write_line, BoxedStream, CLIENT_LINE_LIMIT};
use labwire_codec::{decode, encode_checked, Value};
use std::collections::VecDeque;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader, ReadHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Bound on flushing queued requests in [`AsyncClient::close`] when the
/// client has no timeout of its own.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

type Reply = oneshot::Sender<Result<Value>>;

struct Outgoing {
    line: String,
    reply: Option<Reply>,
}

#[derive(Default)]
struct Pending {
    closed: bool,
    queue: VecDeque<Reply>,
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fail_all(pending: &Mutex<Pending>) {
    let waiters: Vec<Reply> = {
        let mut pending = lock(pending);
        pending.closed = true;
        pending.queue.drain(..).collect()
    };
    for waiter in waiters {
        let _ = waiter.send(Err(Error::ConnectionLost));
    }
}

/// The result of a call that may still be in flight.
///
/// Resolves to the method's return value, or to the error the server or the
/// connection produced.
#[must_use = "a PendingCall does nothing unless awaited"]
pub struct PendingCall {
    state: PendingState,
}

enum PendingState {
    Ready(Option<Result<Value>>),
    Waiting(oneshot::Receiver<Result<Value>>),
}

impl PendingCall {
    fn ready(result: Result<Value>) -> Self {
        Self {
            state: PendingState::Ready(Some(result)),
        }
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingState::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(Error::ConnectionLost))),
            PendingState::Waiting(rx) => Pin::new(rx).poll(cx).map(|received| match received {
                Ok(reply) => reply.and_then(parse_response),
                Err(_) => Err(Error::ConnectionLost),
            }),
        }
    }
}

/// An RPC client whose calls return [`PendingCall`] futures.
///
/// Calls can be issued concurrently from several tasks through `&self`; the
/// server answers them in the order they were sent.
pub struct AsyncClient {
    tx: Option<mpsc::UnboundedSender<Outgoing>>,
    pending: Arc<Mutex<Pending>>,
    identification: Identification,
    selected: Option<String>,
    description: TargetDescription,
    local_addr: SocketAddr,
    flush_timeout: Duration,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClient")
            .field("local_addr", &self.local_addr)
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

impl AsyncClient {
    /// Connect without TLS or timeout and select `target`.
    ///
    /// # Errors
    ///
    /// See [`AsyncClient::connect_with`].
    pub async fn connect(host: &str, port: u16, target: impl Into<TargetSelector>) -> Result<Self> {
        Self::connect_with(host, port, &ClientOptions::target(target)).await
    }

    /// Connect, identify the server and select `options.target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if connecting or the handshake exceeds
    /// `options.timeout`, [`Error::HandshakeMismatch`] if the peer is not an
    /// RPC server, and target selection errors.
    pub async fn connect_with(host: &str, port: u16, options: &ClientOptions) -> Result<Self> {
        let (stream, local_addr) = connect(host, port, options.ssl.as_ref(), options.timeout).await?;
        let mut stream = BufReader::new(stream);
        let identification = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, handshake(&mut stream, MAGIC_RPC))
                .await
                .map_err(|_| Error::Timeout)??,
            None => handshake(&mut stream, MAGIC_RPC).await?,
        };
        let identification = Identification::from_value(&identification)?;

        let (reader, writer) = tokio::io::split(stream);
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(BufReader::new(reader), Arc::clone(&pending)));
        let writer = tokio::spawn(write_loop(writer, rx, Arc::clone(&pending)));

        let mut client = Self {
            tx: Some(tx),
            pending,
            identification,
            selected: None,
            description: TargetDescription::default(),
            local_addr,
            flush_timeout: options.timeout.unwrap_or(CLOSE_FLUSH_TIMEOUT),
            reader,
            writer: Some(writer),
        };
        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, client.select_target(options.target.clone()))
                .await
                .map_err(|_| Error::Timeout)??,
            None => client.select_target(options.target.clone()).await?,
        }
        tracing::debug!(%host, port, target = ?client.selected, "Async RPC client connected");
        Ok(client)
    }

    fn send(&self, line: String, expects_reply: bool) -> PendingCall {
        let Some(tx) = &self.tx else {
            return PendingCall::ready(Err(Error::ConnectionLost));
        };
        let (reply, rx) = if expects_reply {
            let (reply, rx) = oneshot::channel();
            (Some(reply), Some(rx))
        } else {
            (None, None)
        };
        if tx.send(Outgoing { line, reply }).is_err() {
            return PendingCall::ready(Err(Error::ConnectionLost));
        }
        match rx {
            Some(rx) => PendingCall {
                state: PendingState::Waiting(rx),
            },
            None => PendingCall::ready(Ok(Value::None)),
        }
    }

    /// Target names and description sent by the server.
    #[must_use]
    pub fn rpc_id(&self) -> (&[String], Option<&str>) {
        (&self.identification.targets, self.identification.description.as_deref())
    }

    /// Select a target on a client created with [`TargetSelector::None`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTarget`] or [`Error::AmbiguousTarget`] before
    /// contacting the server, or the server's refusal.
    pub async fn select_target(&mut self, target: impl Into<TargetSelector>) -> Result<()> {
        let Some(name) = target.into().resolve(&self.identification.targets)? else {
            return Ok(());
        };
        let reply = self.send(encode_checked(&Value::from(name.as_str()))?, true).await?;
        self.description = TargetDescription::from_value(&reply)?;
        self.selected = Some(name);
        Ok(())
    }

    /// Name of the selected target.
    #[must_use]
    pub fn selected_target(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Description received when the target was selected.
    #[must_use]
    pub fn description(&self) -> &TargetDescription {
        &self.description
    }

    /// Fetch the target description from the server.
    ///
    /// # Errors
    ///
    /// Returns connection and protocol errors.
    pub async fn list_methods(&self) -> Result<TargetDescription> {
        let reply = self.send(encode_checked(&Request::MethodList.to_value())?, true).await?;
        TargetDescription::from_value(&reply)
    }

    /// Send a call and return a handle to its result.
    ///
    /// Fire-and-forget methods resolve to `Value::None` once queued. An
    /// unknown method resolves to [`Error::UnknownMethod`] and arguments
    /// nested too deep to send resolve to [`Error::Codec`], both without a
    /// round trip.
    pub fn call(&self, method: &str, args: CallArgs) -> PendingCall {
        if self.selected.is_none() {
            return PendingCall::ready(Err(Error::UnknownTarget("no target selected".to_string())));
        }
        if !self.description.has_method(method) {
            return PendingCall::ready(Err(Error::UnknownMethod(method.to_string())));
        }
        let fire_and_forget = self.description.is_fire_and_forget(method);
        let request = Request::Call {
            method: method.to_string(),
            args,
            fire_and_forget,
        };
        match encode_checked(&request.to_value()) {
            Ok(line) => self.send(line, !fire_and_forget),
            Err(e) => PendingCall::ready(Err(e.into())),
        }
    }

    /// Whether the connection is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !lock(&self.pending).closed
    }

    /// Address of the local end of the connection.
    #[must_use]
    pub fn local_host(&self) -> IpAddr {
        self.local_addr.ip()
    }

    /// Flush queued requests and close the connection.
    ///
    /// Flushing is bounded by the client's timeout, or [`CLOSE_FLUSH_TIMEOUT`]
    /// without one; requests a stalled peer did not take are dropped. Calls
    /// still waiting for an answer fail with [`Error::ConnectionLost`].
    pub async fn close(mut self) {
        self.tx.take();
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(self.flush_timeout, &mut writer).await.is_err() {
                tracing::debug!("Peer stopped reading, dropping queued RPC requests");
                writer.abort();
            }
        }
        self.reader.abort();
        fail_all(&self.pending);
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        fail_all(&self.pending);
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    pending: Arc<Mutex<Pending>>,
) {
    while let Some(outgoing) = rx.recv().await {
        if let Some(reply) = outgoing.reply {
            let mut queue = lock(&pending);
            if queue.closed {
                drop(queue);
                let _ = reply.send(Err(Error::ConnectionLost));
                continue;
            }
            queue.queue.push_back(reply);
        }
        if let Err(e) = write_line(&mut writer, &outgoing.line).await {
            tracing::debug!(error = %e, "RPC write failed");
            fail_all(&pending);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: BufReader<ReadHalf<BufReader<BoxedStream>>>, pending: Arc<Mutex<Pending>>) {
    loop {
        let line = match read_line(&mut reader, CLIENT_LINE_LIMIT).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "RPC read failed");
                break;
            }
        };
        let waiter = lock(&pending).queue.pop_front();
        let Some(waiter) = waiter else {
            tracing::warn!("Discarding unsolicited RPC response");
            continue;
        };
        let _ = waiter.send(decode(&line).map_err(Error::from));
    }
    fail_all(&pending);
}
