//! RPC server.

use crate::error::{CallError, Error, RemoteError, Result};
use crate::listener::{ConnectionHandler, Listener};
use crate::protocol::{
    failed_response, ok_response, CallArgs, Identification, Request, TargetDescription, MAGIC_INSPECT,
    MAGIC_RPC,
};
use crate::target::{Target, TargetRegistry};
use crate::tls::SslConfig;
use crate::transport::{read_line, read_magic, write_line, write_value, BoxedStream, SERVER_LINE_LIMIT};
use async_trait::async_trait;
use labwire_codec::{decode, encode_checked, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::ToSocketAddrs;
use tokio::sync::watch;

const TERMINATE: &str = "terminate";

/// Serves the targets of a [`TargetRegistry`].
pub struct Server {
    registry: TargetRegistry,
    description: Option<String>,
    builtin_terminate: bool,
}

impl Server {
    /// A server for `registry`.
    #[must_use]
    pub fn new(registry: TargetRegistry) -> Self {
        Self {
            registry,
            description: None,
            builtin_terminate: false,
        }
    }

    /// Set the description sent in the identification.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Offer a `terminate` method on every target that wakes
    /// [`RunningServer::wait_terminate`].
    #[must_use]
    pub fn builtin_terminate(mut self, enabled: bool) -> Self {
        self.builtin_terminate = enabled;
        self
    }

    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Returns the bind error unmodified as [`Error::Io`], or [`Error::Tls`].
    pub async fn bind<A: ToSocketAddrs>(self, addr: A, ssl: Option<&SslConfig>) -> Result<RunningServer> {
        let (terminate_tx, terminate_rx) = watch::channel(false);
        let handler = Arc::new(RpcHandler {
            identification: Identification {
                targets: self.registry.names(),
                description: self.description,
            },
            registry: self.registry,
            builtin_terminate: self.builtin_terminate,
            terminate_tx,
        });
        let listener = Listener::bind(addr, ssl, handler).await?;
        Ok(RunningServer {
            listener,
            terminate_rx,
        })
    }
}

/// A server accepting connections.
pub struct RunningServer {
    listener: Listener,
    terminate_rx: watch::Receiver<bool>,
}

impl RunningServer {
    /// Address the server is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Wait until a client calls the built-in `terminate` method.
    pub async fn wait_terminate(&self) {
        let mut rx = self.terminate_rx.clone();
        if rx.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Close all connections and the listening socket.
    pub async fn stop(self) {
        self.listener.stop().await;
    }
}

/// Serve until Ctrl-C, SIGTERM/SIGHUP or a `terminate` request, then stop.
///
/// # Errors
///
/// Currently infallible once the server is bound; bind errors are returned by
/// [`Server::bind`].
pub async fn serve_until_stopped(server: RunningServer) -> Result<()> {
    tokio::select! {
        () = stop_signal() => tracing::info!("Stop signal received"),
        () = server.wait_terminate() => tracing::info!("Termination requested by client"),
    }
    server.stop().await;
    Ok(())
}

/// Completes on Ctrl-C, and on SIGTERM or SIGHUP on unix.
pub async fn stop_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let unix_signal = |kind: SignalKind| async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot install signal handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            () = ctrl_c => {}
            () = unix_signal(SignalKind::terminate()) => {}
            () = unix_signal(SignalKind::hangup()) => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

struct RpcHandler {
    registry: TargetRegistry,
    identification: Identification,
    builtin_terminate: bool,
    terminate_tx: watch::Sender<bool>,
}

#[async_trait]
impl ConnectionHandler for RpcHandler {
    async fn handle(&self, stream: BoxedStream, peer: SocketAddr) {
        match self.serve(stream, peer).await {
            Ok(()) | Err(Error::ConnectionLost) => {}
            Err(e) => tracing::debug!(%peer, error = %e, "RPC connection ended with error"),
        }
    }
}

impl RpcHandler {
    fn describe(&self, target: &dyn Target) -> TargetDescription {
        let mut description = target.description();
        if self.builtin_terminate {
            description.methods.insert(
                TERMINATE.to_string(),
                ("()".to_string(), Some("Terminate the server.".to_string())),
            );
        }
        description
    }

    async fn serve(&self, stream: BoxedStream, peer: SocketAddr) -> Result<()> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        let magic = read_magic(&mut reader).await?;
        if magic != MAGIC_RPC && magic != MAGIC_INSPECT {
            tracing::debug!(%peer, "Unrecognized magic, closing");
            return Ok(());
        }
        write_value(&mut writer, &self.identification.to_value()).await?;
        if magic == MAGIC_INSPECT {
            writer.shutdown().await?;
            return Ok(());
        }

        let Some(line) = read_line(&mut reader, SERVER_LINE_LIMIT).await? else {
            return Ok(());
        };
        let name = decode(&line)?.as_str().map(str::to_string).unwrap_or_default();
        let Some(target) = self.registry.resolve(&name) else {
            tracing::debug!(%peer, target_name = %name, "Unknown target requested");
            let error = remote(CallError::new(CallError::UNKNOWN_TARGET, name), None);
            write_value(&mut writer, &failed_response(&error)).await?;
            return Ok(());
        };
        let description = self.describe(&*target);
        write_value(&mut writer, &ok_response(description.to_value())).await?;
        tracing::debug!(%peer, target_name = %name, "Target selected");

        while let Some(line) = read_line(&mut reader, SERVER_LINE_LIMIT).await? {
            let request = decode(&line)
                .map_err(|e| CallError::new("MalformedPayload", e.to_string()))
                .and_then(|v| Request::from_value(&v));
            let reply = match request {
                Ok(Request::MethodList) => ok_response(description.to_value()),
                Ok(Request::Call {
                    method,
                    args,
                    fire_and_forget: true,
                }) => {
                    self.spawn_detached(&target, &name, method, args);
                    continue;
                }
                Ok(Request::Call { method, args, .. }) => {
                    match self.dispatch(&target, &description, &name, &method, args).await {
                        Ok(ret) => ok_response(ret),
                        Err(e) => failed_response(&remote(e, Some((&name, &method)))),
                    }
                }
                Err(e) => failed_response(&remote(e, None)),
            };
            let line = encode_checked(&reply).or_else(|e| {
                tracing::warn!(%peer, target_name = %name, error = %e, "Reply cannot be sent");
                encode_checked(&failed_response(&remote(CallError::new("MalformedPayload", e.to_string()), None)))
            })?;
            write_line(&mut writer, &line).await?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        target: &Arc<dyn Target>,
        description: &TargetDescription,
        target_name: &str,
        method: &str,
        args: CallArgs,
    ) -> std::result::Result<Value, CallError> {
        if self.builtin_terminate && method == TERMINATE {
            tracing::info!("Termination requested");
            let _ = self.terminate_tx.send(true);
            return Ok(Value::None);
        }
        if !description.has_method(method) {
            return Err(CallError::new(CallError::UNKNOWN_METHOD, method));
        }
        tracing::debug!(target_name = %target_name, method, "Calling");
        invoke_isolated(Arc::clone(target), method.to_string(), args).await
    }

    fn spawn_detached(&self, target: &Arc<dyn Target>, target_name: &str, method: String, args: CallArgs) {
        let target = Arc::clone(target);
        let target_name = target_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = invoke_isolated(target, method.clone(), args).await {
                tracing::warn!(target_name = %target_name, %method, error = %e, "Fire-and-forget call failed");
            }
        });
    }
}

/// Run the call on its own task so that a panic becomes a `Panic` error.
async fn invoke_isolated(
    target: Arc<dyn Target>,
    method: String,
    args: CallArgs,
) -> std::result::Result<Value, CallError> {
    let call = tokio::spawn(async move { target.invoke(&method, args).await });
    match call.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "method panicked".to_string());
            Err(CallError::new(CallError::PANIC, message))
        }
        Err(_) => Err(CallError::new("Cancelled", "call was cancelled")),
    }
}

fn remote(error: CallError, location: Option<(&str, &str)>) -> RemoteError {
    let mut traceback = Vec::new();
    if let Some((target, method)) = location {
        traceback.push(format!("in {target}.{method}"));
    }
    traceback.push(format!("{}: {}", error.kind, error.message));
    RemoteError {
        kind: error.kind,
        message: error.message,
        traceback,
    }
}
