//! Master runtime orchestration.

use crate::config::MasterConfig;
use crate::targets::{self, Context};
use anyhow::{Context as _, Result};
use labwire_rpc::{stop_signal, Listener, RunningServer, Server, TargetRegistry};
use labwire_sync::{Broadcaster, LogServer, Notifier, Publisher, RunningPublisher};
use std::net::SocketAddr;

/// The master: an RPC server, a status publisher, a log broadcaster and a
/// log server collecting the records of other processes.
pub struct Master {
    config: MasterConfig,
    status: Notifier,
    log: Broadcaster,
}

impl Master {
    /// Create a master from its configuration.
    #[must_use]
    pub fn new(config: MasterConfig) -> Self {
        let status = Notifier::new(targets::initial_status(&config.description));
        Self {
            config,
            status,
            log: Broadcaster::new(),
        }
    }

    /// Bind all services.
    ///
    /// # Errors
    ///
    /// Returns error if a socket cannot be bound or the TLS files are invalid.
    pub async fn start(self) -> Result<RunningMaster> {
        let ctx = Context::new(self.status.clone(), self.log.clone());
        let mut registry = TargetRegistry::new();
        registry.insert("calc", targets::calc(&ctx))?;
        registry.insert("status", targets::status(&ctx))?;

        let listen = &self.config.listen;
        let ssl = self.config.ssl.as_ref();

        let server = Server::new(registry)
            .description(self.config.description.clone())
            .builtin_terminate(self.config.allow_terminate)
            .bind(listen.socket_addr(listen.port), ssl)
            .await
            .context("Failed to bind RPC server")?;

        let publisher = Publisher::new()
            .with("status", self.status.clone())
            .bind(listen.socket_addr(self.config.sync_port), ssl)
            .await
            .context("Failed to bind status publisher")?;

        let broadcaster = self
            .log
            .bind(listen.socket_addr(self.config.broadcast_port), ssl)
            .await
            .context("Failed to bind log broadcaster")?;

        // Forwarded records are logged here and passed on to `log` receivers.
        let log = self.log.clone();
        let log_server = LogServer::new()
            .on_record(move |record| {
                record.emit();
                log.broadcast(targets::LOG_CHANNEL, &targets::forwarded_entry(record));
            })
            .bind(listen.socket_addr(self.config.log_port), ssl)
            .await
            .context("Failed to bind log server")?;

        tracing::info!(
            rpc = %server.local_addr(),
            sync = %publisher.local_addr(),
            broadcast = %broadcaster.local_addr(),
            log = %log_server.local_addr(),
            tls = ssl.is_some(),
            "Master listening"
        );

        Ok(RunningMaster {
            server,
            publisher,
            broadcaster,
            log_server,
        })
    }
}

/// A master serving clients.
pub struct RunningMaster {
    server: RunningServer,
    publisher: RunningPublisher,
    broadcaster: Listener,
    log_server: Listener,
}

impl RunningMaster {
    /// Address of the RPC server.
    #[must_use]
    pub fn rpc_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Address of the status publisher.
    #[must_use]
    pub fn sync_addr(&self) -> SocketAddr {
        self.publisher.local_addr()
    }

    /// Address of the log broadcaster.
    #[must_use]
    pub fn broadcast_addr(&self) -> SocketAddr {
        self.broadcaster.local_addr()
    }

    /// Address of the log server.
    #[must_use]
    pub fn log_addr(&self) -> SocketAddr {
        self.log_server.local_addr()
    }

    /// Serve until a stop signal or a `terminate` request, then stop.
    pub async fn run(self) {
        tokio::select! {
            () = stop_signal() => tracing::info!("Stop signal received"),
            () = self.server.wait_terminate() => tracing::info!("Termination requested by client"),
        }
        self.stop().await;
    }

    /// Close every connection and socket.
    pub async fn stop(self) {
        self.server.stop().await;
        self.publisher.stop().await;
        self.broadcaster.stop().await;
        self.log_server.stop().await;
        tracing::info!("Master stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use labwire_codec::Value;
    use labwire_rpc::{AsyncClient, CallArgs, Error};
    use labwire_sync::{LogForwarder, Receiver, Subscriber};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};
    use tracing_subscriber::layer::SubscriberExt;

    fn local() -> MasterConfig {
        MasterConfig {
            listen: Endpoint {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            sync_port: 0,
            broadcast_port: 0,
            log_port: 0,
            ..MasterConfig::default()
        }
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn calls_are_replicated_and_logged() {
        let running = Master::new(local()).start().await.unwrap();

        let subscription = Subscriber::new("status")
            .connect("127.0.0.1", running.sync_addr().port())
            .await
            .unwrap();
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&records);
        let receiver = Receiver::new(targets::LOG_CHANNEL)
            .on_notify(move |obj| sink.lock().unwrap().push(obj.clone()))
            .connect("127.0.0.1", running.broadcast_addr().port())
            .await
            .unwrap();

        let calc = AsyncClient::connect("127.0.0.1", running.rpc_addr().port(), "calc")
            .await
            .unwrap();
        let sum = assert_ok!(calc.call("add", CallArgs::positional(vec![2.into(), 3.into()])).await);
        assert_eq!(sum, Value::from(5));
        let err = assert_err!(calc.call("div", CallArgs::positional(vec![1.into(), 0.into()])).await);
        assert!(matches!(err, Error::Remote(ref e) if e.kind == "ZeroDivisionError"));

        eventually("call counter", || {
            subscription.read(|v| v.get_str("calls").and_then(Value::as_int)) == Some(2)
        })
        .await;

        let status = AsyncClient::connect("127.0.0.1", running.rpc_addr().port(), "status")
            .await
            .unwrap();
        assert_ok!(status.call("note", CallArgs::positional(vec!["calibrated".into()])).await);
        eventually("note replicated", || {
            subscription.read(|v| v.get_str("notes").and_then(Value::as_seq).map(<[Value]>::len)) == Some(1)
        })
        .await;

        // The receiver registers in the background; objects sent before that are lost.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while records.lock().unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no log record received");
            assert_ok!(status.call("set_state", CallArgs::positional(vec!["running".into()])).await);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let record = records.lock().unwrap()[0].clone();
        assert_eq!(record.get_str("level"), Some(&Value::from("info")));
        eventually("state replicated", || {
            subscription.read(|v| v.get_str("state").cloned()) == Some(Value::from("running"))
        })
        .await;

        calc.close().await;
        status.close().await;
        receiver.close().await;
        subscription.close().await;
        running.stop().await;
    }

    #[tokio::test]
    async fn terminate_stops_the_master() {
        let running = Master::new(local()).start().await.unwrap();
        let port = running.rpc_addr().port();
        let task = tokio::spawn(running.run());

        let client = AsyncClient::connect("127.0.0.1", port, "calc").await.unwrap();
        assert!(client.description().has_method("terminate"));
        let _ = client.call("terminate", CallArgs::default()).await;

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(AsyncClient::connect("127.0.0.1", port, "calc").await.is_err());
    }

    #[tokio::test]
    async fn forwarded_records_are_broadcast() {
        let running = Master::new(local()).start().await.unwrap();
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&records);
        let receiver = Receiver::new(targets::LOG_CHANNEL)
            .on_notify(move |obj| sink.lock().unwrap().push(obj.clone()))
            .connect("127.0.0.1", running.broadcast_addr().port())
            .await
            .unwrap();

        let (layer, task) = LogForwarder::new("controller", "127.0.0.1", running.log_addr().port()).build();
        let delivery = tokio::spawn(task.run());
        let dispatch = tracing::Dispatch::new(tracing_subscriber::registry().with(layer));
        let forwarded = |obj: &Value| obj.get_str("source") == Some(&Value::from("controller"));

        // The receiver registers in the background; keep logging until one arrives.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !records.lock().unwrap().iter().any(forwarded) {
            assert!(tokio::time::Instant::now() < deadline, "no forwarded record received");
            tracing::dispatcher::with_default(&dispatch, || {
                tracing::warn!(target: "scan::motor", "stalled\nat step 4");
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let record = records.lock().unwrap().iter().find(|obj| forwarded(obj)).cloned().unwrap();
        assert_eq!(record.get_str("level"), Some(&Value::from("warn")));
        assert_eq!(record.get_str("target"), Some(&Value::from("scan.motor")));
        assert_eq!(record.get_str("message"), Some(&Value::from("stalled\nat step 4")));

        drop(dispatch);
        assert_ok!(tokio::time::timeout(Duration::from_secs(5), delivery).await);
        receiver.close().await;
        running.stop().await;
    }
}
