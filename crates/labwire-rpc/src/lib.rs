//! # labwire RPC
//!
//! Remote method invocation over line-framed labwire connections.
//!
//! This crate provides:
//! - [`Server`] exposing named [`Target`]s from a [`TargetRegistry`]
//! - [`Client`] (blocking), [`AsyncClient`] (pipelined, tokio) and
//!   [`BestEffortClient`] (skips calls while the server is away)
//! - [`inspect`] for reading a server's identification
//! - [`Listener`], the TCP/TLS accept loop shared with other labwire services
//! - Mutual TLS with pinned peer certificates through [`SslConfig`]
//!
//! ## Example
//!
//! ```no_run
//! use labwire_rpc::{CallArgs, Client, MethodTable, Server, TargetRegistry};
//!
//! # async fn run() -> labwire_rpc::Result<()> {
//! let calc = MethodTable::new().sync_method("add", "(a, b)", "Add.", |args| {
//!     Ok((args.get::<i64>(0, "a")? + args.get::<i64>(1, "b")?).into())
//! });
//! let server = Server::new(TargetRegistry::new().with("calc", calc)?)
//!     .bind("127.0.0.1:0", None)
//!     .await?;
//! let port = server.local_addr().port();
//!
//! let sum = tokio::task::spawn_blocking(move || {
//!     let mut client = Client::connect("127.0.0.1", port, "calc")?;
//!     client.call("add", CallArgs::positional(vec![2.into(), 3.into()]))
//! })
//! .await
//! .expect("client thread");
//! assert_eq!(sum?.as_int(), Some(5));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod async_client;
pub mod best_effort;
pub mod client;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod server;
pub mod target;
pub mod tls;
pub mod transport;

pub use async_client::{AsyncClient, PendingCall};
pub use best_effort::BestEffortClient;
pub use client::{inspect, Client, ClientOptions};
pub use error::{CallError, Error, RemoteError, Result};
pub use listener::{ConnectionHandler, Listener};
pub use protocol::{CallArgs, Identification, TargetDescription, TargetSelector};
pub use server::{serve_until_stopped, stop_signal, RunningServer, Server};
pub use target::{MethodTable, Target, TargetRegistry};
pub use tls::SslConfig;
pub use transport::BoxedStream;
