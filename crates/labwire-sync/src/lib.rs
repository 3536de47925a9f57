//! # labwire sync
//!
//! Replication of a live structure to remote observers, plus plain object
//! broadcast.
//!
//! This crate provides:
//! - [`Mod`] records and [`apply_mod`], the mutation semantics shared by
//!   master and replicas
//! - [`Notifier`], the only way to mutate a published structure
//! - [`Publisher`] / [`Subscriber`]: snapshot followed by the ordered mod
//!   stream, with reconnection driven by a [`Backoff`] policy
//! - [`Broadcaster`] / [`Receiver`] for unordered, lossy object broadcast
//! - [`LogForwarder`] / [`LogServer`] for sending `tracing` events to
//!   another process

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod error;
pub mod logging;
pub mod mods;
pub mod notifier;
pub mod publisher;
pub mod subscriber;

pub use broadcast::{Broadcaster, Receiver, ReceiverHandle, MAGIC_BROADCAST};
pub use error::{Error, ModError, Result};
pub use logging::{
    ForwardingLayer, ForwardingTask, LogForwarder, LogParser, LogRecord, LogServer, FORWARDED_TARGET, MAGIC_LOG,
};
pub use mods::{apply_mod, lookup, Mod};
pub use notifier::{Cursor, Notifier, DEFAULT_QUEUE_CAPACITY};
pub use publisher::{Publisher, RunningPublisher, MAGIC_SYNC};
pub use subscriber::{Backoff, ExponentialBackoff, FixedDelay, Subscriber, Subscription};
