//! Remote log forwarding.
//!
//! A process adds the layer built by [`LogForwarder`] to its `tracing`
//! subscriber. Events are queued and written to a [`LogServer`] as plain text
//! after the [`MAGIC_LOG`] magic:
//!
//! ```text
//! source:LEVEL<lines>:target:message
//! continuation
//! ```
//!
//! `<lines>` is present only for multi-line messages and counts every line of
//! the record. `:` separates the fields, so targets travel with `::` written
//! as `.`. The server re-emits records under [`FORWARDED_TARGET`]; a filter
//! such as `info,labwire_forwarded=trace` lets them through whatever their
//! level, since their source filtered them already.

use crate::error::Result;
use async_trait::async_trait;
use labwire_rpc::transport::{connect, read_line, read_magic, write_line, BoxedStream, SERVER_LINE_LIMIT};
use labwire_rpc::{ConnectionHandler, Listener, SslConfig};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::ToSocketAddrs;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Magic sent by forwarders.
pub const MAGIC_LOG: [u8; 4] = *b"LOG1";

/// Target of the events a [`LogServer`] re-emits.
pub const FORWARDED_TARGET: &str = "labwire_forwarded";

/// Records queued before new ones are dropped.
pub const DEFAULT_QUEUE_SIZE: usize = 1000;

/// Pause before reconnecting to an unreachable log server.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Target given to lines that do not follow the record format.
const UNFORMATTED_TARGET: &str = "print";

/// One log record as it travels between processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Name of the emitting process
    pub source: String,
    /// Severity
    pub level: Level,
    /// Logger name, `::` written as `.`
    pub target: String,
    /// Message, possibly spanning several lines
    pub message: String,
}

fn without_colons(s: &str) -> String {
    s.replace("::", ".").replace(':', ".")
}

fn parse_level(name: &str) -> Option<Level> {
    match name {
        "CRITICAL" | "ERROR" => Some(Level::ERROR),
        "WARNING" | "WARN" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

/// `LEVEL<lines>:target:message` into its parts.
fn parse_header(text: &str) -> Option<(usize, Level, &str, &str)> {
    let (head, rest) = text.split_once(':')?;
    let (level, lines) = match head.split_once('<') {
        Some((level, count)) => (level, count.strip_suffix('>')?.parse::<usize>().ok()?),
        None => (head, 1),
    };
    let level = parse_level(level)?;
    let (target, message) = rest.split_once(':')?;
    Some((lines.max(1), level, target, message))
}

impl LogRecord {
    /// A record of this process.
    #[must_use]
    pub fn new(source: &str, level: Level, target: &str, message: impl Into<String>) -> Self {
        Self {
            source: without_colons(source),
            level,
            target: without_colons(target),
            message: message.into(),
        }
    }

    /// Wire form, without the final line terminator.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let lines = self.message.split('\n').count();
        let mut out = format!("{}:{}", self.source, self.level);
        if lines > 1 {
            let _ = write!(out, "<{lines}>");
        }
        let _ = write!(out, ":{}:{}", self.target, self.message);
        out
    }

    /// Emit the record through `tracing` under [`FORWARDED_TARGET`].
    pub fn emit(&self) {
        macro_rules! forward {
            ($level:expr) => {
                tracing::event!(
                    target: FORWARDED_TARGET,
                    $level,
                    source = %self.source,
                    origin = %self.target,
                    "{}",
                    self.message
                )
            };
        }
        match self.level {
            Level::ERROR => forward!(Level::ERROR),
            Level::WARN => forward!(Level::WARN),
            Level::INFO => forward!(Level::INFO),
            Level::DEBUG => forward!(Level::DEBUG),
            Level::TRACE => forward!(Level::TRACE),
        }
    }
}

/// Reassembles records from the lines of one connection.
#[derive(Debug, Default)]
pub struct LogParser {
    partial: Option<(LogRecord, usize)>,
}

impl LogParser {
    /// Feed one line, without its terminator.
    ///
    /// Returns the record the line completes, if any. A line after the
    /// source that does not follow the record format becomes a one-line
    /// `INFO` record of target `print`.
    ///
    /// # Errors
    ///
    /// Returns [`labwire_rpc::Error::Protocol`] for a first line without a
    /// `source:` prefix.
    pub fn line(&mut self, line: &str) -> Result<Option<LogRecord>> {
        if let Some((mut record, remaining)) = self.partial.take() {
            record.message.push('\n');
            record.message.push_str(line);
            if remaining > 1 {
                self.partial = Some((record, remaining - 1));
                return Ok(None);
            }
            return Ok(Some(record));
        }
        let Some((source, rest)) = line.split_once(':') else {
            return Err(labwire_rpc::Error::Protocol(format!("log line without a source: {line:?}")).into());
        };
        let (lines, level, target, message) =
            parse_header(rest).unwrap_or((1, Level::INFO, UNFORMATTED_TARGET, rest));
        let record = LogRecord {
            source: source.to_string(),
            level,
            target: target.to_string(),
            message: message.to_string(),
        };
        if lines > 1 {
            self.partial = Some((record, lines - 1));
            Ok(None)
        } else {
            Ok(Some(record))
        }
    }

    /// Whether a multi-line record is waiting for more lines.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.partial.is_some()
    }
}

type RecordFn = Box<dyn Fn(&LogRecord) + Send + Sync>;

/// Accepts forwarders and hands their records on.
///
/// Without callbacks every record is re-emitted with [`LogRecord::emit`].
#[derive(Default)]
pub struct LogServer {
    sinks: Vec<RecordFn>,
}

impl std::fmt::Debug for LogServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogServer").field("callbacks", &self.sinks.len()).finish()
    }
}

impl LogServer {
    /// A server re-emitting records locally.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `f` with every complete record instead of re-emitting it.
    #[must_use]
    pub fn on_record(mut self, f: impl Fn(&LogRecord) + Send + Sync + 'static) -> Self {
        self.sinks.push(Box::new(f));
        self
    }

    /// Start accepting forwarders.
    ///
    /// # Errors
    ///
    /// Returns the bind error unmodified, or a TLS configuration error.
    pub async fn bind<A: ToSocketAddrs>(self, addr: A, ssl: Option<&SslConfig>) -> labwire_rpc::Result<Listener> {
        Listener::bind(addr, ssl, Arc::new(self)).await
    }

    fn deliver(&self, record: &LogRecord) {
        if self.sinks.is_empty() {
            record.emit();
        }
        for sink in &self.sinks {
            sink(record);
        }
    }

    async fn serve(&self, stream: BoxedStream) -> Result<()> {
        let mut reader = BufReader::new(stream);
        if read_magic(&mut reader).await? != MAGIC_LOG {
            return Ok(());
        }
        let mut parser = LogParser::default();
        while let Some(line) = read_line(&mut reader, SERVER_LINE_LIMIT).await? {
            if let Some(record) = parser.line(&line)? {
                self.deliver(&record);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionHandler for LogServer {
    async fn handle(&self, stream: BoxedStream, peer: SocketAddr) {
        match self.serve(stream).await {
            Ok(()) => tracing::debug!(%peer, "Log forwarder disconnected"),
            Err(e) => tracing::warn!(%peer, error = %e, "Dropping log forwarder connection"),
        }
    }
}

/// Configuration of a forwarder sending this process's events to a
/// [`LogServer`].
#[derive(Debug, Clone)]
pub struct LogForwarder {
    source: String,
    host: String,
    port: u16,
    ssl: Option<SslConfig>,
    queue_size: usize,
    reconnect_interval: Duration,
}

impl LogForwarder {
    /// Forward as `source` to the server at `host:port`.
    #[must_use]
    pub fn new(source: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            source: without_colons(&source.into()),
            host: host.into(),
            port,
            ssl: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }

    /// Use mutual TLS.
    #[must_use]
    pub fn ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = Some(ssl);
        self
    }

    /// Records held while the server is slow or away.
    #[must_use]
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size.max(1);
        self
    }

    /// Pause between connection attempts.
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Split into the layer to install and the task that delivers its queue.
    #[must_use]
    pub fn build(self) -> (ForwardingLayer, ForwardingTask) {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let layer = ForwardingLayer {
            source: self.source,
            queue: tx,
        };
        let task = ForwardingTask {
            host: self.host,
            port: self.port,
            ssl: self.ssl,
            reconnect_interval: self.reconnect_interval,
            queue: rx,
        };
        (layer, task)
    }
}

/// `tracing` layer queueing every event for a [`ForwardingTask`].
///
/// Never blocks: when the queue is full the event is not forwarded. Events a
/// [`LogServer`] re-emits are not forwarded again.
#[derive(Debug)]
pub struct ForwardingLayer {
    source: String,
    queue: mpsc::Sender<String>,
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(mut self) -> String {
        self.message.push_str(&self.fields);
        self.message
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

impl<S: Subscriber> Layer<S> for ForwardingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Diagnostics of the delivery task and records received from other
        // processes would feed back into the queue.
        if metadata.target() == module_path!() || metadata.target() == FORWARDED_TARGET {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let record = LogRecord::new(&self.source, *metadata.level(), metadata.target(), visitor.finish());
        let _ = self.queue.try_send(record.to_wire());
    }
}

/// Delivers the records queued by a [`ForwardingLayer`].
#[derive(Debug)]
pub struct ForwardingTask {
    host: String,
    port: u16,
    ssl: Option<SslConfig>,
    reconnect_interval: Duration,
    queue: mpsc::Receiver<String>,
}

impl ForwardingTask {
    /// Connect, send queued records and reconnect after failures.
    ///
    /// Returns once the layer is dropped and everything it queued has been
    /// written. A record whose write failed is sent again after reconnecting.
    pub async fn run(mut self) {
        let mut unsent = None;
        loop {
            match self.session(&mut unsent).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::debug!(host = %self.host, port = self.port, error = %e, "Log server unreachable");
                    tokio::time::sleep(self.reconnect_interval).await;
                }
            }
        }
    }

    async fn session(&mut self, unsent: &mut Option<String>) -> Result<()> {
        let (mut stream, _) = connect(&self.host, self.port, self.ssl.as_ref(), Some(self.reconnect_interval)).await?;
        stream.write_all(&MAGIC_LOG).await?;
        loop {
            let line = match unsent.take() {
                Some(line) => line,
                None => match self.queue.recv().await {
                    Some(line) => line,
                    None => {
                        let _ = stream.shutdown().await;
                        return Ok(());
                    }
                },
            };
            if let Err(e) = write_line(&mut stream, &line).await {
                *unsent = Some(line);
                return Err(e.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut LogParser, text: &str) -> Vec<LogRecord> {
        text.lines()
            .filter_map(|line| parser.line(line).unwrap())
            .collect()
    }

    #[test]
    fn single_line_format() {
        let record = LogRecord::new("worker", Level::WARN, "labwire_sync::publisher", "queue full");
        assert_eq!(record.to_wire(), "worker:WARN:labwire_sync.publisher:queue full");
    }

    #[test]
    fn multi_line_records_count_their_lines() {
        let record = LogRecord::new("w", Level::ERROR, "scan", "failed:\n  step 3\n  step 4");
        let wire = record.to_wire();
        assert_eq!(wire, "w:ERROR<3>:scan:failed:\n  step 3\n  step 4");

        let mut parser = LogParser::default();
        let parsed = feed(&mut parser, &format!("{wire}\nw:INFO:scan:done"));
        assert_eq!(parsed, vec![record, LogRecord::new("w", Level::INFO, "scan", "done")]);
        assert!(!parser.is_incomplete());
    }

    #[test]
    fn continuation_lines_are_taken_verbatim() {
        let mut parser = LogParser::default();
        assert_eq!(parser.line("w:INFO<2>:t:head").unwrap(), None);
        assert!(parser.is_incomplete());
        // Looks like a record, but it is the second line of the first one.
        let record = parser.line("w:ERROR:t:body").unwrap().unwrap();
        assert_eq!(record.message, "head\nw:ERROR:t:body");
        assert_eq!(record.level, Level::INFO);
    }

    #[test]
    fn foreign_level_names_are_understood() {
        let mut parser = LogParser::default();
        let records = feed(&mut parser, "a:WARNING:x:one\na:CRITICAL:x:two\na:DEBUG:x:");
        let levels: Vec<Level> = records.iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![Level::WARN, Level::ERROR, Level::DEBUG]);
        assert_eq!(records[2].message, "");
    }

    #[test]
    fn unformatted_lines_become_info_records() {
        let mut parser = LogParser::default();
        let record = parser.line("ctl:plain output: 42").unwrap().unwrap();
        assert_eq!(record.source, "ctl");
        assert_eq!(record.level, Level::INFO);
        assert_eq!(record.target, UNFORMATTED_TARGET);
        assert_eq!(record.message, "plain output: 42");

        let record = parser.line("ctl:NOTICE:x:y").unwrap().unwrap();
        assert_eq!(record.message, "NOTICE:x:y");
        let record = parser.line("ctl:INFO<x>:x:y").unwrap().unwrap();
        assert_eq!(record.target, UNFORMATTED_TARGET);
    }

    #[test]
    fn line_without_source_is_an_error() {
        let mut parser = LogParser::default();
        assert!(parser.line("no separator here").is_err());
    }
}
