//! Line framing and connection setup.
//!
//! After the 4-byte magic every message is one encoded value followed by
//! `\n`. Both the async (tokio) and the blocking (std) sides live here so
//! that the two client flavours put identical bytes on the wire.

use crate::error::{Error, Result};
use crate::tls::SslConfig;
use labwire_codec::{decode, encode_checked, CodecError, Value};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Longest line a server accepts.
pub const SERVER_LINE_LIMIT: usize = 16 * 1024 * 1024;

/// Longest line a client accepts.
pub const CLIENT_LINE_LIMIT: usize = 100 * 1024 * 1024;

/// Idle time before the first keepalive packet.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);

/// Time between unanswered keepalive packets.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Unanswered keepalive packets before the connection is dropped.
pub const KEEPALIVE_RETRIES: u32 = 3;

/// A bidirectional async byte stream, plain TCP or TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased async stream handed to connection handlers.
pub type BoxedStream = Box<dyn AsyncStream>;

/// A bidirectional blocking byte stream, plain TCP or TLS.
pub trait SyncStream: std::io::Read + std::io::Write + Send {}

impl<T: std::io::Read + std::io::Write + Send> SyncStream for T {}

fn check_line(mut buf: Vec<u8>, limit: usize) -> Result<Option<String>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > limit {
            return Err(CodecError::MalformedPayload {
                offset: limit,
                reason: format!("line longer than {limit} bytes"),
            }
            .into());
        }
        return Err(Error::ConnectionLost);
    }
    buf.pop();
    String::from_utf8(buf).map(Some).map_err(|e| {
        CodecError::MalformedPayload {
            offset: e.utf8_error().valid_up_to(),
            reason: "invalid UTF-8".to_string(),
        }
        .into()
    })
}

/// Read one line, without its terminator.
///
/// Returns `Ok(None)` on a clean end of stream.
///
/// # Errors
///
/// Returns [`Error::Codec`] if the line exceeds `limit` or is not UTF-8 and
/// [`Error::ConnectionLost`] if the stream ends mid-line.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R, limit: usize) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let mut bounded = AsyncReadExt::take(&mut *reader, limit as u64 + 1);
    AsyncBufReadExt::read_until(&mut bounded, b'\n', &mut buf).await?;
    check_line(buf, limit)
}

/// Read and decode one value.
///
/// # Errors
///
/// See [`read_line`]; decode failures are [`Error::Codec`].
pub async fn read_value<R: AsyncBufRead + Unpin>(reader: &mut R, limit: usize) -> Result<Option<Value>> {
    match read_line(reader, limit).await? {
        Some(line) => Ok(Some(decode(&line)?)),
        None => Ok(None),
    }
}

/// Write one pre-encoded line and flush.
///
/// # Errors
///
/// Returns an error if the stream is closed.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    let mut framed = Vec::with_capacity(line.len() + 1);
    framed.extend_from_slice(line.as_bytes());
    framed.push(b'\n');
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write one value.
///
/// # Errors
///
/// Returns [`Error::Codec`] without writing anything if the value nests
/// deeper than a peer decodes, or an error if the stream is closed.
pub async fn write_value<W: AsyncWrite + Unpin>(writer: &mut W, value: &Value) -> Result<()> {
    let line = encode_checked(value)?;
    write_line(writer, &line).await
}

/// Blocking counterpart of [`read_line`].
///
/// # Errors
///
/// See [`read_line`].
pub fn read_line_blocking<R: std::io::BufRead>(reader: &mut R, limit: usize) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let mut bounded = std::io::Read::take(&mut *reader, limit as u64 + 1);
    std::io::BufRead::read_until(&mut bounded, b'\n', &mut buf)?;
    check_line(buf, limit)
}

/// Blocking counterpart of [`read_value`].
///
/// # Errors
///
/// See [`read_value`].
pub fn read_value_blocking<R: std::io::BufRead>(reader: &mut R, limit: usize) -> Result<Option<Value>> {
    match read_line_blocking(reader, limit)? {
        Some(line) => Ok(Some(decode(&line)?)),
        None => Ok(None),
    }
}

/// Blocking counterpart of [`write_line`].
///
/// # Errors
///
/// Returns an error if the stream is closed.
pub fn write_line_blocking<W: std::io::Write + ?Sized>(writer: &mut W, line: &str) -> Result<()> {
    let mut framed = Vec::with_capacity(line.len() + 1);
    framed.extend_from_slice(line.as_bytes());
    framed.push(b'\n');
    std::io::Write::write_all(writer, &framed)?;
    std::io::Write::flush(writer)?;
    Ok(())
}

/// Blocking counterpart of [`write_value`].
///
/// # Errors
///
/// See [`write_value`].
pub fn write_value_blocking<W: std::io::Write + ?Sized>(writer: &mut W, value: &Value) -> Result<()> {
    let line = encode_checked(value)?;
    write_line_blocking(writer, &line)
}

fn keepalive() -> TcpKeepalive {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    #[cfg(any(
        windows,
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd"
    ))]
    let keepalive = keepalive.with_interval(KEEPALIVE_INTERVAL);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd"
    ))]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);
    keepalive
}

/// Disable Nagle and enable TCP keepalive on a connected socket.
///
/// Applied to every socket labwire opens or accepts, so a peer that
/// vanishes without closing is detected after about a minute of silence.
///
/// # Errors
///
/// Returns the error of the first option the system refuses.
pub fn configure_socket(socket: SockRef<'_>) -> std::io::Result<()> {
    socket.set_nodelay(true)?;
    socket.set_tcp_keepalive(&keepalive())
}

async fn open_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let tcp = TcpStream::connect((host, port)).await?;
    configure_socket(SockRef::from(&tcp))?;
    Ok(tcp)
}

/// Open a TCP connection, wrapping it in TLS when `ssl` is set.
///
/// Returns the stream and the local address of the socket.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if `timeout` elapses first, [`Error::Tls`] on
/// certificate problems and [`Error::Io`] otherwise.
pub async fn connect(
    host: &str,
    port: u16,
    ssl: Option<&SslConfig>,
    timeout: Option<Duration>,
) -> Result<(BoxedStream, SocketAddr)> {
    let attempt = async {
        let tcp = open_tcp(host, port).await?;
        let local = tcp.local_addr()?;
        let stream: BoxedStream = match ssl {
            Some(ssl) => {
                let tls = ssl.connector()?.connect(SslConfig::server_name(host), tcp).await?;
                Box::new(tls)
            }
            None => Box::new(tcp),
        };
        Ok::<_, Error>((stream, local))
    };
    match timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| Error::Timeout)?,
        None => attempt.await,
    }
}

/// Send `magic` and read the server's first line.
///
/// # Errors
///
/// Returns [`Error::HandshakeMismatch`] if the server closes instead of
/// answering.
pub async fn handshake<S: AsyncBufRead + AsyncWrite + Unpin>(stream: &mut S, magic: [u8; 4]) -> Result<Value> {
    let exchange = async {
        stream.write_all(&magic).await?;
        stream.flush().await?;
        read_value(stream, CLIENT_LINE_LIMIT).await
    };
    match exchange.await {
        Ok(Some(value)) => Ok(value),
        Ok(None) | Err(Error::ConnectionLost) => Err(Error::HandshakeMismatch(
            "server closed the connection during the handshake".to_string(),
        )),
        Err(e) => Err(e),
    }
}

/// Read the 4-byte magic a client opens with.
///
/// # Errors
///
/// Returns [`Error::ConnectionLost`] if fewer than four bytes arrive.
pub async fn read_magic<R: AsyncRead + Unpin>(reader: &mut R) -> Result<[u8; 4]> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    Ok(magic)
}
