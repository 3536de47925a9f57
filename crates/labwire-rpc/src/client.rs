//! Blocking RPC client.

use crate::error::{Error, Result};
use crate::protocol::{
    parse_response, CallArgs, Identification, Request, TargetDescription, TargetSelector, MAGIC_INSPECT,
    MAGIC_RPC,
};
use crate::tls::SslConfig;
use crate::transport::{configure_socket, read_value_blocking, write_value_blocking, SyncStream, CLIENT_LINE_LIMIT};
use socket2::SockRef;
use labwire_codec::Value;
use std::io::{BufReader, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Connection options shared by the client flavours.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Bound on connecting and on the handshake
    pub timeout: Option<Duration>,
    /// Mutual TLS material
    pub ssl: Option<SslConfig>,
    /// Target to select after the handshake
    pub target: TargetSelector,
}

impl ClientOptions {
    /// Options selecting `target`.
    #[must_use]
    pub fn target(target: impl Into<TargetSelector>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Set the connect and handshake timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable mutual TLS.
    #[must_use]
    pub fn with_ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = Some(ssl);
        self
    }
}

/// An RPC client whose calls block the calling thread.
pub struct Client {
    stream: BufReader<Box<dyn SyncStream>>,
    socket: TcpStream,
    local_addr: SocketAddr,
    identification: Identification,
    selected: Option<String>,
    description: TargetDescription,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("local_addr", &self.local_addr)
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

struct Opened {
    stream: Box<dyn SyncStream>,
    socket: TcpStream,
    local_addr: SocketAddr,
}

fn open(host: &str, port: u16, options: &ClientOptions, magic: [u8; 4]) -> Result<Opened> {
    let mut last_error = None;
    let mut tcp = None;
    for addr in (host, port).to_socket_addrs()? {
        let attempt = match options.timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }
    let tcp = match (tcp, last_error) {
        (Some(tcp), _) => tcp,
        (None, Some(e)) => return Err(e.into()),
        (None, None) => return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{host} did not resolve to any address"),
        ))),
    };
    configure_socket(SockRef::from(&tcp))?;
    // The timeout only bounds the handshake; calls block until answered.
    tcp.set_read_timeout(options.timeout)?;
    tcp.set_write_timeout(options.timeout)?;
    let local_addr = tcp.local_addr()?;
    let socket = tcp.try_clone()?;

    let mut stream: Box<dyn SyncStream> = match &options.ssl {
        Some(ssl) => {
            let connection = rustls::ClientConnection::new(ssl.client_config()?, SslConfig::server_name(host))?;
            Box::new(rustls::StreamOwned::new(connection, tcp))
        }
        None => Box::new(tcp),
    };
    stream.write_all(&magic)?;
    stream.flush()?;
    Ok(Opened {
        stream,
        socket,
        local_addr,
    })
}

fn read_identification<R: std::io::BufRead>(reader: &mut R) -> Result<Identification> {
    match read_value_blocking(reader, CLIENT_LINE_LIMIT) {
        Ok(Some(value)) => Identification::from_value(&value),
        Ok(None) | Err(Error::ConnectionLost) => Err(Error::HandshakeMismatch(
            "server closed the connection during the handshake".to_string(),
        )),
        Err(e) => Err(e),
    }
}

/// Ask a server for its targets and description without selecting one.
///
/// # Errors
///
/// Returns connection, TLS and handshake errors.
pub fn inspect(host: &str, port: u16, options: &ClientOptions) -> Result<Identification> {
    let opened = open(host, port, options, MAGIC_INSPECT)?;
    read_identification(&mut BufReader::new(opened.stream))
}

impl Client {
    /// Connect without TLS or timeout and select `target`.
    ///
    /// # Errors
    ///
    /// See [`Client::connect_with`].
    pub fn connect(host: &str, port: u16, target: impl Into<TargetSelector>) -> Result<Self> {
        Self::connect_with(host, port, &ClientOptions::target(target))
    }

    /// Connect, identify the server and select `options.target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the timeout elapses during connect or
    /// handshake, [`Error::HandshakeMismatch`] if the peer is not an RPC
    /// server, and target selection errors.
    pub fn connect_with(host: &str, port: u16, options: &ClientOptions) -> Result<Self> {
        let opened = open(host, port, options, MAGIC_RPC)?;
        let mut stream = BufReader::new(opened.stream);
        let identification = read_identification(&mut stream)?;
        let mut client = Self {
            stream,
            socket: opened.socket,
            local_addr: opened.local_addr,
            identification,
            selected: None,
            description: TargetDescription::default(),
        };
        client.select_target(options.target.clone())?;
        client.socket.set_read_timeout(None)?;
        client.socket.set_write_timeout(None)?;
        tracing::debug!(%host, port, target = ?client.selected, "RPC client connected");
        Ok(client)
    }

    /// Target names and description sent by the server.
    #[must_use]
    pub fn rpc_id(&self) -> (&[String], Option<&str>) {
        (&self.identification.targets, self.identification.description.as_deref())
    }

    /// Select a target; only meaningful once, for clients created with
    /// [`TargetSelector::None`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTarget`] or [`Error::AmbiguousTarget`] before
    /// contacting the server, or the server's refusal.
    pub fn select_target(&mut self, target: impl Into<TargetSelector>) -> Result<()> {
        let Some(name) = target.into().resolve(&self.identification.targets)? else {
            return Ok(());
        };
        write_value_blocking(self.stream.get_mut(), &Value::from(name.as_str()))?;
        let reply = self.receive()?;
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
    pub fn list_methods(&mut self) -> Result<TargetDescription> {
        write_value_blocking(self.stream.get_mut(), &Request::MethodList.to_value())?;
        let reply = self.receive()?;
        TargetDescription::from_value(&reply)
    }

    /// Call `method` and wait for its result.
    ///
    /// Fire-and-forget methods return `Value::None` as soon as the request is sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMethod`] without contacting the server if the
    /// target does not offer `method`, [`Error::Remote`] if the method fails
    /// and connection errors otherwise.
    pub fn call(&mut self, method: &str, args: CallArgs) -> Result<Value> {
        if self.selected.is_none() {
            return Err(Error::UnknownTarget("no target selected".to_string()));
        }
        if !self.description.has_method(method) {
            return Err(Error::UnknownMethod(method.to_string()));
        }
        let fire_and_forget = self.description.is_fire_and_forget(method);
        let request = Request::Call {
            method: method.to_string(),
            args,
            fire_and_forget,
        };
        write_value_blocking(self.stream.get_mut(), &request.to_value())?;
        if fire_and_forget {
            return Ok(Value::None);
        }
        self.receive()
    }

    /// Address of the local end of the connection.
    #[must_use]
    pub fn local_host(&self) -> IpAddr {
        self.local_addr.ip()
    }

    /// Close the connection.
    pub fn close(self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }

    fn receive(&mut self) -> Result<Value> {
        let reply = read_value_blocking(&mut self.stream, CLIENT_LINE_LIMIT)?.ok_or(Error::ConnectionLost)?;
        parse_response(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn opened_socket_uses_keepalive_and_sends_the_magic() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let options = ClientOptions::default().with_timeout(Duration::from_secs(5));

        let opened = open("127.0.0.1", port, &options, MAGIC_RPC).unwrap();
        assert!(SockRef::from(&opened.socket).keepalive().unwrap());
        assert!(SockRef::from(&opened.socket).nodelay().unwrap());

        let (mut peer, _) = listener.accept().unwrap();
        let mut magic = [0u8; 4];
        peer.read_exact(&mut magic).unwrap();
        assert_eq!(magic, MAGIC_RPC);
    }
}
