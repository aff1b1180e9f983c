//! The byte-stream collaborator: how the store obtains a connected, greeted [`Client`].

use std::fmt::{Debug, Formatter};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::Client;
use crate::command::Command;
use crate::error::{Error, Result};

/// Imap connection trait of a read/write stream
pub trait ImapConnection: Read + Write + Send + private::Sealed {}

impl<T> ImapConnection for T where T: Read + Write + Send {}

impl Debug for dyn ImapConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Imap connection")
    }
}

/// A boxed connection type
pub type Connection = Box<dyn ImapConnection>;

mod private {
    use super::{Read, Write};

    pub trait Sealed {}

    impl<T> Sealed for T where T: Read + Write {}
}

/// How the connection is secured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// No encryption.
    Plain,
    /// Connect in the clear and upgrade with `STARTTLS`.
    StartTls,
    /// TLS from the first byte (usually port 993).
    #[default]
    Tls,
}

/// Opens connections to the server. The returned client has already consumed the greeting.
pub trait Connector: Send + Sync {
    /// Open a new connection.
    fn connect(&self) -> Result<Client<Connection>>;
}

/// Connects over TCP, optionally with TLS via `native-tls` or `rustls`.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
    tls: TlsMode,
    timeout: Option<Duration>,
}

impl TcpConnector {
    /// Make a new `TcpConnector` using the given host, port and TLS mode.
    pub fn new(host: impl Into<String>, port: u16, tls: TlsMode) -> Self {
        TcpConnector {
            host: host.into(),
            port,
            tls,
            timeout: None,
        }
    }

    /// Fail reads and writes that stall for longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn tcp(&self) -> Result<TcpStream> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))?;
        tcp.set_read_timeout(self.timeout)?;
        tcp.set_write_timeout(self.timeout)?;
        Ok(tcp)
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> Result<Client<Connection>> {
        info!(host = %self.host, port = self.port, tls = ?self.tls, "connecting");
        match self.tls {
            TlsMode::Plain => {
                let mut client = Client::new(Box::new(self.tcp()?) as Connection);
                client.read_greeting()?;
                Ok(client)
            }
            TlsMode::Tls => {
                let tls = handshake(&self.host, self.tcp()?)?;
                let mut client = Client::new(tls);
                client.read_greeting()?;
                Ok(client)
            }
            TlsMode::StartTls => {
                let mut client = Client::new(self.tcp()?);
                client.read_greeting()?;
                client.send_command(&Command::new("STARTTLS"))?;
                debug!("upgrading connection after STARTTLS");
                let tcp = client.into_inner()?;
                Ok(Client::new(handshake(&self.host, tcp)?))
            }
        }
    }
}

#[cfg(feature = "native-tls")]
fn handshake(domain: &str, tcp: TcpStream) -> Result<Connection> {
    let connector = native_tls::TlsConnector::builder()
        .build()
        .map_err(|e| Error::Tls(e.to_string()))?;
    let tls = connector
        .connect(domain, tcp)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Box::new(tls))
}

#[cfg(all(feature = "rustls-tls", not(feature = "native-tls")))]
fn handshake(domain: &str, tcp: TcpStream) -> Result<Connection> {
    let connector = rustls_connector::RustlsConnector::new_with_native_certs()
        .map_err(|e| Error::Tls(e.to_string()))?;
    let tls = connector
        .connect(domain, tcp)
        .map_err(|e| Error::Tls(format!("{:?}", e)))?;
    Ok(Box::new(tls))
}

#[cfg(not(any(feature = "native-tls", feature = "rustls-tls")))]
fn handshake(_domain: &str, _tcp: TcpStream) -> Result<Connection> {
    Err(Error::Tls("built without TLS support".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_mode_names() {
        let mode: TlsMode = serde_json::from_str("\"starttls\"").unwrap();
        assert_eq!(mode, TlsMode::StartTls);
        assert_eq!(TlsMode::default(), TlsMode::Tls);
    }

    #[test]
    fn refused_port_is_connection_error() {
        // port 1 on localhost is essentially never listening
        let connector = TcpConnector::new("127.0.0.1", 1, TlsMode::Plain);
        let err = connector.connect().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
    }
}
