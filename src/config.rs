//! Store configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conn::{TcpConnector, TlsMode};
use crate::error::{Error, Result};

/// Everything a store needs to know that is not a credential.
///
/// Every field has a default, so a JSON file only needs the fields it changes:
///
/// ```
/// # use imap_disco::config::StoreConfig;
/// let config = StoreConfig::from_json(r#"{"host": "imap.example.com", "username": "me"}"#)
///     .unwrap();
/// assert_eq!(config.port, 993);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Server host name.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Transport security.
    pub tls: TlsMode,
    /// Login name.
    pub username: String,
    /// Root of the on-disk mirror: summaries, caches and the diary.
    pub data_dir: PathBuf,
    /// Sequence numbers per `FETCH` during a rescan, and UIDs per metadata fetch.
    pub fetch_batch_size: u32,
    /// Longest UID set text put into one command.
    pub max_uid_set_len: usize,
    /// Background worker threads.
    pub worker_threads: usize,
    /// Use `LSUB` to learn subscriptions when listing folders.
    pub use_lsub: bool,
    /// Use this namespace prefix instead of asking the server.
    pub namespace: Option<String>,
    /// Socket read/write timeout in seconds.
    pub timeout_secs: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            host: String::new(),
            port: 993,
            tls: TlsMode::Tls,
            username: String::new(),
            data_dir: PathBuf::from("."),
            fetch_batch_size: 500,
            max_uid_set_len: 768,
            worker_threads: 1,
            use_lsub: true,
            namespace: None,
            timeout_secs: Some(60),
        }
    }
}

impl StoreConfig {
    /// A configuration with defaults for everything but the essentials.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        StoreConfig {
            host: host.into(),
            username: username.into(),
            data_dir: data_dir.into(),
            ..StoreConfig::default()
        }
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the transport security.
    pub fn tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Set the rescan batch size. Zero is treated as one.
    pub fn fetch_batch_size(mut self, n: u32) -> Self {
        self.fetch_batch_size = n.max(1);
        self
    }

    /// Set the longest UID set sent in one command.
    pub fn max_uid_set_len(mut self, n: usize) -> Self {
        self.max_uid_set_len = n;
        self
    }

    /// Set the number of background workers.
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Whether to ask the server for subscriptions with `LSUB`.
    pub fn use_lsub(mut self, yes: bool) -> Self {
        self.use_lsub = yes;
        self
    }

    /// Override the namespace prefix.
    pub fn namespace(mut self, prefix: impl Into<String>) -> Self {
        self.namespace = Some(prefix.into());
        self
    }

    /// Parse a JSON configuration.
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::summary(path, e))?;
        Self::from_json(&text).map_err(|e| Error::summary(path, e))
    }

    /// A [`TcpConnector`] for this configuration.
    pub fn connector(&self) -> TcpConnector {
        let connector = TcpConnector::new(self.host.clone(), self.port, self.tls);
        match self.timeout_secs {
            Some(secs) => connector.with_timeout(Duration::from_secs(secs)),
            None => connector,
        }
    }

    pub(crate) fn batch(&self) -> u32 {
        self.fetch_batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_defaults() {
        let config = StoreConfig::from_json(
            r#"{"host": "mail.example.org", "tls": "starttls", "port": 143, "fetch_batch_size": 50}"#,
        )
        .unwrap();
        assert_eq!(config.host, "mail.example.org");
        assert_eq!(config.tls, TlsMode::StartTls);
        assert_eq!(config.port, 143);
        assert_eq!(config.fetch_batch_size, 50);
        assert!(config.use_lsub);
        assert_eq!(config.max_uid_set_len, 768);
    }

    #[test]
    fn builder_setters() {
        let config = StoreConfig::new("h", "u", "/tmp/x")
            .port(10143)
            .fetch_batch_size(0)
            .namespace("INBOX.");
        assert_eq!(config.port, 10143);
        assert_eq!(config.batch(), 1);
        assert_eq!(config.namespace.as_deref(), Some("INBOX."));
    }

    #[test]
    fn missing_file_is_summary_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = StoreConfig::from_file(dir.path().join("nope.json")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cache);
    }
}
