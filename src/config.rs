//! Client configuration.
//!
//! A [`ClientConfig`] is built once and shared by every component of a client. It can be
//! parsed from a connection string, loaded from a TOML file, or assembled in code from
//! [`ClientConfig::default`].
//!
//! # Connection strings
//!
//! `[scheme://][user[:password]@]host:port[,host:port...]`
//!
//! Only the first endpoint is ever dialed; the rest are accepted so that connection
//! strings shared with cluster-aware tools still parse.
//!
//! # Example
//! ```rust
//! use iproto::ClientConfig;
//!
//! let config: ClientConfig = "operator:secret@localhost:3301".parse().unwrap();
//! assert_eq!(config.endpoints[0].port, 3301);
//! assert_eq!(config.credentials.unwrap().user, "operator");
//! ```
use std::{fmt, fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;

use crate::{error::ClientError, protocol::LENGTH_PREFIX_SIZE};

pub const DEFAULT_READ_BUFFER_SIZE: usize = 48 * 1024;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8 * 1024;
pub const DEFAULT_MAX_REQUESTS_IN_BATCH: usize = 16384;
pub const DEFAULT_MIN_REQUESTS_WITH_THROTTLE: usize = 16;
pub const DEFAULT_WRITE_THROTTLE_PERIOD: Duration = Duration::from_millis(10);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ClientError::Config(format!("endpoint '{s}' has no port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ClientError::Config(format!("invalid port in endpoint '{s}'")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ClientError::Config(format!("endpoint '{s}' has no host")));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoints: Vec<Endpoint>,
    /// `None` connects anonymously and skips authentication.
    pub credentials: Option<Credentials>,
    /// Largest frame the reader can hold; bigger frames are drained and failed.
    pub read_buffer_size: usize,
    /// Byte limit for one batched write.
    pub write_buffer_size: usize,
    pub max_requests_in_batch: usize,
    /// Sleep between batches while the queue is shallower than `min_requests_with_throttle`.
    pub write_throttle_period: Option<Duration>,
    pub min_requests_with_throttle: usize,
    /// `None` disables the background health check.
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Duration,
    /// Applied to requests sent without an explicit timeout. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Longest a caller waits for another caller's reconnect before giving up.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            credentials: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_requests_in_batch: DEFAULT_MAX_REQUESTS_IN_BATCH,
            write_throttle_period: Some(DEFAULT_WRITE_THROTTLE_PERIOD),
            min_requests_with_throttle: DEFAULT_MIN_REQUESTS_WITH_THROTTLE,
            ping_interval: None,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl FromStr for ClientConfig {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.split_once("://").map_or(s, |(_, rest)| rest);

        let (credentials, hosts) = match s.rsplit_once('@') {
            Some((auth, hosts)) => {
                let (user, password) = auth.split_once(':').unwrap_or((auth, ""));
                if user.is_empty() {
                    return Err(ClientError::Config("empty user name".into()));
                }
                let credentials = Credentials {
                    user: user.to_string(),
                    password: password.to_string(),
                };
                (Some(credentials), hosts)
            }
            None => (None, s),
        };

        let endpoints = hosts
            .split(',')
            .filter(|h| !h.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Endpoint>, _>>()?;
        if endpoints.is_empty() {
            return Err(ClientError::NoEndpoint);
        }

        Ok(Self {
            endpoints,
            credentials,
            ..Self::default()
        })
    }
}

/// On-disk form of [`ClientConfig`]; durations are in milliseconds, `0` disables.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    uri: String,
    read_buffer_size: Option<usize>,
    write_buffer_size: Option<usize>,
    max_requests_in_batch: Option<usize>,
    write_throttle_period_ms: Option<u64>,
    min_requests_with_throttle: Option<usize>,
    ping_interval_ms: Option<u64>,
    ping_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let text = fs::read_to_string(path)?;
        let file: ConfigFile =
            toml::from_str(&text).map_err(|e| ClientError::Config(e.to_string()))?;

        let mut config: ClientConfig = file.uri.parse()?;
        if let Some(size) = file.read_buffer_size {
            config.read_buffer_size = size;
        }
        if let Some(size) = file.write_buffer_size {
            config.write_buffer_size = size;
        }
        if let Some(count) = file.max_requests_in_batch {
            config.max_requests_in_batch = count;
        }
        if let Some(ms) = file.write_throttle_period_ms {
            config.write_throttle_period = optional_millis(ms);
        }
        if let Some(count) = file.min_requests_with_throttle {
            config.min_requests_with_throttle = count;
        }
        if let Some(ms) = file.ping_interval_ms {
            config.ping_interval = optional_millis(ms);
        }
        if let Some(ms) = file.ping_timeout_ms {
            config.ping_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.request_timeout_ms {
            config.request_timeout = optional_millis(ms);
        }
        if let Some(ms) = file.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// The only endpoint the client dials.
    pub fn endpoint(&self) -> Result<&Endpoint, ClientError> {
        self.endpoints.first().ok_or(ClientError::NoEndpoint)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        self.endpoint()?;
        if self.read_buffer_size <= LENGTH_PREFIX_SIZE {
            return Err(ClientError::Config(format!(
                "read buffer of {} bytes cannot hold a frame",
                self.read_buffer_size
            )));
        }
        if self.write_buffer_size == 0 {
            return Err(ClientError::Config("write buffer size must be non-zero".into()));
        }
        if self.max_requests_in_batch == 0 {
            return Err(ClientError::Config(
                "max requests in batch must be non-zero".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::Config("connect timeout must be non-zero".into()));
        }
        Ok(())
    }
}
