use std::{
    io::{self, Read, Write},
    net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    config::ClientConfig,
    error::ClientError,
    protocol::{GREETING_SIZE, Greeting},
};

/// A TCP byte stream with idempotent, read-safe disposal.
///
/// The read and write halves share one disposal flag. Once [`Transport::dispose`] has
/// run, reads report end of stream instead of the error the shutdown provokes.
#[derive(Debug)]
pub struct Transport {
    stream: TcpStream,
    peer: SocketAddr,
    disposed: Arc<AtomicBool>,
}

impl Transport {
    /// Dials the first configured endpoint, trying a numeric address before DNS.
    ///
    /// Every attempt is bounded by `connect_timeout`.
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let endpoint = config.endpoint()?;
        let timeout = config.connect_timeout;

        let stream = match endpoint.host.parse::<IpAddr>() {
            Ok(ip) => TcpStream::connect_timeout(&SocketAddr::new(ip, endpoint.port), timeout)?,
            Err(_) => {
                let mut last_error = None;
                let mut connected = None;
                for addr in (endpoint.host.as_str(), endpoint.port).to_socket_addrs()? {
                    debug!("trying {addr} for {endpoint}");
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(e) => {
                            warn!("failed to connect to {addr}: {e}");
                            last_error = Some(e);
                        }
                    }
                }
                match connected {
                    Some(stream) => stream,
                    None => {
                        return Err(last_error
                            .unwrap_or_else(|| {
                                io::Error::new(
                                    io::ErrorKind::NotFound,
                                    format!("'{}' resolved to no addresses", endpoint.host),
                                )
                            })
                            .into());
                    }
                }
            }
        };

        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        info!("connected to {endpoint} at {peer}");
        Ok(Self::from_stream(stream, peer))
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Reads the fixed-size greeting the server sends before anything else.
    ///
    /// The socket read timeout is `timeout` only for the duration of this call.
    pub fn read_greeting(&self, timeout: Duration) -> Result<Greeting, ClientError> {
        self.stream.set_read_timeout(Some(timeout))?;
        let read = self.read_greeting_bytes();
        self.stream.set_read_timeout(None)?;

        let (buf, read) = read.map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no greeting from {} within {timeout:?}", self.peer),
            ),
            _ => e,
        })?;
        Greeting::parse(&buf[..read])
    }

    fn read_greeting_bytes(&self) -> io::Result<([u8; GREETING_SIZE], usize)> {
        let mut buf = [0; GREETING_SIZE];
        let mut read = 0;
        let mut reader = self.reader()?;
        while read < GREETING_SIZE {
            match reader.read(&mut buf[read..])? {
                0 => break,
                n => read += n,
            }
        }
        Ok((buf, read))
    }

    pub fn reader(&self) -> io::Result<TransportReader> {
        Ok(TransportReader {
            stream: self.stream.try_clone()?,
            disposed: Arc::clone(&self.disposed),
        })
    }

    pub fn writer(&self) -> io::Result<TransportWriter> {
        Ok(TransportWriter {
            stream: self.stream.try_clone()?,
            disposed: Arc::clone(&self.disposed),
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Closes the socket in both directions. Safe to call repeatedly and while a read blocks.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("disposing transport to {}", self.peer);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown of {} reported: {e}", self.peer);
        }
    }
}

/// Read half. Errors after disposal are reported as end of stream.
#[derive(Debug)]
pub struct TransportReader {
    stream: TcpStream,
    disposed: Arc<AtomicBool>,
}

impl Read for TransportReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(0);
        }
        match self.stream.read(buf) {
            Err(_) if self.disposed.load(Ordering::Acquire) => Ok(0),
            other => other,
        }
    }
}

#[derive(Debug)]
pub struct TransportWriter {
    stream: TcpStream,
    disposed: Arc<AtomicBool>,
}

impl Write for TransportWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
