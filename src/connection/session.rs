use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{debug, info, trace, warn};

use crate::{
    config::ClientConfig,
    error::ClientError,
    protocol::{Frame, Greeting, Request, Response, encode_request, scramble},
};

use super::{FailureHook, PendingTable, Reader, Transport, Writer, WriterOptions};

struct SessionShared {
    alive: AtomicBool,
    pending: Arc<PendingTable>,
    transport: Transport,
    writer: Writer,
    reader: OnceLock<Reader>,
}

impl SessionShared {
    fn fail(&self, reason: &str) {
        if self.alive.load(Ordering::Acquire) {
            warn!("session with {} lost: {reason}", self.transport.peer());
        }
        self.teardown();
    }

    fn teardown(&self) {
        self.alive.store(false, Ordering::Release);
        self.pending.close();
        self.writer.shutdown();
        if let Some(reader) = self.reader.get() {
            reader.shutdown();
        }
        self.transport.dispose();
    }
}

/// One handshake-established connection together with its writer and reader threads.
pub struct Session {
    shared: Arc<SessionShared>,
    greeting: Greeting,
    next_request_id: AtomicU64,
}

impl Session {
    /// Dials, reads the greeting, starts the background loops and authenticates.
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let transport = Transport::connect(config)?;
        let greeting = match transport.read_greeting(config.connect_timeout) {
            Ok(greeting) => greeting,
            Err(e) => {
                transport.dispose();
                return Err(e);
            }
        };
        debug!("server greeting: {}", greeting.banner);

        let shared = Arc::new(SessionShared {
            alive: AtomicBool::new(true),
            pending: Arc::new(PendingTable::new()),
            transport,
            writer: Writer::new(),
            reader: OnceLock::new(),
        });
        let session = Self {
            shared,
            greeting,
            next_request_id: AtomicU64::new(1),
        };

        if let Err(e) = session.start(config) {
            session.dispose();
            return Err(e);
        }
        if let Some(credentials) = &config.credentials {
            // The handshake runs under the reconnect gate, so it always gets a deadline.
            let timeout = config.request_timeout.unwrap_or(config.connect_timeout);
            if let Err(e) = session.authenticate(&credentials.user, &credentials.password, timeout)
            {
                session.dispose();
                return Err(e);
            }
            info!("authenticated as '{}'", credentials.user);
        }

        Ok(session)
    }

    fn start(&self, config: &ClientConfig) -> Result<(), ClientError> {
        let shared = &self.shared;
        let hook = failure_hook(shared);

        shared
            .writer
            .start(shared.transport.writer()?, WriterOptions::from(config), Arc::clone(&hook))?;
        let reader = Reader::start(
            shared.transport.reader()?,
            config.read_buffer_size,
            Arc::clone(&shared.pending),
            hook,
        )?;
        if shared.reader.set(reader).is_err() {
            warn!("session reader started twice");
        }
        Ok(())
    }

    fn authenticate(
        &self,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let request = Request::Auth {
            username: user.to_string(),
            scramble: scramble(&self.greeting.salt, password).to_vec(),
        };
        self.send_no_response(&request, Some(timeout))
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.shared.pending.len()
    }

    /// Sends `request` and blocks for its raw response frame.
    ///
    /// `None` waits until the response arrives or the session dies.
    pub fn send_raw(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Frame, ClientError> {
        if !self.is_alive() {
            return Err(ClientError::NotConnected);
        }

        let pending = &self.shared.pending;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let slot = pending.register(request_id)?;

        let frame = match encode_request(request, request_id) {
            Ok(frame) => frame,
            Err(e) => {
                pending.remove(request_id);
                return Err(e.into());
            }
        };
        trace!("request {request_id}: {:?}, {} bytes", request.code(), frame.len());

        if let Err(e) = self.shared.writer.enqueue(frame) {
            pending.remove(request_id);
            return Err(e);
        }
        slot.wait(pending, timeout)
    }

    /// Sends `request` and decodes the response body.
    pub fn send(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        let frame = self.send_raw(request, timeout)?;
        Ok(Response::decode(&frame.body)?)
    }

    /// Sends `request`, waits for the acknowledgement and discards its body.
    pub fn send_no_response(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        self.send_raw(request, timeout).map(|_| ())
    }

    /// Stops every loop, fails pending requests and joins the background threads.
    pub fn dispose(&self) {
        if self.is_alive() {
            debug!("disposing session with {}", self.shared.transport.peer());
        }
        self.shared.teardown();
        self.shared.writer.join();
        if let Some(reader) = self.shared.reader.get() {
            reader.join();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn failure_hook(shared: &Arc<SessionShared>) -> FailureHook {
    let weak = Arc::downgrade(shared);
    Arc::new(move |reason: &str| {
        if let Some(shared) = weak.upgrade() {
            shared.fail(reason);
        }
    })
}
