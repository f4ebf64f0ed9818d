use std::{
    sync::{
        Arc, Condvar, Mutex, MutexGuard, RwLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    config::ClientConfig,
    error::ClientError,
    protocol::{Frame, Request, Response},
};

use super::{Session, join_unless_current};

#[derive(Debug, Default)]
struct GateState {
    busy: bool,
    attempts: u64,
    last_failure: Option<String>,
}

/// Releases the reconnect gate and records how the attempt ended.
struct GateTicket<'a> {
    supervisor: &'a Supervisor,
    failure: Option<String>,
}

impl Drop for GateTicket<'_> {
    fn drop(&mut self) {
        let mut gate = self.supervisor.lock_gate();
        gate.busy = false;
        gate.attempts += 1;
        gate.last_failure = self.failure.take();
        drop(gate);
        self.supervisor.gate_released.notify_all();
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    signal: Condvar,
}

impl StopSignal {
    /// Sleeps for `period`; returns `true` if stopped meanwhile.
    fn wait(&self, period: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        let (stopped, _) = self
            .signal
            .wait_timeout_while(stopped, period, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.signal.notify_all();
    }
}

/// Keeps exactly one live [`Session`] and reconnects transparently on demand.
///
/// Connection is lazy: the first request dials. Concurrent callers that find the
/// session down queue on a reconnect gate so only one of them performs the handshake.
pub struct Supervisor {
    config: ClientConfig,
    session: RwLock<Option<Arc<Session>>>,
    connected: AtomicBool,
    gate: Mutex<GateState>,
    gate_released: Condvar,
    sessions_opened: AtomicU64,
    failed_pings: AtomicU64,
    next_ping: Mutex<Instant>,
    timer: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<StopSignal>,
}

impl Supervisor {
    pub fn new(config: ClientConfig) -> Result<Arc<Self>, ClientError> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            session: RwLock::new(None),
            connected: AtomicBool::new(false),
            gate: Mutex::new(GateState::default()),
            gate_released: Condvar::new(),
            sessions_opened: AtomicU64::new(0),
            failed_pings: AtomicU64::new(0),
            next_ping: Mutex::new(Instant::now()),
            timer: Mutex::new(None),
            stop: Arc::new(StopSignal::default()),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn lock_gate(&self) -> MutexGuard<'_, GateState> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_session(&self) -> Option<Arc<Session>> {
        let current = self.session.read().unwrap_or_else(|e| e.into_inner());
        current.as_ref().filter(|s| s.is_alive()).cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.live_session().is_some()
    }

    /// Number of completed handshakes over the supervisor's lifetime.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Acquire)
    }

    pub fn failed_pings(&self) -> u64 {
        self.failed_pings.load(Ordering::Acquire)
    }

    /// Returns the live session, connecting first if there is none.
    pub fn ensure_connected(self: &Arc<Self>) -> Result<Arc<Session>, ClientError> {
        if self.connected.load(Ordering::Acquire) {
            if let Some(session) = self.live_session() {
                return Ok(session);
            }
        }

        let gate = self.lock_gate();
        let seen = gate.attempts;
        let (mut gate, wait) = self
            .gate_released
            .wait_timeout_while(gate, self.config.connect_timeout, |g| g.busy)
            .unwrap_or_else(|e| e.into_inner());
        if wait.timed_out() && gate.busy {
            warn!("gave up waiting for another caller's reconnect");
            return Err(ClientError::NotConnected);
        }
        if gate.attempts != seen {
            if let Some(failure) = &gate.last_failure {
                return Err(ClientError::ConnectFailed(failure.clone()));
            }
        }
        if let Some(session) = self.live_session() {
            return Ok(session);
        }
        gate.busy = true;
        drop(gate);

        let mut ticket = GateTicket {
            supervisor: self.as_ref(),
            failure: None,
        };
        let result = self.reconnect();
        if let Err(e) = &result {
            warn!("failed to connect to {}: {e}", self.endpoint_name());
            ticket.failure = Some(e.to_string());
        }
        drop(ticket);
        result
    }

    fn endpoint_name(&self) -> String {
        self.config
            .endpoint()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    fn reconnect(self: &Arc<Self>) -> Result<Arc<Session>, ClientError> {
        self.connected.store(false, Ordering::Release);
        let stale = self
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(stale) = stale {
            debug!("tearing down stale session");
            stale.dispose();
        }

        info!("connecting to {}", self.endpoint_name());
        let session = Arc::new(Session::connect(&self.config)?);
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&session));
        self.connected.store(true, Ordering::Release);
        let opened = self.sessions_opened.fetch_add(1, Ordering::AcqRel) + 1;
        info!("session {opened} established");

        self.schedule_next_ping();
        if let Some(interval) = self.config.ping_interval {
            self.arm_timer(interval);
        }
        Ok(session)
    }

    fn schedule_next_ping(&self) {
        if let Some(interval) = self.config.ping_interval {
            *self.next_ping.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now() + interval;
        }
    }

    fn arm_timer(self: &Arc<Self>, interval: Duration) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let stop = Arc::clone(&self.stop);
        match thread::Builder::new()
            .name("iproto-ping".into())
            .spawn(move || ping_loop(weak, stop, interval))
        {
            Ok(handle) => *timer = Some(handle),
            Err(e) => warn!("failed to start ping timer: {e}"),
        }
    }

    fn on_ping_timer(&self) {
        if Instant::now() < *self.next_ping.lock().unwrap_or_else(|e| e.into_inner()) {
            return;
        }
        // The timer only checks health; reconnecting is left to the next caller.
        let Some(session) = self.live_session() else {
            return;
        };

        match session.send_raw(&Request::Ping, Some(self.config.ping_timeout)) {
            Err(ClientError::Timeout { .. }) => {
                let failed = self.failed_pings.fetch_add(1, Ordering::AcqRel) + 1;
                warn!("ping timed out ({failed} so far); dropping session");
                self.drop_session(&session);
            }
            Err(e) => {
                debug!("ping failed: {e}");
                self.schedule_next_ping();
            }
            Ok(_) => self.schedule_next_ping(),
        }
    }

    fn drop_session(&self, session: &Arc<Session>) {
        {
            let mut current = self.session.write().unwrap_or_else(|e| e.into_inner());
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
                current.take();
                self.connected.store(false, Ordering::Release);
            }
        }
        session.dispose();
    }

    /// Sends through the live session, reconnecting first if needed.
    ///
    /// `timeout` falls back to the configured request timeout.
    pub fn send_raw(
        self: &Arc<Self>,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Frame, ClientError> {
        let session = self.ensure_connected()?;
        let frame = session.send_raw(request, timeout.or(self.config.request_timeout))?;
        self.schedule_next_ping();
        Ok(frame)
    }

    pub fn send(
        self: &Arc<Self>,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        let frame = self.send_raw(request, timeout)?;
        Ok(Response::decode(&frame.body)?)
    }

    pub fn send_no_response(
        self: &Arc<Self>,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<(), ClientError> {
        self.send_raw(request, timeout).map(|_| ())
    }

    pub fn ping(self: &Arc<Self>) -> Result<(), ClientError> {
        self.send_no_response(&Request::Ping, None)
    }

    /// Drops the current session; the next request reconnects.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let session = self
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            session.dispose();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop.stop();
        let timer = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(timer) = timer {
            join_unless_current(timer);
        }
        self.disconnect();
    }
}

fn ping_loop(supervisor: Weak<Supervisor>, stop: Arc<StopSignal>, interval: Duration) {
    while !stop.wait(interval) {
        let Some(supervisor) = supervisor.upgrade() else {
            return;
        };
        supervisor.on_ping_timer();
    }
    debug!("ping timer stopped");
}
