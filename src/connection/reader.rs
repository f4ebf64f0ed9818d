use std::{
    io::{self, Read},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        mpsc::{self, Receiver, Sender, TryRecvError},
    },
    thread::{self, JoinHandle},
};

use bytes::{Bytes, BytesMut};
use log::{debug, error, trace, warn};

use crate::{
    error::ClientError,
    protocol::{
        Frame, LENGTH_PREFIX_SIZE, ProtocolError, SENTINEL_REQUEST_ID, decode_error,
        decode_length_prefix, peek_request_id,
    },
};

use super::{FailureHook, join_unless_current, pending::PendingTable};

/// Work handed from the byte loop to the processing loop.
#[derive(Debug)]
enum Inbound {
    Frame(Bytes),
    Failed { request_id: u64, error: ProtocolError },
    Closed(String),
}

/// Bytes of the receive buffer held by frames not yet dispatched.
#[derive(Debug, Default)]
struct Window {
    used: usize,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct WindowShared {
    state: Mutex<Window>,
    space: Condvar,
}

impl WindowShared {
    fn lock(&self) -> MutexGuard<'_, Window> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until `size` more bytes fit. Returns `false` on shutdown.
    fn acquire(&self, size: usize, capacity: usize) -> bool {
        let mut window = self.lock();
        while window.used + size > capacity && !window.shutdown {
            window = self.space.wait(window).unwrap_or_else(|e| e.into_inner());
        }
        if window.shutdown {
            return false;
        }
        window.used += size;
        true
    }

    fn release(&self, size: usize) {
        let mut window = self.lock();
        window.used = window.used.saturating_sub(size);
        drop(window);
        self.space.notify_all();
    }
}

/// The two receive-side threads of a session.
#[derive(Debug)]
pub struct Reader {
    window: Arc<WindowShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Reader {
    /// Spawns the byte loop over `source` and the processing loop dispatching into `pending`.
    ///
    /// `on_failure` fires once the stream ends or breaks, after every frame already read
    /// has been dispatched.
    pub fn start<R>(
        source: R,
        capacity: usize,
        pending: Arc<PendingTable>,
        on_failure: FailureHook,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let window = Arc::new(WindowShared::default());
        let (tx, rx) = mpsc::channel();

        let bytes_window = Arc::clone(&window);
        let byte_loop = thread::Builder::new()
            .name("iproto-reader".into())
            .spawn(move || read_frames(source, capacity, &bytes_window, tx))?;

        let dispatch_window = Arc::clone(&window);
        let processing_loop = thread::Builder::new()
            .name("iproto-dispatch".into())
            .spawn(move || dispatch_frames(rx, &dispatch_window, &pending, &on_failure))?;

        Ok(Self {
            window,
            handles: Mutex::new(vec![byte_loop, processing_loop]),
        })
    }

    /// Releases a byte loop parked on buffer space. A loop blocked on the socket is
    /// released by disposing the transport.
    pub fn shutdown(&self) {
        self.window.lock().shutdown = true;
        self.window.space.notify_all();
    }

    pub fn join(&self) {
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            join_unless_current(handle);
        }
    }
}

/// Fills `buf` completely. `Ok(false)` means the stream ended cleanly before the first byte.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match source.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {read} of {} bytes", buf.len()),
                ));
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn read_frames<R: Read>(
    mut source: R,
    capacity: usize,
    window: &WindowShared,
    tx: Sender<Inbound>,
) {
    let reason = match read_loop(&mut source, capacity, window, &tx) {
        Ok(()) => String::from("connection closed"),
        Err(e) => format!("read failed: {e}"),
    };
    debug!("byte loop exiting: {reason}");
    let _ = tx.send(Inbound::Closed(reason));
}

fn read_loop<R: Read>(
    source: &mut R,
    capacity: usize,
    window: &WindowShared,
    tx: &Sender<Inbound>,
) -> io::Result<()> {
    let mut buffer = BytesMut::with_capacity(capacity);

    loop {
        let mut prefix = [0; LENGTH_PREFIX_SIZE];
        if !read_full(source, &mut prefix)? {
            return Ok(());
        }

        let size = match decode_length_prefix(&prefix) {
            Ok(size) => size,
            Err(e) => {
                // Without a length there is no next frame boundary to resume from.
                error!("unreadable length prefix {prefix:02x?}: {e}");
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        };

        if size > capacity {
            let mut head = vec![0; capacity];
            if !read_full(source, &mut head)? {
                return Ok(());
            }
            let request_id = peek_request_id(&head).unwrap_or(SENTINEL_REQUEST_ID);
            let rest = (size - capacity) as u64;
            let drained = io::copy(&mut source.by_ref().take(rest), &mut io::sink())?;
            if drained < rest {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            warn!("discarded {size}-byte frame for request {request_id}; buffer holds {capacity}");
            let failed = Inbound::Failed {
                request_id,
                error: ProtocolError::OversizedFrame { size, capacity },
            };
            if tx.send(failed).is_err() {
                return Ok(());
            }
            continue;
        }

        if !window.acquire(size, capacity) {
            return Ok(());
        }
        buffer.reserve(size);
        buffer.resize(size, 0);
        if !read_full(source, &mut buffer[..])? && size > 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        trace!("read {size}-byte frame");

        if tx.send(Inbound::Frame(buffer.split().freeze())).is_err() {
            return Ok(());
        }
    }
}

fn dispatch_frames(
    rx: Receiver<Inbound>,
    window: &WindowShared,
    pending: &PendingTable,
    on_failure: &FailureHook,
) {
    let mut dispatched = 0;

    loop {
        let item = match rx.try_recv() {
            Ok(item) => item,
            Err(TryRecvError::Empty) => {
                // Space is only handed back once the queue is fully drained.
                window.release(dispatched);
                dispatched = 0;
                match rx.recv() {
                    Ok(item) => item,
                    Err(_) => return,
                }
            }
            Err(TryRecvError::Disconnected) => return,
        };

        match item {
            Inbound::Frame(bytes) => {
                dispatched += bytes.len();
                dispatch(bytes, pending);
            }
            Inbound::Failed { request_id, error } => {
                deliver(pending, request_id, Err(error.into()))
            }
            Inbound::Closed(reason) => {
                window.release(dispatched);
                on_failure(&reason);
                return;
            }
        }
    }
}

fn dispatch(bytes: Bytes, pending: &PendingTable) {
    let frame = match Frame::parse(bytes.clone()) {
        Ok(frame) => frame,
        Err(e) => {
            match peek_request_id(&bytes) {
                Some(request_id) => {
                    warn!("malformed response for request {request_id}: {e}");
                    deliver(pending, request_id, Err(e.into()));
                }
                None => warn!("dropping malformed response: {e}"),
            }
            return;
        }
    };

    let request_id = frame.header.request_id;
    let outcome = if frame.header.is_error() {
        match decode_error(&frame.body) {
            Ok(message) => Err(ClientError::Server {
                code: frame.header.error_code(),
                request_id,
                message,
            }),
            Err(e) => Err(e.into()),
        }
    } else {
        Ok(frame)
    };
    deliver(pending, request_id, outcome);
}

fn deliver(pending: &PendingTable, request_id: u64, outcome: Result<Frame, ClientError>) {
    if !pending.complete(request_id, outcome) {
        warn!("dropping response for request {request_id}: nobody is waiting");
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::mpsc::RecvTimeoutError, time::Duration};

    use rmpv::Value;

    use crate::{
        connection::pending::CompletionSlot,
        protocol::{ERROR_BIT, Key, Response, ResponseHeader, encode_response},
    };

    use super::*;

    fn response(request_id: u64, data: Value) -> Vec<u8> {
        encode_response(
            &ResponseHeader::ok(request_id),
            &Value::Map(vec![(Key::Data.into(), data)]),
        )
        .unwrap()
    }

    fn closed_hook() -> (FailureHook, Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let hook: FailureHook = Arc::new(move |reason: &str| {
            let _ = tx.send(reason.to_string());
        });
        (hook, rx)
    }

    fn wait(table: &PendingTable, slot: CompletionSlot) -> Result<Frame, ClientError> {
        slot.wait(table, Some(Duration::from_secs(5)))
    }

    #[test]
    fn out_of_order_responses_reach_their_callers() {
        let pending = Arc::new(PendingTable::new());
        let slots: Vec<_> = (1..=3).map(|id| pending.register(id).unwrap()).collect();

        let mut stream = Vec::new();
        for id in [3u64, 1, 2] {
            stream.extend(response(id, Value::from(id * 10)));
        }

        let (hook, closed) = closed_hook();
        let reader = Reader::start(Cursor::new(stream), 1024, Arc::clone(&pending), hook).unwrap();

        for (id, slot) in (1u64..=3).zip(slots) {
            let frame = wait(&pending, slot).unwrap();
            assert_eq!(frame.header.request_id, id);
            let data = Response::decode(&frame.body).unwrap().data;
            assert_eq!(data, Some(Value::from(id * 10)));
        }

        assert_eq!(closed.recv_timeout(Duration::from_secs(5)).unwrap(), "connection closed");
        reader.join();
    }

    #[test]
    fn oversized_frame_is_drained_and_failed() {
        let pending = Arc::new(PendingTable::new());
        let big = pending.register(5).unwrap();
        let small = pending.register(6).unwrap();

        let mut stream = response(5, Value::Binary(vec![0; 200]));
        stream.extend(response(6, Value::from("ok")));

        let (hook, _closed) = closed_hook();
        let reader = Reader::start(Cursor::new(stream), 64, Arc::clone(&pending), hook).unwrap();

        let err = wait(&pending, big).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::OversizedFrame { capacity: 64, .. })
        ));
        assert_eq!(wait(&pending, small).unwrap().header.request_id, 6);
        reader.join();
    }

    #[test]
    fn server_error_is_decoded_for_its_caller() {
        let pending = Arc::new(PendingTable::new());
        let slot = pending.register(11).unwrap();

        let header = ResponseHeader {
            code: ERROR_BIT | 0x03,
            request_id: 11,
            schema_id: None,
        };
        let body = Value::Map(vec![(Key::Error.into(), Value::from("Duplicate key exists"))]);
        let stream = encode_response(&header, &body).unwrap();

        let (hook, _closed) = closed_hook();
        let reader = Reader::start(Cursor::new(stream), 1024, Arc::clone(&pending), hook).unwrap();

        match wait(&pending, slot).unwrap_err() {
            ClientError::Server {
                code,
                request_id,
                message,
            } => {
                assert_eq!(code, 0x03);
                assert_eq!(request_id, 11);
                assert_eq!(message, "Duplicate key exists");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        reader.join();
    }

    #[test]
    fn unclaimed_response_is_dropped() {
        let pending = Arc::new(PendingTable::new());
        let slot = pending.register(1).unwrap();

        let mut stream = response(99, Value::Nil);
        stream.extend(response(1, Value::Nil));

        let (hook, _closed) = closed_hook();
        let reader = Reader::start(Cursor::new(stream), 1024, Arc::clone(&pending), hook).unwrap();

        assert_eq!(wait(&pending, slot).unwrap().header.request_id, 1);
        assert!(pending.is_empty());
        reader.join();
    }

    #[test]
    fn small_buffer_applies_backpressure_without_stalling() {
        let pending = Arc::new(PendingTable::new());
        let slots: Vec<_> = (0..50).map(|id| pending.register(id).unwrap()).collect();

        let mut stream = Vec::new();
        for id in 0..50u64 {
            stream.extend(response(id, Value::from("x".repeat(20))));
        }

        let (hook, closed) = closed_hook();
        let reader = Reader::start(Cursor::new(stream), 48, Arc::clone(&pending), hook).unwrap();

        for (id, slot) in (0u64..).zip(slots) {
            assert_eq!(wait(&pending, slot).unwrap().header.request_id, id);
        }
        assert!(!matches!(
            closed.recv_timeout(Duration::from_secs(5)),
            Err(RecvTimeoutError::Timeout)
        ));
        reader.join();
    }

    #[test]
    fn truncated_stream_reports_failure() {
        let pending = Arc::new(PendingTable::new());
        let stream = response(1, Value::Nil);
        let truncated = stream[..stream.len() - 1].to_vec();

        let (hook, closed) = closed_hook();
        let reader = Reader::start(Cursor::new(truncated), 1024, pending, hook).unwrap();

        let reason = closed.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(reason.starts_with("read failed"));
        reader.join();
    }
}
