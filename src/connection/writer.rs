use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, trace};

use crate::{config::ClientConfig, error::ClientError};

use super::{FailureHook, join_unless_current};

/// Batching limits for the writer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    pub max_batch_count: usize,
    pub max_batch_bytes: usize,
    pub throttle: Option<Duration>,
    /// Throttling only kicks in while fewer frames than this are queued.
    pub low_water: usize,
}

impl From<&ClientConfig> for WriterOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_batch_count: config.max_requests_in_batch.max(1),
            max_batch_bytes: config.write_buffer_size.max(1),
            throttle: config.write_throttle_period,
            low_water: config.min_requests_with_throttle,
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    frames: VecDeque<Vec<u8>>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    signal: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Background thread that coalesces queued frames into batched writes.
#[derive(Debug, Default)]
pub struct Writer {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the writer loop over `sink`. Frames queued before this call are kept.
    pub fn start<W>(
        &self,
        sink: W,
        options: WriterOptions,
        on_failure: FailureHook,
    ) -> io::Result<()>
    where
        W: Write + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("iproto-writer".into())
            .spawn(move || {
                run(&shared, sink, options, &on_failure);
                debug!("writer loop exited");
            })?;
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Queues one serialized frame; its bytes are never split across batches.
    pub fn enqueue(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        let mut queue = self.shared.lock();
        if queue.shutdown {
            return Err(ClientError::NotConnected);
        }
        queue.frames.push_back(frame);
        drop(queue);
        self.shared.signal.notify_one();
        Ok(())
    }

    /// Asks the loop to exit. Queued frames are discarded.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.signal.notify_all();
    }

    pub fn join(&self) {
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            join_unless_current(handle);
        }
    }
}

fn run<W: Write>(shared: &Shared, mut sink: W, options: WriterOptions, on_failure: &FailureHook) {
    let mut batch = Vec::with_capacity(options.max_batch_bytes);

    loop {
        let (count, remaining) = {
            let mut queue = shared.lock();
            while queue.frames.is_empty() && !queue.shutdown {
                queue = shared
                    .signal
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
            if queue.shutdown {
                return;
            }

            batch.clear();
            let mut count = 0;
            while count < options.max_batch_count {
                let Some(next) = queue.frames.front() else {
                    break;
                };
                // A frame larger than the byte budget still goes out, alone.
                if count > 0 && batch.len() + next.len() > options.max_batch_bytes {
                    break;
                }
                if let Some(frame) = queue.frames.pop_front() {
                    batch.extend_from_slice(&frame);
                    count += 1;
                }
            }
            (count, queue.frames.len())
        };

        trace!("writing {count} frames in {} bytes", batch.len());
        if let Err(e) = sink.write_all(&batch).and_then(|_| sink.flush()) {
            on_failure(&format!("write failed: {e}"));
            return;
        }

        if let Some(period) = options.throttle {
            if remaining < options.low_water {
                let queue = shared.lock();
                let (queue, _) = shared
                    .signal
                    .wait_timeout_while(queue, period, |q| !q.shutdown)
                    .unwrap_or_else(|e| e.into_inner());
                if queue.shutdown {
                    return;
                }
            }
        }
    }
}
