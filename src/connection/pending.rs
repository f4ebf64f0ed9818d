use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError},
    },
    time::Duration,
};

use log::{debug, error};

use crate::{error::ClientError, protocol::Frame};

/// What the dispatch path hands to a waiting caller.
pub type Outcome = Result<Frame, ClientError>;

#[derive(Debug, Default)]
struct TableState {
    slots: HashMap<u64, SyncSender<Outcome>>,
    closed: bool,
}

/// Request id to completion slot map shared by the send path and the reader.
#[derive(Debug, Default)]
pub struct PendingTable {
    state: Mutex<TableState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        // The guarded map stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers interest in `request_id`. Fails once the table has been closed.
    pub fn register(&self, request_id: u64) -> Result<CompletionSlot, ClientError> {
        let mut state = self.lock();
        if state.closed {
            return Err(ClientError::NotConnected);
        }
        if state.slots.contains_key(&request_id) {
            error!("request id {request_id} registered twice");
            return Err(ClientError::DuplicateRequestId(request_id));
        }

        let (sender, receiver) = mpsc::sync_channel(1);
        state.slots.insert(request_id, sender);
        Ok(CompletionSlot {
            request_id,
            receiver,
        })
    }

    /// Delivers an outcome to the caller waiting on `request_id`.
    ///
    /// Returns `false` when nobody is waiting; the outcome is dropped.
    pub fn complete(&self, request_id: u64, outcome: Outcome) -> bool {
        let sender = self.lock().slots.remove(&request_id);
        match sender {
            Some(sender) => {
                if sender.send(outcome).is_err() {
                    debug!("caller for request {request_id} is gone");
                }
                true
            }
            None => false,
        }
    }

    /// Withdraws interest, e.g. after a timeout.
    pub fn remove(&self, request_id: u64) -> bool {
        self.lock().slots.remove(&request_id).is_some()
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.lock().slots.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuses further registrations and wakes every waiter with `NotConnected`.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.slots.drain().collect()
        };
        if !drained.is_empty() {
            debug!("failing {} pending requests", drained.len());
        }
        // Dropping each sender disconnects its receiver.
        drop(drained);
    }
}

/// The receiving end a caller blocks on.
#[derive(Debug)]
pub struct CompletionSlot {
    request_id: u64,
    receiver: Receiver<Outcome>,
}

impl CompletionSlot {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Blocks until the outcome arrives, the table is closed, or `timeout` elapses.
    ///
    /// On timeout the slot deregisters itself so a late response is dropped.
    pub fn wait(self, table: &PendingTable, timeout: Option<Duration>) -> Outcome {
        let received = match timeout {
            Some(timeout) => match self.receiver.recv_timeout(timeout) {
                Ok(outcome) => return outcome,
                Err(RecvTimeoutError::Disconnected) => Err(ClientError::NotConnected),
                Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout {
                    request_id: self.request_id,
                    timeout,
                }),
            },
            None => self
                .receiver
                .recv()
                .unwrap_or(Err(ClientError::NotConnected)),
        };

        if let Err(ClientError::Timeout { .. }) = received {
            table.remove(self.request_id);
            // The response may have landed between the timeout and the removal.
            match self.receiver.try_recv() {
                Ok(outcome) => return outcome,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }
        received
    }
}
