//! Connection management and request pipelining.
//!
//! This module owns everything between a caller's request and the socket: one TCP
//! [`Transport`], a [`Writer`] thread that batches outbound frames, a [`Reader`] pair of
//! threads that frame and dispatch inbound responses, the [`PendingTable`] correlating the
//! two, and the [`Supervisor`] that keeps exactly one live [`Session`] around.
//!
//! # Overview
//!
//! ```text
//!  caller ──send──▶ Supervisor ──ensure_connected──▶ Session
//!                                                      │ register id
//!                                                      ▼
//!                  PendingTable ◀──dispatch── Reader ◀── socket ◀── Writer ◀── queue
//! ```
//!
//! A caller thread blocks on its completion slot while its frame travels through the
//! writer queue, the server, and back through the reader. Responses may arrive in any
//! order; each is routed by request id and never to anyone else.
//!
//! # Threads
//!
//! Per live session: one writer thread, one byte-reading thread and one dispatching
//! thread. Per supervisor: one ping timer thread once a ping interval is configured.
//! Disposal stops all of them cooperatively and fails every pending request with
//! [`ClientError::NotConnected`](crate::ClientError::NotConnected).
mod pending;
mod reader;
mod session;
mod supervisor;
mod transport;
mod writer;

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::error;

pub use pending::{CompletionSlot, Outcome, PendingTable};
pub use reader::Reader;
pub use session::Session;
pub use supervisor::Supervisor;
pub use transport::{Transport, TransportReader, TransportWriter};
pub use writer::{Writer, WriterOptions};

/// Invoked by a background loop when the session it serves can no longer be used.
pub type FailureHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Joins a background thread, unless the caller is that thread.
fn join_unless_current(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    let name = handle.thread().name().unwrap_or("unnamed").to_string();
    if handle.join().is_err() {
        error!("background thread '{name}' panicked");
    }
}
