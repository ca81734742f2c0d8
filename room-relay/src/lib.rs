//! Multi-room text chat relay over TCP.
//!
//! Clients speak a line-based `COMMAND;PAYLOAD` protocol. Every client starts
//! in the `waiting room` and can move between named rooms, rename itself, and
//! chat with whoever shares its room. Each module focuses on a concrete
//! responsibility:
//!
//! - [`protocol`] encodes and decodes frames and reads/writes them on a stream.
//! - [`session`] is one connected client: its name, its room, its outbound
//!   queue, and the idempotent teardown that unhooks it from everything.
//! - [`room`] holds a membership set and fans frames out to it.
//! - [`state`] owns the room and session registries and enforces capacity.
//! - [`server`] accepts TCP connections and runs the per-connection reader and
//!   writer tasks.
//! - [`config`] and [`cli`] describe how the binary is configured.
//! - [`client`] is a small terminal client for trying the server by hand.
//!
//! Registries and memberships are guarded by `std::sync::Mutex` and never
//! locked across an `.await`; sockets are only touched by each connection's own
//! tasks.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod cli;
pub mod client;
pub mod config;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod state;

/// Locks `mutex`, carrying on with the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
