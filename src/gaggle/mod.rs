//! Gaggle: a load test distributed over one Master and many Workers.
//!
//! The Master runs no users. It splits the target user count over the connected
//! Workers, tells each Worker how many users to run, and merges the stats the Workers
//! report into one global view. Workers send a heartbeat every second; a Worker that
//! misses too many heartbeats is marked missing and its users are reassigned to the
//! others.
//!
//! Messages are [`Envelope`](./common/struct.Envelope.html)s, carried by a
//! [`ManagerTransport`](./transport/trait.ManagerTransport.html) on the Master and a
//! [`WorkerTransport`](./transport/trait.WorkerTransport.html) on each Worker.

pub mod common;
pub(crate) mod manager;
pub mod transport;
pub mod websocket;
pub(crate) mod worker;
