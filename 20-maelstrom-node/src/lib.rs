//! Node runtime for distributed-systems workloads driven over stdin/stdout.
//!
//! A node reads one JSON message per line from stdin, answers on stdout, and
//! logs to stderr. The external test harness spawns several nodes, routes
//! their messages, injects faults, and checks the end state. Each module
//! focuses on a concrete responsibility:
//!
//! - [`message`] is the wire codec: envelope, reserved body fields, and the
//!   `type`-tagged payload schema.
//! - [`transport`] frames lines in and out; sends are atomic per line.
//! - [`server`] owns the read loop and runs handlers concurrently.
//! - [`client`] correlates requests with responses, with timeouts and
//!   retry/backoff from [`retry`].
//! - [`init`] holds the node's identity, known once `init` arrives.
//! - [`broadcast`] gossips values to neighbors until every node has them.
//! - [`echo`] and [`unique_ids`] are the smaller workloads.
//! - [`node`] wires it all together; [`cli`] maps flags onto it.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod echo;
pub mod error;
pub mod init;
pub mod message;
pub mod node;
pub mod retry;
pub mod server;
pub mod shutdown;
pub mod transport;
pub mod unique_ids;

pub use error::Error;
