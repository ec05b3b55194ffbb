//! stopcast: streams debuggee state from a debugger to terminal views over a local socket.
//!
//! The server side ([`server::Server`]) lives next to the debugger and fans out updates on
//! every stop; clients ([`client::Connector`]) register once and then either render pushed
//! updates or issue synchronous queries.

pub mod adapter;
pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod host;
pub mod log;
pub mod proto;
pub mod server;
pub mod transport;
pub mod view;
