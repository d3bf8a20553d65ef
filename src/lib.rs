//! Client library for the D-Bus local message-bus IPC protocol.
//!
//! This crate implements the connection engine that talks to a bus daemon over a Unix
//! domain socket: the SASL handshake, the binary message codec, serial-correlated
//! method call/reply, signal dispatch against a dynamic name-ownership table, and
//! reference-counted match-rule bookkeeping with the bus. It does not generate typed
//! proxies or interface implementations from traits -- callers build and read
//! [`Value`] argument lists directly.
//!
//! ### Example
//!
//! ```no_run
//! use ipcbus::Connection;
//!
//! # fn main() -> ipcbus::Result<()> {
//! pollster::block_on(async {
//!     let conn = Connection::session()?;
//!     let reply = conn
//!         .call_method(
//!             Some("org.freedesktop.DBus"),
//!             "/org/freedesktop/DBus",
//!             Some("org.freedesktop.DBus"),
//!             "GetId",
//!             vec![],
//!         )
//!         .await?;
//!     println!("bus id: {:?}", reply);
//!     Ok(())
//! })
//! # }
//! ```

mod address;
mod connection;
mod error;
pub mod fdo;
mod guid;
pub mod message;
mod object_tree;
pub mod value;

pub use connection::{Connection, RequestNameFlags, Signal, SignalFilter, SignalSubscription};
pub use error::{Error, Result};
pub use guid::Guid;
pub use message::Message;
pub use object_tree::{Interface, ObjectTree};
pub use value::Value;
