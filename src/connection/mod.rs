//! The connection engine: handshake, serial-correlated request/reply, signal dispatch,
//! name-ownership tracking, and hosted-object dispatch over a single duplex transport.

mod api;
mod dispatch;
mod handshake;
mod inner;
mod names;
mod subscription;

pub use api::Connection;
pub use names::RequestNameFlags;
pub use subscription::{Signal, SignalFilter, SignalSubscription};
