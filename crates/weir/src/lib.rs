//! Sender side of a UDP publish/subscribe transport.
//!
//! A producer lays frames out in a memory-mapped, term-partitioned log; a
//! [`driver::publication::NetworkPublication`] drains the committed frames
//! onto a [`driver::endpoint::SendChannelEndpoint`], throttled by a
//! [`driver::flow_control::FlowControl`] strategy fed from receiver status
//! messages, retransmitting NAKed ranges and heartbeating when idle.

pub mod context;
pub mod driver;
pub mod error;
pub mod logbuffer;
pub mod protocol;

pub use context::DriverContext;
pub use error::DriverError;
