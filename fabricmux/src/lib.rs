//! fabricmux -- stream-multiplexing transport.
//!
//! Turns one reliable, ordered, bidirectional byte channel (a "fabric",
//! typically a TCP connection) into many independent logical byte streams,
//! each with its own flow-controlled send window and half-close semantics.
//!
//! Dialing the underlying transport, authentication, and routing across
//! more than one fabric hop are all out of scope here — bring your own
//! `Read + Write` and this crate multiplexes streams over it.

pub mod addr;
pub mod config;
pub mod error;
pub mod fabric;
pub mod frame;
pub mod queue;
pub mod stream;

pub use addr::StreamAddr;
pub use config::FabricConfig;
pub use error::{FabricError, Result};
pub use fabric::{Acceptor, Fabric};
pub use frame::{Frame, FrameType};
pub use stream::{Stream, StreamState};
