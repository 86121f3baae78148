//! CDB transport
//!
//! This crate contains the wire level pieces used to talk to a `cdb.exe`
//! process: the stream parser classifying its output, command framing, the
//! parser for structured replies and the IO abstraction over its streams.
pub mod command;
pub mod error;
pub mod gdbmi;
pub mod io;
pub mod stream;

pub use command::{Command, CommandKind};
pub use error::{Error, ParseError, ProtocolFault};
pub use gdbmi::GdbMi;
pub use io::{CdbTransport, InMemoryPeer, InMemoryTransport, Incoming, Source};
pub use stream::{ExtensionMessage, MessageKind, StreamEvent, StreamParser};

/// Token used by the extension for messages not tied to a command.
pub const UNSOLICITED_TOKEN: i64 = -1;
