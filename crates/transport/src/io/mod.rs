//! IO abstraction over the debugger's standard streams
//!
//! The engine talks to the debugger through three byte streams: commands go
//! to its standard input, replies and notifications come back on standard
//! output and diagnostics on standard error. [`CdbTransport`] abstracts over
//! where those streams come from so the engine can be driven by a real child
//! process or, in tests, by an [`InMemoryTransport`].
//!
//! # Examples
//!
//! ```
//! use std::io::Write;
//! use transport::io::{CdbTransport, InMemoryTransport, Incoming, Source, spawn_pump};
//!
//! let (transport, mut peer) = InMemoryTransport::pair();
//! let (stdout, _stderr, _stdin) = transport.split()?;
//! let (tx, rx) = crossbeam_channel::unbounded();
//! spawn_pump(Source::Stdout, stdout, tx);
//!
//! peer.stdout.write_all(b"0:000> ")?;
//! assert!(matches!(rx.recv()?, Incoming::Data(Source::Stdout, _)));
//! # Ok::<(), eyre::Error>(())
//! ```

use std::io::{ErrorKind, Read, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

mod memory;

pub use memory::{InMemoryPeer, InMemoryReader, InMemoryTransport, InMemoryWriter};

/// Size of the buffer used by [`spawn_pump`].
const PUMP_BUFFER_SIZE: usize = 8192;

/// Trait for the three standard streams of a debugger process
///
/// Implementations split into independent halves so that the output streams
/// can be moved into pump threads while the input stays with the engine.
pub trait CdbTransport: Send + 'static {
    /// Debugger standard output
    type Output: Read + Send + 'static;

    /// Debugger standard error
    type Errors: Read + Send + 'static;

    /// Debugger standard input
    type Input: Write + Send + 'static;

    /// Split the transport into its streams
    ///
    /// # Errors
    ///
    /// Returns an error if one of the streams is not available, for example
    /// when a child process was spawned without piped stdio.
    fn split(self) -> eyre::Result<(Self::Output, Self::Errors, Self::Input)>;
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Stdout,
    Stderr,
}

/// Everything the engine receives from the debugger process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A chunk of raw bytes.
    Data(Source, Vec<u8>),
    /// The stream reached end of file or failed.
    Closed(Source),
    /// The process terminated, with its exit code when known.
    Exited(Option<i32>),
}

/// Read `reader` on a background thread, forwarding chunks to `tx`.
///
/// The thread ends after sending [`Incoming::Closed`] on end of file or on a
/// read error, or when the receiving side has gone away.
pub fn spawn_pump(
    source: Source,
    mut reader: impl Read + Send + 'static,
    tx: Sender<Incoming>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Incoming::Data(source, buf[..n].to_vec())).is_err() {
                        tracing::debug!(?source, "receiver dropped, stopping pump");
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(?source, error = %e, "error reading debugger output");
                    break;
                }
            }
        }
        tracing::debug!(?source, "debugger stream closed");
        let _ = tx.send(Incoming::Closed(source));
    })
}
