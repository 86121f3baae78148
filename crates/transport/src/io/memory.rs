//! In-memory transport implementation for testing

use std::io::{self, Cursor, Read, Write};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::CdbTransport;

/// In-memory transport for testing
///
/// Stands in for a debugger process: the engine owns the
/// [`InMemoryTransport`] and the test drives the matching [`InMemoryPeer`],
/// writing scripted debugger output and reading the commands the engine sent.
///
/// # Examples
///
/// ```
/// use std::io::Write;
/// use std::time::Duration;
/// use transport::io::{CdbTransport, InMemoryTransport};
///
/// let (transport, mut peer) = InMemoryTransport::pair();
/// let (_stdout, _stderr, mut stdin) = transport.split()?;
///
/// stdin.write_all(b"g\n")?;
/// assert_eq!(peer.recv_input(Duration::from_secs(1)).as_deref(), Some("g\n"));
/// # Ok::<(), eyre::Error>(())
/// ```
pub struct InMemoryTransport {
    stdout: InMemoryReader,
    stderr: InMemoryReader,
    stdin: InMemoryWriter,
}

/// The debugger's end of an in-memory transport
pub struct InMemoryPeer {
    /// Bytes written here are read by the engine as debugger output
    pub stdout: InMemoryWriter,

    /// Bytes written here are read by the engine as debugger diagnostics
    pub stderr: InMemoryWriter,

    /// Commands written by the engine
    pub stdin: InMemoryReader,
}

/// Reader half of an in-memory stream
///
/// Blocks until data arrives and reports end of file once every writer has
/// been dropped.
pub struct InMemoryReader {
    buffer: Cursor<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// Writer half of an in-memory stream
///
/// Every `write` call is delivered as one chunk.
pub struct InMemoryWriter {
    tx: Sender<Vec<u8>>,
}

fn stream() -> (InMemoryWriter, InMemoryReader) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        InMemoryWriter { tx },
        InMemoryReader {
            buffer: Cursor::new(Vec::new()),
            rx,
        },
    )
}

impl InMemoryTransport {
    /// Create a transport and the peer acting as the debugger
    pub fn pair() -> (Self, InMemoryPeer) {
        let (stdout_writer, stdout_reader) = stream();
        let (stderr_writer, stderr_reader) = stream();
        let (stdin_writer, stdin_reader) = stream();

        let transport = Self {
            stdout: stdout_reader,
            stderr: stderr_reader,
            stdin: stdin_writer,
        };

        let peer = InMemoryPeer {
            stdout: stdout_writer,
            stderr: stderr_writer,
            stdin: stdin_reader,
        };

        (transport, peer)
    }
}

impl CdbTransport for InMemoryTransport {
    type Output = InMemoryReader;
    type Errors = InMemoryReader;
    type Input = InMemoryWriter;

    fn split(self) -> eyre::Result<(Self::Output, Self::Errors, Self::Input)> {
        Ok((self.stdout, self.stderr, self.stdin))
    }
}

impl InMemoryPeer {
    /// Receive the next chunk written by the engine, as text
    pub fn recv_input(&mut self, timeout: Duration) -> Option<String> {
        self.stdin.recv_chunk(timeout)
    }

    /// Write a line of debugger output
    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.stdout.write_all(format!("{line}\r\n").as_bytes())
    }
}

impl InMemoryReader {
    /// Receive the next chunk as a string, ignoring the read buffer
    pub fn recv_chunk(&mut self, timeout: Duration) -> Option<String> {
        match self.rx.recv_timeout(timeout) {
            Ok(data) => Some(String::from_utf8_lossy(&data).into_owned()),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Read for InMemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffer.position() >= self.buffer.get_ref().len() as u64 {
            match self.rx.recv() {
                Ok(data) => self.buffer = Cursor::new(data),
                // every writer dropped
                Err(_) => return Ok(0),
            }
        }
        self.buffer.read(buf)
    }
}

impl Write for InMemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_reaches_engine() -> io::Result<()> {
        let (transport, mut peer) = InMemoryTransport::pair();
        let (mut stdout, mut stderr, _stdin) = transport.split().unwrap();

        peer.send_line("0:000> ")?;
        peer.stderr.write_all(b"oops")?;

        let mut buf = vec![0u8; 9];
        stdout.read_exact(&mut buf)?;
        assert_eq!(&buf, b"0:000> \r\n");

        let mut buf = vec![0u8; 4];
        stderr.read_exact(&mut buf)?;
        assert_eq!(&buf, b"oops");
        Ok(())
    }

    #[test]
    fn partial_reads_keep_remaining_bytes() -> io::Result<()> {
        let (transport, mut peer) = InMemoryTransport::pair();
        let (mut stdout, _stderr, _stdin) = transport.split().unwrap();

        peer.stdout.write_all(b"First")?;
        peer.stdout.write_all(b"Second")?;

        let mut buf = vec![0u8; 3];
        stdout.read_exact(&mut buf)?;
        assert_eq!(&buf, b"Fir");
        let mut buf = vec![0u8; 8];
        stdout.read_exact(&mut buf)?;
        assert_eq!(&buf, b"stSecond");
        Ok(())
    }

    #[test]
    fn eof_when_peer_dropped() -> io::Result<()> {
        let (transport, peer) = InMemoryTransport::pair();
        let (mut stdout, _stderr, _stdin) = transport.split().unwrap();
        drop(peer);

        let mut buf = [0u8; 4];
        assert_eq!(stdout.read(&mut buf)?, 0);
        Ok(())
    }

    #[test]
    fn commands_reach_peer() -> io::Result<()> {
        let (transport, mut peer) = InMemoryTransport::pair();
        let (_stdout, _stderr, mut stdin) = transport.split().unwrap();

        stdin.write_all(b"!qtcreatorcdbext.pid -t 1\n")?;
        assert_eq!(
            peer.recv_input(Duration::from_secs(1)).as_deref(),
            Some("!qtcreatorcdbext.pid -t 1\n")
        );
        assert_eq!(peer.recv_input(Duration::from_millis(10)), None);
        Ok(())
    }
}
