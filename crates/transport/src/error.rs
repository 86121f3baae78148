//! Error types for the transport layer.

use std::io;

/// Errors raised while talking to the debugger subprocess.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A structured reply could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Script arguments could not be serialized.
    #[error("serializing script arguments failed: {0}")]
    ScriptArguments(#[source] serde_json::Error),
}

/// Failure to parse a structured (GDB/MI style) reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The input ended in the middle of a value.
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEnd { offset: usize },

    /// An unexpected character was found.
    #[error("unexpected character '{found}' at offset {offset}")]
    UnexpectedCharacter { found: char, offset: usize },

    /// Input remained after the top level value.
    #[error("trailing input at offset {offset}")]
    TrailingInput { offset: usize },
}

/// Violations of the token bracket protocol.
///
/// These are reported by the stream parser rather than returned as errors so
/// that the remaining lines of a chunk are still classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolFault {
    /// A start bracket arrived while output for another token was captured.
    #[error("command start for token {token} while capturing output of token {active}")]
    NestedCapture { active: i64, token: i64 },

    /// An end bracket did not match the active capture.
    #[error("command end for token {token} does not match active capture {active:?}")]
    UnmatchedEnd { active: Option<i64>, token: i64 },

    /// An extension frame was truncated.
    #[error("malformed extension message: {line}")]
    MalformedFrame { line: String },
}

impl ProtocolFault {
    /// Token of the capture thrown away because of this fault.
    pub fn discarded_capture(&self) -> Option<i64> {
        match self {
            ProtocolFault::NestedCapture { active, .. } => Some(*active),
            ProtocolFault::UnmatchedEnd { active, .. } => *active,
            ProtocolFault::MalformedFrame { .. } => None,
        }
    }
}
