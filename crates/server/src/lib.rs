//! Launching and controlling the `cdb.exe` process

use std::{io, path::PathBuf};

pub mod arguments;
mod cdb;
pub mod interrupt;

pub use arguments::StartMode;
pub use cdb::{CdbServer, CdbStreams, cdb_executable, extension_directory, extension_library};

/// Fatal errors starting the debugger. These are never retried.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("cdb not found (searched {searched})")]
    CdbNotFound { searched: String },

    #[error("unable to locate the debugger extension {}", path.display())]
    ExtensionMissing { path: PathBuf },

    #[error("cannot determine the debugger extension directory")]
    ExtensionDirectoryUnknown,

    #[error("spawning {}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("debugger process started without piped standard streams")]
    MissingStreams,
}

/// Control over the debugger process, beyond its standard streams
pub trait Server: Send {
    /// Break into the running debuggee `inferior_pid`
    fn interrupt(&mut self, inferior_pid: u32) -> eyre::Result<()>;

    /// Terminate the debugger, waiting for it to exit
    fn kill(&mut self) -> eyre::Result<()>;
}
