use std::{collections::HashMap, path::PathBuf};

use config::SourcePathMapping;
use server::StartMode;

use crate::types::{
    BreakpointId, BreakpointResponse, LogChannel, ModuleRecord, RegisterRecord, StackSnapshot,
    TaskSeverity, ThreadSnapshot,
};

/// Where the session is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    SetupRequested,
    RunRequested,
    Running,
    StopRequested,
    Stopped,
    ShutdownRequested,
    Finished,
}

impl Lifecycle {
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Lifecycle::ShutdownRequested | Lifecycle::Finished)
    }
}

/// Lifecycle plus whether the debugger currently accepts commands.
///
/// Accessibility toggles freely while the process lives and is independent
/// of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionState {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) accessible: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::SetupRequested,
            accessible: false,
        }
    }
}

/// Published to consumers of a [`crate::Debugger`]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Log {
        channel: LogChannel,
        text: String,
    },
    SetupOk,
    SetupFailed(String),
    StateChanged(Lifecycle),
    /// The debuggee stopped; `message` describes why
    Stopped {
        message: String,
    },
    Stack(StackSnapshot),
    Threads(ThreadSnapshot),
    Modules(Vec<ModuleRecord>),
    Registers(Vec<RegisterRecord>),
    Breakpoint {
        id: BreakpointId,
        /// `None` while pending
        response: Option<BreakpointResponse>,
    },
    BreakpointRemoved(BreakpointId),
    /// An exception worth showing to the user in a dialog
    ExceptionBox(String),
    /// An entry for an issues list
    Task {
        severity: TaskSeverity,
        message: String,
    },
    InferiorExited,
    Finished,
}

/// How to start a session
#[derive(Debug, Clone)]
pub struct StartParameters {
    pub mode: StartMode,
    pub environment: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
    /// Added after the mappings from the settings
    pub source_path_mappings: Vec<SourcePathMapping>,
    /// Run verbatim once the debugger is ready
    pub post_connect_commands: Vec<String>,
}

impl StartParameters {
    pub fn new(mode: StartMode) -> Self {
        Self {
            mode,
            environment: HashMap::new(),
            working_directory: None,
            source_path_mappings: Vec::new(),
            post_connect_commands: Vec::new(),
        }
    }

    pub fn launch(executable: impl Into<PathBuf>, arguments: Vec<String>) -> Self {
        let executable = executable.into();
        let working_directory = executable.parent().map(|p| p.to_path_buf());
        Self {
            working_directory,
            ..Self::new(StartMode::Launch {
                executable,
                arguments,
            })
        }
    }

    pub fn attach(pid: u32) -> Self {
        Self::new(StartMode::AttachToProcess { pid })
    }

    pub fn dump(path: impl Into<PathBuf>) -> Self {
        Self::new(StartMode::Dump { path: path.into() })
    }

    pub fn remote(channel: impl Into<String>) -> Self {
        Self::new(StartMode::Remote {
            channel: channel.into(),
        })
    }
}
