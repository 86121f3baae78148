//! Requests from a [`crate::Debugger`] handle to its background thread

use std::fmt;

use transport::Command as CdbCommand;

use crate::{
    breakpoints::LineCorrector,
    types::{BreakpointId, BreakpointParameters, VisiblePanels},
};

/// Ways of resuming the debuggee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunAction {
    Continue,
    StepOver,
    StepIn,
    StepOut,
}

/// Snapshots that can be requested explicitly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reload {
    Registers,
    Modules,
    Threads,
    Stack,
}

type Reply<T> = oneshot::Sender<eyre::Result<T>>;

/// Commands sent from the handle to the background thread
///
/// Each variant carries a channel for the result, except where the handle
/// does not wait.
pub(crate) enum Command {
    /// Run a correlated debugger command and return its output
    Execute {
        command: CdbCommand,
        response_tx: Reply<String>,
    },

    /// Write text to the debugger without waiting for anything
    ExecuteRaw { text: String, response_tx: Reply<()> },

    AddBreakpoint {
        parameters: BreakpointParameters,
        response_tx: Reply<BreakpointId>,
    },
    ChangeBreakpoint {
        id: BreakpointId,
        parameters: BreakpointParameters,
        response_tx: Reply<()>,
    },
    RemoveBreakpoint { id: BreakpointId, response_tx: Reply<()> },

    Run { action: RunAction, response_tx: Reply<()> },
    Interrupt { response_tx: Reply<()> },

    SetOperateByInstruction(bool),
    SetVisiblePanels(VisiblePanels),
    SetLineCorrector(Option<Box<dyn LineCorrector>>),

    Reload { what: Reload, response_tx: Reply<()> },
    SelectThread { id: u32, response_tx: Reply<()> },

    /// End the session
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Execute { command, .. } => write!(f, "Execute({:?})", command.describe()),
            Command::ExecuteRaw { text, .. } => write!(f, "ExecuteRaw({text:?})"),
            Command::AddBreakpoint { parameters, .. } => write!(f, "AddBreakpoint({parameters:?})"),
            Command::ChangeBreakpoint { id, parameters, .. } => {
                write!(f, "ChangeBreakpoint({id}, {parameters:?})")
            }
            Command::RemoveBreakpoint { id, .. } => write!(f, "RemoveBreakpoint({id})"),
            Command::Run { action, .. } => write!(f, "Run({action:?})"),
            Command::Interrupt { .. } => f.write_str("Interrupt"),
            Command::SetOperateByInstruction(on) => write!(f, "SetOperateByInstruction({on})"),
            Command::SetVisiblePanels(panels) => write!(f, "SetVisiblePanels({panels:?})"),
            Command::SetLineCorrector(c) => write!(f, "SetLineCorrector({})", c.is_some()),
            Command::Reload { what, .. } => write!(f, "Reload({what:?})"),
            Command::SelectThread { id, .. } => write!(f, "SelectThread({id})"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}
