//! High level debugger engine for `cdb.exe`
//!
//! A [`Debugger`] owns one debugger process. Requests go through the handle,
//! everything the debugger reports comes back as [`Event`]s.
mod breakpoints;
mod commands;
mod debugger;
mod dispatcher;
mod exceptions;
mod internals;
mod source_map;
mod stack;
pub(crate) mod state;
mod stop;
mod types;

pub use breakpoints::{BreakpointState, BreakpointTracker, LineCorrector};
pub use debugger::Debugger;
pub use dispatcher::{DispatchError, Response, ResponseData};
pub use exceptions::WinException;
pub use source_map::{NormalizedFile, SourceMapper};
pub use stack::Wow64State;
pub use state::{Event, Lifecycle, StartParameters};
pub use stop::StopActions;
pub use types::*;

pub use config::{Settings, SourcePathMapping};
pub use server::StartMode;
