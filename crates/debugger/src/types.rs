use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a breakpoint.
///
/// `minor` is 0 for the breakpoint the user asked for and counts up for the
/// extra locations an ambiguous breakpoint resolved to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BreakpointId {
    pub major: u32,
    pub minor: u32,
}

impl BreakpointId {
    /// Debugger side ids start here.
    pub const WIRE_BASE: u32 = 100_000;

    /// Number of wire ids reserved per major id.
    pub const MINOR_RANGE: u32 = 100;

    pub fn new(major: u32) -> Self {
        Self { major, minor: 0 }
    }

    pub fn sub(self, minor: u32) -> Self {
        Self {
            major: self.major,
            minor,
        }
    }

    pub fn is_sub(&self) -> bool {
        self.minor != 0
    }

    pub fn parent(self) -> Self {
        Self::new(self.major)
    }

    /// The numeric id used in debugger commands, if representable.
    pub fn to_wire(self) -> Option<u32> {
        if self.minor >= Self::MINOR_RANGE {
            return None;
        }
        self.major
            .checked_mul(Self::MINOR_RANGE)?
            .checked_add(Self::WIRE_BASE)?
            .checked_add(self.minor)
    }

    pub fn from_wire(wire: i64) -> Option<Self> {
        let offset = u32::try_from(wire).ok()?.checked_sub(Self::WIRE_BASE)?;
        Some(Self {
            major: offset / Self::MINOR_RANGE,
            minor: offset % Self::MINOR_RANGE,
        })
    }
}

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{}", self.major)
        } else {
            write!(f, "{}.{}", self.major, self.minor)
        }
    }
}

/// Where a breakpoint is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointLocation {
    FileLine { file: String, line: u32 },
    Function {
        module: Option<String>,
        function: String,
    },
    Address(u64),
    /// Data breakpoint on `size` bytes at `address`
    Watch { address: u64, size: u32 },
    /// C++ `throw`
    Throw,
    /// C++ `catch`
    Catch,
    Main,
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointParameters {
    pub location: BreakpointLocation,
    pub enabled: bool,
    pub condition: Option<String>,
    pub ignore_count: u32,
    /// Only stop in this debugger thread
    pub thread: Option<u32>,
    pub one_shot: bool,
    /// Log and continue instead of stopping
    pub tracepoint: bool,
    /// Text printed when the breakpoint is hit
    pub message: Option<String>,
}

impl BreakpointParameters {
    pub fn new(location: BreakpointLocation) -> Self {
        Self {
            location,
            enabled: true,
            condition: None,
            ignore_count: 0,
            thread: None,
            one_shot: false,
            tracepoint: false,
            message: None,
        }
    }

    pub fn file_line(file: impl Into<String>, line: u32) -> Self {
        Self::new(BreakpointLocation::FileLine {
            file: file.into(),
            line,
        })
    }

    pub fn function(function: impl Into<String>) -> Self {
        let function = function.into();
        let (module, function) = match function.split_once('!') {
            Some((module, function)) => (Some(module.to_string()), function.to_string()),
            None => (None, function),
        };
        Self::new(BreakpointLocation::Function { module, function })
    }

    pub fn address(address: u64) -> Self {
        Self::new(BreakpointLocation::Address(address))
    }

    /// True when `other` differs from `self` in nothing but `enabled`.
    pub fn differs_only_in_enabled(&self, other: &Self) -> bool {
        self.enabled != other.enabled
            && Self {
                enabled: other.enabled,
                ..self.clone()
            } == *other
    }
}

/// What the debugger reported back for a breakpoint
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BreakpointResponse {
    pub enabled: bool,
    pub address: Option<u64>,
    pub module: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub ignore_count: Option<u32>,
    pub thread: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub index: usize,
    /// Absent when the debugger did not report one; 0 is a valid address
    pub address: Option<u64>,
    pub function: String,
    pub module: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    /// The source file exists locally
    pub usable: bool,
}

/// A complete call stack of the current thread
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackSnapshot {
    pub frames: Vec<StackFrame>,
    /// More frames exist than were reported
    pub incomplete: bool,
    /// Index of the frame to show
    pub current: usize,
}

impl StackSnapshot {
    pub fn current_frame(&self) -> Option<&StackFrame> {
        self.frames.get(self.current)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: u32,
    pub target_id: String,
    pub name: Option<String>,
    pub state: Option<String>,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub module: Option<String>,
    pub address: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadSnapshot {
    pub threads: Vec<ThreadRecord>,
    pub current: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub name: String,
    pub image: String,
    pub start: Option<u64>,
    pub end: Option<u64>,
    /// Symbols are loaded lazily
    pub deferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRecord {
    pub name: String,
    pub value: String,
    pub description: String,
    pub kind: String,
    pub size: Option<u32>,
}

/// Severity of text published to the front end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogChannel {
    /// Commands sent to the debugger
    Input,
    /// Debugger output
    Output,
    Warning,
    Error,
    /// Short messages for a status bar
    Status,
    /// Output of the debuggee itself
    AppOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSeverity {
    Error,
    Warning,
}

/// Which optional views the front end currently shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VisiblePanels {
    pub registers: bool,
    pub modules: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_ids() {
        let id = BreakpointId::new(1);
        assert_eq!(id.to_wire(), Some(100_100));
        assert_eq!(id.sub(3).to_wire(), Some(100_103));
        assert_eq!(BreakpointId::from_wire(100_103), Some(id.sub(3)));
        assert_eq!(BreakpointId::from_wire(0), None);
        assert_eq!(BreakpointId::from_wire(-1), None);
        assert_eq!(id.sub(100).to_wire(), None);
        assert_eq!(id.sub(3).to_string(), "1.3");
        assert_eq!(id.sub(3).parent(), id);
    }

    #[test]
    fn function_with_module() {
        assert_eq!(
            BreakpointParameters::function("app!main").location,
            BreakpointLocation::Function {
                module: Some("app".to_string()),
                function: "main".to_string()
            }
        );
    }

    #[test]
    fn enabled_only_change() {
        let a = BreakpointParameters::file_line("main.cpp", 3);
        let mut b = a.clone();
        b.enabled = false;
        assert!(a.differs_only_in_enabled(&b));
        b.ignore_count = 2;
        assert!(!a.differs_only_in_enabled(&b));
        assert!(!a.differs_only_in_enabled(&a));
    }
}
