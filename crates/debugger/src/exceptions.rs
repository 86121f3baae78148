//! Windows exception records reported by the debugger
use std::fmt::{self, Write as _};

use transport::GdbMi;

pub const EXCEPTION_CPP: u32 = 0xE06D_7363;
pub const EXCEPTION_SET_THREAD_NAME: u32 = 0x406D_1388;
pub const EXCEPTION_WX86_BREAKPOINT: u32 = 0x4000_001F;
pub const EXCEPTION_CTRL_C: u32 = 0x4001_0005;
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
pub const EXCEPTION_RPC_SERVER_UNAVAILABLE: u32 = 0x6BA;
pub const EXCEPTION_RPC_SERVER_INVALID: u32 = 0x6A6;
pub const EXCEPTION_DLL_NOT_FOUND: u32 = 0xC000_0135;
pub const EXCEPTION_DLL_ENTRY_POINT_NOT_FOUND: u32 = 0xC000_0139;
pub const EXCEPTION_DLL_INIT_FAILED: u32 = 0xC000_0142;
pub const EXCEPTION_MISSING_SYSTEM_FILE: u32 = 0xC000_0143;
pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
pub const EXCEPTION_ARRAY_BOUNDS_EXCEEDED: u32 = 0xC000_008C;
pub const EXCEPTION_DATATYPE_MISALIGNMENT: u32 = 0x8000_0002;
pub const EXCEPTION_FLT_DENORMAL_OPERAND: u32 = 0xC000_008D;
pub const EXCEPTION_FLT_DIVIDE_BY_ZERO: u32 = 0xC000_008E;
pub const EXCEPTION_FLT_INEXACT_RESULT: u32 = 0xC000_008F;
pub const EXCEPTION_FLT_INVALID_OPERATION: u32 = 0xC000_0090;
pub const EXCEPTION_FLT_OVERFLOW: u32 = 0xC000_0091;
pub const EXCEPTION_FLT_STACK_CHECK: u32 = 0xC000_0092;
pub const EXCEPTION_FLT_UNDERFLOW: u32 = 0xC000_0093;
pub const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
pub const EXCEPTION_IN_PAGE_ERROR: u32 = 0xC000_0006;
pub const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
pub const EXCEPTION_INT_OVERFLOW: u32 = 0xC000_0095;
pub const EXCEPTION_INVALID_DISPOSITION: u32 = 0xC000_0026;
pub const EXCEPTION_NONCONTINUABLE: u32 = 0xC000_0025;
pub const EXCEPTION_PRIV_INSTRUCTION: u32 = 0xC000_0096;
pub const EXCEPTION_STACK_OVERFLOW: u32 = 0xC000_00FD;

/// An exception raised in the debuggee
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WinException {
    pub code: u32,
    pub flags: u32,
    pub address: u64,
    pub info1: u64,
    pub info2: u64,
    pub first_chance: bool,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl WinException {
    /// Decode the fields of an exception record; absent fields are zero.
    pub fn from_gdbmi(record: &GdbMi) -> Self {
        let int = |name: &str| record.get(name).to_int().unwrap_or(0);
        let text = |name: &str| {
            record
                .str_of(name)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            code: int("exceptionCode") as u32,
            flags: int("exceptionFlags") as u32,
            address: record.get("exceptionAddress").to_address().unwrap_or(0),
            info1: int("exceptionInformation0") as u64,
            info2: int("exceptionInformation1") as u64,
            first_chance: int("firstChance") != 0,
            function: text("exceptionFunction"),
            file: text("exceptionFile"),
            line: record
                .get("exceptionLine")
                .to_int()
                .and_then(|l| u32::try_from(l).ok())
                .filter(|l| *l > 0),
        }
    }

    /// Raised by the debugger itself rather than the program.
    pub fn is_debugger_exception(&self) -> bool {
        matches!(self.code, EXCEPTION_BREAKPOINT | EXCEPTION_SINGLE_STEP)
    }

    /// Whether the program can be expected to survive the exception.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.code,
            EXCEPTION_BREAKPOINT
                | EXCEPTION_SINGLE_STEP
                | EXCEPTION_SET_THREAD_NAME
                | EXCEPTION_RPC_SERVER_UNAVAILABLE
                | EXCEPTION_RPC_SERVER_INVALID
                | EXCEPTION_DLL_NOT_FOUND
                | EXCEPTION_DLL_ENTRY_POINT_NOT_FOUND
                | EXCEPTION_CPP
        )
    }

    /// One line summary, e.g. for a status bar or an exception dialog.
    pub fn describe(&self) -> String {
        match self.code {
            EXCEPTION_CPP => "C++ exception".to_string(),
            EXCEPTION_SET_THREAD_NAME => "Thread name".to_string(),
            EXCEPTION_WX86_BREAKPOINT => "WX86 breakpoint".to_string(),
            EXCEPTION_CTRL_C => "Ctrl-C".to_string(),
            EXCEPTION_BREAKPOINT => "Breakpoint hit".to_string(),
            EXCEPTION_SINGLE_STEP => "Single step".to_string(),
            EXCEPTION_RPC_SERVER_UNAVAILABLE => "RPC server unavailable".to_string(),
            EXCEPTION_RPC_SERVER_INVALID => "RPC server invalid".to_string(),
            EXCEPTION_DLL_NOT_FOUND => "DLL not found".to_string(),
            EXCEPTION_DLL_ENTRY_POINT_NOT_FOUND => "DLL entry point not found".to_string(),
            EXCEPTION_DLL_INIT_FAILED => "DLL initialization failed".to_string(),
            EXCEPTION_MISSING_SYSTEM_FILE => "System file missing".to_string(),
            EXCEPTION_ACCESS_VIOLATION => {
                let kind = if self.info1 != 0 { "write" } else { "read" };
                format!("{kind} access violation at: 0x{:x}", self.info2)
            }
            EXCEPTION_ARRAY_BOUNDS_EXCEEDED => "Array bounds exceeded".to_string(),
            EXCEPTION_DATATYPE_MISALIGNMENT => "Datatype misalignment".to_string(),
            EXCEPTION_FLT_DENORMAL_OPERAND => "Floating point denormal operand".to_string(),
            EXCEPTION_FLT_DIVIDE_BY_ZERO => "Floating point divide by zero".to_string(),
            EXCEPTION_FLT_INEXACT_RESULT => "Floating point inexact result".to_string(),
            EXCEPTION_FLT_INVALID_OPERATION => "Floating point invalid operation".to_string(),
            EXCEPTION_FLT_OVERFLOW => "Floating point overflow".to_string(),
            EXCEPTION_FLT_STACK_CHECK => "Floating point stack check".to_string(),
            EXCEPTION_FLT_UNDERFLOW => "Floating point underflow".to_string(),
            EXCEPTION_ILLEGAL_INSTRUCTION => "Invalid instruction".to_string(),
            EXCEPTION_IN_PAGE_ERROR => "In page error".to_string(),
            EXCEPTION_INT_DIVIDE_BY_ZERO => "Integer division by zero".to_string(),
            EXCEPTION_INT_OVERFLOW => "Integer overflow".to_string(),
            EXCEPTION_INVALID_DISPOSITION => "Invalid disposition".to_string(),
            EXCEPTION_NONCONTINUABLE => "Noncontinuable exception".to_string(),
            EXCEPTION_PRIV_INSTRUCTION => "Privileged instruction".to_string(),
            EXCEPTION_STACK_OVERFLOW => "Stack overflow".to_string(),
            _ => "Unknown exception".to_string(),
        }
    }
}

impl fmt::Display for WinException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!(
            "Exception at 0x{:x}, code: 0x{:x}: {}, flags=0x{:x}",
            self.address,
            self.code,
            self.describe(),
            self.flags
        );
        if self.first_chance {
            out.push_str(" (first chance)");
        }
        match (&self.file, self.line, &self.function) {
            (Some(file), Some(line), _) => {
                let _ = write!(out, " at {file}:{line}");
            }
            (_, _, Some(function)) => {
                let _ = write!(out, " in {function}");
            }
            _ => {}
        }
        f.write_str(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str) -> WinException {
        WinException::from_gdbmi(&GdbMi::parse(text).unwrap())
    }

    #[test]
    fn access_violation() {
        let ex = record(
            r#"{exceptionCode="3221225477",exceptionFlags="0",exceptionAddress="0x7ff6a1032410",exceptionInformation0="1",exceptionInformation1="0x10",firstChance="1",exceptionFile="C:\\src\\main.cpp",exceptionLine="12"}"#,
        );
        assert_eq!(ex.code, EXCEPTION_ACCESS_VIOLATION);
        assert!(ex.is_fatal());
        assert!(!ex.is_debugger_exception());
        assert_eq!(
            ex.to_string(),
            "Exception at 0x7ff6a1032410, code: 0xc0000005: write access violation at: 0x10, flags=0x0 (first chance) at C:\\src\\main.cpp:12"
        );
    }

    #[test]
    fn cpp_exception_is_not_fatal() {
        let ex = record(
            r#"{exceptionCode="0xe06d7363",exceptionAddress="0x1000",firstChance="0",exceptionFunction="KERNELBASE!RaiseException"}"#,
        );
        assert!(!ex.is_fatal());
        assert_eq!(
            ex.to_string(),
            "Exception at 0x1000, code: 0xe06d7363: C++ exception, flags=0x0 in KERNELBASE!RaiseException"
        );
    }

    #[test]
    fn debugger_exceptions() {
        let ex = record(r#"{exceptionCode="0x80000003"}"#);
        assert!(ex.is_debugger_exception());
        assert!(!ex.is_fatal());
        assert_eq!(record("{}"), WinException::default());
        assert_eq!(record("{}").describe(), "Unknown exception");
    }
}
