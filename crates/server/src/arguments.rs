//! Command line and environment of the debugger process

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use config::Settings;
use transport::command::EXTENSION_NAME;

/// Environment variable listing directories searched for extensions.
pub const EXTENSION_PATH_VARIABLE: &str = "_NT_DEBUGGER_EXTENSION_PATH";

/// How the debugger gets hold of its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// Start `executable` under the debugger
    Launch {
        executable: PathBuf,
        arguments: Vec<String>,
    },

    /// Attach to a running process
    AttachToProcess { pid: u32 },

    /// Attach to a process that was started suspended in its own console
    AttachToConsoleProcess { pid: u32 },

    /// Attach to a process that crashed, signalling `event` once attached
    AttachToCrashedProcess { pid: u32, event: String },

    /// Open a crash dump
    Dump { path: PathBuf },

    /// Connect to a debugging server, e.g. `tcp:server=host,port=1234`
    Remote { channel: String },
}

impl StartMode {
    /// Attached sessions detach instead of killing the target on shutdown.
    pub fn is_attach(&self) -> bool {
        matches!(
            self,
            StartMode::AttachToProcess { .. }
                | StartMode::AttachToConsoleProcess { .. }
                | StartMode::AttachToCrashedProcess { .. }
        )
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StartMode::Remote { .. })
    }

    pub fn is_dump(&self) -> bool {
        matches!(self, StartMode::Dump { .. })
    }
}

/// File name of the extension library.
pub fn extension_file_name() -> String {
    format!("{EXTENSION_NAME}.dll")
}

/// Arguments passed to `cdb.exe`.
///
/// `extension` is the extension library, loaded with `-a`; it is ignored for
/// remote sessions where the server side has it loaded already.
pub fn cdb_arguments(settings: &Settings, mode: &StartMode, extension: &Path) -> Vec<String> {
    let mut args = Vec::new();
    match mode {
        // must come first
        StartMode::Remote { channel } => {
            args.push("-remote".to_string());
            args.push(channel.clone());
        }
        _ => args.push(format!("-a{}", extension.display())),
    }

    args.extend([
        "-lines".to_string(),
        "-G".to_string(),
        "-c".to_string(),
        format!(".idle_cmd !{EXTENSION_NAME}.idle"),
    ]);
    if settings.use_terminal {
        args.push("-2".to_string());
    }
    if settings.ignore_first_chance_access_violation {
        args.push("-x".to_string());
    }
    if !settings.symbol_paths.is_empty() {
        args.push("-y".to_string());
        args.push(settings.symbol_paths.join(";"));
    }
    if !settings.source_paths.is_empty() {
        args.push("-srcpath".to_string());
        args.push(settings.source_paths.join(";"));
    }
    args.extend(
        settings
            .additional_arguments
            .split_whitespace()
            .map(str::to_string),
    );

    match mode {
        StartMode::Launch {
            executable,
            arguments,
        } => {
            args.push(executable.display().to_string());
            args.extend(arguments.iter().cloned());
        }
        StartMode::AttachToProcess { pid } => {
            args.push("-p".to_string());
            args.push(pid.to_string());
        }
        StartMode::AttachToConsoleProcess { pid } => {
            args.push("-p".to_string());
            args.push(pid.to_string());
            args.push("-pr".to_string());
            args.push("-pb".to_string());
        }
        StartMode::AttachToCrashedProcess { pid, event } => {
            args.push("-p".to_string());
            args.push(pid.to_string());
            args.push("-e".to_string());
            args.push(event.clone());
            args.push("-g".to_string());
        }
        StartMode::Dump { path } => {
            args.push("-z".to_string());
            args.push(path.display().to_string());
        }
        StartMode::Remote { .. } => {}
    }
    args
}

/// Value of [`EXTENSION_PATH_VARIABLE`] with `directory` appended.
pub fn extension_search_path(existing: Option<OsString>, directory: &Path) -> OsString {
    match existing {
        Some(mut value) if !value.is_empty() => {
            value.push(";");
            value.push(directory.as_os_str());
            value
        }
        _ => directory.as_os_str().to_os_string(),
    }
}
