use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Stdio},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use config::Settings;
use crossbeam_channel::Sender;
use eyre::WrapErr;
use transport::{CdbTransport, Incoming};

use crate::{
    LaunchError, Server,
    arguments::{self, StartMode},
    interrupt,
};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running `cdb.exe`
pub struct CdbServer {
    child: Arc<Mutex<Child>>,
    pid: u32,
    interrupt_helper: Option<PathBuf>,
}

/// Piped standard streams of a [`CdbServer`]
pub struct CdbStreams {
    stdout: ChildStdout,
    stderr: ChildStderr,
    stdin: ChildStdin,
}

impl CdbTransport for CdbStreams {
    type Output = ChildStdout;
    type Errors = ChildStderr;
    type Input = ChildStdin;

    fn split(self) -> eyre::Result<(Self::Output, Self::Errors, Self::Input)> {
        Ok((self.stdout, self.stderr, self.stdin))
    }
}

/// Locate the debugger executable.
pub fn cdb_executable(settings: &Settings) -> Result<PathBuf, LaunchError> {
    match &settings.cdb_executable {
        Some(path) if path.is_file() => Ok(path.clone()),
        Some(path) => Err(LaunchError::CdbNotFound {
            searched: path.display().to_string(),
        }),
        None => which::which("cdb").map_err(|_| LaunchError::CdbNotFound {
            searched: "PATH".to_string(),
        }),
    }
}

/// Directory holding the extension library.
///
/// Defaults to `lib/qtcreatorcdbext64` (or `32`) next to the directory of the
/// running executable.
pub fn extension_directory(settings: &Settings) -> Result<PathBuf, LaunchError> {
    if let Some(dir) = &settings.extension_directory {
        return Ok(dir.clone());
    }
    let bits = if cfg!(target_pointer_width = "64") {
        "64"
    } else {
        "32"
    };
    let exe = std::env::current_exe().map_err(|_| LaunchError::ExtensionDirectoryUnknown)?;
    exe.parent()
        .and_then(Path::parent)
        .map(|root| root.join("lib").join(format!("qtcreatorcdbext{bits}")))
        .ok_or(LaunchError::ExtensionDirectoryUnknown)
}

/// Path of the extension library, which must exist.
pub fn extension_library(directory: &Path) -> Result<PathBuf, LaunchError> {
    let path = directory.join(arguments::extension_file_name());
    if path.is_file() {
        Ok(path)
    } else {
        Err(LaunchError::ExtensionMissing { path })
    }
}

impl CdbServer {
    /// Start the debugger for `mode`.
    ///
    /// Failure to find the debugger or the extension library, or to spawn the
    /// process, is final.
    #[tracing::instrument(skip(settings, environment))]
    pub fn spawn(
        settings: &Settings,
        mode: &StartMode,
        environment: &HashMap<String, String>,
        working_directory: Option<&Path>,
    ) -> Result<(Self, CdbStreams), LaunchError> {
        let program = cdb_executable(settings)?;
        let mut command = std::process::Command::new(&program);

        let extension = if mode.is_remote() {
            PathBuf::new()
        } else {
            let directory = extension_directory(settings)?;
            let library = extension_library(&directory)?;
            command.env(
                arguments::EXTENSION_PATH_VARIABLE,
                arguments::extension_search_path(
                    std::env::var_os(arguments::EXTENSION_PATH_VARIABLE),
                    &directory,
                ),
            );
            library
        };

        let args = arguments::cdb_arguments(settings, mode, &extension);
        tracing::debug!(program = %program.display(), ?args, "starting debugger process");

        command
            .args(&args)
            .envs(environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: program.clone(),
            source,
        })?;

        let streams = match (child.stdout.take(), child.stderr.take(), child.stdin.take()) {
            (Some(stdout), Some(stderr), Some(stdin)) => CdbStreams {
                stdout,
                stderr,
                stdin,
            },
            _ => {
                let _ = child.kill();
                return Err(LaunchError::MissingStreams);
            }
        };

        let pid = child.id();
        tracing::debug!(pid, "debugger process started");
        Ok((
            Self {
                child: Arc::new(Mutex::new(child)),
                pid,
                interrupt_helper: interrupt::helper_path(),
            },
            streams,
        ))
    }

    /// Report the process exit on `tx` from a background thread.
    pub fn watch_exit(&self, tx: Sender<Incoming>) -> JoinHandle<()> {
        let child = Arc::clone(&self.child);
        thread::spawn(move || {
            loop {
                let status = match child.lock() {
                    Ok(mut guard) => guard.try_wait(),
                    Err(_) => {
                        tracing::warn!("child process mutex poisoned");
                        return;
                    }
                };
                match status {
                    Ok(Some(status)) => {
                        tracing::debug!(%status, "debugger process exited");
                        let _ = tx.send(Incoming::Exited(status.code()));
                        return;
                    }
                    Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot query debugger process status");
                        let _ = tx.send(Incoming::Exited(None));
                        return;
                    }
                }
            }
        })
    }
}

impl Server for CdbServer {
    fn interrupt(&mut self, inferior_pid: u32) -> eyre::Result<()> {
        let helper = self
            .interrupt_helper
            .as_deref()
            .ok_or_else(|| eyre::eyre!("interrupt helper not found"))?;
        interrupt::run_helper(helper, inferior_pid).wrap_err("interrupting debuggee")
    }

    fn kill(&mut self) -> eyre::Result<()> {
        let mut child = self
            .child
            .lock()
            .map_err(|e| eyre::eyre!("child process mutex poisoned: {e}"))?;
        if child.try_wait().wrap_err("checking debugger process")?.is_some() {
            return Ok(());
        }
        child.kill().wrap_err("killing debugger process")?;
        child.wait().wrap_err("waiting for debugger process")?;
        tracing::debug!(pid = self.pid, "debugger process killed");
        Ok(())
    }
}

impl Drop for CdbServer {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::warn!(error = %e, "could not terminate debugger process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_extension_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = extension_library(dir.path()).unwrap_err();
        assert!(matches!(err, LaunchError::ExtensionMissing { .. }));
        assert!(err.to_string().contains("qtcreatorcdbext.dll"));
    }

    #[test]
    fn extension_found_in_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qtcreatorcdbext.dll"), b"").unwrap();
        let settings = Settings {
            extension_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let directory = extension_directory(&settings).unwrap();
        assert_eq!(
            extension_library(&directory).unwrap(),
            dir.path().join("qtcreatorcdbext.dll")
        );
    }

    #[test]
    fn configured_debugger_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cdb_executable: Some(dir.path().join("cdb.exe")),
            ..Default::default()
        };
        assert!(matches!(
            cdb_executable(&settings),
            Err(LaunchError::CdbNotFound { .. })
        ));
    }

    #[test]
    fn missing_debugger_fails_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cdb_executable: Some(dir.path().join("cdb.exe")),
            ..Default::default()
        };
        let mode = StartMode::Dump {
            path: dir.path().join("crash.dmp"),
        };
        let result = CdbServer::spawn(&settings, &mode, &HashMap::new(), None);
        assert!(matches!(result, Err(LaunchError::CdbNotFound { .. })));
    }

    #[test]
    fn unrunnable_debugger_fails_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("cdb.exe");
        std::fs::write(&program, b"not a program").unwrap();
        let settings = Settings {
            cdb_executable: Some(program.clone()),
            ..Default::default()
        };
        // remote sessions need no extension library
        let mode = StartMode::Remote {
            channel: "tcp:server=localhost,port=1".to_string(),
        };
        match CdbServer::spawn(&settings, &mode, &HashMap::new(), None) {
            Err(LaunchError::Spawn { program: failed, .. }) => assert_eq!(failed, program),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("a text file was started as the debugger"),
        }
    }
}
