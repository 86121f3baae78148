//! Out of band interruption of a running debuggee
//!
//! A running target does not read commands, so breaking into it goes through
//! a small helper executable calling `DebugBreakProcess` on the debuggee.
use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};

use eyre::WrapErr;

/// File name of the helper matching the pointer width of this build.
pub fn helper_name() -> &'static str {
    if cfg!(target_pointer_width = "64") {
        "win64interrupt.exe"
    } else {
        "win32interrupt.exe"
    }
}

/// Look for the helper next to the running executable, then on `PATH`.
pub fn helper_path() -> Option<PathBuf> {
    let beside = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(helper_name())))
        .filter(|path| path.is_file());
    beside.or_else(|| which::which(helper_name()).ok())
}

/// Start the helper for `pid` without waiting for it.
///
/// The helper's exit status is logged from a background thread; the stop it
/// causes arrives through the debugger's normal output.
pub fn run_helper(helper: &Path, pid: u32) -> eyre::Result<()> {
    tracing::debug!(helper = %helper.display(), pid, "interrupting debuggee");
    let mut child = Command::new(helper)
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .wrap_err_with(|| format!("spawning {}", helper.display()))?;

    thread::spawn(move || match child.wait() {
        Ok(status) if status.success() => tracing::debug!(pid, "interrupt delivered"),
        Ok(status) => tracing::warn!(pid, %status, "interrupt helper failed"),
        Err(e) => tracing::warn!(pid, error = %e, "waiting for interrupt helper"),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_helper_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_helper(&dir.path().join(helper_name()), 1).is_err());
    }
}
