//! Small child-process helpers shared by the bridge and player supervisors.

use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Build a `tokio::process::Command` for a supervised child.
///
/// stdin is closed, the child dies with its handle, and on Windows no console
/// window is created.
pub fn supervised_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Ask the child to exit, wait up to `grace`, then force it.
///
/// Returns the exit status when one could be collected. A child that already
/// exited is reaped without sending anything.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<Option<ExitStatus>> {
    if let Some(status) = child.try_wait()? {
        return Ok(Some(status));
    }

    if request_exit(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status.map(Some),
            Err(_) => warn!(
                pid = child.id(),
                "child ignored termination request for {:?}, killing",
                grace
            ),
        }
    }

    child.kill().await?;
    let status = child.try_wait()?;
    debug!(?status, "child killed");
    Ok(status)
}

/// Deliver SIGTERM. Returns false when no signal could be sent.
#[cfg(unix)]
fn request_exit(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: plain syscall on a pid we own; no memory is shared.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    rc == 0
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) -> bool {
    false
}
