//! Platform interface for daemonization (spec §4.8 / §5 Design Notes:
//! "Platform branch ... isolate behind a small platform interface").
//!
//! Grounded on `original_source/smartd.cpp`'s `DaemonInit()`: double-fork,
//! new session, stdio redirected to `/dev/null`, `umask(0)`, `chdir("/")`.
//! The teacher has no equivalent (it always runs in the foreground), so
//! this module is new; it is kept small and Unix-only, the way the
//! Design Notes ask for a platform seam rather than `#[cfg]` scattered
//! through the main loop.

use std::{fs::File, os::fd::AsRawFd as _, path::Path};

use anyhow::Context as _;
use nix::{
    sys::stat::{umask, Mode},
    unistd::{chdir, dup2, fork, setsid, ForkResult},
};

/// Daemonize the current process: fork twice (dropping the controlling
/// terminal via an intermediate session leader), redirect stdin/stdout/
/// stderr to `/dev/null`, clear the umask, and chdir to `/`.
///
/// Each parent in the fork chain exits immediately with status 0; only
/// the final grandchild returns from this function.
pub(crate) fn daemonize() -> anyhow::Result<()> {
    // SAFETY: no threads have been spawned yet at this point in startup,
    // and the only work done between fork and exec-equivalent below is
    // async-signal-safe (session/fd manipulation, no allocation).
    match unsafe { fork() }.context("failed to fork daemon process")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("failed to start a new session")?;

    // SAFETY: see above.
    match unsafe { fork() }.context("failed to fork daemon process")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_stdio_to_null().context("failed to redirect stdio")?;
    umask(Mode::empty());
    chdir("/").context("failed to chdir to /")?;

    Ok(())
}

/// Redirect stdin/stdout/stderr to `/dev/null`
fn redirect_stdio_to_null() -> anyhow::Result<()> {
    let devnull = File::options()
        .read(true)
        .write(true)
        .open(Path::new("/dev/null"))
        .context("failed to open /dev/null")?;
    let fd = devnull.as_raw_fd();
    for target in 0..=2 {
        dup2(fd, target).with_context(|| format!("failed to redirect fd {target}"))?;
    }
    // `devnull` closes its own fd on drop; fds 0-2 now point to independent
    // open-file-descriptions of /dev/null via dup2, so this does not affect them.
    Ok(())
}
