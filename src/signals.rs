//! Signal-to-loop communication (spec §4.8 / §5 Design Notes): handlers
//! never do anything beyond flipping an atomic flag, read back at safe
//! points by the main loop.
//!
//! Grounded on `original_source/smartd.cpp`'s `volatile int caughtsig*`
//! globals, modeled here as a small [`SignalFlags`] struct of
//! `AtomicBool`s installed via `signal_hook`, the way the teacher installs
//! its single `ctrlc` SIGINT handler in `main.rs::run_daemon`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context as _;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};

/// Shared flags set by signal handlers and drained by the main loop
#[derive(Clone, Default)]
pub(crate) struct SignalFlags {
    /// SIGHUP, or SIGINT while in debug mode: re-parse and re-register
    reload: Arc<AtomicBool>,
    /// SIGUSR1: shorten the current sleep to zero
    check_now: Arc<AtomicBool>,
    /// SIGTERM/SIGQUIT, or SIGINT outside debug mode: clean up and exit
    exit: Arc<AtomicBool>,
    /// SIGUSR2: toggle debug-level logging at runtime
    toggle_debug: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Install handlers for every signal this daemon reacts to (spec §6
    /// "Signals"). `debug` controls whether SIGINT means reload or exit.
    pub(crate) fn install(debug: bool) -> anyhow::Result<Self> {
        let flags = Self::default();

        register(SIGHUP, Arc::clone(&flags.reload))?;
        register(SIGUSR1, Arc::clone(&flags.check_now))?;
        register(SIGTERM, Arc::clone(&flags.exit))?;
        register(SIGQUIT, Arc::clone(&flags.exit))?;
        register(SIGUSR2, Arc::clone(&flags.toggle_debug))?;
        register(SIGINT, Arc::clone(if debug { &flags.reload } else { &flags.exit }))?;

        Ok(flags)
    }

    /// Drain and clear the reload flag
    pub(crate) fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    /// Read the reload flag without clearing it, to wake an interruptible
    /// sleep promptly; the loop still drains it via [`Self::take_reload`]
    pub(crate) fn peek_reload(&self) -> bool {
        self.reload.load(Ordering::SeqCst)
    }

    /// Drain and clear the check-now flag
    pub(crate) fn take_check_now(&self) -> bool {
        self.check_now.swap(false, Ordering::SeqCst)
    }

    /// Read the check-now flag without clearing it, to wake an
    /// interruptible sleep promptly
    pub(crate) fn peek_check_now(&self) -> bool {
        self.check_now.load(Ordering::SeqCst)
    }

    /// Whether exit has been requested; not cleared, since exit is terminal
    pub(crate) fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// Drain and clear the toggle-debug flag
    pub(crate) fn take_toggle_debug(&self) -> bool {
        self.toggle_debug.swap(false, Ordering::SeqCst)
    }
}

/// Register one signal number to set `flag` when raised
fn register(signal: i32, flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    signal_hook::flag::register(signal, flag)
        .with_context(|| format!("failed to install handler for signal {signal}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_reload_clears_after_read() {
        let flags = SignalFlags::default();
        flags.reload.store(true, Ordering::SeqCst);
        assert!(flags.take_reload());
        assert!(!flags.take_reload());
    }

    #[test]
    fn exit_requested_does_not_clear() {
        let flags = SignalFlags::default();
        flags.exit.store(true, Ordering::SeqCst);
        assert!(flags.exit_requested());
        assert!(flags.exit_requested());
    }

    #[test]
    fn peek_check_now_does_not_clear() {
        let flags = SignalFlags::default();
        flags.check_now.store(true, Ordering::SeqCst);
        assert!(flags.peek_check_now());
        assert!(flags.take_check_now());
        assert!(!flags.peek_check_now());
    }

    #[test]
    fn peek_reload_does_not_clear() {
        let flags = SignalFlags::default();
        flags.reload.store(true, Ordering::SeqCst);
        assert!(flags.peek_reload());
        assert!(flags.take_reload());
        assert!(!flags.peek_reload());
    }
}
