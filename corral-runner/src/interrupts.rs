// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interruption handling for the scheduler.
//!
//! SIGHUP, SIGINT and SIGTERM flip a process-global flag; nothing else
//! happens in signal context. Code with cleanup responsibilities polls the
//! flag through [`check_interrupt`] at its checkpoints and unwinds with a
//! structured [`Interrupted`] error.
//!
//! Handler installation is reference counted so that several executors (in
//! particular, executors created by tests running in one process) can coexist;
//! the original dispositions are restored when the last one goes away.

use crate::errors::Interrupted;
use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow, sigaction, sigprocmask,
};
use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

/// Signals that interrupt a run.
const INTERRUPT_SIGNALS: [Signal; 3] = [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM];

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

struct InstallState {
    count: usize,
    saved: Option<[SigAction; 3]>,
}

static INSTALLS: Mutex<InstallState> = Mutex::new(InstallState {
    count: 0,
    saved: None,
});

extern "C" fn handle_signal(_signo: libc::c_int) {
    // Only async-signal-safe work here: store into an atomic.
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Installed interrupt handlers; uninstalls on drop.
#[derive(Debug)]
pub struct InterruptsHandler {
    active: bool,
}

impl InterruptsHandler {
    /// Installs the interrupt handlers, or bumps the refcount if another
    /// instance already has them installed.
    pub fn install() -> Result<Self, nix::Error> {
        let mut state = INSTALLS.lock().unwrap_or_else(|e| e.into_inner());
        if state.count == 0 {
            // SA_RESTART is deliberately absent: a pending interrupt must be
            // able to wake a blocked waitpid(2).
            let action = SigAction::new(
                SigHandler::Handler(handle_signal),
                SaFlags::empty(),
                SigSet::empty(),
            );
            let mut saved = [action; 3];
            for (slot, signal) in saved.iter_mut().zip(INTERRUPT_SIGNALS) {
                *slot = unsafe { sigaction(signal, &action) }?;
            }
            state.saved = Some(saved);
        }
        state.count += 1;
        Ok(Self { active: true })
    }

    /// Restores the previous signal dispositions if this is the last
    /// installed handler.
    pub fn uninstall(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let mut state = INSTALLS.lock().unwrap_or_else(|e| e.into_inner());
        state.count -= 1;
        if state.count == 0 {
            if let Some(saved) = state.saved.take() {
                for (old, signal) in saved.iter().zip(INTERRUPT_SIGNALS) {
                    if let Err(error) = unsafe { sigaction(signal, old) } {
                        tracing::warn!("failed to restore handler for {signal}: {error}");
                    }
                }
            }
        }
    }
}

impl Drop for InterruptsHandler {
    fn drop(&mut self) {
        self.uninstall();
    }
}

/// Returns an [`Interrupted`] error if a termination signal has been
/// delivered since the last check.
pub fn check_interrupt() -> Result<(), Interrupted> {
    if INTERRUPTED.swap(false, Ordering::Relaxed) {
        Err(Interrupted)
    } else {
        Ok(())
    }
}

/// Puts signal handling back to its default state in a just-forked child.
///
/// Only async-signal-safe calls: the child must become interruptible before
/// it execs the test program.
pub(crate) fn reset_for_child() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in INTERRUPT_SIGNALS {
        let _ = unsafe { sigaction(signal, &default) };
    }
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}
