// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The deadline killer: a process-wide service that SIGKILLs the process
//! group of any registered PID whose deadline has passed.
//!
//! The worker thread starts lazily on the first registration and stays
//! around, detached, for the lifetime of the process; over the course of a
//! run there is a lot of churn in registrations and the once-a-second wakeup
//! is cheaper than starting and stopping the thread. All state lives in one
//! mutex-protected ordered map.

use crate::process;
use nix::unistd::Pid;
use std::{
    collections::BTreeMap,
    sync::Mutex,
    time::{Duration, Instant},
};

struct KillerState {
    started: bool,
    next_seq: u64,
    // Keyed by (deadline, registration sequence) so that identical deadlines
    // do not collide.
    deadlines: BTreeMap<(Instant, u64), i32>,
}

static STATE: Mutex<KillerState> = Mutex::new(KillerState {
    started: false,
    next_seq: 0,
    deadlines: BTreeMap::new(),
});

fn lock() -> std::sync::MutexGuard<'static, KillerState> {
    STATE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes and returns the PIDs whose deadline has expired.
fn extract_expired() -> Vec<i32> {
    let mut state = lock();
    let now = Instant::now();
    let mut pids = Vec::new();
    while let Some(entry) = state.deadlines.first_entry() {
        if entry.key().0 <= now {
            pids.push(entry.remove());
        } else {
            break;
        }
    }
    pids
}

fn killer_thread() {
    loop {
        for pid in extract_expired() {
            tracing::debug!("deadline expired; killing process group {pid}");
            process::terminate_group(Pid::from_raw(pid));
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// A scheduled kill, returned by [`register`].
///
/// [`DeadlineHandle::unschedule`] must be called once the subprocess has been
/// waited for; dropping a still-scheduled handle unschedules it too but logs
/// a warning, because the caller then cannot learn whether the kill fired.
#[derive(Debug)]
pub struct DeadlineHandle {
    key: (Instant, u64),
    pid: i32,
    scheduled: bool,
    fired: bool,
}

impl DeadlineHandle {
    /// Removes the entry from the killer's schedule.
    ///
    /// Returns true if the deadline had already expired (the process group
    /// was sent SIGKILL) before the entry could be removed. Idempotent.
    pub fn unschedule(&mut self) -> bool {
        if self.scheduled {
            let mut state = lock();
            let removed = state.deadlines.remove(&self.key).is_some();
            self.scheduled = false;
            self.fired = !removed;
        }
        self.fired
    }
}

impl Drop for DeadlineHandle {
    fn drop(&mut self) {
        if self.scheduled {
            tracing::warn!(
                "dropping still-scheduled deadline entry for PID {}",
                self.pid
            );
            let _ = self.unschedule();
        }
    }
}

/// Schedules `pid`'s process group to be killed once `delta` elapses.
pub fn register(delta: Duration, pid: Pid) -> DeadlineHandle {
    let mut state = lock();
    let deadline = Instant::now() + delta;
    let seq = state.next_seq;
    state.next_seq += 1;
    state.deadlines.insert((deadline, seq), pid.as_raw());

    if !state.started {
        state.started = true;
        std::thread::Builder::new()
            .name("corral-deadline-killer".to_owned())
            .spawn(killer_thread)
            .expect("failed to start the deadline killer thread");
    }

    DeadlineHandle {
        key: (deadline, seq),
        pid: pid.as_raw(),
        scheduled: true,
        fired: false,
    }
}
