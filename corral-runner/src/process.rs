// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Low-level subprocess primitives: fork with file redirection, waiting, and
//! process-group termination.
//!
//! The child side of [`fork_with_files`] runs between fork and exec and
//! restricts itself to async-signal-safe operations; everything it needs that
//! allocates is prepared before the fork.

use crate::{
    errors::{SpawnError, WaitError},
    interrupts,
};
use camino::Utf8Path;
use nix::{
    errno::Errno,
    sys::{
        signal::{Signal, kill, killpg},
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, execv, fork, setsid},
};
use std::{
    convert::Infallible,
    ffi::{CStr, CString},
};

/// Decoded termination status of a subprocess.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    /// The process exited on its own with the given code.
    Exited(i32),
    /// The process was terminated by the given signal; the flag records
    /// whether a core file was dumped.
    Signaled(i32, bool),
}

impl Status {
    /// The exit code, if the process exited normally.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Status::Exited(code) => Some(*code),
            Status::Signaled(..) => None,
        }
    }

    /// Whether the process was terminated by a signal.
    pub fn signaled(&self) -> bool {
        matches!(self, Status::Signaled(..))
    }

    /// Whether the process was terminated by a signal and dumped core.
    pub fn coredump(&self) -> bool {
        matches!(self, Status::Signaled(_, true))
    }

    /// Decodes a raw wait(2) status as stored in exit cookies.
    pub fn from_raw(raw: i32) -> Option<Status> {
        if libc::WIFEXITED(raw) {
            Some(Status::Exited(libc::WEXITSTATUS(raw)))
        } else if libc::WIFSIGNALED(raw) {
            Some(Status::Signaled(libc::WTERMSIG(raw), libc::WCOREDUMP(raw)))
        } else {
            None
        }
    }

    fn from_wait_status(status: WaitStatus) -> Option<(Pid, Status)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, Status::Exited(code))),
            WaitStatus::Signaled(pid, signal, core_dumped) => {
                Some((pid, Status::Signaled(signal as i32, core_dumped)))
            }
            _ => None,
        }
    }
}

/// Writes a message to a raw file descriptor, ignoring errors.
///
/// Async-signal-safe; for diagnostics on the child side of a fork.
fn write_raw(fd: libc::c_int, message: &str) {
    let _ = unsafe { libc::write(fd, message.as_ptr() as *const libc::c_void, message.len()) };
}

/// Writes a diagnostic to stderr and aborts the calling (child) process.
///
/// The resulting SIGABRT is visible to the parent as a signalled status, so
/// setup failures between fork and exec classify as broken test cases.
pub(crate) fn fail_child(message: &str) -> ! {
    write_raw(libc::STDERR_FILENO, message);
    write_raw(libc::STDERR_FILENO, "\n");
    unsafe { libc::abort() }
}

/// Terminates the calling (child) process without running any destructors or
/// atexit handlers inherited from the parent.
pub(crate) fn exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

fn path_to_cstring(path: &Utf8Path) -> Result<CString, SpawnError> {
    CString::new(path.as_str()).map_err(|_| SpawnError::InvalidPath {
        path: path.to_owned(),
    })
}

/// Opens `path` in append mode and duplicates it onto `target_fd`.
///
/// A literal `/dev/stdout` or `/dev/stderr` path leaves the inherited
/// descriptor alone. Errors are reported on the current stderr and otherwise
/// ignored; there is nobody else to tell at this point.
fn redirect_to_file(path: &CStr, passthrough: &CStr, target_fd: libc::c_int) {
    if path.to_bytes() == passthrough.to_bytes() {
        return;
    }
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_CREAT | libc::O_WRONLY | libc::O_APPEND,
            0o644 as libc::c_uint,
        )
    };
    if fd == -1 {
        write_raw(libc::STDERR_FILENO, "Failed to create output file\n");
        return;
    }
    if unsafe { libc::dup2(fd, target_fd) } == -1 {
        write_raw(libc::STDERR_FILENO, "dup2 failed\n");
    }
    let _ = unsafe { libc::close(fd) };
}

/// Forks a subprocess whose stdout and stderr are sent to the given files.
///
/// The child becomes the leader of a new session (and thus process group),
/// gets the default signal handling back, opens the redirection targets in
/// append mode, and then runs `child_fn`, which must terminate the process by
/// exec'ing or exiting; the `Infallible` return type makes falling off the
/// end impossible to express.
pub fn fork_with_files<F>(
    child_fn: F,
    stdout_file: &Utf8Path,
    stderr_file: &Utf8Path,
) -> Result<Pid, SpawnError>
where
    F: FnOnce() -> Infallible,
{
    // Everything that allocates happens before the fork.
    let stdout_c = path_to_cstring(stdout_file)?;
    let stderr_c = path_to_cstring(stderr_file)?;

    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            interrupts::reset_for_child();
            let _ = setsid();
            redirect_to_file(&stdout_c, c"/dev/stdout", libc::STDOUT_FILENO);
            redirect_to_file(&stderr_c, c"/dev/stderr", libc::STDERR_FILENO);
            match child_fn() {}
        }
    }
}

/// Blocks until any child terminates and returns its PID and decoded status.
///
/// EINTR wakes the interruption checkpoint so that a SIGINT delivered while
/// blocked here surfaces as [`WaitError::Interrupted`].
pub fn wait_any() -> Result<(Pid, Status), WaitError> {
    loop {
        interrupts::check_interrupt()?;
        match nix::sys::wait::wait() {
            Ok(status) => {
                if let Some(decoded) = Status::from_wait_status(status) {
                    return Ok(decoded);
                }
                // Stop/continue notifications are not requested; skip any
                // that show up anyway.
            }
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(WaitError::Wait(source)),
        }
    }
}

/// Blocks until the given child terminates and returns its decoded status.
pub fn wait(pid: Pid) -> Result<Status, WaitError> {
    loop {
        interrupts::check_interrupt()?;
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some((_, decoded)) = Status::from_wait_status(status) {
                    return Ok(decoded);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(source) => return Err(WaitError::Wait(source)),
        }
    }
}

/// Forcibly terminates a process group and its leader.
///
/// SIGKILL goes to the group first and then to the PID itself, which covers
/// children that have not yet had the chance to run setsid(2). ESRCH is
/// expected (the process may be long gone) and ignored.
pub fn terminate_group(pid: Pid) {
    let _ = killpg(pid, Signal::SIGKILL);
    let _ = kill(pid, Signal::SIGKILL);
}

/// Replaces the current (child) process image.
///
/// On exec failure a diagnostic is written to the redirected stderr and the
/// child exits with code 127, which the interfaces classify like any other
/// unexpected exit.
pub fn exec(program: &Utf8Path, args: &[String]) -> Infallible {
    let Ok(c_program) = CString::new(program.as_str()) else {
        fail_child("Invalid test program path");
    };
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(c_program.clone());
    for arg in args {
        match CString::new(arg.as_str()) {
            Ok(c_arg) => argv.push(c_arg),
            Err(_) => fail_child("Invalid argument to test program"),
        }
    }

    match execv(&c_program, &argv) {
        Ok(infallible) => match infallible {},
        Err(_) => {
            write_raw(libc::STDERR_FILENO, "Failed to execute ");
            write_raw(libc::STDERR_FILENO, program.as_str());
            write_raw(libc::STDERR_FILENO, "\n");
            exit(127)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_from_raw_exited() {
        // A raw status of 0 is a clean exit everywhere.
        assert_eq!(Status::from_raw(0), Some(Status::Exited(0)));
    }

    #[test]
    fn status_accessors() {
        assert_eq!(Status::Exited(3).exit_status(), Some(3));
        assert!(!Status::Exited(3).signaled());
        assert!(Status::Signaled(9, false).signaled());
        assert!(!Status::Signaled(9, false).coredump());
        assert!(Status::Signaled(6, true).coredump());
    }

    #[test]
    fn fork_with_files_captures_output() {
        let dir = Utf8TempDir::new().unwrap();
        let stdout_file = dir.path().join("out.txt");
        let stderr_file = dir.path().join("err.txt");

        let pid = fork_with_files(
            || {
                write_raw(libc::STDOUT_FILENO, "to stdout");
                write_raw(libc::STDERR_FILENO, "to stderr");
                exit(0)
            },
            &stdout_file,
            &stderr_file,
        )
        .unwrap();
        let status = wait(pid).unwrap();

        assert_eq!(status, Status::Exited(0));
        assert_eq!(std::fs::read_to_string(&stdout_file).unwrap(), "to stdout");
        assert_eq!(std::fs::read_to_string(&stderr_file).unwrap(), "to stderr");
    }

    #[test]
    fn fork_with_files_appends() {
        let dir = Utf8TempDir::new().unwrap();
        let stdout_file = dir.path().join("out.txt");
        let stderr_file = dir.path().join("err.txt");
        std::fs::write(&stdout_file, "existing\n").unwrap();

        let pid = fork_with_files(
            || {
                write_raw(libc::STDOUT_FILENO, "appended");
                exit(0)
            },
            &stdout_file,
            &stderr_file,
        )
        .unwrap();
        wait(pid).unwrap();

        assert_eq!(
            std::fs::read_to_string(&stdout_file).unwrap(),
            "existing\nappended"
        );
    }

    #[test]
    fn exit_status_round_trip() {
        let dir = Utf8TempDir::new().unwrap();
        let stdout_file = dir.path().join("out.txt");
        let stderr_file = dir.path().join("err.txt");

        let pid = fork_with_files(|| exit(42), &stdout_file, &stderr_file).unwrap();
        assert_eq!(wait(pid).unwrap(), Status::Exited(42));
    }

    #[test]
    fn terminate_group_kills_child() {
        let dir = Utf8TempDir::new().unwrap();
        let stdout_file = dir.path().join("out.txt");
        let stderr_file = dir.path().join("err.txt");

        let pid = fork_with_files(
            || {
                loop {
                    std::thread::sleep(std::time::Duration::from_secs(60));
                }
            },
            &stdout_file,
            &stderr_file,
        )
        .unwrap();
        terminate_group(pid);
        let status = wait(pid).unwrap();
        assert_eq!(status, Status::Signaled(libc::SIGKILL, false));
    }
}
