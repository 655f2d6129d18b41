// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Best-effort stack trace collection for crashed test programs.
//!
//! When a test dies with a signal and dumps core, a short gdb invocation is
//! appended to the test's stderr capture to aid post-mortem diagnosis. Every
//! failure mode along the way turns into a diagnostic line in that capture;
//! nothing here ever aborts the run.

use crate::{deadline, process::Status, requirements};
use camino::{Utf8Path, Utf8PathBuf};
use nix::unistd::Pid;
use std::{
    fs::OpenOptions,
    io::Write,
    process::{Command, Stdio},
    time::Duration,
};

/// Time allowed for the external debugger to produce a trace.
const GDB_TIMEOUT: Duration = Duration::from_secs(300);

/// Appends a stack trace of `program` to `output_file` if the given status
/// says it crashed and dumped core.
pub(crate) fn dump_stacktrace_if_available(
    program: &Utf8Path,
    status: Option<&Status>,
    work_directory: &Utf8Path,
    output_file: &Utf8Path,
) {
    let Some(status) = status else { return };
    let Status::Signaled(signal, true) = status else {
        return;
    };

    let mut output = match OpenOptions::new().append(true).open(output_file) {
        Ok(output) => output,
        Err(error) => {
            tracing::warn!("cannot append stack trace to {output_file}: {error}");
            return;
        }
    };

    let _ = writeln!(
        output,
        "Test program received signal {signal} and dumped core; \
         attempting to gather stack trace"
    );
    dump_stacktrace(program, work_directory, &mut output);
}

fn dump_stacktrace(program: &Utf8Path, work_directory: &Utf8Path, output: &mut dyn Write) {
    let Some(gdb) = requirements::find_in_path("gdb") else {
        let _ = writeln!(output, "Cannot find GDB binary in PATH");
        return;
    };

    let Some(core_file) = find_core(program, work_directory) else {
        let _ = writeln!(output, "Cannot find any core file");
        return;
    };

    let child = Command::new(&gdb)
        .args(["-batch", "-q", "-ex", "bt"])
        .arg(program)
        .arg(&core_file)
        .current_dir(work_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(error) => {
            let _ = writeln!(output, "Failed to execute GDB: {error}");
            return;
        }
    };

    let mut timer = deadline::register(GDB_TIMEOUT, Pid::from_raw(child.id() as i32));
    let result = child.wait_with_output();
    let fired = timer.unschedule();

    match result {
        Ok(gdb_output) => {
            for line in String::from_utf8_lossy(&gdb_output.stdout).lines() {
                let _ = writeln!(output, "gdb stdout: {line}");
            }
            for line in String::from_utf8_lossy(&gdb_output.stderr).lines() {
                let _ = writeln!(output, "gdb stderr: {line}");
            }
            if gdb_output.status.success() && !fired {
                let _ = writeln!(output, "GDB exited successfully");
            } else {
                let _ = writeln!(output, "GDB failed; see output above for details");
            }
        }
        Err(error) => {
            let _ = writeln!(output, "Failed to wait for GDB: {error}");
        }
    }
}

/// Looks for a core file produced by `program` inside `work_directory`.
fn find_core(program: &Utf8Path, work_directory: &Utf8Path) -> Option<Utf8PathBuf> {
    let program_core = program
        .file_name()
        .map(|name| format!("{name}.core"))
        .unwrap_or_default();
    let entries = work_directory.read_dir_utf8().ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name == "core" || name.starts_with("core.") || name == program_core {
            return Some(entry.path().to_owned());
        }
    }
    None
}
