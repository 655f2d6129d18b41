// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Child-side isolation applied between fork and exec.
//!
//! Every test case gets a scrubbed environment, a private home and temporary
//! directory, a known umask, and its work directory as the working directory.
//! Cases that ask for it are additionally switched to the configured
//! unprivileged user.

use crate::{config::UnprivilegedUser, process};
use camino::Utf8Path;
use nix::{
    sys::stat::{Mode, umask},
    unistd::{Gid, Uid, chdir, chown, setgid, setgroups, setuid},
};

/// Environment variables that leak host-specific behaviour into tests.
const CLEAN_VARS: [&str; 9] = [
    "LANG",
    "LC_ALL",
    "LC_COLLATE",
    "LC_CTYPE",
    "LC_MESSAGES",
    "LC_MONETARY",
    "LC_NUMERIC",
    "LC_TIME",
    "TZ",
];

/// Sanitises the calling (child) process for test execution.
///
/// Failures abort the child; the parent sees the abort as a broken test.
pub(crate) fn isolate_child(
    unprivileged_user: Option<&UnprivilegedUser>,
    work_directory: &Utf8Path,
) {
    // The child is single-threaded from fork onwards, which makes the
    // environment mutations safe.
    for name in CLEAN_VARS {
        unsafe { std::env::remove_var(name) };
    }
    unsafe {
        std::env::set_var("HOME", work_directory);
        std::env::set_var("TMPDIR", work_directory);
    }

    let _ = umask(Mode::from_bits_truncate(0o022));

    if let Err(error) = chdir(work_directory.as_std_path()) {
        process::fail_child(&format!(
            "Failed to enter work directory {work_directory}: {error}"
        ));
    }

    if let Some(user) = unprivileged_user {
        drop_privileges(user);
    }
}

/// Changes the ownership of an executor-controlled path so that an
/// unprivileged test can write its control files into it.
pub(crate) fn isolate_path(unprivileged_user: Option<&UnprivilegedUser>, path: &Utf8Path) {
    if let Some(user) = unprivileged_user {
        if let Err(error) =
            chown_recursive(path, Uid::from_raw(user.uid), Gid::from_raw(user.gid))
        {
            process::fail_child(&format!("Failed to chown {path} to {}: {error}", user.name));
        }
    }
}

fn drop_privileges(user: &UnprivilegedUser) {
    let gid = Gid::from_raw(user.gid);
    let uid = Uid::from_raw(user.uid);
    if let Err(error) = setgroups(&[gid]) {
        process::fail_child(&format!("Failed to reset supplementary groups: {error}"));
    }
    if let Err(error) = setgid(gid) {
        process::fail_child(&format!("Failed to drop group privileges: {error}"));
    }
    if let Err(error) = setuid(uid) {
        process::fail_child(&format!("Failed to drop user privileges: {error}"));
    }
}

fn chown_recursive(path: &Utf8Path, uid: Uid, gid: Gid) -> Result<(), nix::Error> {
    chown(path.as_std_path(), Some(uid), Some(gid))?;
    if path.is_dir() {
        let entries = match path.read_dir_utf8() {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            chown_recursive(entry.path(), uid, gid)?;
        }
    }
    Ok(())
}
