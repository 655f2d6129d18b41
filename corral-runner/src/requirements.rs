// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Evaluation of a test case's execution requirements against the current
//! host and configuration.
//!
//! The check runs in the child, after isolation, so that requirement
//! evaluation parallelises with the rest of the run. A non-empty return value
//! is the reason the case has to be skipped.

use crate::{
    config::UserConfig,
    model::{Metadata, RequiredUser},
};
use camino::{Utf8Path, Utf8PathBuf};
use nix::unistd::Uid;

/// Checks whether the requirements in `metadata` are satisfied.
///
/// Returns `None` when the test can run, or the skip reason otherwise.
pub fn check_requirements(
    metadata: &Metadata,
    test_suite: &str,
    user_config: &UserConfig,
) -> Option<String> {
    for name in &metadata.required_configs {
        // The unprivileged-user requirement refers to the top-level
        // configuration entry, not to a per-suite variable.
        let defined = if name == "unprivileged-user" {
            user_config.unprivileged_user.is_some()
        } else {
            user_config.has_test_suite_var(test_suite, name)
        };
        if !defined {
            return Some(format!(
                "Required configuration property '{name}' not defined"
            ));
        }
    }

    if !metadata.allowed_architectures.is_empty() {
        let arch = std::env::consts::ARCH;
        if !metadata.allowed_architectures.contains(arch) {
            return Some(format!("Current architecture '{arch}' not supported"));
        }
    }

    if !metadata.allowed_platforms.is_empty() {
        let platform = std::env::consts::OS;
        if !metadata.allowed_platforms.contains(platform) {
            return Some(format!("Current platform '{platform}' not supported"));
        }
    }

    match metadata.required_user {
        RequiredUser::Any => {}
        RequiredUser::Root => {
            if !Uid::effective().is_root() {
                return Some("Requires root privileges".to_owned());
            }
        }
        RequiredUser::Unprivileged => {
            if !Uid::effective().is_root() {
                return Some(
                    "Requires root privileges to drop to an unprivileged user".to_owned(),
                );
            }
            if user_config.unprivileged_user.is_none() {
                return Some(
                    "Requires an unprivileged user but the unprivileged-user configuration \
                     variable is not defined"
                        .to_owned(),
                );
            }
        }
    }

    for file in &metadata.required_files {
        if !file.exists() {
            return Some(format!("Required file '{file}' not found"));
        }
    }

    for program in &metadata.required_programs {
        if program.is_absolute() {
            if !program.exists() {
                return Some(format!("Required program '{program}' not found"));
            }
        } else if find_in_path(program.as_str()).is_none() {
            return Some(format!("Required program '{program}' not found in PATH"));
        }
    }

    if metadata.required_memory > 0 {
        if let Some(available) = physical_memory() {
            if available < metadata.required_memory {
                return Some(format!(
                    "Requires {} bytes of physical memory but only {} available",
                    metadata.required_memory, available
                ));
            }
        }
    }

    None
}

/// Looks up a program name in the `PATH`.
pub(crate) fn find_in_path(name: &str) -> Option<Utf8PathBuf> {
    let path = std::env::var("PATH").ok()?;
    for dir in path.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Utf8Path::new(dir).join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// The amount of physical memory on this host, if it can be determined.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "macos"
))]
fn physical_memory() -> Option<u64> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        None
    } else {
        Some(pages as u64 * page_size as u64)
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "macos"
)))]
fn physical_memory() -> Option<u64> {
    None
}
