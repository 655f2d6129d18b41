// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared helpers for the integration tests: on-the-fly shell-script test
//! programs and serialisation of executor use.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use camino::{Utf8Path, Utf8PathBuf};
use corral_runner::{
    interfaces::TestInterface,
    model::{Metadata, TestCase, TestCasesMap, TestProgram},
};
use std::{
    os::unix::fs::PermissionsExt,
    sync::{Mutex, MutexGuard},
};

/// Tests that spawn children through an executor must hold this lock:
/// `wait_any` reaps any child of the test process, so concurrent executors
/// inside one test binary would steal each other's children.
static EXEC_LOCK: Mutex<()> = Mutex::new(());

pub fn exec_lock() -> MutexGuard<'static, ()> {
    EXEC_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Writes an executable `/bin/sh` script into `dir`.
pub fn write_script(dir: &Utf8Path, name: &str, body: &str) -> Utf8PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}

/// Builds a plain-interface test program whose single `main` case carries
/// the given metadata.
pub fn plain_program(
    root: &Utf8Path,
    relative_path: &str,
    test_suite: &str,
    case_metadata: Metadata,
) -> TestProgram {
    let mut program = TestProgram::new(
        TestInterface::Plain,
        relative_path,
        root,
        test_suite,
        Metadata::default(),
    );
    let mut cases = TestCasesMap::new();
    cases.insert("main".to_owned(), TestCase::new("main", case_metadata));
    program.set_test_cases(cases);
    program
}

/// Builds a tap-interface test program with its single `main` case.
pub fn tap_program(root: &Utf8Path, relative_path: &str, test_suite: &str) -> TestProgram {
    let mut program = TestProgram::new(
        TestInterface::Tap,
        relative_path,
        root,
        test_suite,
        Metadata::default(),
    );
    let mut cases = TestCasesMap::new();
    cases.insert("main".to_owned(), TestCase::new("main", Metadata::default()));
    program.set_test_cases(cases);
    program
}

/// Builds an atf-interface test program with explicitly listed cases.
pub fn atf_program(
    root: &Utf8Path,
    relative_path: &str,
    test_suite: &str,
    cases: Vec<TestCase>,
) -> TestProgram {
    let mut program = TestProgram::new(
        TestInterface::Atf,
        relative_path,
        root,
        test_suite,
        Metadata::default(),
    );
    let mut map = TestCasesMap::new();
    for case in cases {
        map.insert(case.name.clone(), case);
    }
    program.set_test_cases(map);
    program
}
