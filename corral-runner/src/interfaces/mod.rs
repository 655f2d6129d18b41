// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test program interfaces: the conventions a program can follow to list
//! its test cases, be invoked for one case, and report an outcome.
//!
//! The set of interfaces is closed, so dispatch is a plain enum match and
//! every call site is checked for exhaustiveness. The `exec_*` operations run
//! on the child side of a fork and never return; the `parse_list` and
//! `compute_result` operations run in the parent.

mod atf;
mod googletest;
mod plain;
mod tap;

use crate::{
    errors::ListError,
    model::{TestCase, TestCasesMap, TestProgram, TestResult},
    process::{self, Status},
};
use camino::Utf8Path;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, fmt, str::FromStr};

/// The convention a test program follows.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestInterface {
    /// ATF test programs: self-describing listings, result files, optional
    /// standalone cleanup routines.
    Atf,
    /// A plain executable exposing a single test case; exit status is the
    /// verdict.
    Plain,
    /// A program that emits a Test Anything Protocol stream on stdout.
    Tap,
    /// A GoogleTest binary.
    GoogleTest,
}

impl TestInterface {
    /// The interface's registered name.
    pub fn name(&self) -> &'static str {
        match self {
            TestInterface::Atf => "atf",
            TestInterface::Plain => "plain",
            TestInterface::Tap => "tap",
            TestInterface::GoogleTest => "googletest",
        }
    }

    /// Whether listing the program's test cases requires executing it.
    ///
    /// Interfaces without a listing convention expose a single synthetic
    /// `main` test case instead.
    pub(crate) fn provides_list(&self) -> bool {
        match self {
            TestInterface::Atf | TestInterface::GoogleTest => true,
            TestInterface::Plain | TestInterface::Tap => false,
        }
    }

    /// The synthetic case list for interfaces without a listing convention.
    ///
    /// The single `main` case inherits the program-level metadata.
    pub(crate) fn default_test_cases(&self, program: &TestProgram) -> TestCasesMap {
        let mut cases = TestCasesMap::new();
        cases.insert(
            "main".to_owned(),
            TestCase::new("main", program.metadata.clone()),
        );
        cases
    }

    /// Produces the program's test case enumeration on stdout.
    ///
    /// Runs inside a just-forked child and terminates it by exec'ing the
    /// program.
    pub(crate) fn exec_list(
        &self,
        program: &TestProgram,
        vars: &IndexMap<String, String>,
    ) -> Infallible {
        match self {
            TestInterface::Atf => atf::exec_list(program, vars),
            TestInterface::GoogleTest => googletest::exec_list(program, vars),
            TestInterface::Plain | TestInterface::Tap => {
                // Listing never forks for these interfaces.
                process::fail_child("Interface does not implement a test case listing")
            }
        }
    }

    /// Reconstructs the test case list from a finished listing subprocess.
    ///
    /// `status` is `None` when the listing overran its deadline.
    pub(crate) fn parse_list(
        &self,
        status: Option<&Status>,
        stdout_path: &Utf8Path,
        stderr_path: &Utf8Path,
    ) -> Result<TestCasesMap, ListError> {
        check_list_status(status, stderr_path)?;
        let output = std::fs::read_to_string(stdout_path).map_err(ListError::Read)?;
        match self {
            TestInterface::Atf => atf::parse_list(&output),
            TestInterface::GoogleTest => googletest::parse_list(&output),
            TestInterface::Plain | TestInterface::Tap => {
                Err(ListError::Format("Interface does not implement a test case listing".into()))
            }
        }
    }

    /// Invokes one test case of the program.
    ///
    /// Runs inside a just-forked, already isolated child and terminates it
    /// by exec'ing the program (possibly after interface-specific forking of
    /// its own).
    pub(crate) fn exec_test(
        &self,
        program: &TestProgram,
        test_case: &TestCase,
        vars: &IndexMap<String, String>,
        control_directory: &Utf8Path,
    ) -> Infallible {
        match self {
            TestInterface::Atf => atf::exec_test(program, test_case, vars, control_directory),
            TestInterface::Plain => plain::exec_test(program, vars),
            TestInterface::Tap => tap::exec_test(program, vars),
            TestInterface::GoogleTest => googletest::exec_test(program, test_case, vars),
        }
    }

    /// Computes the typed result of a finished test case.
    ///
    /// `status` is `None` when the deadline killer fired, so interfaces map
    /// timeouts uniformly to their own broken-timeout messages. Parse
    /// problems are folded into `Broken` results rather than raised.
    pub(crate) fn compute_result(
        &self,
        status: Option<&Status>,
        control_directory: &Utf8Path,
        stdout_path: &Utf8Path,
        stderr_path: &Utf8Path,
    ) -> TestResult {
        let _ = stderr_path;
        match self {
            TestInterface::Atf => atf::compute_result(status, control_directory),
            TestInterface::Plain => plain::compute_result(status),
            TestInterface::Tap => tap::compute_result(status, stdout_path),
            TestInterface::GoogleTest => googletest::compute_result(status, stdout_path),
        }
    }
}

impl fmt::Display for TestInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown interface name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownInterface {
    /// The name that did not match any interface.
    pub name: String,
}

impl fmt::Display for UnknownInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown interface `{}`", self.name)
    }
}

impl std::error::Error for UnknownInterface {}

impl FromStr for TestInterface {
    type Err = UnknownInterface;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atf" => Ok(TestInterface::Atf),
            "plain" => Ok(TestInterface::Plain),
            "tap" => Ok(TestInterface::Tap),
            "googletest" => Ok(TestInterface::GoogleTest),
            _ => Err(UnknownInterface { name: s.to_owned() }),
        }
    }
}

/// Validates the termination status of a listing subprocess.
fn check_list_status(status: Option<&Status>, stderr_path: &Utf8Path) -> Result<(), ListError> {
    match status {
        None => Err(ListError::Timeout),
        Some(Status::Signaled(signal, _)) => Err(ListError::Signal { signal: *signal }),
        Some(Status::Exited(0)) => Ok(()),
        Some(Status::Exited(code)) => {
            let stderr = std::fs::read_to_string(stderr_path).unwrap_or_default();
            let stderr = stderr.trim();
            let reason = if stderr.is_empty() {
                format!("Test program did not exit cleanly (returned {code})")
            } else {
                stderr.to_owned()
            };
            Err(ListError::ExitFailure { reason })
        }
    }
}

/// Exports user configuration variables in the `TEST_ENV_<name>` convention
/// shared by the plain, tap and googletest interfaces.
///
/// Runs in the single-threaded child, where environment mutation is safe.
pub(crate) fn export_test_env_vars(vars: &IndexMap<String, String>) {
    for (name, value) in vars {
        unsafe { std::env::set_var(format!("TEST_ENV_{name}"), value) };
    }
}

/// Terminates the listing child early with a readable diagnostic when the
/// program is plainly not runnable.
pub(crate) fn check_program_exists(program: &Utf8Path) {
    if !program.exists() {
        eprintln!("Cannot find test program");
        process::exit(1);
    }
}

/// The parenthetical appended to signal messages when a core was dumped.
pub(crate) fn coredump_suffix(core_dumped: bool) -> &'static str {
    if core_dumped { " (core dumped)" } else { "" }
}
