// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The plain interface: one executable, one test case, exit status is the
//! verdict.

use super::{coredump_suffix, export_test_env_vars};
use crate::{
    model::{TestProgram, TestResult},
    process::{self, Status},
};
use indexmap::IndexMap;
use std::convert::Infallible;

pub(super) fn exec_test(program: &TestProgram, vars: &IndexMap<String, String>) -> Infallible {
    export_test_env_vars(vars);
    process::exec(&program.absolute_path(), &[])
}

pub(super) fn compute_result(status: Option<&Status>) -> TestResult {
    match status {
        None => TestResult::Broken("Test case timed out".to_owned()),
        Some(Status::Exited(0)) => TestResult::Passed,
        Some(Status::Exited(code)) => {
            TestResult::Failed(format!("Returned non-success exit status {code}"))
        }
        Some(Status::Signaled(signal, core_dumped)) => TestResult::Broken(format!(
            "Received signal {signal}{}",
            coredump_suffix(*core_dumped)
        )),
    }
}
