// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! JUnit XML rendering of a stored run.
//!
//! The whole run maps to a single test suite. Context properties become
//! `<property>` elements; skip and expected-failure details, the case
//! metadata table and the captured stderr are folded into the
//! `<system-err>` section the way downstream JUnit consumers expect.

use crate::{
    driver::ScanHooks,
    model::{Context, TestProgram, TestResult},
    store::StoredResult,
};
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use std::io;

/// Header of the metadata block prepended to the stderr section.
static METADATA_PREFIX: &str = "Test case metadata\n------------------\n\n";

/// Separator between the metadata block and the real stderr contents.
static METADATA_SUFFIX: &str = "\nOriginal stderr\n---------------\n\n";

/// Converts a test program's path into a JUnit class-like name.
fn junit_classname(program: &TestProgram) -> String {
    program.relative_path.as_str().replace('/', ".")
}

/// Formats a case's metadata for the stderr preamble.
fn junit_metadata(result: &StoredResult) -> String {
    let props = result.test_case_metadata.to_properties();
    if props.is_empty() {
        return String::new();
    }
    let mut output = String::from(METADATA_PREFIX);
    for (key, value) in props {
        if value.is_empty() {
            output.push_str(&format!("{key} is empty\n"));
        } else {
            output.push_str(&format!("{key} = {value}\n"));
        }
    }
    output.push_str(METADATA_SUFFIX);
    output
}

/// Scan hook that accumulates a JUnit report.
#[derive(Debug)]
pub struct JunitHooks {
    suite: TestSuite,
}

impl JunitHooks {
    /// Creates an empty report builder.
    pub fn new() -> Self {
        Self {
            suite: TestSuite::new("corral"),
        }
    }

    /// Serializes the accumulated report.
    pub fn write(self, writer: impl io::Write) -> io::Result<()> {
        let mut report = Report::new("corral");
        report.add_test_suite(self.suite);
        report
            .serialize(writer)
            .map_err(|error| io::Error::other(error.to_string()))
    }
}

impl Default for JunitHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanHooks for JunitHooks {
    fn got_context(&mut self, context: &Context) {
        self.suite
            .add_property(("cwd", context.cwd.as_str()));
        for (name, value) in &context.env {
            self.suite
                .add_property((format!("env.{name}"), value.clone()));
        }
    }

    fn got_result(&mut self, result: &StoredResult) {
        let mut stderr_preamble = String::new();

        let status = match &result.result {
            TestResult::Passed => TestCaseStatus::success(),
            TestResult::ExpectedFailure(reason) => {
                stderr_preamble.push_str(&format!(
                    "Expected failure result details\n\
                     -------------------------------\n\
                     \n\
                     {reason}\n\
                     \n"
                ));
                TestCaseStatus::success()
            }
            TestResult::Skipped(reason) => {
                stderr_preamble.push_str(&format!(
                    "Skipped result details\n\
                     ----------------------\n\
                     \n\
                     {reason}\n\
                     \n"
                ));
                TestCaseStatus::skipped()
            }
            TestResult::Failed(reason) => {
                let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
                status.set_message(reason.clone());
                status
            }
            TestResult::Broken(reason) => {
                let mut status = TestCaseStatus::non_success(NonSuccessKind::Error);
                status.set_message(reason.clone());
                status
            }
        };

        let mut test_case = TestCase::new(result.test_case_name.clone(), status);
        test_case
            .set_classname(junit_classname(&result.program))
            .set_timestamp(result.start_time.fixed_offset())
            .set_time(result.duration());

        let stdout = String::from_utf8_lossy(&result.stdout);
        if !stdout.is_empty() {
            test_case.set_system_out(stdout.into_owned());
        }

        let mut stderr_section = stderr_preamble;
        stderr_section.push_str(&junit_metadata(result));
        let stderr = String::from_utf8_lossy(&result.stderr);
        if stderr.is_empty() {
            stderr_section.push_str("<EMPTY>\n");
        } else {
            stderr_section.push_str(&stderr);
        }
        test_case.set_system_err(stderr_section);

        self.suite.add_test_case(test_case);
    }
}
