// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The googletest interface.
//!
//! Listing runs the binary with `--gtest_list_tests` and reconstructs
//! `Suite.Case` identifiers from the indented output; execution selects a
//! single case with `--gtest_filter`.

use super::{check_program_exists, coredump_suffix, export_test_env_vars};
use crate::{
    errors::ListError,
    model::{Metadata, TestCase, TestCasesMap, TestProgram, TestResult},
    process::{self, Status},
};
use camino::Utf8Path;
use indexmap::IndexMap;
use std::convert::Infallible;

/// Marker googletest prints for every failed test.
static FAILED_MARKER: &str = "[  FAILED  ]";

/// Marker googletest prints when a test starts.
static RUN_MARKER: &str = "[ RUN      ]";

pub(super) fn exec_list(program: &TestProgram, _vars: &IndexMap<String, String>) -> Infallible {
    let absolute_path = program.absolute_path();
    check_program_exists(&absolute_path);
    process::exec(
        &absolute_path,
        &["--gtest_list_tests".to_owned(), "--gtest_color=no".to_owned()],
    )
}

/// Parses `--gtest_list_tests` output.
///
/// Suites are lines ending in `.`; their cases follow, indented by two
/// spaces. Both kinds of line may carry a trailing `#` comment
/// (`TypeParam` / `GetParam` annotations). Anything else outside a suite is
/// banner noise and ignored.
pub(super) fn parse_list(output: &str) -> Result<TestCasesMap, ListError> {
    let mut cases = TestCasesMap::new();
    let mut current_suite: Option<String> = None;

    for line in output.lines() {
        if line.starts_with("  ") {
            let Some(suite) = &current_suite else {
                return Err(ListError::Format(
                    "Invalid testcase definition: not preceded by a test suite definition"
                        .to_owned(),
                ));
            };
            let name = strip_comment(line).trim();
            if name.is_empty() {
                continue;
            }
            let ident = format!("{suite}{name}");
            cases.insert(ident.clone(), TestCase::new(ident, Metadata::default()));
        } else {
            let name = strip_comment(line).trim_end();
            if name.ends_with('.') {
                current_suite = Some(name.to_owned());
            }
            // Anything else is part of the start-up banner; skip it.
        }
    }

    if cases.is_empty() {
        return Err(ListError::Format("No test cases".to_owned()));
    }
    Ok(cases)
}

fn strip_comment(line: &str) -> &str {
    match line.split_once('#') {
        Some((head, _)) => head,
        None => line,
    }
}

pub(super) fn exec_test(
    program: &TestProgram,
    test_case: &TestCase,
    vars: &IndexMap<String, String>,
) -> Infallible {
    export_test_env_vars(vars);
    process::exec(
        &program.absolute_path(),
        &[
            "--gtest_color=no".to_owned(),
            format!("--gtest_filter={}", test_case.name),
        ],
    )
}

pub(super) fn compute_result(status: Option<&Status>, stdout_path: &Utf8Path) -> TestResult {
    match status {
        None => TestResult::Broken("Test case body timed out".to_owned()),
        Some(Status::Signaled(signal, core_dumped)) => TestResult::Broken(format!(
            "Error: Premature exit. Test case received signal {signal}{}",
            coredump_suffix(*core_dumped)
        )),
        Some(Status::Exited(0)) => TestResult::Passed,
        Some(Status::Exited(code)) => {
            let output = std::fs::read_to_string(stdout_path).unwrap_or_default();
            match extract_failure(&output) {
                Some(reason) => TestResult::Failed(reason),
                None => TestResult::Broken(format!(
                    "Error: Premature exit. Test case exited with code {code}"
                )),
            }
        }
    }
}

/// Extracts the failure block of the executed test: the lines between the
/// last `[ RUN      ]` marker and the first `[  FAILED  ]` marker after it.
fn extract_failure(output: &str) -> Option<String> {
    let lines: Vec<&str> = output.lines().collect();
    let run_index = lines
        .iter()
        .rposition(|line| line.starts_with(RUN_MARKER))?;
    let failed_offset = lines[run_index + 1..]
        .iter()
        .position(|line| line.starts_with(FAILED_MARKER))?;

    let block = &lines[run_index + 1..run_index + 1 + failed_offset];
    if block.is_empty() {
        return Some("Test case failed without a failure message".to_owned());
    }
    let mut reason = String::new();
    for line in block {
        reason.push_str(line);
        reason.push('\n');
    }
    Some(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn list_single_case() {
        let cases = parse_list("TestSuite.\n  TestCase\n").unwrap();
        assert_eq!(cases.len(), 1);
        assert!(cases.contains_key("TestSuite.TestCase"));
    }

    #[test]
    fn list_parameterized_cases() {
        let cases = parse_list(indoc! {r#"
            TestSuite.
              TestCase/0  # GetParam() = 'c'
              TestCase/1  # GetParam() = "herp"
        "#})
        .unwrap();
        let names: Vec<_> = cases.keys().cloned().collect();
        assert_eq!(names, ["TestSuite.TestCase/0", "TestSuite.TestCase/1"]);
    }

    #[test]
    fn list_parameterized_suite() {
        let cases = parse_list(indoc! {"
            Param/TestSuite.  # TypeParam = int
              TestCase
        "})
        .unwrap();
        assert!(cases.contains_key("Param/TestSuite.TestCase"));
    }

    #[test]
    fn list_multiple_suites() {
        let cases = parse_list(indoc! {"
            First.
              a
              b
            Second.
              c
        "})
        .unwrap();
        let names: Vec<_> = cases.keys().cloned().collect();
        assert_eq!(names, ["First.a", "First.b", "Second.c"]);
    }

    #[test]
    fn list_ignores_banner() {
        let cases = parse_list(indoc! {"
            Running main() from gmock_main.cc
            TestSuite.
              TestCase
        "})
        .unwrap();
        assert!(cases.contains_key("TestSuite.TestCase"));
    }

    #[test]
    fn list_case_without_suite_rejected() {
        let error = parse_list("  TestCase\n").unwrap_err();
        assert_eq!(
            error.to_string(),
            "Invalid testcase definition: not preceded by a test suite definition"
        );
    }

    #[test]
    fn list_empty_rejected() {
        for input in ["", "\n", "TestSuiteWithoutSeparator\n"] {
            let error = parse_list(input).unwrap_err();
            assert_eq!(error.to_string(), "No test cases");
        }
    }

    fn classify(status: Status, output: &str) -> TestResult {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let stdout_path = dir.path().join("stdout.txt");
        std::fs::write(&stdout_path, output).unwrap();
        compute_result(Some(&status), &stdout_path)
    }

    #[test]
    fn exit_success_passes() {
        assert_eq!(classify(Status::Exited(0), ""), TestResult::Passed);
    }

    #[test]
    fn failure_block_extracted() {
        let output = indoc! {"
            [==========] Running 1 test from 1 test suite.
            [ RUN      ] demo.fail
            gtest_macros_demo.cc:4: Failure
            Failed
            with a reason
            [  FAILED  ] demo.fail (0 ms)
            [==========] 1 test from 1 test suite ran. (0 ms total)
        "};
        assert_eq!(
            classify(Status::Exited(1), output),
            TestResult::Failed(
                "gtest_macros_demo.cc:4: Failure\nFailed\nwith a reason\n".to_owned()
            )
        );
    }

    #[test]
    fn exit_failure_without_marker_breaks() {
        assert_eq!(
            classify(Status::Exited(1), "no gtest output at all\n"),
            TestResult::Broken("Error: Premature exit. Test case exited with code 1".to_owned())
        );
    }

    #[test]
    fn signal_breaks() {
        assert_eq!(
            classify(Status::Signaled(6, true), ""),
            TestResult::Broken(
                "Error: Premature exit. Test case received signal 6 (core dumped)".to_owned()
            )
        );
    }

    #[test]
    fn timeout_breaks() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let stdout_path = dir.path().join("stdout.txt");
        std::fs::write(&stdout_path, "").unwrap();
        assert_eq!(
            compute_result(None, &stdout_path),
            TestResult::Broken("Test case body timed out".to_owned())
        );
    }
}
