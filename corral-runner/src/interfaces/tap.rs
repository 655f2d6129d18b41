// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The tap interface: the program emits a Test Anything Protocol stream on
//! stdout and the verdict is reconstructed from the plan and the `ok` /
//! `not ok` lines.

use super::{coredump_suffix, export_test_env_vars};
use crate::{
    model::{TestProgram, TestResult},
    process::{self, Status},
};
use camino::Utf8Path;
use indexmap::IndexMap;
use std::convert::Infallible;

pub(super) fn exec_test(program: &TestProgram, vars: &IndexMap<String, String>) -> Infallible {
    export_test_env_vars(vars);
    process::exec(&program.absolute_path(), &[])
}

#[derive(Debug, Default, Eq, PartialEq)]
struct TapSummary {
    plan: Option<u64>,
    all_skipped_reason: Option<String>,
    ok_count: u64,
    failed_count: u64,
    bailed: bool,
}

/// Parses a TAP stream.
///
/// Only the constructs the verdict depends on are recognised: the plan line
/// (with an optional `# SKIP` directive), `ok` / `not ok` test lines (where
/// `TODO` and `SKIP` directives neutralise a failure), and `Bail out!`.
/// Everything else is diagnostic noise and ignored.
fn parse_tap_output(text: &str) -> Result<TapSummary, String> {
    let mut summary = TapSummary::default();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("1..") {
            if summary.plan.is_some() {
                return Err("Output contains two TAP plans".to_owned());
            }
            let (count, directive) = match rest.split_once('#') {
                Some((count, directive)) => (count.trim(), Some(directive.trim())),
                None => (rest.trim(), None),
            };
            let count: u64 = count
                .parse()
                .map_err(|_| format!("Invalid TAP plan '{line}'"))?;
            summary.plan = Some(count);
            if let Some(directive) = directive {
                if let Some(reason) = strip_directive(directive, "SKIP") {
                    summary.all_skipped_reason = Some(if reason.is_empty() {
                        "Skipped".to_owned()
                    } else {
                        reason.to_owned()
                    });
                }
            }
        } else if line.starts_with("Bail out!") {
            summary.bailed = true;
            break;
        } else if is_test_line(line, "not ok") {
            if has_pardon_directive(line) {
                summary.ok_count += 1;
            } else {
                summary.failed_count += 1;
            }
        } else if is_test_line(line, "ok") {
            summary.ok_count += 1;
        }
    }

    Ok(summary)
}

/// Whether `line` is a test line introduced by `keyword` (`ok` or `not ok`).
fn is_test_line(line: &str, keyword: &str) -> bool {
    match line.strip_prefix(keyword) {
        None => false,
        Some("") => true,
        Some(rest) => rest.starts_with(' ') || rest.starts_with('\t'),
    }
}

/// Whether a failing test line carries a directive that pardons the failure.
fn has_pardon_directive(line: &str) -> bool {
    match line.split_once('#') {
        None => false,
        Some((_, directive)) => {
            strip_directive(directive.trim(), "TODO").is_some()
                || strip_directive(directive.trim(), "SKIP").is_some()
        }
    }
}

/// Strips a case-insensitive directive keyword, returning the trailing text.
fn strip_directive<'a>(directive: &'a str, keyword: &str) -> Option<&'a str> {
    if directive.len() < keyword.len() {
        return None;
    }
    let (head, tail) = directive.split_at(keyword.len());
    if head.eq_ignore_ascii_case(keyword) {
        Some(tail.trim())
    } else {
        None
    }
}

pub(super) fn compute_result(status: Option<&Status>, stdout_path: &Utf8Path) -> TestResult {
    let status = match status {
        None => return TestResult::Broken("Test case timed out".to_owned()),
        Some(Status::Signaled(signal, core_dumped)) => {
            return TestResult::Broken(format!(
                "Received signal {signal}{}",
                coredump_suffix(*core_dumped)
            ));
        }
        Some(status) => status,
    };

    let output = match std::fs::read_to_string(stdout_path) {
        Ok(output) => output,
        Err(error) => {
            return TestResult::Broken(format!("Failed to read test case output: {error}"));
        }
    };

    let summary = match parse_tap_output(&output) {
        Ok(summary) => summary,
        Err(message) => return TestResult::Broken(message),
    };

    if let Some(reason) = summary.all_skipped_reason {
        return TestResult::Skipped(reason);
    }
    if summary.bailed {
        return TestResult::Failed("Bailed out".to_owned());
    }
    let Some(plan) = summary.plan else {
        return TestResult::Broken("Output did not contain a TAP plan".to_owned());
    };
    if summary.ok_count + summary.failed_count != plan {
        return TestResult::Broken(
            "Reported plan differs from actual executed tests".to_owned(),
        );
    }
    if summary.failed_count > 0 {
        return TestResult::Failed(format!("{} tests of {plan} failed", summary.failed_count));
    }
    if let Some(code) = status.exit_status() {
        if code != 0 {
            return TestResult::Failed(format!("Returned non-success exit status {code}"));
        }
    }
    TestResult::Passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn classify(output: &str) -> TestResult {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let stdout_path = dir.path().join("stdout.txt");
        std::fs::write(&stdout_path, output).unwrap();
        compute_result(Some(&Status::Exited(0)), &stdout_path)
    }

    #[test]
    fn all_pass_with_todo() {
        let result = classify(indoc! {"
            1..3
            ok - 1
            ok - 2 This test also passed
            not ok - 3 This test passed # TODO Not yet done
        "});
        assert_eq!(result, TestResult::Passed);
    }

    #[test]
    fn some_failures_counted() {
        let result = classify(indoc! {"
            1..5
            ok - 1
            not ok - 2
            not ok - 3
            ok - 4
            not ok - 5
        "});
        assert_eq!(result, TestResult::Failed("3 tests of 5 failed".to_owned()));
    }

    #[test]
    fn plan_mismatch_breaks() {
        let result = classify(indoc! {"
            1..3
            ok
        "});
        assert_eq!(
            result,
            TestResult::Broken("Reported plan differs from actual executed tests".to_owned())
        );
    }

    #[test]
    fn plan_at_the_end_accepted() {
        let result = classify(indoc! {"
            ok - 1
            ok - 2
            1..2
        "});
        assert_eq!(result, TestResult::Passed);
    }

    #[test]
    fn duplicate_plan_breaks() {
        let result = classify(indoc! {"
            1..1
            ok
            1..1
        "});
        assert_eq!(
            result,
            TestResult::Broken("Output contains two TAP plans".to_owned())
        );
    }

    #[test]
    fn missing_plan_breaks() {
        let result = classify("ok - 1\n");
        assert_eq!(
            result,
            TestResult::Broken("Output did not contain a TAP plan".to_owned())
        );
    }

    #[test]
    fn bail_out_fails() {
        let result = classify(indoc! {"
            1..5
            ok - 1
            Bail out! We cannot go on.
        "});
        assert_eq!(result, TestResult::Failed("Bailed out".to_owned()));
    }

    #[test]
    fn skipped_plan_skips() {
        let result = classify("1..0 # SKIP not supported here\n");
        assert_eq!(
            result,
            TestResult::Skipped("not supported here".to_owned())
        );
    }

    #[test]
    fn skip_directive_on_test_line_is_not_a_failure() {
        let result = classify(indoc! {"
            1..2
            ok - 1
            not ok - 2 # SKIP no permissions
        "});
        assert_eq!(result, TestResult::Passed);
    }

    #[test]
    fn diagnostics_ignored() {
        let result = classify(indoc! {"
            1..1
            # a comment
            random noise
            ok - 1
        "});
        assert_eq!(result, TestResult::Passed);
    }

    #[test]
    fn okay_prefix_is_not_a_test_line() {
        let result = classify(indoc! {"
            1..1
            okay this is noise
            ok - 1
        "});
        assert_eq!(result, TestResult::Passed);
    }

    #[test]
    fn nonzero_exit_with_clean_stream_fails() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let stdout_path = dir.path().join("stdout.txt");
        std::fs::write(&stdout_path, "1..1\nok - 1\n").unwrap();
        assert_eq!(
            compute_result(Some(&Status::Exited(2)), &stdout_path),
            TestResult::Failed("Returned non-success exit status 2".to_owned())
        );
    }

    #[test]
    fn signal_overrides_stream() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let stdout_path = dir.path().join("stdout.txt");
        std::fs::write(&stdout_path, "1..1\nok - 1\n").unwrap();
        assert_eq!(
            compute_result(Some(&Status::Signaled(6, false)), &stdout_path),
            TestResult::Broken("Received signal 6".to_owned())
        );
    }

    #[test]
    fn timeout_overrides_stream() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let stdout_path = dir.path().join("stdout.txt");
        std::fs::write(&stdout_path, "1..1\nok - 1\n").unwrap();
        assert_eq!(
            compute_result(None, &stdout_path),
            TestResult::Broken("Test case timed out".to_owned())
        );
    }
}
