// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The atf interface.
//!
//! ATF test programs enumerate their cases through a self-describing listing
//! and report outcomes through a result file written into the control
//! directory. Cases with a standalone cleanup routine need an extra dance:
//! the body and the cleanup run as separate subprocesses whose exit statuses
//! are parked in cookie files, and the intermediate child exits with a magic
//! code so the parent knows to reconstruct the outcome from disk.

use super::{check_program_exists, coredump_suffix};
use crate::{
    errors::ListError,
    model::{MetadataBuilder, RequiredUser, TestCase, TestCasesMap, TestProgram, TestResult},
    process::{self, Status},
};
use camino::Utf8Path;
use indexmap::IndexMap;
use std::{convert::Infallible, time::Duration};

/// Name of the result file written by the test case's body.
static RESULT_NAME: &str = "result.body";

/// Cookie holding the body's raw exit status when the case has a cleanup.
static BODY_EXIT_COOKIE: &str = "exit.body";

/// Cookie holding the cleanup's raw exit status when the case has a cleanup.
static CLEANUP_EXIT_COOKIE: &str = "exit.cleanup";

/// Exit code of the intermediate child when body and cleanup both ran.
///
/// A test case exiting with this code on its own is out of contract and gets
/// classified from the (then missing) cookies as broken anyway.
pub(crate) const EXIT_WITH_CLEANUP: i32 = 108;

/// Listing header identifying ATF test program metadata output.
static LIST_HEADER: &str = "Content-Type: application/X-atf-tp; version=\"1\"";

pub(super) fn exec_list(program: &TestProgram, _vars: &IndexMap<String, String>) -> Infallible {
    let absolute_path = program.absolute_path();
    check_program_exists(&absolute_path);
    process::exec(&absolute_path, &["-l".to_owned()])
}

/// Parses the `-l` listing output into test cases with metadata.
pub(super) fn parse_list(output: &str) -> Result<TestCasesMap, ListError> {
    let mut lines = output.lines().peekable();

    while matches!(lines.peek(), Some(line) if line.trim().is_empty()) {
        let _ = lines.next();
    }
    match lines.next() {
        Some(line) if line.trim() == LIST_HEADER => {}
        _ => {
            return Err(ListError::Format(
                "Invalid header in test case list".to_owned(),
            ));
        }
    }

    let mut cases = TestCasesMap::new();
    let mut current: Option<(String, MetadataBuilder)> = None;

    for line in lines {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(ListError::Format(format!(
                "Invalid property line in test case list: '{line}'"
            )));
        };
        let key = key.trim();
        let value = value.trim();

        if key == "ident" {
            if let Some((name, builder)) = current.take() {
                cases.insert(name.clone(), TestCase::new(name, builder.build()));
            }
            current = Some((value.to_owned(), MetadataBuilder::new()));
        } else {
            let Some((_, builder)) = current.as_mut() else {
                return Err(ListError::Format(format!(
                    "Property '{key}' precedes the first test case identifier"
                )));
            };
            let updated = apply_property(builder.clone(), key, value)?;
            *builder = updated;
        }
    }
    if let Some((name, builder)) = current.take() {
        cases.insert(name.clone(), TestCase::new(name, builder.build()));
    }

    Ok(cases)
}

fn apply_property(
    builder: MetadataBuilder,
    key: &str,
    value: &str,
) -> Result<MetadataBuilder, ListError> {
    let builder = match key {
        "descr" => builder.set_description(value),
        "timeout" => {
            let seconds: u64 = value.parse().map_err(|_| {
                ListError::Format(format!("Invalid timeout value '{value}'"))
            })?;
            builder.set_timeout(Duration::from_secs(seconds))
        }
        "has.cleanup" => builder.set_has_cleanup(value == "true"),
        "require.arch" => value
            .split_whitespace()
            .fold(builder, |b, arch| b.add_allowed_architecture(arch)),
        "require.machine" => value
            .split_whitespace()
            .fold(builder, |b, platform| b.add_allowed_platform(platform)),
        "require.config" => value
            .split_whitespace()
            .fold(builder, |b, name| b.add_required_config(name)),
        "require.files" => value
            .split_whitespace()
            .fold(builder, |b, file| b.add_required_file(file)),
        "require.progs" => value
            .split_whitespace()
            .fold(builder, |b, prog| b.add_required_program(prog)),
        "require.memory" => builder.set_required_memory(parse_bytes(value).ok_or_else(|| {
            ListError::Format(format!("Invalid memory value '{value}'"))
        })?),
        "require.user" => {
            let user = RequiredUser::parse(value).ok_or_else(|| {
                ListError::Format(format!("Invalid required user '{value}'"))
            })?;
            builder.set_required_user(user)
        }
        _ => match key.strip_prefix("X-") {
            Some(custom_key) => builder.set_custom(custom_key, value),
            None => {
                return Err(ListError::Format(format!(
                    "Unknown metadata property '{key}'"
                )));
            }
        },
    };
    Ok(builder)
}

/// Parses a byte count with an optional k/m/g/t suffix.
fn parse_bytes(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1u64 << 10),
        'm' | 'M' => (&value[..value.len() - 1], 1u64 << 20),
        'g' | 'G' => (&value[..value.len() - 1], 1u64 << 30),
        't' | 'T' => (&value[..value.len() - 1], 1u64 << 40),
        _ => (value, 1),
    };
    digits.parse::<u64>().ok().map(|n| n * multiplier)
}

pub(super) fn exec_test(
    program: &TestProgram,
    test_case: &TestCase,
    vars: &IndexMap<String, String>,
    control_directory: &Utf8Path,
) -> Infallible {
    unsafe { std::env::set_var("__RUNNING_INSIDE_ATF_RUN", "internal-yes-value") };

    let absolute_path = program.absolute_path();
    let common_args: Vec<String> = vars
        .iter()
        .map(|(name, value)| format!("-v{name}={value}"))
        .collect();
    let result_arg = format!("-r{}", control_directory.join(RESULT_NAME));

    if !test_case.metadata.has_cleanup {
        let mut args = common_args;
        args.push(result_arg);
        args.push(test_case.name.clone());
        process::exec(&absolute_path, &args)
    } else {
        let mut body_args = common_args.clone();
        body_args.push(result_arg);
        body_args.push(format!("{}:body", test_case.name));
        run_part(
            &absolute_path,
            &body_args,
            &control_directory.join(BODY_EXIT_COOKIE),
        );

        let mut cleanup_args = common_args;
        cleanup_args.push(format!("{}:cleanup", test_case.name));
        run_part(
            &absolute_path,
            &cleanup_args,
            &control_directory.join(CLEANUP_EXIT_COOKIE),
        );

        process::exit(EXIT_WITH_CLEANUP)
    }
}

/// Runs one part of a test case (body or cleanup) in a subprocess of the
/// intermediate child and parks its raw exit status in a cookie file.
fn run_part(program: &Utf8Path, args: &[String], exit_cookie: &Utf8Path) {
    let pid = unsafe { libc::fork() };
    if pid == -1 {
        process::fail_child("fork(2) failed to run test case part");
    } else if pid == 0 {
        match process::exec(program, args) {}
    }

    let mut raw_status: libc::c_int = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut raw_status, 0) };
        if ret == pid {
            break;
        }
        if ret == -1 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            process::fail_child("waitpid(2) failed to wait for test case part");
        }
    }
    if std::fs::write(exit_cookie, raw_status.to_string()).is_err() {
        process::fail_child("Failed to write exit status cookie");
    }
}

/// Reads an exit status cookie written by [`run_part`].
///
/// A missing cookie most likely means the part never got to run because the
/// case was killed halfway through.
fn read_exit_cookie(path: &Utf8Path) -> Option<Status> {
    let raw: i32 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
    Status::from_raw(raw)
}

pub(super) fn compute_result(status: Option<&Status>, control_directory: &Utf8Path) -> TestResult {
    let result_file = control_directory.join(RESULT_NAME);

    if status.is_none() || status.and_then(Status::exit_status) == Some(EXIT_WITH_CLEANUP) {
        // Slow path: either the case timed out or it had a standalone
        // cleanup routine; both outcomes live in the on-disk cookies.
        let body_status = read_exit_cookie(&control_directory.join(BODY_EXIT_COOKIE));
        let mut cleanup_status = read_exit_cookie(&control_directory.join(CLEANUP_EXIT_COOKIE));
        if body_status.is_none() && cleanup_status.is_none() {
            // The body timed out before its cookie could be written, which
            // also means the cleanup never ran. Fake a successful cleanup so
            // the timeout classification below stays in charge.
            cleanup_status = Some(Status::Exited(0));
        }
        calculate(body_status, cleanup_status, &result_file)
    } else {
        calculate(status.copied(), Some(Status::Exited(0)), &result_file)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum AtfOutcome {
    Passed,
    Failed,
    Skipped,
    Broken,
    ExpectedFailure,
    ExpectedDeath,
    ExpectedTimeout,
    ExpectedExit(Option<i32>),
    ExpectedSignal(Option<i32>),
}

#[derive(Clone, Debug)]
struct AtfRawResult {
    outcome: AtfOutcome,
    reason: String,
}

enum ParseIssue {
    Missing,
    Bad(String),
}

/// Parses the first line of a `result.body` file.
fn parse_result_file(path: &Utf8Path) -> Result<AtfRawResult, ParseIssue> {
    let contents = std::fs::read_to_string(path).map_err(|_| ParseIssue::Missing)?;
    let line = contents.lines().next().unwrap_or("");

    if line == "passed" {
        return Ok(AtfRawResult {
            outcome: AtfOutcome::Passed,
            reason: String::new(),
        });
    }

    let Some((head, reason)) = line.split_once(": ") else {
        return Err(ParseIssue::Bad(format!("Invalid result line '{line}'")));
    };

    let (base, arg) = match head.split_once('(') {
        Some((base, rest)) => {
            let Some(digits) = rest.strip_suffix(')') else {
                return Err(ParseIssue::Bad(format!("Invalid result line '{line}'")));
            };
            let arg: i32 = digits
                .parse()
                .map_err(|_| ParseIssue::Bad(format!("Invalid result line '{line}'")))?;
            (base, Some(arg))
        }
        None => (head, None),
    };

    let outcome = match (base, arg) {
        ("failed", None) => AtfOutcome::Failed,
        ("skipped", None) => AtfOutcome::Skipped,
        ("broken", None) => AtfOutcome::Broken,
        ("expected_failure", None) => AtfOutcome::ExpectedFailure,
        ("expected_death", None) => AtfOutcome::ExpectedDeath,
        ("expected_timeout", None) => AtfOutcome::ExpectedTimeout,
        ("expected_exit", arg) => AtfOutcome::ExpectedExit(arg),
        ("expected_signal", arg) => AtfOutcome::ExpectedSignal(arg),
        _ => {
            return Err(ParseIssue::Bad(format!("Unknown result type '{base}'")));
        }
    };
    Ok(AtfRawResult {
        outcome,
        reason: reason.to_owned(),
    })
}

/// Combines the body status, the cleanup status and the result file into the
/// final classification.
fn calculate(
    body_status: Option<Status>,
    cleanup_status: Option<Status>,
    result_file: &Utf8Path,
) -> TestResult {
    let parsed = parse_result_file(result_file);

    let body_result = match body_status {
        None => match &parsed {
            Ok(raw) if raw.outcome == AtfOutcome::ExpectedTimeout => {
                TestResult::ExpectedFailure(raw.reason.clone())
            }
            Ok(raw) if raw.outcome == AtfOutcome::Skipped => {
                TestResult::Skipped(raw.reason.clone())
            }
            Ok(raw) if raw.outcome == AtfOutcome::Failed => {
                TestResult::Failed(raw.reason.clone())
            }
            Ok(raw) if raw.outcome == AtfOutcome::Broken => {
                TestResult::Broken(raw.reason.clone())
            }
            _ => TestResult::Broken("Test case body timed out".to_owned()),
        },
        Some(Status::Signaled(signal, core_dumped)) => match &parsed {
            Ok(raw) if raw.outcome == AtfOutcome::ExpectedDeath => {
                TestResult::ExpectedFailure(raw.reason.clone())
            }
            Ok(raw) => match raw.outcome {
                AtfOutcome::ExpectedSignal(arg) if arg.is_none() || arg == Some(signal) => {
                    TestResult::ExpectedFailure(raw.reason.clone())
                }
                AtfOutcome::ExpectedSignal(Some(expected)) => TestResult::Failed(format!(
                    "Test case was expected to receive signal {expected} but got {signal}"
                )),
                _ => TestResult::Broken(format!(
                    "Premature exit; test case received signal {signal}{}",
                    coredump_suffix(core_dumped)
                )),
            },
            Err(_) => TestResult::Broken(format!(
                "Premature exit; test case received signal {signal}{}",
                coredump_suffix(core_dumped)
            )),
        },
        Some(Status::Exited(code)) => match &parsed {
            Err(ParseIssue::Missing) => {
                TestResult::Broken(format!("Premature exit; test case exited with code {code}"))
            }
            Err(ParseIssue::Bad(message)) => TestResult::Broken(message.clone()),
            Ok(raw) => apply_exited(raw, code),
        },
    };

    if !body_result.good() {
        return body_result;
    }
    match cleanup_status {
        None => TestResult::Broken("Test case cleanup timed out".to_owned()),
        Some(Status::Exited(0)) => body_result,
        Some(_) => {
            TestResult::Broken("Test case cleanup did not terminate successfully".to_owned())
        }
    }
}

fn apply_exited(raw: &AtfRawResult, code: i32) -> TestResult {
    match &raw.outcome {
        AtfOutcome::Passed => {
            if code == 0 {
                TestResult::Passed
            } else {
                TestResult::Broken(format!("Test case exited with unexpected code {code}"))
            }
        }
        AtfOutcome::Failed => {
            if code != 0 {
                TestResult::Failed(raw.reason.clone())
            } else {
                TestResult::Broken("Test case exited successfully but reported failure".to_owned())
            }
        }
        AtfOutcome::Skipped => {
            if code == 0 {
                TestResult::Skipped(raw.reason.clone())
            } else {
                TestResult::Broken(format!("Test case exited with unexpected code {code}"))
            }
        }
        AtfOutcome::Broken => TestResult::Broken(raw.reason.clone()),
        AtfOutcome::ExpectedFailure => {
            if code == 0 {
                TestResult::ExpectedFailure(raw.reason.clone())
            } else {
                TestResult::Broken(format!("Test case exited with unexpected code {code}"))
            }
        }
        AtfOutcome::ExpectedDeath => {
            if code != 0 {
                TestResult::ExpectedFailure(raw.reason.clone())
            } else {
                TestResult::Failed(
                    "Test case was expected to terminate abruptly but it continued execution"
                        .to_owned(),
                )
            }
        }
        AtfOutcome::ExpectedExit(arg) => {
            if arg.is_none() || *arg == Some(code) {
                TestResult::ExpectedFailure(raw.reason.clone())
            } else {
                TestResult::Failed(format!(
                    "Test case was expected to exit with code {} but exited with code {code}",
                    arg.unwrap_or_default()
                ))
            }
        }
        AtfOutcome::ExpectedSignal(_) => TestResult::Failed(
            "Test case was expected to receive a signal but it exited normally".to_owned(),
        ),
        AtfOutcome::ExpectedTimeout => TestResult::Failed(
            "Test case was expected to hang but it continued execution".to_owned(),
        ),
    }
}
