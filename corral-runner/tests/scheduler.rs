// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for the run driver: manifest in, results store out.

mod common;

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use common::{exec_lock, write_script};
use corral_runner::{
    config::UserConfig,
    driver::{self, RunHooks},
    model::{TEST_CASES_LIST_CASE, TestProgram, TestResult},
    report_junit::JunitHooks,
    scanner::TestFilter,
    store::ReadStore,
};
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, fmt::Write as _, time::Duration};

/// Hook that records the order of events for assertions.
#[derive(Debug, Default)]
struct RecordingHooks {
    selected: Vec<String>,
    finished: Vec<(String, TestResult)>,
}

impl RunHooks for RecordingHooks {
    fn got_test_case(&mut self, program: &TestProgram, test_case_name: &str) {
        self.selected
            .push(format!("{}:{test_case_name}", program.relative_path));
    }

    fn got_result(
        &mut self,
        program: &TestProgram,
        test_case_name: &str,
        result: &TestResult,
        _duration: Duration,
    ) {
        self.finished.push((
            format!("{}:{test_case_name}", program.relative_path),
            result.clone(),
        ));
    }
}

/// Writes a manifest declaring plain programs `t_0` .. `t_{count-1}` where
/// program `i` exits with status `i % 2`.
fn build_tree(dir: &Utf8Path, count: usize) -> Utf8PathBuf {
    let mut manifest = String::from("test_suite = \"integration\"\n");
    for i in 0..count {
        write_script(dir, &format!("t_{i}"), &format!("exit {}\n", i % 2));
        let _ = write!(
            manifest,
            "\n[[test_program]]\ninterface = \"plain\"\npath = \"t_{i}\"\n"
        );
    }
    let manifest_path = dir.join("Kyuafile.toml");
    std::fs::write(&manifest_path, manifest).unwrap();
    manifest_path
}

#[test]
fn full_run_records_every_result() {
    let _guard = exec_lock();
    let dir = Utf8TempDir::new().unwrap();
    let manifest_path = build_tree(dir.path(), 6);
    let store_path = dir.path().join("results.db");

    let mut config = UserConfig::default();
    config.parallelism = 4;
    let mut hooks = RecordingHooks::default();
    let run_result = driver::run_tests(
        &manifest_path,
        None,
        &store_path,
        Vec::new(),
        &config,
        &mut hooks,
    )
    .unwrap();

    assert_eq!(run_result.stats.total, 6);
    assert_eq!(run_result.stats.good, 3);
    assert_eq!(run_result.stats.bad, 3);
    assert!(run_result.unused_filters.is_empty());
    assert_eq!(hooks.selected.len(), 6);
    assert_eq!(hooks.finished.len(), 6);

    // Exactly one stored result per selected case, with the right verdicts.
    let mut store = ReadStore::open(&store_path).unwrap();
    assert_eq!(store.results_count(), 6);
    let mut by_program: BTreeMap<String, TestResult> = BTreeMap::new();
    let mut cursor = store.results_cursor();
    while let Some(row) = cursor.next().unwrap() {
        assert_eq!(row.test_case_name, "main");
        assert!(row.end_time >= row.start_time);
        by_program.insert(row.program.relative_path.to_string(), row.result);
    }
    for i in 0..6 {
        let expected = if i % 2 == 0 {
            TestResult::Passed
        } else {
            TestResult::Failed("Returned non-success exit status 1".to_owned())
        };
        assert_eq!(by_program[&format!("t_{i}")], expected, "t_{i}");
    }
}

#[test]
fn serial_run_has_monotonic_end_times() {
    let _guard = exec_lock();
    let dir = Utf8TempDir::new().unwrap();
    let manifest_path = build_tree(dir.path(), 4);
    let store_path = dir.path().join("results.db");

    let config = UserConfig::default();
    assert_eq!(config.parallelism, 1);
    driver::run_tests(
        &manifest_path,
        None,
        &store_path,
        Vec::new(),
        &config,
        &mut driver::NoopRunHooks,
    )
    .unwrap();

    let mut store = ReadStore::open(&store_path).unwrap();
    let mut previous_end = None;
    let mut cursor = store.results_cursor();
    while let Some(row) = cursor.next().unwrap() {
        if let Some(previous) = previous_end {
            assert!(row.end_time >= previous);
        }
        previous_end = Some(row.end_time);
    }
}

#[test]
fn artifacts_are_ingested() {
    let _guard = exec_lock();
    let dir = Utf8TempDir::new().unwrap();
    write_script(
        dir.path(),
        "t_noisy",
        "echo to stdout\necho to stderr >&2\nexit 0\n",
    );
    let manifest_path = dir.path().join("Kyuafile.toml");
    std::fs::write(
        &manifest_path,
        "test_suite = \"s\"\n\n[[test_program]]\ninterface = \"plain\"\npath = \"t_noisy\"\n",
    )
    .unwrap();
    let store_path = dir.path().join("results.db");

    driver::run_tests(
        &manifest_path,
        None,
        &store_path,
        Vec::new(),
        &UserConfig::default(),
        &mut driver::NoopRunHooks,
    )
    .unwrap();

    let mut store = ReadStore::open(&store_path).unwrap();
    let mut cursor = store.results_cursor();
    let row = cursor.next().unwrap().unwrap();
    assert_eq!(row.stdout, b"to stdout\n");
    assert_eq!(row.stderr, b"to stderr\n");
}

#[test]
fn filters_select_and_unused_filters_surface() {
    let _guard = exec_lock();
    let dir = Utf8TempDir::new().unwrap();
    let manifest_path = build_tree(dir.path(), 4);
    let store_path = dir.path().join("results.db");

    let filters = vec![
        "t_2".parse::<TestFilter>().unwrap(),
        "t_no_such_program".parse::<TestFilter>().unwrap(),
    ];
    let run_result = driver::run_tests(
        &manifest_path,
        None,
        &store_path,
        filters,
        &UserConfig::default(),
        &mut driver::NoopRunHooks,
    )
    .unwrap();

    assert_eq!(run_result.stats.total, 1);
    assert_eq!(
        run_result.unused_filters,
        vec!["t_no_such_program".parse::<TestFilter>().unwrap()]
    );

    let mut store = ReadStore::open(&store_path).unwrap();
    assert_eq!(store.results_count(), 1);
    let mut cursor = store.results_cursor();
    let row = cursor.next().unwrap().unwrap();
    assert_eq!(row.program.relative_path, Utf8Path::new("t_2"));
}

#[test]
fn atf_programs_are_listed_and_run() {
    let _guard = exec_lock();
    let dir = Utf8TempDir::new().unwrap();
    write_script(
        dir.path(),
        "t_atf",
        r#"if [ "$1" = "-l" ]; then
  printf 'Content-Type: application/X-atf-tp; version="1"\n'
  printf '\n'
  printf 'ident: first\n'
  printf '\n'
  printf 'ident: second\n'
  exit 0
fi
rfile=
for arg in "$@"; do
  case "$arg" in
    -r*) rfile="${arg#-r}" ;;
    *) case_name="$arg" ;;
  esac
done
if [ "$case_name" = "first" ]; then
  echo "passed" > "$rfile"
  exit 0
else
  echo "failed: second failed" > "$rfile"
  exit 1
fi
"#,
    );
    let manifest_path = dir.path().join("Kyuafile.toml");
    std::fs::write(
        &manifest_path,
        "test_suite = \"s\"\n\n[[test_program]]\ninterface = \"atf\"\npath = \"t_atf\"\n",
    )
    .unwrap();
    let store_path = dir.path().join("results.db");

    let run_result = driver::run_tests(
        &manifest_path,
        None,
        &store_path,
        Vec::new(),
        &UserConfig::default(),
        &mut driver::NoopRunHooks,
    )
    .unwrap();
    assert_eq!(run_result.stats.total, 2);
    assert_eq!(run_result.stats.good, 1);

    let mut store = ReadStore::open(&store_path).unwrap();
    let mut results: BTreeMap<String, TestResult> = BTreeMap::new();
    let mut cursor = store.results_cursor();
    while let Some(row) = cursor.next().unwrap() {
        results.insert(row.test_case_name.clone(), row.result.clone());
    }
    assert_eq!(results["first"], TestResult::Passed);
    assert_eq!(
        results["second"],
        TestResult::Failed("second failed".to_owned())
    );
}

#[test]
fn broken_listing_is_reported_through_the_store() {
    let _guard = exec_lock();
    let dir = Utf8TempDir::new().unwrap();
    write_script(dir.path(), "t_bad", "echo 'no listing here' >&2\nexit 2\n");
    let manifest_path = dir.path().join("Kyuafile.toml");
    std::fs::write(
        &manifest_path,
        "test_suite = \"s\"\n\n[[test_program]]\ninterface = \"googletest\"\npath = \"t_bad\"\n",
    )
    .unwrap();
    let store_path = dir.path().join("results.db");

    let run_result = driver::run_tests(
        &manifest_path,
        None,
        &store_path,
        Vec::new(),
        &UserConfig::default(),
        &mut driver::NoopRunHooks,
    )
    .unwrap();
    assert_eq!(run_result.stats.total, 1);
    assert_eq!(run_result.stats.bad, 1);

    let mut store = ReadStore::open(&store_path).unwrap();
    let mut cursor = store.results_cursor();
    let row = cursor.next().unwrap().unwrap();
    assert_eq!(row.test_case_name, TEST_CASES_LIST_CASE);
    assert_eq!(row.result, TestResult::Broken("no listing here".to_owned()));
}

#[test]
fn same_program_inserted_once() {
    let _guard = exec_lock();
    let dir = Utf8TempDir::new().unwrap();
    write_script(
        dir.path(),
        "t_multi",
        r#"if [ "$1" = "-l" ]; then
  printf 'Content-Type: application/X-atf-tp; version="1"\n'
  printf '\n'
  printf 'ident: one\n'
  printf '\n'
  printf 'ident: two\n'
  printf '\n'
  printf 'ident: three\n'
  exit 0
fi
rfile=
for arg in "$@"; do
  case "$arg" in
    -r*) rfile="${arg#-r}" ;;
  esac
done
echo "passed" > "$rfile"
exit 0
"#,
    );
    let manifest_path = dir.path().join("Kyuafile.toml");
    std::fs::write(
        &manifest_path,
        "test_suite = \"s\"\n\n[[test_program]]\ninterface = \"atf\"\npath = \"t_multi\"\n",
    )
    .unwrap();
    let store_path = dir.path().join("results.db");

    driver::run_tests(
        &manifest_path,
        None,
        &store_path,
        Vec::new(),
        &UserConfig::default(),
        &mut driver::NoopRunHooks,
    )
    .unwrap();

    // Three cases of one program share one stored program row.
    let mut store = ReadStore::open(&store_path).unwrap();
    assert_eq!(store.programs_count(), 1);
    assert_eq!(store.results_count(), 3);
    let mut cursor = store.results_cursor();
    while let Some(row) = cursor.next().unwrap() {
        assert_eq!(row.program.relative_path, Utf8Path::new("t_multi"));
        assert_eq!(row.result, TestResult::Passed);
    }
}

#[test]
fn junit_report_from_completed_store() {
    let _guard = exec_lock();
    let dir = Utf8TempDir::new().unwrap();
    let manifest_path = build_tree(dir.path(), 2);
    let store_path = dir.path().join("results.db");

    driver::run_tests(
        &manifest_path,
        None,
        &store_path,
        Vec::new(),
        &UserConfig::default(),
        &mut driver::NoopRunHooks,
    )
    .unwrap();

    let mut hooks = JunitHooks::new();
    driver::scan_results(&store_path, &mut hooks).unwrap();
    let mut bytes = Vec::new();
    hooks.write(&mut bytes).unwrap();
    let xml = String::from_utf8(bytes).unwrap();

    assert!(xml.contains("<testsuite"), "{xml}");
    assert!(xml.contains("classname=\"t_0\""), "{xml}");
    assert!(xml.contains("classname=\"t_1\""), "{xml}");
    assert!(xml.contains("<failure"), "{xml}");
    assert!(xml.contains("name=\"cwd\""), "{xml}");
}
