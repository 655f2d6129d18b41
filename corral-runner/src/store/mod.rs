// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The results store: a durable, append-only record of everything a run
//! produced, scanned later by report generators.
//!
//! Logically the store is five tables: the run context, test programs, test
//! cases, results and per-case artifact files. Physically it is a single zip
//! archive holding one JSON-lines entry per table plus one raw entry per
//! artifact blob; rows appear in their tables in insertion order, which is
//! the order the read side replays them in. The whole archive is written to a
//! temporary file and atomically renamed into place on commit, so a crashed
//! or interrupted run never leaves a half-written store behind.

mod read;
mod write;

pub use read::{ReadStore, ResultsCursor, StoredResult};
pub use write::WriteStore;

use crate::{interfaces::TestInterface, model::Metadata, model::TestResult};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Artifact name under which a test's stdout is ingested.
pub static STDOUT_ARTIFACT: &str = "__STDOUT__";

/// Artifact name under which a test's stderr is ingested.
pub static STDERR_ARTIFACT: &str = "__STDERR__";

pub(crate) static CONTEXT_ENTRY: &str = "context.json";
pub(crate) static PROGRAMS_ENTRY: &str = "test_programs.jsonl";
pub(crate) static CASES_ENTRY: &str = "test_cases.jsonl";
pub(crate) static RESULTS_ENTRY: &str = "results.jsonl";

pub(crate) fn artifact_entry(test_case_id: i64, name: &str) -> String {
    format!("files/{test_case_id}/{name}")
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ProgramRow {
    pub(crate) id: i64,
    pub(crate) root: Utf8PathBuf,
    pub(crate) relative_path: Utf8PathBuf,
    pub(crate) interface: TestInterface,
    pub(crate) test_suite: String,
    pub(crate) metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CaseRow {
    pub(crate) id: i64,
    pub(crate) program_id: i64,
    pub(crate) name: String,
    pub(crate) metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ResultRow {
    pub(crate) test_case_id: i64,
    pub(crate) result: TestResult,
    pub(crate) start_us: i64,
    pub(crate) end_us: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Context, Metadata, TestProgram, TestResult};
    use camino::Utf8Path;
    use camino_tempfile::Utf8TempDir;
    use chrono::{TimeZone, Utc};
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    fn sample_program() -> TestProgram {
        TestProgram::new(
            TestInterface::Plain,
            "dir/prog",
            "/build",
            "the-suite",
            Metadata::builder().set_description("a program").build(),
        )
    }

    #[test]
    fn round_trip_full_store() {
        let dir = Utf8TempDir::new().unwrap();
        let store_path = dir.path().join("results.db");
        let stdout_file = dir.path().join("stdout.txt");
        let stderr_file = dir.path().join("stderr.txt");
        std::fs::write(&stdout_file, b"standard output bytes").unwrap();
        std::fs::write(&stderr_file, b"standard error bytes").unwrap();

        let context = Context {
            cwd: "/somewhere".into(),
            env: IndexMap::from([("HOME".to_owned(), "/home/nobody".to_owned())]),
        };
        let start = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let end = start + chrono::TimeDelta::milliseconds(1500);

        let mut store = WriteStore::create(&store_path).unwrap();
        store.put_context(context.clone()).unwrap();
        let program_id = store.put_test_program(&sample_program());
        let case_id = store.put_test_case(program_id, "main", &Metadata::default());
        store
            .put_result(
                case_id,
                &TestResult::Failed("boom".to_owned()),
                start,
                end,
            )
            .unwrap();
        store
            .put_artifact(STDOUT_ARTIFACT, &stdout_file, case_id)
            .unwrap();
        store
            .put_artifact(STDERR_ARTIFACT, &stderr_file, case_id)
            .unwrap();
        store.commit().unwrap();

        let mut read = ReadStore::open(&store_path).unwrap();
        assert_eq!(read.context(), &context);

        let mut cursor = read.results_cursor();
        let row = cursor.next().unwrap().expect("one result stored");
        assert_eq!(row.program.relative_path, Utf8Path::new("dir/prog"));
        assert_eq!(row.program.test_suite, "the-suite");
        assert_eq!(row.test_case_name, "main");
        assert_eq!(row.result, TestResult::Failed("boom".to_owned()));
        assert_eq!(row.start_time, start);
        assert_eq!(row.end_time, end);
        assert_eq!(row.duration(), std::time::Duration::from_millis(1500));
        assert_eq!(row.stdout, b"standard output bytes");
        assert_eq!(row.stderr, b"standard error bytes");
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn results_replay_in_insertion_order() {
        let dir = Utf8TempDir::new().unwrap();
        let store_path = dir.path().join("results.db");

        let mut store = WriteStore::create(&store_path).unwrap();
        store.put_context(Context::current()).unwrap();
        let program_id = store.put_test_program(&sample_program());
        let now = Utc::now();
        // Insert results out of test-case-id order on purpose.
        let ids: Vec<i64> = (0..5)
            .map(|i| store.put_test_case(program_id, format!("case{i}"), &Metadata::default()))
            .collect();
        for &id in ids.iter().rev() {
            store
                .put_result(id, &TestResult::Passed, now, now)
                .unwrap();
        }
        store.commit().unwrap();

        let mut read = ReadStore::open(&store_path).unwrap();
        let mut seen = Vec::new();
        let mut cursor = read.results_cursor();
        while let Some(row) = cursor.next().unwrap() {
            seen.push(row.test_case_name);
        }
        assert_eq!(seen, ["case4", "case3", "case2", "case1", "case0"]);
    }

    #[test]
    fn missing_artifacts_read_as_empty() {
        let dir = Utf8TempDir::new().unwrap();
        let store_path = dir.path().join("results.db");

        let mut store = WriteStore::create(&store_path).unwrap();
        store.put_context(Context::current()).unwrap();
        let program_id = store.put_test_program(&sample_program());
        let case_id = store.put_test_case(program_id, "main", &Metadata::default());
        let now = Utc::now();
        store
            .put_result(case_id, &TestResult::Passed, now, now)
            .unwrap();
        store.commit().unwrap();

        let mut read = ReadStore::open(&store_path).unwrap();
        let mut cursor = read.results_cursor();
        let row = cursor.next().unwrap().unwrap();
        assert!(row.stdout.is_empty());
        assert!(row.stderr.is_empty());
    }

    #[test]
    fn uncommitted_store_leaves_no_file() {
        let dir = Utf8TempDir::new().unwrap();
        let store_path = dir.path().join("results.db");
        {
            let mut store = WriteStore::create(&store_path).unwrap();
            store.put_context(Context::current()).unwrap();
            // Dropped without commit: the transaction rolls back.
        }
        assert!(!store_path.exists());
    }

    #[test]
    fn duplicate_context_rejected() {
        let dir = Utf8TempDir::new().unwrap();
        let store_path = dir.path().join("results.db");
        let mut store = WriteStore::create(&store_path).unwrap();
        store.put_context(Context::current()).unwrap();
        assert!(matches!(
            store.put_context(Context::current()),
            Err(crate::errors::StoreError::DuplicateContext)
        ));
    }

    #[test]
    fn open_missing_store_fails() {
        let dir = Utf8TempDir::new().unwrap();
        assert!(matches!(
            ReadStore::open(&dir.path().join("absent.db")),
            Err(crate::errors::StoreError::Open { .. })
        ));
    }

    #[test]
    fn open_garbage_store_fails() {
        let dir = Utf8TempDir::new().unwrap();
        let store_path = dir.path().join("garbage.db");
        std::fs::write(&store_path, "this is not a store").unwrap();
        assert!(ReadStore::open(&store_path).is_err());
    }
}
