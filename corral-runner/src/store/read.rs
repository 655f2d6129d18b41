// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The read side of the results store.

use super::{
    CASES_ENTRY, CONTEXT_ENTRY, CaseRow, PROGRAMS_ENTRY, ProgramRow, RESULTS_ENTRY, ResultRow,
    STDERR_ARTIFACT, STDOUT_ARTIFACT, artifact_entry,
};
use crate::{
    errors::StoreError,
    model::{Context, Metadata, TestProgram, TestResult},
};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::{collections::HashMap, fs::File, io::Read, time::Duration};
use zip::{ZipArchive, result::ZipError};

/// One tuple yielded by [`ResultsCursor`]: everything a report generator
/// needs about one executed test case.
#[derive(Clone, Debug)]
pub struct StoredResult {
    /// The owning test program, reconstructed from its stored row.
    pub program: TestProgram,

    /// The test case's name.
    pub test_case_name: String,

    /// The test case's metadata.
    pub test_case_metadata: Metadata,

    /// The recorded result.
    pub result: TestResult,

    /// When the case was spawned.
    pub start_time: DateTime<Utc>,

    /// When the case was waited for.
    pub end_time: DateTime<Utc>,

    /// The captured stdout bytes; empty if none were stored.
    pub stdout: Vec<u8>,

    /// The captured stderr bytes; empty if none were stored.
    pub stderr: Vec<u8>,
}

impl StoredResult {
    /// Wall-clock duration of the execution.
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time).to_std().unwrap_or_default()
    }
}

/// Read-only view of a committed results store.
pub struct ReadStore {
    archive: ZipArchive<File>,
    context: Context,
    programs: HashMap<i64, ProgramRow>,
    cases: HashMap<i64, CaseRow>,
    results: Vec<ResultRow>,
}

impl ReadStore {
    /// Opens the store at `path`.
    pub fn open(path: &Utf8Path) -> Result<Self, StoreError> {
        let file = File::open(path).map_err(|source| StoreError::Open {
            path: path.to_owned(),
            source,
        })?;
        let mut archive = ZipArchive::new(file).map_err(|error| match error {
            ZipError::Io(source) => StoreError::Open {
                path: path.to_owned(),
                source,
            },
            other => StoreError::Container(other),
        })?;

        let context: Context =
            serde_json::from_str(&read_entry(&mut archive, CONTEXT_ENTRY)?)
                .map_err(StoreError::Encode)?;
        let programs: HashMap<i64, ProgramRow> =
            parse_rows::<ProgramRow>(&read_entry(&mut archive, PROGRAMS_ENTRY)?)?
                .into_iter()
                .map(|row| (row.id, row))
                .collect();
        let cases: HashMap<i64, CaseRow> =
            parse_rows::<CaseRow>(&read_entry(&mut archive, CASES_ENTRY)?)?
                .into_iter()
                .map(|row| (row.id, row))
                .collect();
        let results = parse_rows::<ResultRow>(&read_entry(&mut archive, RESULTS_ENTRY)?)?;

        Ok(Self {
            archive,
            context,
            programs,
            cases,
            results,
        })
    }

    /// The run context captured when the store was produced.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Number of stored results.
    pub fn results_count(&self) -> usize {
        self.results.len()
    }

    /// Number of stored test program rows.
    pub fn programs_count(&self) -> usize {
        self.programs.len()
    }

    /// A forward cursor over the stored results, in insertion order.
    pub fn results_cursor(&mut self) -> ResultsCursor<'_> {
        ResultsCursor {
            store: self,
            next: 0,
        }
    }

    fn read_artifact(&mut self, test_case_id: i64, name: &str) -> Result<Vec<u8>, StoreError> {
        match self.archive.by_name(&artifact_entry(test_case_id, name)) {
            Ok(mut entry) => {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes).map_err(StoreError::Io)?;
                Ok(bytes)
            }
            Err(ZipError::FileNotFound) => Ok(Vec::new()),
            Err(other) => Err(StoreError::Container(other)),
        }
    }

    fn build_row(&mut self, index: usize) -> Result<StoredResult, StoreError> {
        let row = &self.results[index];
        let test_case_id = row.test_case_id;
        let result = row.result.clone();
        let start_us = row.start_us;
        let end_us = row.end_us;

        let case = self.cases.get(&test_case_id).ok_or_else(|| {
            StoreError::Corrupt {
                message: format!("result references unknown test case {test_case_id}"),
            }
        })?;
        let program_row = self.programs.get(&case.program_id).ok_or_else(|| {
            StoreError::Corrupt {
                message: format!("test case references unknown program {}", case.program_id),
            }
        })?;

        let program = TestProgram::new(
            program_row.interface,
            program_row.relative_path.clone(),
            program_row.root.clone(),
            program_row.test_suite.clone(),
            program_row.metadata.clone(),
        );
        let test_case_name = case.name.clone();
        let test_case_metadata = case.metadata.clone();

        let start_time = decode_timestamp(start_us)?;
        let end_time = decode_timestamp(end_us)?;
        let stdout = self.read_artifact(test_case_id, STDOUT_ARTIFACT)?;
        let stderr = self.read_artifact(test_case_id, STDERR_ARTIFACT)?;

        Ok(StoredResult {
            program,
            test_case_name,
            test_case_metadata,
            result,
            start_time,
            end_time,
            stdout,
            stderr,
        })
    }
}

impl std::fmt::Debug for ReadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStore")
            .field("programs", &self.programs.len())
            .field("cases", &self.cases.len())
            .field("results", &self.results.len())
            .finish_non_exhaustive()
    }
}

/// Forward cursor over stored results.
#[derive(Debug)]
pub struct ResultsCursor<'a> {
    store: &'a mut ReadStore,
    next: usize,
}

impl ResultsCursor<'_> {
    /// Yields the next stored result, or `None` at the end.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<StoredResult>, StoreError> {
        if self.next >= self.store.results.len() {
            return Ok(None);
        }
        let row = self.store.build_row(self.next)?;
        self.next += 1;
        Ok(Some(row))
    }
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<String, StoreError> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut contents = String::new();
            entry
                .read_to_string(&mut contents)
                .map_err(StoreError::Io)?;
            Ok(contents)
        }
        Err(ZipError::FileNotFound) => Err(StoreError::Corrupt {
            message: format!("missing store entry `{name}`"),
        }),
        Err(other) => Err(StoreError::Container(other)),
    }
}

fn parse_rows<T: DeserializeOwned>(contents: &str) -> Result<Vec<T>, StoreError> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(StoreError::Encode))
        .collect()
}

fn decode_timestamp(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| StoreError::Corrupt {
        message: format!("timestamp {micros} out of range"),
    })
}
