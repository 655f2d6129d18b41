// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The write side of the results store.

use super::{
    CASES_ENTRY, CONTEXT_ENTRY, CaseRow, PROGRAMS_ENTRY, ProgramRow, RESULTS_ENTRY, ResultRow,
    artifact_entry,
};
use crate::{
    errors::StoreError,
    model::{Context, Metadata, TestProgram, TestResult},
};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::{Builder, NamedUtf8TempFile};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fs::File, io::Write};
use zip::{ZipWriter, write::SimpleFileOptions};

/// Single-writer handle over a store being produced by a run.
///
/// All operations belong to one transaction: nothing is visible at the target
/// path until [`WriteStore::commit`] renames the finished archive into place.
/// Dropping the handle without committing discards everything.
pub struct WriteStore {
    path: Utf8PathBuf,
    temp: Option<NamedUtf8TempFile>,
    writer: Option<ZipWriter<File>>,
    context: Option<Context>,
    programs: Vec<ProgramRow>,
    cases: Vec<CaseRow>,
    results: Vec<ResultRow>,
    committed: bool,
}

impl WriteStore {
    /// Starts a new store transaction targeting `path`.
    ///
    /// The backing temporary file lives next to the target so the commit
    /// rename stays within one filesystem.
    pub fn create(path: &Utf8Path) -> Result<Self, StoreError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        let temp = Builder::new()
            .prefix(".corral-store.")
            .tempfile_in(parent)
            .map_err(|source| StoreError::Create {
                path: path.to_owned(),
                source,
            })?;
        let file = temp.reopen().map_err(|source| StoreError::Create {
            path: path.to_owned(),
            source,
        })?;
        Ok(Self {
            path: path.to_owned(),
            temp: Some(temp),
            writer: Some(ZipWriter::new(file)),
            context: None,
            programs: Vec::new(),
            cases: Vec::new(),
            results: Vec::new(),
            committed: false,
        })
    }

    /// Records the run context. May be called once per run.
    pub fn put_context(&mut self, context: Context) -> Result<i64, StoreError> {
        if self.context.is_some() {
            return Err(StoreError::DuplicateContext);
        }
        self.context = Some(context);
        Ok(1)
    }

    /// Records a test program and returns its identifier.
    ///
    /// Callers are expected to memoise the identifier per relative path; the
    /// store itself appends a fresh row on every call.
    pub fn put_test_program(&mut self, program: &TestProgram) -> i64 {
        let id = self.programs.len() as i64 + 1;
        self.programs.push(ProgramRow {
            id,
            root: program.root.clone(),
            relative_path: program.relative_path.clone(),
            interface: program.interface,
            test_suite: program.test_suite.clone(),
            metadata: program.metadata.clone(),
        });
        id
    }

    /// Records a test case of a stored program and returns its identifier.
    pub fn put_test_case(
        &mut self,
        program_id: i64,
        name: impl Into<String>,
        metadata: &Metadata,
    ) -> i64 {
        let id = self.cases.len() as i64 + 1;
        self.cases.push(CaseRow {
            id,
            program_id,
            name: name.into(),
            metadata: metadata.clone(),
        });
        id
    }

    /// Records the result of a test case.
    pub fn put_result(
        &mut self,
        test_case_id: i64,
        result: &TestResult,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.results.push(ResultRow {
            test_case_id,
            result: result.clone(),
            start_us: start_time.timestamp_micros(),
            end_us: end_time.timestamp_micros(),
        });
        Ok(())
    }

    /// Streams the bytes of an on-disk artifact into the store under the
    /// given name, keyed to a test case.
    pub fn put_artifact(
        &mut self,
        name: &str,
        file_path: &Utf8Path,
        test_case_id: i64,
    ) -> Result<(), StoreError> {
        let mut source = File::open(file_path).map_err(|source| StoreError::Artifact {
            path: file_path.to_owned(),
            source,
        })?;
        let writer = self.writer()?;
        writer
            .start_file(artifact_entry(test_case_id, name), SimpleFileOptions::default())
            .map_err(StoreError::Container)?;
        std::io::copy(&mut source, writer).map_err(|source| StoreError::Artifact {
            path: file_path.to_owned(),
            source,
        })?;
        Ok(())
    }

    /// Atomically persists the transaction at the target path.
    pub fn commit(mut self) -> Result<(), StoreError> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| StoreError::Corrupt {
                message: "store already committed".to_owned(),
            })?;
        if let Some(context) = self.context.take() {
            writer
                .start_file(CONTEXT_ENTRY, SimpleFileOptions::default())
                .map_err(StoreError::Container)?;
            serde_json::to_writer(&mut writer, &context).map_err(StoreError::Encode)?;
        }
        write_rows(&mut writer, PROGRAMS_ENTRY, &self.programs)?;
        write_rows(&mut writer, CASES_ENTRY, &self.cases)?;
        write_rows(&mut writer, RESULTS_ENTRY, &self.results)?;

        let file = writer.finish().map_err(StoreError::Container)?;
        file.sync_all().map_err(StoreError::Io)?;
        drop(file);

        let temp = self.temp.take().ok_or_else(|| StoreError::Corrupt {
            message: "store already committed".to_owned(),
        })?;
        temp.persist(&self.path)
            .map_err(|error| StoreError::Persist {
                path: self.path.clone(),
                source: error.error,
            })?;
        self.committed = true;
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut ZipWriter<File>, StoreError> {
        self.writer.as_mut().ok_or_else(|| StoreError::Corrupt {
            message: "store already committed".to_owned(),
        })
    }
}

impl Drop for WriteStore {
    fn drop(&mut self) {
        if !self.committed {
            // The temp file unlinks itself; the transaction simply vanishes.
            tracing::debug!("discarding uncommitted results store for {}", self.path);
        }
    }
}

impl std::fmt::Debug for WriteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStore")
            .field("path", &self.path)
            .field("programs", &self.programs.len())
            .field("cases", &self.cases.len())
            .field("results", &self.results.len())
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

fn write_rows<T: Serialize>(
    writer: &mut ZipWriter<File>,
    entry_name: &str,
    rows: &[T],
) -> Result<(), StoreError> {
    writer
        .start_file(entry_name, SimpleFileOptions::default())
        .map_err(StoreError::Container)?;
    for row in rows {
        serde_json::to_writer(&mut *writer, row).map_err(StoreError::Encode)?;
        writer.write_all(b"\n").map_err(StoreError::Io)?;
    }
    Ok(())
}
