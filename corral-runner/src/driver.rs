// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end drivers: the bounded-parallelism run loop and the stored-results
//! scan used by report generators.

use crate::{
    config::UserConfig,
    errors::{DriveError, SpawnError, StoreError, WaitError},
    executor::{ExecHandle, Executor},
    manifest,
    model::{Context, TestProgram, TestResult},
    scanner::{Scanner, TestFilter},
    store::{ReadStore, STDERR_ARTIFACT, STDOUT_ARTIFACT, StoredResult, WriteStore},
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::{collections::HashMap, time::Duration};

/// Observer of the run path. All callbacks have do-nothing defaults.
pub trait RunHooks {
    /// A test case has been selected for execution.
    fn got_test_case(&mut self, program: &TestProgram, test_case_name: &str) {
        let _ = (program, test_case_name);
    }

    /// A test case finished and its result has been stored.
    fn got_result(
        &mut self,
        program: &TestProgram,
        test_case_name: &str,
        result: &TestResult,
        duration: Duration,
    ) {
        let _ = (program, test_case_name, result, duration);
    }
}

/// Hooks that do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRunHooks;

impl RunHooks for NoopRunHooks {}

/// Aggregate counters for a completed run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunStats {
    /// Number of results recorded.
    pub total: u64,
    /// Results that were `good()`: passed, skipped or expected failures.
    pub good: u64,
    /// Results that were failed or broken.
    pub bad: u64,
}

/// The outcome of a completed (non-interrupted) run.
#[derive(Clone, Debug)]
pub struct RunResult {
    /// Result counters.
    pub stats: RunStats,
    /// Filters provided by the user that matched nothing.
    pub unused_filters: Vec<TestFilter>,
}

/// Puts a test program in the store, memoising identifiers per relative path
/// so each program is inserted at most once per run.
fn find_test_program_id(
    program: &TestProgram,
    store: &mut WriteStore,
    ids_cache: &mut IndexMap<Utf8PathBuf, i64>,
) -> i64 {
    match ids_cache.get(&program.relative_path) {
        Some(id) => *id,
        None => {
            let id = store.put_test_program(program);
            ids_cache.insert(program.relative_path.clone(), id);
            id
        }
    }
}

/// Executes the run path: loads the manifest, scans for matching test cases,
/// keeps up to `parallelism` cases in flight, and records every outcome in
/// the store at `store_path`.
///
/// On interruption the in-flight children are killed, the work directory
/// tree is removed, the store transaction is discarded and
/// [`DriveError::Interrupted`] is returned.
pub fn run_tests(
    manifest_path: &Utf8Path,
    build_root: Option<&Utf8Path>,
    store_path: &Utf8Path,
    filters: Vec<TestFilter>,
    user_config: &UserConfig,
    hooks: &mut dyn RunHooks,
) -> Result<RunResult, DriveError> {
    let programs = manifest::load(manifest_path, build_root)?;
    let mut store = WriteStore::create(store_path)?;
    let _ = store.put_context(Context::current())?;

    let executor = Executor::setup()?;
    let mut scanner = Scanner::new(programs, filters);

    let outcome = drive_loop(&mut scanner, executor, &mut store, user_config, hooks);
    let stats = outcome?;

    store.commit()?;
    Ok(RunResult {
        stats,
        unused_filters: scanner.unused_filters(),
    })
}

/// The scheduling loop proper. Owns the executor so that every exit path,
/// including interruption, runs its cleanup.
fn drive_loop(
    scanner: &mut Scanner,
    mut executor: Executor,
    store: &mut WriteStore,
    user_config: &UserConfig,
    hooks: &mut dyn RunHooks,
) -> Result<RunStats, DriveError> {
    let slots = user_config.parallelism;
    debug_assert!(slots >= 1);

    let mut ids_cache: IndexMap<Utf8PathBuf, i64> = IndexMap::new();
    let mut in_flight: HashMap<ExecHandle, i64> = HashMap::new();
    let mut stats = RunStats::default();

    let outcome = 'outcome: loop {
        debug_assert!(in_flight.len() <= slots);

        // Fill the free slots first: spawning is cheaper than any single
        // test, so the scheduler stays saturated whenever the scanner can
        // produce more work.
        while in_flight.len() < slots {
            let Some(scan_match) = scanner.yield_next(&mut executor, user_config) else {
                break;
            };
            let program = scanner.program(scan_match.program_id);
            hooks.got_test_case(program, &scan_match.test_case_name);

            let test_program_id = find_test_program_id(program, store, &mut ids_cache);
            let test_case = program
                .find(&scan_match.test_case_name)
                .expect("scanner yielded an unlisted test case");
            let test_case_id = store.put_test_case(
                test_program_id,
                &scan_match.test_case_name,
                &test_case.metadata,
            );

            let handle = match executor.spawn_test(
                program,
                scan_match.program_id,
                &scan_match.test_case_name,
                user_config,
            ) {
                Ok(handle) => handle,
                Err(SpawnError::Interrupted(interrupted)) => {
                    break 'outcome Err(DriveError::Interrupted(interrupted));
                }
                Err(error) => break 'outcome Err(DriveError::Spawn(error)),
            };
            in_flight.insert(handle, test_case_id);
        }

        // Consume one slot at a time to keep the spawn side saturated.
        if !in_flight.is_empty() {
            let mut result_handle = match executor.wait_any() {
                Ok(result_handle) => result_handle,
                Err(WaitError::Interrupted(interrupted)) => {
                    break 'outcome Err(DriveError::Interrupted(interrupted));
                }
                Err(error) => break 'outcome Err(DriveError::Wait(error)),
            };

            let Some(test_case_id) = in_flight.remove(&result_handle.exec_handle()) else {
                break 'outcome Err(DriveError::Wait(WaitError::UnknownChild {
                    pid: result_handle.exec_handle().pid(),
                }));
            };

            let stored = store
                .put_result(
                    test_case_id,
                    result_handle.test_result(),
                    result_handle.start_time(),
                    result_handle.end_time(),
                )
                .and_then(|()| {
                    store.put_artifact(
                        STDOUT_ARTIFACT,
                        result_handle.stdout_file(),
                        test_case_id,
                    )
                })
                .and_then(|()| {
                    store.put_artifact(
                        STDERR_ARTIFACT,
                        result_handle.stderr_file(),
                        test_case_id,
                    )
                });
            if let Err(error) = stored {
                break 'outcome Err(DriveError::Store(error));
            }

            stats.total += 1;
            if result_handle.test_result().good() {
                stats.good += 1;
            } else {
                stats.bad += 1;
            }

            let program = scanner.program(result_handle.program_id());
            hooks.got_result(
                program,
                result_handle.test_case_name(),
                result_handle.test_result(),
                result_handle.duration(),
            );

            // Cleanup failures must not abort the run; they are logged and
            // the executor's final sweep retries.
            if let Err(error) = result_handle.cleanup() {
                tracing::warn!("failed to clean up test case state: {error}");
            }
        }

        if in_flight.is_empty() && scanner.done() {
            break 'outcome Ok(stats);
        }
    };

    // Both the success and every error path release the executor here;
    // cleanup problems are logged, never raised, because this also runs
    // while unwinding from an interrupt.
    if let Err(error) = executor.cleanup() {
        tracing::warn!("executor cleanup failed: {error}");
    }
    outcome
}

/// Observer of the report path. All callbacks have do-nothing defaults.
pub trait ScanHooks {
    /// The run context has been loaded from the store.
    fn got_context(&mut self, context: &Context) {
        let _ = context;
    }

    /// A stored result has been loaded.
    fn got_result(&mut self, result: &StoredResult) {
        let _ = result;
    }

    /// The scan is complete.
    fn end(&mut self) {}
}

/// Walks a committed results store in insertion order, feeding `hooks`.
pub fn scan_results(store_path: &Utf8Path, hooks: &mut dyn ScanHooks) -> Result<(), StoreError> {
    let mut store = ReadStore::open(store_path)?;
    hooks.got_context(store.context());

    let mut cursor = store.results_cursor();
    while let Some(row) = cursor.next()? {
        hooks.got_result(&row);
    }
    hooks.end();
    Ok(())
}
