// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The executor: forks test case subprocesses, owns the per-case work
//! directory tree, enforces deadlines, and turns dead children into typed
//! results.
//!
//! Every execution gets a fresh numbered directory under the root work
//! directory. The numbered directory is the *control* directory: it holds the
//! captured stdout/stderr and any interface cookies, out of reach of the test
//! itself, which runs with its working directory set to the `work/`
//! subdirectory. A test deleting everything in its cwd therefore cannot
//! destroy the executor's control files.

use crate::{
    config::{UnprivilegedUser, UserConfig},
    deadline::{self, DeadlineHandle},
    errors::{CleanupError, ExecutorSetupError, ListError, SpawnError, WaitError},
    interfaces::TestInterface,
    interrupts::{self, InterruptsHandler},
    isolation,
    model::{
        Metadata, TEST_CASES_LIST_CASE, TestCase, TestCasesMap, TestProgram, TestResult,
    },
    process::{self, Status},
    requirements, stacktrace,
};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::{Builder, Utf8TempDir};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use nix::{
    errno::Errno,
    sys::{
        signal::{Signal, kill, killpg},
        wait::waitpid,
    },
    unistd::Pid,
};
use std::{
    cell::RefCell,
    collections::HashMap,
    convert::Infallible,
    fmt,
    fs::OpenOptions,
    io::Write,
    os::unix::fs::DirBuilderExt,
    rc::Rc,
    time::Duration,
};

/// Basename of the captured stdout of a test.
static STDOUT_NAME: &str = "stdout.txt";

/// Basename of the captured stderr of a test.
static STDERR_NAME: &str = "stderr.txt";

/// Cookie holding the skip reason written by the requirements check.
static SKIPPED_COOKIE: &str = "skipped.txt";

/// Basename of the subdirectory the test actually runs in.
static WORK_SUBDIR: &str = "work";

/// Template prefix for the mkdtemp'd root work directory.
static WORK_DIRECTORY_PREFIX: &str = "corral.";

/// Header prepended to the leftover-files listing on failures.
static FILES_LEFT_HEADER: &str = "Files left in work directory after failure:";

/// Magic exit code meaning "probably skipped by the requirements check".
///
/// The case was skipped if and only if the child exited with this code *and*
/// the skip cookie exists; a test exiting 84 on its own falls through to the
/// regular status handling.
pub const EXIT_SKIPPED: i32 = 84;

/// Deadline for a test case listing subprocess.
const LIST_TIMEOUT: Duration = Duration::from_secs(300);

/// Opaque identifier of one in-flight execution.
///
/// Values are unique for the lifetime of an executor instance.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ExecHandle(Pid);

impl ExecHandle {
    /// The underlying PID, for display purposes only.
    pub fn pid(&self) -> i32 {
        self.0.as_raw()
    }
}

impl fmt::Display for ExecHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_raw())
    }
}

/// Maintenance data for one in-flight execution, from spawn to result
/// handle cleanup.
struct ExecData {
    interface: TestInterface,
    program_id: usize,
    program_path: Utf8PathBuf,
    test_case_name: String,
    fake_result: Option<TestResult>,
    start_time: DateTime<Utc>,
    unique_work_directory: Utf8PathBuf,
    stdout_file: Utf8PathBuf,
    stderr_file: Utf8PathBuf,
    timer: DeadlineHandle,
}

type ExecDataMap = HashMap<ExecHandle, ExecData>;

/// The subprocess scheduler's executor.
///
/// Dropping an executor without calling [`Executor::cleanup`] performs a
/// best-effort cleanup that logs and swallows errors.
pub struct Executor {
    interrupts: InterruptsHandler,
    root_work_directory: Option<Utf8TempDir>,
    next_job: u64,
    live: Rc<RefCell<ExecDataMap>>,
    cleaned: bool,
}

impl Executor {
    /// Initialises an executor: creates the root work directory and installs
    /// the interrupt handlers.
    pub fn setup() -> Result<Self, ExecutorSetupError> {
        let interrupts =
            InterruptsHandler::install().map_err(ExecutorSetupError::Interrupts)?;
        let root_work_directory = Builder::new()
            .prefix(WORK_DIRECTORY_PREFIX)
            .tempdir()
            .map_err(ExecutorSetupError::RootWorkDirectory)?;
        tracing::debug!(
            "executor root work directory: {}",
            root_work_directory.path()
        );
        Ok(Self {
            interrupts,
            root_work_directory: Some(root_work_directory),
            next_job: 0,
            live: Rc::new(RefCell::new(HashMap::new())),
            cleaned: false,
        })
    }

    /// The root all per-case work directories hang off.
    pub fn root_work_directory(&self) -> &Utf8Path {
        self.root_work_directory
            .as_ref()
            .expect("root work directory gone before cleanup")
            .path()
    }

    /// Creates the control and work directories for the next execution.
    fn allocate_job_directory(&mut self) -> Result<Utf8PathBuf, SpawnError> {
        self.next_job += 1;
        let control_directory = self.root_work_directory().join(self.next_job.to_string());
        let mut builder = std::fs::DirBuilder::new();
        builder.mode(0o755);
        for path in [&control_directory, &control_directory.join(WORK_SUBDIR)] {
            builder.create(path).map_err(|source| {
                SpawnError::CreateWorkDirectory {
                    path: path.clone(),
                    source,
                }
            })?;
        }
        Ok(control_directory)
    }

    /// Forks and executes a test case asynchronously.
    ///
    /// The returned handle matches this invocation with the result later
    /// returned by [`Executor::wait_any`]. `program_id` is the caller's
    /// identifier for the program (an index into its program table) and is
    /// carried through to the result handle untouched.
    pub fn spawn_test(
        &mut self,
        program: &TestProgram,
        program_id: usize,
        test_case_name: &str,
        user_config: &UserConfig,
    ) -> Result<ExecHandle, SpawnError> {
        self.spawn_test_with_output(program, program_id, test_case_name, user_config, None, None)
    }

    /// Same as [`Executor::spawn_test`] but sends the captured stdout and/or
    /// stderr to caller-chosen files.
    pub fn spawn_test_with_output(
        &mut self,
        program: &TestProgram,
        program_id: usize,
        test_case_name: &str,
        user_config: &UserConfig,
        stdout_target: Option<&Utf8Path>,
        stderr_target: Option<&Utf8Path>,
    ) -> Result<ExecHandle, SpawnError> {
        interrupts::check_interrupt()?;

        let test_case =
            program
                .find(test_case_name)
                .ok_or_else(|| SpawnError::UnknownTestCase {
                    program: program.relative_path.clone(),
                    test_case: test_case_name.to_owned(),
                })?;

        let control_directory = self.allocate_job_directory()?;
        let work_directory = control_directory.join(WORK_SUBDIR);
        let stdout_file = stdout_target
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| control_directory.join(STDOUT_NAME));
        let stderr_file = stderr_target
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|| control_directory.join(STDERR_NAME));

        let unprivileged_user = match test_case.metadata.required_user {
            crate::model::RequiredUser::Unprivileged => user_config.unprivileged_user.clone(),
            _ => None,
        };
        let vars = user_config.test_suite_vars(&program.test_suite);
        let skipped_cookie_path = control_directory.join(SKIPPED_COOKIE);

        tracing::info!(
            "spawning {}:{test_case_name}",
            program.absolute_path()
        );

        let start_time = Utc::now();
        let pid = process::fork_with_files(
            || {
                run_test_case(
                    program,
                    test_case,
                    &vars,
                    user_config,
                    unprivileged_user.as_ref(),
                    &control_directory,
                    &work_directory,
                    &skipped_cookie_path,
                )
            },
            &stdout_file,
            &stderr_file,
        )?;

        let timer = deadline::register(test_case.metadata.timeout(), pid);
        let handle = ExecHandle(pid);
        let data = ExecData {
            interface: program.interface,
            program_id,
            program_path: program.absolute_path(),
            test_case_name: test_case_name.to_owned(),
            fake_result: test_case.fake_result.clone(),
            start_time,
            unique_work_directory: control_directory,
            stdout_file,
            stderr_file,
            timer,
        };
        self.live.borrow_mut().insert(handle, data);
        tracing::debug!("spawned test case with exec handle {handle}");
        Ok(handle)
    }

    /// Waits for completion of any in-flight test case and computes its
    /// result.
    pub fn wait_any(&mut self) -> Result<ResultHandle, WaitError> {
        interrupts::check_interrupt()?;

        let (pid, status) = process::wait_any()?;
        let end_time = Utc::now();
        let handle = ExecHandle(pid);
        tracing::debug!("waited for test case with exec handle {handle}");

        // Reap any orphans the dead process left behind in its group.
        let _ = killpg(pid, Signal::SIGKILL);

        let (data_view, fired) = {
            let mut live = self.live.borrow_mut();
            let data = live
                .get_mut(&handle)
                .ok_or(WaitError::UnknownChild { pid: pid.as_raw() })?;
            let fired = data.timer.unschedule();
            (
                (
                    data.interface,
                    data.program_id,
                    data.program_path.clone(),
                    data.test_case_name.clone(),
                    data.fake_result.clone(),
                    data.start_time,
                    data.unique_work_directory.clone(),
                    data.stdout_file.clone(),
                    data.stderr_file.clone(),
                ),
                fired,
            )
        };
        let (
            interface,
            program_id,
            program_path,
            test_case_name,
            fake_result,
            start_time,
            control_directory,
            stdout_file,
            stderr_file,
        ) = data_view;
        let work_directory = control_directory.join(WORK_SUBDIR);

        stacktrace::dump_stacktrace_if_available(
            &program_path,
            Some(&status),
            &work_directory,
            &stderr_file,
        );

        let status_for_interface = if fired { None } else { Some(&status) };
        let test_result = if let Some(fake) = fake_result {
            fake
        } else if let Some(skip_reason) =
            recover_skip_reason(&status, &control_directory.join(SKIPPED_COOKIE))
        {
            TestResult::Skipped(skip_reason)
        } else {
            interface.compute_result(
                status_for_interface,
                &control_directory,
                &stdout_file,
                &stderr_file,
            )
        };

        if !test_result.good() {
            if let Err(error) = append_files_listing(&work_directory, &stderr_file) {
                tracing::warn!(
                    "cannot append files listing to {stderr_file}: {error}"
                );
            }
        }

        Ok(ResultHandle {
            exec_handle: handle,
            program_id,
            test_case_name,
            test_result,
            start_time,
            end_time,
            control_directory,
            stdout_file,
            stderr_file,
            live: Rc::clone(&self.live),
            cleaned: false,
        })
    }

    /// Obtains the test case list of a program.
    ///
    /// This operation is synchronous and never fails: any error in the
    /// listing pipeline is folded into a single synthetic test case whose
    /// fake result describes the failure.
    pub fn list_tests(&mut self, program: &TestProgram, user_config: &UserConfig) -> TestCasesMap {
        if !program.interface.provides_list() {
            return program.interface.default_test_cases(program);
        }
        match self.try_list_tests(program, user_config) {
            Ok(test_cases) => test_cases,
            Err(error) => {
                tracing::warn!(
                    "failed to load test cases list for {}: {error}",
                    program.absolute_path()
                );
                let metadata = Metadata::builder()
                    .set_description("Represents the correct processing of the test cases list")
                    .build();
                let mut test_cases = TestCasesMap::new();
                test_cases.insert(
                    TEST_CASES_LIST_CASE.to_owned(),
                    TestCase::new_fake(
                        TEST_CASES_LIST_CASE,
                        metadata,
                        TestResult::Broken(error.to_string()),
                    ),
                );
                test_cases
            }
        }
    }

    fn try_list_tests(
        &mut self,
        program: &TestProgram,
        user_config: &UserConfig,
    ) -> Result<TestCasesMap, ListError> {
        let control_directory = self
            .allocate_job_directory()
            .map_err(|error| ListError::Spawn(error.to_string()))?;
        let work_directory = control_directory.join(WORK_SUBDIR);
        let stdout_file = control_directory.join(STDOUT_NAME);
        let stderr_file = control_directory.join(STDERR_NAME);
        let vars = user_config.test_suite_vars(&program.test_suite);
        let interface = program.interface;

        let pid = process::fork_with_files(
            || {
                isolation::isolate_child(None, &work_directory);
                interface.exec_list(program, &vars)
            },
            &stdout_file,
            &stderr_file,
        )
        .map_err(|error| ListError::Spawn(error.to_string()))?;

        let mut timer = deadline::register(LIST_TIMEOUT, pid);
        let wait_outcome = process::wait(pid);
        let fired = timer.unschedule();

        let outcome = wait_outcome
            .map_err(|error| ListError::Spawn(error.to_string()))
            .and_then(|status| {
                let status_for_interface = if fired { None } else { Some(&status) };
                interface.parse_list(status_for_interface, &stdout_file, &stderr_file)
            })
            .and_then(|test_cases| {
                if test_cases.is_empty() {
                    Err(ListError::Empty)
                } else {
                    Ok(test_cases)
                }
            });

        if let Err(error) = std::fs::remove_dir_all(&control_directory) {
            tracing::warn!("failed to remove listing directory {control_directory}: {error}");
        }
        outcome
    }

    /// Releases the executor: kills any still-live children, wipes their
    /// work directories, removes the root work directory and uninstalls the
    /// interrupt handlers.
    pub fn cleanup(mut self) -> Result<(), CleanupError> {
        self.cleanup_impl()
    }

    fn cleanup_impl(&mut self) -> Result<(), CleanupError> {
        assert!(!self.cleaned, "executor cleaned up twice");
        self.cleaned = true;

        let entries: Vec<(ExecHandle, ExecData)> =
            self.live.borrow_mut().drain().collect();
        for (handle, mut data) in entries {
            tracing::warn!("killing still-live subprocess (and group) {handle}");
            // The child may not have reached setsid(2) yet, in which case its
            // group does not exist; killing the PID first stops it from
            // making forward progress either way, then the group sweep takes
            // out anything it spawned.
            let _ = kill(handle.0, Signal::SIGKILL);
            let _ = killpg(handle.0, Signal::SIGKILL);
            loop {
                match waitpid(handle.0, None) {
                    Err(Errno::EINTR) => continue,
                    Ok(_) | Err(_) => break,
                }
            }
            let _ = data.timer.unschedule();
            if let Err(error) = std::fs::remove_dir_all(&data.unique_work_directory) {
                tracing::error!(
                    "failed to clean up work directory {}: {error}",
                    data.unique_work_directory
                );
            }
        }

        let result = match self.root_work_directory.take() {
            Some(root) => root
                .close()
                .map_err(CleanupError::RemoveRootWorkDirectory),
            None => Ok(()),
        };
        self.interrupts.uninstall();
        result
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if !self.cleaned {
            tracing::warn!("implicitly cleaning up executor; ignoring errors");
            if let Err(error) = self.cleanup_impl() {
                tracing::error!("executor cleanup failed: {error}");
            }
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("root_work_directory", &self.root_work_directory)
            .field("next_job", &self.next_job)
            .field("cleaned", &self.cleaned)
            .finish_non_exhaustive()
    }
}

/// Child-side body of a test case execution.
#[allow(clippy::too_many_arguments)]
fn run_test_case(
    program: &TestProgram,
    test_case: &TestCase,
    vars: &IndexMap<String, String>,
    user_config: &UserConfig,
    unprivileged_user: Option<&UnprivilegedUser>,
    control_directory: &Utf8Path,
    work_directory: &Utf8Path,
    skipped_cookie_path: &Utf8Path,
) -> Infallible {
    // Cases with a pre-recorded result never touch the test program.
    if test_case.fake_result.is_some() {
        process::exit(0)
    }

    isolation::isolate_path(unprivileged_user, control_directory);
    isolation::isolate_child(unprivileged_user, work_directory);

    if let Some(reason) =
        requirements::check_requirements(&test_case.metadata, &program.test_suite, user_config)
    {
        if std::fs::write(skipped_cookie_path, &reason).is_err() {
            process::fail_child("Failed to write skip reason cookie");
        }
        // Terminate abruptly: destructors inherited from the parent must not
        // run here, lest they touch the parent's own control files.
        process::exit(EXIT_SKIPPED)
    }

    if test_case.metadata.wants_control_dir() {
        unsafe { std::env::set_var("CONTROL_DIR", control_directory) };
    }

    program
        .interface
        .exec_test(program, test_case, vars, control_directory)
}

/// Recovers the skip reason when the child exited with the skip sentinel and
/// actually left the cookie behind.
fn recover_skip_reason(status: &Status, skipped_cookie_path: &Utf8Path) -> Option<String> {
    if status.exit_status() != Some(EXIT_SKIPPED) {
        return None;
    }
    std::fs::read_to_string(skipped_cookie_path).ok()
}

/// Appends the sorted listing of files left in `work_directory` to the
/// stderr capture, to aid post-mortem diagnosis of bad results.
fn append_files_listing(
    work_directory: &Utf8Path,
    output_file: &Utf8Path,
) -> std::io::Result<()> {
    let mut names: Vec<String> = Vec::new();
    for entry in work_directory.read_dir_utf8()? {
        names.push(entry?.file_name().to_owned());
    }
    if names.is_empty() {
        return Ok(());
    }
    names.sort();

    let mut output = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output_file)?;
    writeln!(output, "{FILES_LEFT_HEADER}")?;
    for name in names {
        writeln!(output, "{name}")?;
    }
    Ok(())
}

/// The outcome of one finished execution.
///
/// Keeps the per-case on-disk state alive until [`ResultHandle::cleanup`] is
/// called, which wipes the work directory tree and releases the executor's
/// bookkeeping entry. Dropping an uncleaned handle cleans up best-effort with
/// a warning.
pub struct ResultHandle {
    exec_handle: ExecHandle,
    program_id: usize,
    test_case_name: String,
    test_result: TestResult,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    control_directory: Utf8PathBuf,
    stdout_file: Utf8PathBuf,
    stderr_file: Utf8PathBuf,
    live: Rc<RefCell<ExecDataMap>>,
    cleaned: bool,
}

impl ResultHandle {
    /// The exec handle this result corresponds to.
    pub fn exec_handle(&self) -> ExecHandle {
        self.exec_handle
    }

    /// The caller-supplied identifier of the test program.
    pub fn program_id(&self) -> usize {
        self.program_id
    }

    /// The name of the test case that yielded this result.
    pub fn test_case_name(&self) -> &str {
        &self.test_case_name
    }

    /// The computed result.
    pub fn test_result(&self) -> &TestResult {
        &self.test_result
    }

    /// When the test case was spawned.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// When the wait for the test case returned.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    /// Wall-clock duration of the execution.
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time).to_std().unwrap_or_default()
    }

    /// The directory the test ran in; exists until cleanup.
    pub fn work_directory(&self) -> Utf8PathBuf {
        self.control_directory.join(WORK_SUBDIR)
    }

    /// The captured stdout; exists until cleanup.
    pub fn stdout_file(&self) -> &Utf8Path {
        &self.stdout_file
    }

    /// The captured stderr; exists until cleanup.
    pub fn stderr_file(&self) -> &Utf8Path {
        &self.stderr_file
    }

    /// Wipes the per-case on-disk state and releases the executor's
    /// bookkeeping entry.
    ///
    /// Must be called at most once; prefer calling it explicitly over relying
    /// on the drop-side fallback, which cannot report errors.
    pub fn cleanup(&mut self) -> Result<(), CleanupError> {
        assert!(!self.cleaned, "result handle cleaned up twice");
        std::fs::remove_dir_all(&self.control_directory).map_err(|source| {
            CleanupError::RemoveWorkDirectory {
                path: self.control_directory.clone(),
                source,
            }
        })?;
        self.live.borrow_mut().remove(&self.exec_handle);
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for ResultHandle {
    fn drop(&mut self) {
        if !self.cleaned {
            tracing::warn!(
                "implicitly cleaning up result handle for exec handle {}; ignoring errors",
                self.exec_handle
            );
            if let Err(error) = std::fs::remove_dir_all(&self.control_directory) {
                tracing::error!("test case cleanup failed: {error}");
            }
            self.live.borrow_mut().remove(&self.exec_handle);
            self.cleaned = true;
        }
    }
}

impl fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("exec_handle", &self.exec_handle)
            .field("test_case_name", &self.test_case_name)
            .field("test_result", &self.test_result)
            .field("control_directory", &self.control_directory)
            .field("cleaned", &self.cleaned)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;

    #[test]
    fn files_listing_skips_empty_directories() {
        let dir = Utf8TempDir::new().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let capture = dir.path().join("stderr.txt");
        std::fs::write(&capture, "").unwrap();

        append_files_listing(&work, &capture).unwrap();
        assert_eq!(std::fs::read_to_string(&capture).unwrap(), "");
    }

    #[test]
    fn files_listing_sorted_one_per_line() {
        let dir = Utf8TempDir::new().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        std::fs::write(work.join("zz"), "").unwrap();
        std::fs::write(work.join("aa"), "").unwrap();
        let capture = dir.path().join("stderr.txt");
        std::fs::write(&capture, "tail of test output\n").unwrap();

        append_files_listing(&work, &capture).unwrap();
        assert_eq!(
            std::fs::read_to_string(&capture).unwrap(),
            "tail of test output\nFiles left in work directory after failure:\naa\nzz\n"
        );
    }

    #[test]
    fn skip_reason_needs_sentinel_and_cookie() {
        let dir = Utf8TempDir::new().unwrap();
        let cookie = dir.path().join("skipped.txt");

        // Sentinel exit without a cookie: not a skip.
        assert_eq!(recover_skip_reason(&Status::Exited(EXIT_SKIPPED), &cookie), None);
        // Cookie with a non-sentinel exit: not a skip either.
        std::fs::write(&cookie, "the reason").unwrap();
        assert_eq!(recover_skip_reason(&Status::Exited(0), &cookie), None);
        // Both: a skip.
        assert_eq!(
            recover_skip_reason(&Status::Exited(EXIT_SKIPPED), &cookie),
            Some("the reason".to_owned())
        );
    }

    #[test]
    fn setup_creates_and_cleanup_removes_root() {
        let executor = Executor::setup().unwrap();
        let root = executor.root_work_directory().to_owned();
        assert!(root.is_dir());
        executor.cleanup().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn job_directories_are_sequential() {
        let mut executor = Executor::setup().unwrap();
        let first = executor.allocate_job_directory().unwrap();
        let second = executor.allocate_job_directory().unwrap();
        assert_eq!(first.file_name(), Some("1"));
        assert_eq!(second.file_name(), Some("2"));
        assert!(first.join(WORK_SUBDIR).is_dir());
        assert!(second.join(WORK_SUBDIR).is_dir());
        executor.cleanup().unwrap();
    }
}
