// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by corral.

use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;

/// The run was interrupted by SIGHUP, SIGINT or SIGTERM.
///
/// This is raised from interruption checkpoints, never from signal context
/// itself.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("interrupted by signal")]
pub struct Interrupted;

/// An error that occurred while loading the test suite manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("failed to read manifest `{path}`")]
    Read {
        /// The path to the manifest.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The manifest file is not valid TOML.
    #[error("failed to parse manifest `{path}`")]
    Parse {
        /// The path to the manifest.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// A test program declared an interface corral does not know about.
    #[error("unknown interface `{interface}` for test program `{program}`")]
    UnknownInterface {
        /// The interface name as written in the manifest.
        interface: String,
        /// The test program the interface was declared for.
        program: Utf8PathBuf,
    },

    /// A test program path must be relative to the build root.
    #[error("test program path `{program}` must be relative")]
    AbsoluteProgramPath {
        /// The offending path.
        program: Utf8PathBuf,
    },

    /// A test program did not name a test suite and the manifest has no
    /// default.
    #[error("test program `{program}` does not belong to a test suite")]
    MissingTestSuite {
        /// The test program missing a suite.
        program: Utf8PathBuf,
    },

    /// An invalid `required_user` value.
    #[error("invalid required_user `{value}` for test program `{program}`")]
    InvalidRequiredUser {
        /// The value as written.
        value: String,
        /// The test program it was declared for.
        program: Utf8PathBuf,
    },
}

/// An error that occurred while loading the user configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration `{path}`")]
    Read {
        /// The path to the configuration file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML.
    #[error("failed to parse configuration `{path}`")]
    Parse {
        /// The path to the configuration file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// `parallelism` must be a positive integer.
    #[error("parallelism must be at least 1")]
    InvalidParallelism,

    /// The configured unprivileged user does not exist.
    #[error("unprivileged_user `{user}` does not exist")]
    UnknownUser {
        /// The user name as configured.
        user: String,
    },

    /// The passwd database could not be queried.
    #[error("failed to look up user `{user}`")]
    UserLookup {
        /// The user name as configured.
        user: String,
        /// The underlying error.
        #[source]
        source: nix::Error,
    },
}

/// An error that occurred while spawning a test case subprocess.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The run was interrupted before the spawn happened.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    /// fork(2) failed.
    #[error("failed to fork test case subprocess")]
    Fork(#[source] nix::Error),

    /// A work directory could not be created.
    #[error("failed to create work directory `{path}`")]
    CreateWorkDirectory {
        /// The directory that could not be created.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A redirection target path contains an interior NUL byte.
    #[error("invalid redirection target `{path}`")]
    InvalidPath {
        /// The offending path.
        path: Utf8PathBuf,
    },

    /// The requested test case is not part of the test program.
    #[error("test program `{program}` does not define test case `{test_case}`")]
    UnknownTestCase {
        /// The test program.
        program: Utf8PathBuf,
        /// The requested test case name.
        test_case: String,
    },
}

/// An error that occurred while waiting for a test case subprocess.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The run was interrupted.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    /// waitpid(2) failed.
    #[error("failed to wait for test case subprocess")]
    Wait(#[source] nix::Error),

    /// waitpid(2) reported a child the executor is not tracking.
    ///
    /// This is an invariant violation: all children are spawned through the
    /// executor and recorded before any wait happens.
    #[error("waited for unknown subprocess with PID {pid}")]
    UnknownChild {
        /// The unknown PID.
        pid: i32,
    },
}

/// An error that occurred while setting up the executor.
#[derive(Debug, Error)]
pub enum ExecutorSetupError {
    /// The root work directory could not be created.
    #[error("failed to create the root work directory")]
    RootWorkDirectory(#[source] io::Error),

    /// The interrupt handlers could not be installed.
    #[error("failed to install interrupt handlers")]
    Interrupts(#[source] nix::Error),
}

/// An error that occurred while cleaning up per-case or executor state.
#[derive(Debug, Error)]
pub enum CleanupError {
    /// A work directory could not be removed.
    #[error("failed to remove work directory `{path}`")]
    RemoveWorkDirectory {
        /// The directory that could not be removed.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The root work directory could not be removed.
    #[error("failed to remove the root work directory")]
    RemoveRootWorkDirectory(#[source] io::Error),
}

/// An error that occurred while obtaining the test case list of a program.
///
/// Listing errors are not fatal: the scanner folds them into a synthetic
/// `__test_cases_list__` case whose fake result carries the message below.
#[derive(Debug, Error)]
pub enum ListError {
    /// The listing subprocess could not be spawned.
    #[error("failed to spawn test case list subprocess: {0}")]
    Spawn(String),

    /// The listing subprocess overran its deadline.
    #[error("Test case list timed out")]
    Timeout,

    /// The listing subprocess died with a signal.
    #[error("Test program received signal {signal}")]
    Signal {
        /// The signal number.
        signal: i32,
    },

    /// The listing subprocess exited with a non-zero code.
    #[error("{reason}")]
    ExitFailure {
        /// A message built from the subprocess's exit code and stderr.
        reason: String,
    },

    /// The listing output could not be read.
    #[error("failed to read test case list output")]
    Read(#[source] io::Error),

    /// The listing output does not follow the interface's format.
    #[error("{0}")]
    Format(String),

    /// The program reported no test cases at all.
    #[error("Empty test cases list")]
    Empty,
}

/// An error that occurred while writing to or reading from a results store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store file could not be created.
    #[error("failed to create results store `{path}`")]
    Create {
        /// The path to the store.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The store file could not be opened for reading.
    #[error("failed to open results store `{path}`")]
    Open {
        /// The path to the store.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The store container is damaged or not a corral store.
    #[error("corrupt results store: {message}")]
    Corrupt {
        /// What exactly is wrong.
        message: String,
    },

    /// An error in the underlying zip container.
    #[error("results store container error")]
    Container(#[source] zip::result::ZipError),

    /// A row could not be serialized or deserialized.
    #[error("failed to encode or decode a results store row")]
    Encode(#[source] serde_json::Error),

    /// An artifact file could not be ingested.
    #[error("failed to ingest artifact `{path}`")]
    Artifact {
        /// The artifact's source path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The context was stored more than once within a run.
    #[error("the run context has already been stored")]
    DuplicateContext,

    /// The committed store could not be moved into place.
    #[error("failed to persist results store `{path}`")]
    Persist {
        /// The path to the store.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A general I/O failure while streaming store contents.
    #[error("results store I/O error")]
    Io(#[source] io::Error),
}

/// An error that occurred while driving a test run end to end.
#[derive(Debug, Error)]
pub enum DriveError {
    /// The manifest could not be loaded.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The results store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The executor could not be set up.
    #[error(transparent)]
    Setup(#[from] ExecutorSetupError),

    /// A test case could not be spawned.
    #[error("failed to spawn test case")]
    Spawn(#[source] SpawnError),

    /// Waiting for a test case failed.
    #[error("failed to wait for test case")]
    Wait(#[source] WaitError),

    /// The run was interrupted; children have been killed and the work
    /// directory tree removed.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}
