// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The data model: test programs, test cases, metadata, results and the run
//! context.
//!
//! Test programs own their test cases; code that needs to go the other way
//! carries a `(program id, case name)` pair instead of a back-reference, with
//! the program table owned by the scanner for the duration of a run.

use crate::interfaces::TestInterface;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, collections::BTreeSet, fmt, time::Duration};

/// Name of the synthetic test case that carries a failed listing attempt
/// through the normal result pipeline.
pub static TEST_CASES_LIST_CASE: &str = "__test_cases_list__";

/// The outcome of executing a single test case.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "reason", rename_all = "snake_case")]
pub enum TestResult {
    /// The test case completed successfully.
    Passed,
    /// The test case was not run because a precondition was not met.
    Skipped(String),
    /// The test case failed in a way it declared it would.
    ExpectedFailure(String),
    /// The test case reported a failure.
    Failed(String),
    /// The test case (or corral itself) misbehaved; the failure does not
    /// come from the code under test.
    Broken(String),
}

impl TestResult {
    /// Whether the result is to be considered a success of the run.
    pub fn good(&self) -> bool {
        matches!(
            self,
            TestResult::Passed | TestResult::Skipped(_) | TestResult::ExpectedFailure(_)
        )
    }

    /// The result's reason, if it carries one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            TestResult::Passed => None,
            TestResult::Skipped(reason)
            | TestResult::ExpectedFailure(reason)
            | TestResult::Failed(reason)
            | TestResult::Broken(reason) => Some(reason),
        }
    }

    /// The stable tag used for this result in stores and reports.
    pub fn type_name(&self) -> &'static str {
        match self {
            TestResult::Passed => "passed",
            TestResult::Skipped(_) => "skipped",
            TestResult::ExpectedFailure(_) => "expected_failure",
            TestResult::Failed(_) => "failed",
            TestResult::Broken(_) => "broken",
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            None => write!(f, "{}", self.type_name()),
            Some(reason) => write!(f, "{}: {}", self.type_name(), reason),
        }
    }
}

/// The user a test case requires to run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredUser {
    /// No requirement.
    #[default]
    Any,
    /// The test case must run as root.
    Root,
    /// The test case must run as a non-root user.
    Unprivileged,
}

impl RequiredUser {
    /// Parses the textual form used by manifests and test program listings.
    ///
    /// The empty string means "no requirement".
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" => Some(RequiredUser::Any),
            "root" => Some(RequiredUser::Root),
            "unprivileged" => Some(RequiredUser::Unprivileged),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RequiredUser::Any => "",
            RequiredUser::Root => "root",
            RequiredUser::Unprivileged => "unprivileged",
        }
    }
}

/// Default timeout for a test case that does not declare one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

/// Execution requirements and descriptive properties of a test program or
/// test case.
///
/// All fields have defined defaults so metadata can be built up from sparse
/// declarations. `required_memory == 0` means no memory requirement.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Architectures the test may run on; empty means any.
    #[serde(default)]
    pub allowed_architectures: BTreeSet<String>,

    /// Platforms (operating systems) the test may run on; empty means any.
    #[serde(default)]
    pub allowed_platforms: BTreeSet<String>,

    /// Configuration variables that must be set for the test to run.
    #[serde(default)]
    pub required_configs: BTreeSet<String>,

    /// Files that must exist for the test to run.
    #[serde(default)]
    pub required_files: BTreeSet<Utf8PathBuf>,

    /// Programs that must be present (absolute, or looked up in `PATH`).
    #[serde(default)]
    pub required_programs: BTreeSet<Utf8PathBuf>,

    /// Minimum physical memory in bytes; 0 means no requirement.
    #[serde(default)]
    pub required_memory: u64,

    /// The user the test must run as.
    #[serde(default)]
    pub required_user: RequiredUser,

    /// Whether the test case has a standalone cleanup routine.
    #[serde(default)]
    pub has_cleanup: bool,

    /// Free-form description.
    #[serde(default)]
    pub description: String,

    /// Deadline for one execution of the test case, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Free-form custom properties.
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

impl Default for Metadata {
    fn default() -> Self {
        MetadataBuilder::new().build()
    }
}

impl Metadata {
    /// Starts building a metadata instance from the defaults.
    pub fn builder() -> MetadataBuilder {
        MetadataBuilder::new()
    }

    /// The test case deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether the executor should expose the control directory to the test
    /// through the `CONTROL_DIR` environment variable.
    pub fn wants_control_dir(&self) -> bool {
        self.custom.get("wants_control_dir").map(String::as_str) == Some("true")
    }

    /// Flattens the metadata into displayable key/value properties.
    ///
    /// Used by report renderers; set-valued properties are joined with a
    /// single space and iteration order is stable.
    pub fn to_properties(&self) -> IndexMap<String, String> {
        fn join<T: fmt::Display>(set: &BTreeSet<T>) -> String {
            set.iter()
                .map(|item| item.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        }

        let mut props = IndexMap::new();
        props.insert("allowed_architectures".to_owned(), join(&self.allowed_architectures));
        props.insert("allowed_platforms".to_owned(), join(&self.allowed_platforms));
        for (key, value) in &self.custom {
            props.insert(format!("custom.{key}"), value.clone());
        }
        props.insert("description".to_owned(), self.description.clone());
        props.insert("has_cleanup".to_owned(), self.has_cleanup.to_string());
        props.insert("required_configs".to_owned(), join(&self.required_configs));
        props.insert("required_files".to_owned(), join(&self.required_files));
        props.insert("required_memory".to_owned(), self.required_memory.to_string());
        props.insert("required_programs".to_owned(), join(&self.required_programs));
        props.insert("required_user".to_owned(), self.required_user.as_str().to_owned());
        props.insert("timeout".to_owned(), self.timeout_secs.to_string());
        props
    }
}

/// Builder for [`Metadata`].
#[derive(Clone, Debug)]
pub struct MetadataBuilder {
    metadata: Metadata,
}

impl MetadataBuilder {
    /// Creates a builder holding the default values.
    pub fn new() -> Self {
        Self {
            metadata: Metadata {
                allowed_architectures: BTreeSet::new(),
                allowed_platforms: BTreeSet::new(),
                required_configs: BTreeSet::new(),
                required_files: BTreeSet::new(),
                required_programs: BTreeSet::new(),
                required_memory: 0,
                required_user: RequiredUser::Any,
                has_cleanup: false,
                description: String::new(),
                timeout_secs: default_timeout_secs(),
                custom: BTreeMap::new(),
            },
        }
    }

    /// Adds an allowed architecture.
    pub fn add_allowed_architecture(mut self, arch: impl Into<String>) -> Self {
        self.metadata.allowed_architectures.insert(arch.into());
        self
    }

    /// Adds an allowed platform.
    pub fn add_allowed_platform(mut self, platform: impl Into<String>) -> Self {
        self.metadata.allowed_platforms.insert(platform.into());
        self
    }

    /// Adds a required configuration variable.
    pub fn add_required_config(mut self, name: impl Into<String>) -> Self {
        self.metadata.required_configs.insert(name.into());
        self
    }

    /// Adds a required file.
    pub fn add_required_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.metadata.required_files.insert(path.into());
        self
    }

    /// Adds a required program.
    pub fn add_required_program(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.metadata.required_programs.insert(path.into());
        self
    }

    /// Sets the required memory, in bytes.
    pub fn set_required_memory(mut self, bytes: u64) -> Self {
        self.metadata.required_memory = bytes;
        self
    }

    /// Sets the required user.
    pub fn set_required_user(mut self, user: RequiredUser) -> Self {
        self.metadata.required_user = user;
        self
    }

    /// Marks the test case as having a standalone cleanup routine.
    pub fn set_has_cleanup(mut self, has_cleanup: bool) -> Self {
        self.metadata.has_cleanup = has_cleanup;
        self
    }

    /// Sets the description.
    pub fn set_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    /// Sets the timeout.
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.metadata.timeout_secs = timeout.as_secs();
        self
    }

    /// Sets a custom property.
    pub fn set_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.custom.insert(key.into(), value.into());
        self
    }

    /// Finishes the build.
    pub fn build(self) -> Metadata {
        self.metadata
    }
}

impl Default for MetadataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A single named unit of testing inside a test program.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestCase {
    /// The case's name, unique within its program.
    pub name: String,

    /// The case's metadata.
    pub metadata: Metadata,

    /// A pre-recorded result.
    ///
    /// When present the case is executed as a no-op that immediately yields
    /// this result; used to surface meta-failures (such as a broken test case
    /// listing) through the same pipeline as real results.
    pub fake_result: Option<TestResult>,
}

impl TestCase {
    /// Creates a test case with the given metadata and no fake result.
    pub fn new(name: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            name: name.into(),
            metadata,
            fake_result: None,
        }
    }

    /// Creates a test case that yields `result` without running anything.
    pub fn new_fake(
        name: impl Into<String>,
        metadata: Metadata,
        result: TestResult,
    ) -> Self {
        Self {
            name: name.into(),
            metadata,
            fake_result: Some(result),
        }
    }
}

/// Collection of test cases, keyed by name, in listing order.
pub type TestCasesMap = IndexMap<String, TestCase>;

/// An executable on disk that exposes zero or more test cases through one of
/// the supported interfaces.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestProgram {
    /// The convention the program follows to list and run test cases.
    pub interface: TestInterface,

    /// Path to the program, relative to `root`. Never absolute.
    pub relative_path: Utf8PathBuf,

    /// The root all test programs of this run hang off.
    pub root: Utf8PathBuf,

    /// The test suite the program belongs to.
    pub test_suite: String,

    /// Program-level metadata, inherited by cases that do not override it.
    pub metadata: Metadata,

    /// The program's test cases, filled in lazily by the interface's listing
    /// operation. `None` means not yet materialised.
    test_cases: Option<TestCasesMap>,
}

impl TestProgram {
    /// Creates a test program record.
    ///
    /// `relative_path` must be relative; the program's executable lives at
    /// `root / relative_path`.
    pub fn new(
        interface: TestInterface,
        relative_path: impl Into<Utf8PathBuf>,
        root: impl Into<Utf8PathBuf>,
        test_suite: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        let relative_path = relative_path.into();
        assert!(
            relative_path.is_relative(),
            "test program path `{relative_path}` must be relative"
        );
        Self {
            interface,
            relative_path,
            root: root.into(),
            test_suite: test_suite.into(),
            metadata,
            test_cases: None,
        }
    }

    /// The absolute location of the program on disk.
    pub fn absolute_path(&self) -> Utf8PathBuf {
        self.root.join(&self.relative_path)
    }

    /// The materialised test cases, if the listing has run.
    pub fn test_cases(&self) -> Option<&TestCasesMap> {
        self.test_cases.as_ref()
    }

    /// Records the outcome of the listing operation.
    pub fn set_test_cases(&mut self, test_cases: TestCasesMap) {
        self.test_cases = Some(test_cases);
    }

    /// Looks up a test case by name.
    pub fn find(&self, name: &str) -> Option<&TestCase> {
        self.test_cases.as_ref()?.get(name)
    }
}

/// The environment a run was executed in, captured once per run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// The working directory the run was started from.
    pub cwd: Utf8PathBuf,

    /// The environment variables visible to the run, in iteration order.
    pub env: IndexMap<String, String>,
}

impl Context {
    /// Captures the current process's context.
    pub fn current() -> Self {
        let cwd = std::env::current_dir()
            .ok()
            .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
            .unwrap_or_else(|| Utf8PathBuf::from("/"));
        let mut env: Vec<(String, String)> = std::env::vars().collect();
        env.sort();
        Self {
            cwd,
            env: env.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(TestResult::Passed, true; "passed is good")]
    #[test_case(TestResult::Skipped("nope".into()), true; "skipped is good")]
    #[test_case(TestResult::ExpectedFailure("known".into()), true; "expected failure is good")]
    #[test_case(TestResult::Failed("boom".into()), false; "failed is not good")]
    #[test_case(TestResult::Broken("boom".into()), false; "broken is not good")]
    fn result_goodness(result: TestResult, good: bool) {
        assert_eq!(result.good(), good);
    }

    #[test]
    fn result_display() {
        assert_eq!(TestResult::Passed.to_string(), "passed");
        assert_eq!(
            TestResult::Failed("oh no".into()).to_string(),
            "failed: oh no"
        );
    }

    #[test]
    fn result_serde_round_trip() {
        for result in [
            TestResult::Passed,
            TestResult::Skipped("reason".into()),
            TestResult::ExpectedFailure("reason".into()),
            TestResult::Failed("reason".into()),
            TestResult::Broken("reason".into()),
        ] {
            let json = serde_json::to_string(&result).unwrap();
            let back: TestResult = serde_json::from_str(&json).unwrap();
            assert_eq!(back, result);
        }
    }

    #[test]
    fn metadata_defaults() {
        let metadata = Metadata::default();
        assert_eq!(metadata.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(metadata.required_memory, 0);
        assert_eq!(metadata.required_user, RequiredUser::Any);
        assert!(!metadata.has_cleanup);
        assert!(!metadata.wants_control_dir());
    }

    #[test]
    fn metadata_builder() {
        let metadata = Metadata::builder()
            .set_timeout(Duration::from_secs(10))
            .add_required_config("unprivileged-user")
            .set_custom("wants_control_dir", "true")
            .build();
        assert_eq!(metadata.timeout(), Duration::from_secs(10));
        assert!(metadata.required_configs.contains("unprivileged-user"));
        assert!(metadata.wants_control_dir());
    }

    #[test]
    fn required_user_parse() {
        assert_eq!(RequiredUser::parse(""), Some(RequiredUser::Any));
        assert_eq!(RequiredUser::parse("root"), Some(RequiredUser::Root));
        assert_eq!(
            RequiredUser::parse("unprivileged"),
            Some(RequiredUser::Unprivileged)
        );
        assert_eq!(RequiredUser::parse("wheel"), None);
    }

    #[test]
    fn program_absolute_path() {
        let program = TestProgram::new(
            TestInterface::Plain,
            "dir/prog",
            "/build",
            "suite",
            Metadata::default(),
        );
        assert_eq!(program.absolute_path(), Utf8PathBuf::from("/build/dir/prog"));
    }

    #[test]
    #[should_panic(expected = "must be relative")]
    fn program_rejects_absolute_relative_path() {
        let _ = TestProgram::new(
            TestInterface::Plain,
            "/abs/prog",
            "/build",
            "suite",
            Metadata::default(),
        );
    }

    #[test]
    fn program_cases_lazily_filled() {
        let mut program = TestProgram::new(
            TestInterface::Plain,
            "prog",
            "/build",
            "suite",
            Metadata::default(),
        );
        assert!(program.test_cases().is_none());
        assert!(program.find("main").is_none());

        let mut cases = TestCasesMap::new();
        cases.insert("main".into(), TestCase::new("main", Metadata::default()));
        program.set_test_cases(cases);
        assert!(program.find("main").is_some());
    }
}
