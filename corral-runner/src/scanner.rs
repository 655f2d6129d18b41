// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lazy iteration over the `(test program, test case)` pairs selected by the
//! user's filters.
//!
//! The scanner owns the program table for the duration of a run; everything
//! downstream refers to programs through their index in that table, which
//! keeps program/case relationships cycle-free. Case lists are materialised
//! on demand, one program at a time, so a filtered run never pays the listing
//! cost of programs it does not touch.

use crate::{config::UserConfig, executor::Executor, model::TestProgram};
use camino::{Utf8Path, Utf8PathBuf};
use std::{collections::VecDeque, fmt, str::FromStr};

/// A user-supplied test filter: a test program path, a directory prefix of
/// test program paths, or a `path:case` pair.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TestFilter {
    /// Program path or directory prefix, relative to the test suite root.
    pub path: Utf8PathBuf,

    /// Specific test case within `path`, if any.
    pub test_case: Option<String>,
}

impl TestFilter {
    /// Whether this filter may select cases of the given program.
    fn matches_program(&self, relative_path: &Utf8Path) -> bool {
        if self.path == relative_path {
            return true;
        }
        // A bare path also selects everything under it, but a filter naming
        // a test case must match the program exactly.
        self.test_case.is_none() && relative_path.starts_with(&self.path)
    }

    /// Whether this filter selects the given test case.
    fn matches_test_case(&self, relative_path: &Utf8Path, case_name: &str) -> bool {
        if !self.matches_program(relative_path) {
            return false;
        }
        match &self.test_case {
            None => true,
            Some(wanted) => wanted == case_name,
        }
    }
}

/// Error produced when parsing a syntactically invalid filter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidFilter {
    /// The filter as typed by the user.
    pub filter: String,
    /// What is wrong with it.
    pub message: String,
}

impl fmt::Display for InvalidFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid filter `{}`: {}", self.filter, self.message)
    }
}

impl std::error::Error for InvalidFilter {}

impl FromStr for TestFilter {
    type Err = InvalidFilter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, test_case) = match s.split_once(':') {
            Some((path, case)) => (path, Some(case)),
            None => (s, None),
        };
        if path.is_empty() {
            return Err(InvalidFilter {
                filter: s.to_owned(),
                message: "program path is empty".to_owned(),
            });
        }
        if test_case == Some("") {
            return Err(InvalidFilter {
                filter: s.to_owned(),
                message: "test case name is empty".to_owned(),
            });
        }
        let path = Utf8PathBuf::from(path);
        if path.is_absolute() {
            return Err(InvalidFilter {
                filter: s.to_owned(),
                message: "program path must be relative".to_owned(),
            });
        }
        Ok(TestFilter {
            path,
            test_case: test_case.map(str::to_owned),
        })
    }
}

impl fmt::Display for TestFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.test_case {
            None => write!(f, "{}", self.path),
            Some(case) => write!(f, "{}:{case}", self.path),
        }
    }
}

/// One scheduling unit produced by the scanner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanMatch {
    /// Index of the program in the scanner's program table.
    pub program_id: usize,

    /// Name of the selected test case.
    pub test_case_name: String,
}

/// Lazy producer of `(program, case)` pairs.
pub struct Scanner {
    programs: Vec<TestProgram>,
    filters: Vec<TestFilter>,
    filter_used: Vec<bool>,
    next_program: usize,
    current_program: usize,
    pending_cases: VecDeque<String>,
    done: bool,
}

impl Scanner {
    /// Creates a scanner over the given programs and filters.
    ///
    /// An empty filter set selects everything.
    pub fn new(programs: Vec<TestProgram>, filters: Vec<TestFilter>) -> Self {
        let filter_used = vec![false; filters.len()];
        Self {
            programs,
            filters,
            filter_used,
            next_program: 0,
            current_program: 0,
            pending_cases: VecDeque::new(),
            done: false,
        }
    }

    /// The scanner's program table.
    pub fn programs(&self) -> &[TestProgram] {
        &self.programs
    }

    /// A program by its table index.
    pub fn program(&self, program_id: usize) -> &TestProgram {
        &self.programs[program_id]
    }

    /// Whether the scanner has run out of matches.
    pub fn done(&self) -> bool {
        self.done
    }

    /// Produces the next match, materialising case lists through `executor`
    /// as needed. Returns `None` once everything has been yielded.
    pub fn yield_next(
        &mut self,
        executor: &mut Executor,
        user_config: &UserConfig,
    ) -> Option<ScanMatch> {
        loop {
            if let Some(case_name) = self.pending_cases.pop_front() {
                return Some(ScanMatch {
                    program_id: self.current_program,
                    test_case_name: case_name,
                });
            }
            if self.done {
                return None;
            }

            let program_id = match self.advance_program() {
                Some(program_id) => program_id,
                None => {
                    self.done = true;
                    return None;
                }
            };

            if self.programs[program_id].test_cases().is_none() {
                let test_cases = executor.list_tests(&self.programs[program_id], user_config);
                self.programs[program_id].set_test_cases(test_cases);
            }

            self.current_program = program_id;
            self.pending_cases = self.select_cases(program_id);
        }
    }

    /// Filters the user did not manage to match anything with.
    pub fn unused_filters(&self) -> Vec<TestFilter> {
        self.filters
            .iter()
            .zip(&self.filter_used)
            .filter(|(_, used)| !**used)
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    /// Finds the next program any filter is interested in.
    fn advance_program(&mut self) -> Option<usize> {
        while self.next_program < self.programs.len() {
            let program_id = self.next_program;
            self.next_program += 1;
            let relative_path = &self.programs[program_id].relative_path;
            if self.filters.is_empty()
                || self
                    .filters
                    .iter()
                    .any(|filter| filter.matches_program(relative_path))
            {
                return Some(program_id);
            }
        }
        None
    }

    /// Selects the cases of a listed program, marking the filters that
    /// matched along the way.
    fn select_cases(&mut self, program_id: usize) -> VecDeque<String> {
        let program = &self.programs[program_id];
        let Some(test_cases) = program.test_cases() else {
            return VecDeque::new();
        };

        let mut selected = VecDeque::new();
        for case_name in test_cases.keys() {
            if self.filters.is_empty() {
                selected.push_back(case_name.clone());
                continue;
            }
            let mut matched = false;
            for (filter, used) in self.filters.iter().zip(self.filter_used.iter_mut()) {
                if filter.matches_test_case(&program.relative_path, case_name) {
                    *used = true;
                    matched = true;
                }
            }
            if matched {
                selected.push_back(case_name.clone());
            }
        }
        selected
    }
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("programs", &self.programs.len())
            .field("filters", &self.filters)
            .field("next_program", &self.next_program)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
