// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{EXIT_FAILED_TESTS, EXIT_INTERNAL, EXIT_INTERRUPTED, EXIT_OK, EXIT_USAGE};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use corral_runner::{
    config::UserConfig,
    driver::{self, RunHooks},
    errors::DriveError,
    model::{TestProgram, TestResult},
    report_junit::JunitHooks,
    scanner::TestFilter,
};
use std::time::Duration;

/// A parallel scheduler and executor for heterogeneous test programs.
#[derive(Debug, Parser)]
#[command(name = "corral", version, about)]
pub struct CorralApp {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute the test programs named by a Kyuafile manifest.
    Run {
        /// Path to the manifest naming the test programs to run.
        #[arg(long, value_name = "PATH")]
        kyuafile: Utf8PathBuf,

        /// Root of the built test programs; defaults to the manifest's
        /// directory.
        #[arg(long, value_name = "PATH")]
        build_root: Option<Utf8PathBuf>,

        /// Path of the results store to create.
        #[arg(long, value_name = "PATH")]
        store: Utf8PathBuf,

        /// Path to the user configuration file.
        #[arg(long, value_name = "PATH")]
        config: Option<Utf8PathBuf>,

        /// Test filters: `path`, a directory prefix, or `path:case`.
        #[arg(value_name = "FILTER")]
        filters: Vec<String>,
    },

    /// Render a completed results store as a JUnit XML document.
    ReportJunit {
        /// Path of the results store to read.
        #[arg(long, value_name = "PATH")]
        results_file: Utf8PathBuf,

        /// Path of the JUnit document to write.
        #[arg(long, value_name = "PATH")]
        output: Utf8PathBuf,
    },
}

impl CorralApp {
    /// Runs the selected command and returns the process exit code.
    pub fn exec(self) -> i32 {
        match self.command {
            Command::Run {
                kyuafile,
                build_root,
                store,
                config,
                filters,
            } => run(&kyuafile, build_root.as_deref(), &store, config.as_deref(), &filters),
            Command::ReportJunit {
                results_file,
                output,
            } => report_junit(&results_file, &output),
        }
    }
}

/// Console reporter for the run path: one line per finished test case.
#[derive(Debug, Default)]
struct ConsoleHooks;

impl RunHooks for ConsoleHooks {
    fn got_result(
        &mut self,
        program: &TestProgram,
        test_case_name: &str,
        result: &TestResult,
        duration: Duration,
    ) {
        println!(
            "{}:{test_case_name}  ->  {result}  [{:.3}s]",
            program.relative_path,
            duration.as_secs_f64()
        );
    }
}

fn run(
    kyuafile: &camino::Utf8Path,
    build_root: Option<&camino::Utf8Path>,
    store: &camino::Utf8Path,
    config: Option<&camino::Utf8Path>,
    raw_filters: &[String],
) -> i32 {
    let user_config = match config {
        Some(path) => match UserConfig::load(path) {
            Ok(user_config) => user_config,
            Err(error) => {
                eprintln!("corral: {}", error_chain(&error));
                return EXIT_USAGE;
            }
        },
        None => UserConfig::default(),
    };

    let mut filters = Vec::with_capacity(raw_filters.len());
    for raw in raw_filters {
        match raw.parse::<TestFilter>() {
            Ok(filter) => filters.push(filter),
            Err(error) => {
                eprintln!("corral: {error}");
                return EXIT_USAGE;
            }
        }
    }

    let mut hooks = ConsoleHooks;
    match driver::run_tests(kyuafile, build_root, store, filters, &user_config, &mut hooks) {
        Ok(run_result) => {
            let stats = run_result.stats;
            println!(
                "{}/{} passed ({} failed or broken)",
                stats.good, stats.total, stats.bad
            );
            let mut code = if stats.bad > 0 { EXIT_FAILED_TESTS } else { EXIT_OK };
            for filter in &run_result.unused_filters {
                eprintln!("corral: no test cases matched by the filter `{filter}`");
                code = EXIT_FAILED_TESTS;
            }
            code
        }
        Err(DriveError::Interrupted(_)) => {
            eprintln!("corral: interrupted");
            EXIT_INTERRUPTED
        }
        Err(error @ DriveError::Manifest(_)) => {
            eprintln!("corral: {}", error_chain(&error));
            EXIT_USAGE
        }
        Err(error) => {
            eprintln!("corral: {}", error_chain(&error));
            EXIT_INTERNAL
        }
    }
}

fn report_junit(results_file: &camino::Utf8Path, output: &camino::Utf8Path) -> i32 {
    let mut hooks = JunitHooks::new();
    if let Err(error) = driver::scan_results(results_file, &mut hooks) {
        eprintln!("corral: {}", error_chain(&error));
        return EXIT_INTERNAL;
    }
    let file = match std::fs::File::create(output) {
        Ok(file) => file,
        Err(error) => {
            eprintln!("corral: failed to create {output}: {error}");
            return EXIT_INTERNAL;
        }
    };
    if let Err(error) = hooks.write(file) {
        eprintln!("corral: failed to write {output}: {error}");
        return EXIT_INTERNAL;
    }
    EXIT_OK
}

/// Renders an error and its sources on one line.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    message
}
