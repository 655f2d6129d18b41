// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The thin command-line layer over `corral-runner`.

mod dispatch;

pub use dispatch::CorralApp;

/// Every test case produced a result and all results were good.
pub const EXIT_OK: i32 = 0;

/// The run completed but produced failed or broken results, or some filters
/// matched nothing.
pub const EXIT_FAILED_TESTS: i32 = 1;

/// Usage error; also produced by clap for unparseable command lines.
pub const EXIT_USAGE: i32 = 2;

/// Internal error: the store, the manifest or the executor failed.
pub const EXIT_INTERNAL: i32 = 3;

/// The run was interrupted by a termination signal.
pub const EXIT_INTERRUPTED: i32 = 130;
