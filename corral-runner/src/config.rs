// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-user configuration for a run.
//!
//! The configuration is a small TOML document:
//!
//! ```toml
//! parallelism = 4
//! unprivileged_user = "nobody"
//!
//! [test_suites.my-suite]
//! timeout = "10"
//! lang = "en"
//! ```
//!
//! Per-suite variables are free-form strings handed to test programs through
//! each interface's own convention.

use crate::errors::ConfigError;
use camino::Utf8Path;
use indexmap::IndexMap;
use serde::Deserialize;

/// A resolved unprivileged user to drop privileges to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnprivilegedUser {
    /// The login name.
    pub name: String,
    /// The numeric user id.
    pub uid: u32,
    /// The user's primary group id.
    pub gid: u32,
}

/// User-provided configuration for a run.
#[derive(Clone, Debug)]
pub struct UserConfig {
    /// Maximum number of test cases kept in flight; always at least 1.
    pub parallelism: usize,

    /// User to drop privileges to for cases that require running
    /// unprivileged.
    pub unprivileged_user: Option<UnprivilegedUser>,

    test_suites: IndexMap<String, IndexMap<String, String>>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            unprivileged_user: None,
            test_suites: IndexMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    parallelism: Option<usize>,
    unprivileged_user: Option<String>,
    #[serde(default)]
    test_suites: IndexMap<String, IndexMap<String, String>>,
}

impl UserConfig {
    /// Loads the configuration from a TOML file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;

        let parallelism = raw.parallelism.unwrap_or(1);
        if parallelism < 1 {
            return Err(ConfigError::InvalidParallelism);
        }

        let unprivileged_user = raw
            .unprivileged_user
            .map(|name| resolve_user(&name))
            .transpose()?;

        Ok(Self {
            parallelism,
            unprivileged_user,
            test_suites: raw.test_suites,
        })
    }

    /// The variables configured for a test suite, in declaration order.
    ///
    /// Returns an empty map for suites without configuration.
    pub fn test_suite_vars(&self, test_suite: &str) -> IndexMap<String, String> {
        self.test_suites.get(test_suite).cloned().unwrap_or_default()
    }

    /// Whether the given variable is set for the given suite.
    pub fn has_test_suite_var(&self, test_suite: &str, name: &str) -> bool {
        self.test_suites
            .get(test_suite)
            .is_some_and(|vars| vars.contains_key(name))
    }

    /// Sets a per-suite variable; primarily useful to build configurations
    /// programmatically.
    pub fn set_test_suite_var(
        &mut self,
        test_suite: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.test_suites
            .entry(test_suite.into())
            .or_default()
            .insert(name.into(), value.into());
    }
}

fn resolve_user(name: &str) -> Result<UnprivilegedUser, ConfigError> {
    let user = nix::unistd::User::from_name(name)
        .map_err(|source| ConfigError::UserLookup {
            user: name.to_owned(),
            source,
        })?
        .ok_or_else(|| ConfigError::UnknownUser {
            user: name.to_owned(),
        })?;
    Ok(UnprivilegedUser {
        name: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
    })
}
