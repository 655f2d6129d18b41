// Copyright (c) The corral Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Loader for the test suite manifest (the Kyuafile).
//!
//! The manifest is a TOML document naming the test programs of a source tree
//! in execution order:
//!
//! ```toml
//! test_suite = "my-project"
//!
//! [[test_program]]
//! interface = "atf"
//! path = "core/fs_test"
//!
//! [[test_program]]
//! interface = "plain"
//! path = "contrib/smoke_test"
//! test_suite = "contrib"
//!
//! [test_program.metadata]
//! timeout = 30
//! required_user = "unprivileged"
//! ```
//!
//! Program paths are relative to the build root, which defaults to the
//! directory containing the manifest itself.

use crate::{
    errors::ManifestError,
    interfaces::TestInterface,
    model::{Metadata, MetadataBuilder, RequiredUser, TestProgram},
};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    test_suite: Option<String>,
    #[serde(default, rename = "test_program")]
    test_programs: Vec<RawTestProgram>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTestProgram {
    interface: String,
    path: Utf8PathBuf,
    test_suite: Option<String>,
    #[serde(default)]
    metadata: RawMetadata,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMetadata {
    description: Option<String>,
    timeout: Option<u64>,
    #[serde(default)]
    allowed_architectures: Vec<String>,
    #[serde(default)]
    allowed_platforms: Vec<String>,
    #[serde(default)]
    required_configs: Vec<String>,
    #[serde(default)]
    required_files: Vec<Utf8PathBuf>,
    #[serde(default)]
    required_programs: Vec<Utf8PathBuf>,
    required_memory: Option<u64>,
    required_user: Option<String>,
    has_cleanup: Option<bool>,
    #[serde(default)]
    custom: BTreeMap<String, String>,
}

/// Loads the manifest at `path`.
///
/// Returns the test programs in declaration order. `build_root` overrides the
/// root the program paths are resolved against; it defaults to the manifest's
/// directory. The returned programs carry an absolute root so they stay
/// executable after the children change their working directories.
pub fn load(
    path: &Utf8Path,
    build_root: Option<&Utf8Path>,
) -> Result<Vec<TestProgram>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.to_owned(),
        source,
    })?;
    let raw: RawManifest = toml::from_str(&text).map_err(|source| ManifestError::Parse {
        path: path.to_owned(),
        source,
    })?;

    let root = match build_root {
        Some(root) => root.to_owned(),
        None => path.parent().unwrap_or(Utf8Path::new(".")).to_owned(),
    };
    let root = absolutize(&root);

    let mut programs = Vec::with_capacity(raw.test_programs.len());
    for raw_program in raw.test_programs {
        if raw_program.path.is_absolute() {
            return Err(ManifestError::AbsoluteProgramPath {
                program: raw_program.path,
            });
        }
        let interface: TestInterface = raw_program.interface.parse().map_err(|_| {
            ManifestError::UnknownInterface {
                interface: raw_program.interface.clone(),
                program: raw_program.path.clone(),
            }
        })?;
        let test_suite = raw_program
            .test_suite
            .or_else(|| raw.test_suite.clone())
            .ok_or_else(|| ManifestError::MissingTestSuite {
                program: raw_program.path.clone(),
            })?;
        let metadata = build_metadata(raw_program.metadata, &raw_program.path)?;

        programs.push(TestProgram::new(
            interface,
            raw_program.path,
            root.clone(),
            test_suite,
            metadata,
        ));
    }
    Ok(programs)
}

fn build_metadata(raw: RawMetadata, program: &Utf8Path) -> Result<Metadata, ManifestError> {
    let mut builder = MetadataBuilder::new();
    if let Some(description) = raw.description {
        builder = builder.set_description(description);
    }
    if let Some(timeout) = raw.timeout {
        builder = builder.set_timeout(Duration::from_secs(timeout));
    }
    for arch in raw.allowed_architectures {
        builder = builder.add_allowed_architecture(arch);
    }
    for platform in raw.allowed_platforms {
        builder = builder.add_allowed_platform(platform);
    }
    for config in raw.required_configs {
        builder = builder.add_required_config(config);
    }
    for file in raw.required_files {
        builder = builder.add_required_file(file);
    }
    for prog in raw.required_programs {
        builder = builder.add_required_program(prog);
    }
    if let Some(memory) = raw.required_memory {
        builder = builder.set_required_memory(memory);
    }
    if let Some(user) = raw.required_user {
        let user = RequiredUser::parse(&user).ok_or_else(|| ManifestError::InvalidRequiredUser {
            value: user.clone(),
            program: program.to_owned(),
        })?;
        builder = builder.set_required_user(user);
    }
    if let Some(has_cleanup) = raw.has_cleanup {
        builder = builder.set_has_cleanup(has_cleanup);
    }
    for (key, value) in raw.custom {
        builder = builder.set_custom(key, value);
    }
    Ok(builder.build())
}

fn absolutize(path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        return path.to_owned();
    }
    match std::env::current_dir()
        .ok()
        .and_then(|cwd| Utf8PathBuf::from_path_buf(cwd).ok())
    {
        Some(cwd) => cwd.join(path),
        None => path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn write_manifest(dir: &Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("Kyuafile.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn load_ordered_programs() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r#"
                test_suite = "default-suite"

                [[test_program]]
                interface = "plain"
                path = "b_test"

                [[test_program]]
                interface = "tap"
                path = "a_test"
                test_suite = "other"
            "#},
        );
        let programs = load(&path, None).unwrap();
        assert_eq!(programs.len(), 2);
        assert_eq!(programs[0].relative_path, Utf8PathBuf::from("b_test"));
        assert_eq!(programs[0].test_suite, "default-suite");
        assert_eq!(programs[0].interface, TestInterface::Plain);
        assert_eq!(programs[1].relative_path, Utf8PathBuf::from("a_test"));
        assert_eq!(programs[1].test_suite, "other");
        assert_eq!(programs[1].interface, TestInterface::Tap);
        // The default root is the manifest's own directory.
        assert_eq!(programs[0].root, dir.path());
        assert!(programs[0].root.is_absolute());
    }

    #[test]
    fn load_metadata() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r#"
                [[test_program]]
                interface = "atf"
                path = "x_test"
                test_suite = "s"

                [test_program.metadata]
                timeout = 42
                has_cleanup = true
                required_user = "unprivileged"
                required_configs = ["abcde"]
                required_memory = 1024

                [test_program.metadata.custom]
                wants_control_dir = "true"
            "#},
        );
        let programs = load(&path, None).unwrap();
        let metadata = &programs[0].metadata;
        assert_eq!(metadata.timeout(), Duration::from_secs(42));
        assert!(metadata.has_cleanup);
        assert_eq!(metadata.required_user, RequiredUser::Unprivileged);
        assert!(metadata.required_configs.contains("abcde"));
        assert_eq!(metadata.required_memory, 1024);
        assert!(metadata.wants_control_dir());
    }

    #[test]
    fn build_root_override() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r#"
                [[test_program]]
                interface = "plain"
                path = "t"
                test_suite = "s"
            "#},
        );
        let programs = load(&path, Some(Utf8Path::new("/opt/tests"))).unwrap();
        assert_eq!(
            programs[0].absolute_path(),
            Utf8PathBuf::from("/opt/tests/t")
        );
    }

    #[test]
    fn absolute_program_path_rejected() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r#"
                [[test_program]]
                interface = "plain"
                path = "/abs/t"
                test_suite = "s"
            "#},
        );
        assert!(matches!(
            load(&path, None),
            Err(ManifestError::AbsoluteProgramPath { .. })
        ));
    }

    #[test]
    fn unknown_interface_rejected() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r#"
                [[test_program]]
                interface = "junit"
                path = "t"
                test_suite = "s"
            "#},
        );
        assert!(matches!(
            load(&path, None),
            Err(ManifestError::UnknownInterface { .. })
        ));
    }

    #[test]
    fn missing_test_suite_rejected() {
        let dir = Utf8TempDir::new().unwrap();
        let path = write_manifest(
            &dir,
            indoc! {r#"
                [[test_program]]
                interface = "plain"
                path = "t"
            "#},
        );
        assert!(matches!(
            load(&path, None),
            Err(ManifestError::MissingTestSuite { .. })
        ));
    }
}
