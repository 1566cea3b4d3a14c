//! Shared test utilities for strata tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use tempfile::TempDir;

use strata::config::Params;
use strata::context::BuildContext;
use strata::files::write_file_with_dirs;
use strata::pkg::{ArchiveIndex, PackageMeta};

/// Test environment with a fully seeded pipeline root: base image,
/// package archive, dependency registry and project tree.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Pipeline root
    pub base_dir: PathBuf,
}

impl TestEnv {
    /// Standard environment: manifest without an install command.
    pub fn new() -> Self {
        Self::create(None)
    }

    /// Environment whose manifest declares a collaborator install command.
    pub fn with_install_command(command: &str) -> Self {
        Self::create(Some(command))
    }

    fn create(install_command: Option<&str>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base_dir = temp_dir.path().to_path_buf();

        seed_base_image(&base_dir.join("base/bookworm-3.12"));
        seed_archive(&base_dir.join("archive/bookworm"));
        seed_registry(&base_dir.join("registry"));
        seed_project(&base_dir.join("project"), install_command);

        Self {
            _temp_dir: temp_dir,
            base_dir,
        }
    }

    /// Build parameters pointing at the seeded inputs.
    pub fn params(&self) -> Params {
        Params {
            runtime_version: "3.12".to_string(),
            os_variant: "bookworm".to_string(),
            build_uid: 1000,
            build_user: "dev".to_string(),
            project_dir: self.base_dir.join("project"),
            registry_dir: self.base_dir.join("registry"),
        }
    }

    /// Build context over the seeded root.
    pub fn ctx(&self) -> BuildContext {
        BuildContext::new(&self.base_dir, self.params())
    }

    /// Host-side manifest path.
    pub fn manifest_path(&self) -> PathBuf {
        self.base_dir.join("project/manifest.toml")
    }
}

/// Minimal root-filesystem seed standing in for the external base image.
pub fn seed_base_image(dir: &Path) {
    write_file_with_dirs(
        dir.join("etc/os-release"),
        "ID=mockos\nVERSION_CODENAME=bookworm\n",
    )
    .expect("Failed to seed base image");
    write_file_with_dirs(dir.join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\n")
        .expect("Failed to seed passwd");
    write_file_with_dirs(dir.join("etc/group"), "root:x:0:\n").expect("Failed to seed group");
    write_file_with_dirs(dir.join("usr/lib/runtime/libruntime.so.3.12"), "runtime")
        .expect("Failed to seed runtime library");
    write_file_with_dirs(dir.join("bin/sh"), "#!/bin/sh\n").expect("Failed to seed shell");
}

fn package(name: &str, version: &str, recommends: &[&str]) -> PackageMeta {
    PackageMeta {
        name: name.to_string(),
        version: version.to_string(),
        recommends: recommends.iter().map(|s| s.to_string()).collect(),
    }
}

/// Package archive with every package the stage definitions reference,
/// plus the recommends used to distinguish minimal installs.
pub fn seed_archive(dir: &Path) {
    let index = ArchiveIndex {
        variant: "bookworm".to_string(),
        packages: vec![
            package("libextdb1", "5.3.0", &["extdb-doc"]),
            package("extdb-doc", "5.3.0", &[]),
            package("ca-certificates", "2024.1", &[]),
            package("build-essential", "12.9", &[]),
            package("git", "2.39", &[]),
            package("sudo", "1.9", &[]),
            package("pkg-config", "1.8", &[]),
            package("vim", "9.0", &["vim-runtime"]),
            package("vim-runtime", "9.0", &[]),
            package("bash-completion", "2.11", &[]),
            package("htop", "3.2", &[]),
            package("gnupg", "2.2", &[]),
        ],
    };
    write_file_with_dirs(
        dir.join("index.json"),
        serde_json::to_string_pretty(&index).expect("Failed to serialize index"),
    )
    .expect("Failed to seed archive index");

    for meta in &index.packages {
        // One marker file per payload so installs are observable.
        write_file_with_dirs(
            dir.join("pkgs")
                .join(&meta.name)
                .join(format!("usr/share/pkg/{}", meta.name)),
            meta.version.clone(),
        )
        .expect("Failed to seed package payload");
    }
    write_file_with_dirs(dir.join("pkgs/vim/usr/bin/vim"), "elf").expect("Failed to seed vim");
    write_file_with_dirs(
        dir.join("pkgs/build-essential/usr/bin/cc"),
        "elf",
    )
    .expect("Failed to seed cc");
}

/// Dependency registry with one payload per manifest entry.
pub fn seed_registry(dir: &Path) {
    write_file_with_dirs(dir.join("extdb-core-2.1.0/lib/extdb_core.so"), "core")
        .expect("Failed to seed extdb-core");
    write_file_with_dirs(dir.join("extdb-cli-1.0.3/bin/extdb"), "cli")
        .expect("Failed to seed extdb-cli");
    write_file_with_dirs(dir.join("devtool-0.9.1/bin/devtool"), "tool")
        .expect("Failed to seed devtool");
}

/// Project tree: manifest plus source files the pipeline never inspects.
pub fn seed_project(dir: &Path, install_command: Option<&str>) {
    write_manifest(dir, install_command);
    write_file_with_dirs(dir.join("src/bindings.c"), "/* extension bindings */\n")
        .expect("Failed to seed source");
    write_file_with_dirs(dir.join("scripts/run-tests.sh"), "#!/bin/sh\nexit 0\n")
        .expect("Failed to seed scripts");
}

/// (Re)write the project manifest.
pub fn write_manifest(dir: &Path, install_command: Option<&str>) {
    let mut doc = String::from("[manifest]\nversion = 1\n");
    if let Some(command) = install_command {
        doc.push_str(&format!("install-command = \"{}\"\n", command));
    }
    doc.push_str(
        r#"
[[dependency]]
name = "extdb-core"
version = "2.1.0"
group = "default"
source = "extdb-core-2.1.0"

[[dependency]]
name = "extdb-cli"
version = "1.0.3"
group = "default"
source = "extdb-cli-1.0.3"

[[dependency]]
name = "devtool"
version = "0.9.1"
group = "development"
source = "devtool-0.9.1"
"#,
    );
    write_file_with_dirs(dir.join("manifest.toml"), doc).expect("Failed to write manifest");
}

/// Assert that a file exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}

/// Assert that a directory exists.
pub fn assert_dir_exists(path: &Path) {
    assert!(path.is_dir(), "Expected directory to exist: {}", path.display());
}

/// Assert that a file contains expected content.
pub fn assert_file_contains(path: &Path, expected: &str) {
    let content = std::fs::read_to_string(path)
        .unwrap_or_else(|_| panic!("Failed to read file: {}", path.display()));
    assert!(
        content.contains(expected),
        "File {} does not contain expected content.\nExpected to find: {}\nActual content: {}",
        path.display(),
        expected,
        content
    );
}
