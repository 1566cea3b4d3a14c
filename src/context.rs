//! Build context shared across all pipeline modules.
//!
//! Provides the on-disk layout: external inputs (base images, package
//! archive, project tree, registry) live under the pipeline root, outputs
//! under `output/`.

use std::path::{Path, PathBuf};

use crate::config::Params;
use crate::stage::StageId;

/// Canonical working directory inside every snapshot (relative path).
pub const WORKDIR: &str = "workspace";
/// The project's own scripts directory, appended to PATH.
pub const SCRIPTS_DIR: &str = "workspace/scripts";
/// Dependency cache directory inside a snapshot.
pub const DEP_CACHE: &str = "var/cache/deps";
/// Installed OS package database inside a snapshot.
pub const PKG_DB: &str = "var/lib/pkgdb/status.json";
/// Retained copy of the package archive index inside a snapshot.
pub const PKG_INDEX_CACHE: &str = "var/cache/pkg/index.json";
/// Resolver retry/concurrency policy file inside a snapshot.
pub const RESOLVER_POLICY: &str = "etc/strata/resolver.toml";
/// File name of the dependency manifest.
pub const MANIFEST_NAME: &str = "manifest.toml";

/// Shared context for all pipeline operations.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Pipeline root directory
    pub base_dir: PathBuf,
    /// Build parameters (substitution values only)
    pub params: Params,
}

impl BuildContext {
    /// Create a new build context.
    pub fn new(base_dir: &Path, params: Params) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            params,
        }
    }

    /// Root filesystem seed the runtime stage starts from.
    pub fn base_image_dir(&self) -> PathBuf {
        self.base_dir.join("base").join(self.params.base_image())
    }

    /// OS package archive for the configured variant.
    pub fn archive_dir(&self) -> PathBuf {
        self.base_dir.join("archive").join(&self.params.os_variant)
    }

    /// Output directory for all build products.
    pub fn output_dir(&self) -> PathBuf {
        self.base_dir.join("output")
    }

    /// Directory holding completed stage snapshots.
    pub fn stages_dir(&self) -> PathBuf {
        self.output_dir().join("stages")
    }

    /// Directory holding in-progress staging trees.
    pub fn staging_dir(&self) -> PathBuf {
        self.output_dir().join("staging")
    }

    /// Completed snapshot location for a stage.
    pub fn snapshot_dir(&self, id: StageId) -> PathBuf {
        self.stages_dir().join(id.name())
    }

    /// Staging tree location for a stage while it builds.
    pub fn staging_for(&self, id: StageId) -> PathBuf {
        self.staging_dir().join(id.name())
    }

    /// Recorded input digest for a stage.
    pub fn hash_file(&self, id: StageId) -> PathBuf {
        self.output_dir()
            .join(".hashes")
            .join(format!("{}.hash", id.name()))
    }

    /// The project's dependency manifest on the host side.
    pub fn manifest_path(&self) -> PathBuf {
        self.params.project_dir.join(MANIFEST_NAME)
    }

    /// Host-side cache for remote dependency fetches.
    pub fn fetch_cache_dir(&self) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("strata")
    }
}
