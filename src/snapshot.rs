//! Snapshot metadata and lifecycle.
//!
//! A snapshot is a completed stage's filesystem tree plus a `.strata/`
//! metadata directory. Stages build into a staging tree that is renamed
//! into place only after the completion marker is written; a failed stage
//! leaves no output.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::files::write_file_with_dirs;

/// Metadata directory inside every snapshot.
pub const META_DIR: &str = ".strata";

/// Per-snapshot metadata: stage identity, declared build arguments, the
/// environment accumulated across ancestors, and the completion marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    /// Stage that produced this tree.
    pub stage: String,
    /// Parent stage name, or the external base image name for the root.
    pub parent: String,
    /// Build arguments declared by this stage and its ancestors.
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    /// Environment variables accumulated in declaration order.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Name of the provisioned build account, if any.
    #[serde(default)]
    pub build_user: Option<String>,
    /// Numeric id of the build account.
    #[serde(default)]
    pub build_uid: Option<u32>,
    /// Set only when the stage ran all its steps to the end.
    #[serde(default)]
    pub complete: bool,
}

impl Meta {
    /// Fresh metadata for a stage starting from an external base image.
    pub fn for_image(stage: &str, image: &str) -> Self {
        Self {
            stage: stage.to_string(),
            parent: image.to_string(),
            build_args: BTreeMap::new(),
            env: BTreeMap::new(),
            build_user: None,
            build_uid: None,
            complete: false,
        }
    }

    /// Metadata for a stage derived from a parent snapshot: environment,
    /// build arguments and the build account carry over.
    pub fn derived(stage: &str, parent: &Meta) -> Self {
        Self {
            stage: stage.to_string(),
            parent: parent.stage.clone(),
            build_args: parent.build_args.clone(),
            env: parent.env.clone(),
            build_user: parent.build_user.clone(),
            build_uid: parent.build_uid,
            complete: false,
        }
    }
}

/// Path of the metadata file inside a snapshot tree.
pub fn meta_path(root: &Path) -> PathBuf {
    root.join(META_DIR).join("meta.json")
}

/// Read snapshot metadata.
pub fn read_meta(root: &Path) -> Result<Meta> {
    let path = meta_path(root);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading snapshot metadata at {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("parsing snapshot metadata at {}", path.display()))
}

/// Write snapshot metadata.
pub fn write_meta(root: &Path, meta: &Meta) -> Result<()> {
    let content = serde_json::to_string_pretty(meta)?;
    write_file_with_dirs(meta_path(root), content)
        .with_context(|| format!("writing snapshot metadata under {}", root.display()))
}

/// Whether `root` holds a completed snapshot.
pub fn is_complete(root: &Path) -> bool {
    matches!(read_meta(root), Ok(meta) if meta.complete)
}

/// Move a finished staging tree into its final snapshot location,
/// replacing any previous snapshot of the same stage.
pub fn commit(staging: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest)
            .with_context(|| format!("removing previous snapshot at {}", dest.display()))?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(staging, dest).with_context(|| {
        format!(
            "committing snapshot {} -> {}",
            staging.display(),
            dest.display()
        )
    })
}

/// Remove a failed staging tree. Best effort: a leftover staging tree is
/// never mistaken for output, so removal failure only warrants a warning.
pub fn discard(staging: &Path) {
    if staging.exists() {
        if let Err(e) = fs::remove_dir_all(staging) {
            eprintln!(
                "  [WARN] Failed to remove staging tree {}: {}",
                staging.display(),
                e
            );
        }
    }
}
