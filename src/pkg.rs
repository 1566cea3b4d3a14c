//! OS package provisioning.
//!
//! Packages are installed from a per-variant local archive: a JSON index
//! plus one payload tree per package under `pkgs/`. Installing copies the
//! payload into the snapshot and records the package in the snapshot's
//! package database. Re-declaring a package re-runs the copy; the pipeline
//! makes no attempt to detect no-op installs.
//!
//! The archive index is mirrored into the snapshot at
//! `var/cache/pkg/index.json` on first install. Runtime purges that cache
//! to keep the image small; dev-base descendants retain it so later
//! incremental installs don't refetch the index. Deliberate trade-off,
//! per stage.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::context::{PKG_DB, PKG_INDEX_CACHE};
use crate::files::{copy_tree, write_file_with_dirs};

/// Archive index document.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveIndex {
    pub variant: String,
    pub packages: Vec<PackageMeta>,
}

/// One package known to the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMeta {
    pub name: String,
    pub version: String,
    /// Optional companions pulled in unless the install is minimal.
    #[serde(default)]
    pub recommends: Vec<String>,
}

/// An opened package archive.
#[derive(Debug)]
pub struct Archive {
    dir: PathBuf,
    pub index: ArchiveIndex,
}

impl Archive {
    /// Open the archive for a variant directory. A missing index is fatal:
    /// no package can be provisioned without it.
    pub fn open(dir: &Path) -> Result<Self> {
        let index_path = dir.join("index.json");
        if !index_path.exists() {
            bail!(
                "package archive not found at {} (expected index.json)",
                dir.display()
            );
        }
        let content = fs::read_to_string(&index_path)
            .with_context(|| format!("reading package archive index at {}", index_path.display()))?;
        let index: ArchiveIndex = serde_json::from_str(&content)
            .with_context(|| format!("parsing package archive index at {}", index_path.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            index,
        })
    }

    /// Path of the archive index file.
    pub fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    /// Look up a package by name.
    pub fn find(&self, name: &str) -> Option<&PackageMeta> {
        self.index.packages.iter().find(|p| p.name == name)
    }

    /// Payload tree for a package.
    pub fn payload_dir(&self, meta: &PackageMeta) -> PathBuf {
        self.dir.join("pkgs").join(&meta.name)
    }
}

/// Install packages into a snapshot tree.
///
/// `minimal` skips recommended companions (runtime wants the smallest
/// possible closure). A requested package missing from the archive aborts
/// the stage; a missing recommend is only a warning.
pub fn install(root: &Path, archive: &Archive, names: &[String], minimal: bool) -> Result<()> {
    seed_index_cache(root, archive)?;

    let mut installed = Vec::new();
    for name in names {
        let meta = archive.find(name).with_context(|| {
            format!(
                "package '{}' not found in archive index {}",
                name,
                archive.index_path().display()
            )
        })?;
        install_one(root, archive, meta)?;
        installed.push(meta.clone());

        if !minimal {
            for rec in &meta.recommends {
                match archive.find(rec) {
                    Some(rec_meta) => {
                        install_one(root, archive, rec_meta)?;
                        installed.push(rec_meta.clone());
                    }
                    None => eprintln!(
                        "  [WARN] recommended package '{}' (for '{}') not in archive, skipping",
                        rec, name
                    ),
                }
            }
        }
    }

    record_installed(root, &installed)?;
    println!("  installed {} package(s)", installed.len());
    Ok(())
}

fn install_one(root: &Path, archive: &Archive, meta: &PackageMeta) -> Result<()> {
    let payload = archive.payload_dir(meta);
    if !payload.exists() {
        bail!(
            "archive payload missing for package '{}' at {}",
            meta.name,
            payload.display()
        );
    }
    copy_tree(&payload, root)
        .with_context(|| format!("installing package '{}'", meta.name))?;
    Ok(())
}

fn seed_index_cache(root: &Path, archive: &Archive) -> Result<()> {
    let cache = root.join(PKG_INDEX_CACHE);
    if !cache.exists() {
        let content = fs::read(archive.index_path())?;
        write_file_with_dirs(&cache, content)?;
    }
    Ok(())
}

/// Remove the snapshot's copy of the archive index.
pub fn purge_index_cache(root: &Path) -> Result<()> {
    let cache = root.join(PKG_INDEX_CACHE);
    if cache.exists() {
        fs::remove_file(&cache)
            .with_context(|| format!("purging package index cache at {}", cache.display()))?;
    }
    Ok(())
}

/// Installed packages recorded in a snapshot, name -> version.
pub fn installed(root: &Path) -> Result<BTreeMap<String, String>> {
    let db = root.join(PKG_DB);
    if !db.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(&db)
        .with_context(|| format!("reading package database at {}", db.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("parsing package database at {}", db.display()))
}

fn record_installed(root: &Path, packages: &[PackageMeta]) -> Result<()> {
    let mut db = installed(root)?;
    for meta in packages {
        db.insert(meta.name.clone(), meta.version.clone());
    }
    write_file_with_dirs(root.join(PKG_DB), serde_json::to_string_pretty(&db)?)
}
