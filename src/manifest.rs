//! Dependency manifest parsing.
//!
//! The manifest is the collaborator library's lockfile-like artifact: a
//! versioned TOML document listing exact dependency versions partitioned
//! into named groups. The pipeline never edits it; only the installed
//! subset (which groups are excluded) varies per stage.
//!
//! ```toml
//! [manifest]
//! version = 1
//! install-command = "sh scripts/install.sh"
//!
//! [[dependency]]
//! name = "extdb-core"
//! version = "2.1.0"
//! group = "default"
//! source = "extdb-core-2.1.0"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::cache;

/// Group installed in every stage that resolves dependencies.
pub const DEFAULT_GROUP: &str = "default";
/// Group excluded from the testing stage and layered on in development.
pub const DEV_GROUP: &str = "development";

/// Manifest format version this build understands.
const SUPPORTED_VERSION: u32 = 1;

/// The parsed dependency manifest.
#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub manifest: Info,
    #[serde(default, rename = "dependency")]
    pub dependencies: Vec<Dependency>,
}

/// Header of the manifest.
#[derive(Debug, Deserialize)]
pub struct Info {
    pub version: u32,
    /// Collaborator build/install command, run inside the working
    /// directory after the source tree is populated.
    #[serde(default, rename = "install-command")]
    pub install_command: Option<String>,
}

/// One locked dependency.
#[derive(Debug, Clone, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
    #[serde(default = "default_group")]
    pub group: String,
    /// Registry-relative payload path, or an http(s) URL.
    pub source: String,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Where a dependency payload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Path relative to the configured registry directory.
    Registry(String),
    /// Remote URL, fetched with retries.
    Http(String),
}

impl Dependency {
    /// Canonical payload directory name, `<name>-<version>`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// Classify the declared source.
    pub fn source(&self) -> Source {
        if self.source.starts_with("http://") || self.source.starts_with("https://") {
            Source::Http(self.source.clone())
        } else {
            Source::Registry(self.source.clone())
        }
    }
}

impl Manifest {
    /// Parse and validate a manifest document.
    pub fn parse(text: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(text).context("parsing dependency manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load a manifest file, returning it together with its content digest.
    /// The digest identifies the manifest for staleness checks.
    pub fn load(path: &Path) -> Result<(Self, String)> {
        if !path.exists() {
            bail!("dependency manifest not found at {}", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading dependency manifest at {}", path.display()))?;
        let manifest = Self::parse(&content)
            .with_context(|| format!("in manifest {}", path.display()))?;
        Ok((manifest, cache::hash_bytes(&[content.as_bytes()])))
    }

    fn validate(&self) -> Result<()> {
        if self.manifest.version != SUPPORTED_VERSION {
            bail!(
                "unsupported manifest version {} (expected {})",
                self.manifest.version,
                SUPPORTED_VERSION
            );
        }

        let mut seen = BTreeSet::new();
        for dep in &self.dependencies {
            if dep.name.is_empty() || dep.version.is_empty() || dep.source.is_empty() {
                bail!("dependency entry with empty name, version or source");
            }
            if dep.group.is_empty() {
                bail!("dependency '{}' has an empty group", dep.name);
            }
            if !seen.insert(dep.name.as_str()) {
                bail!("duplicate dependency '{}'", dep.name);
            }
        }

        if !self.dependencies.is_empty() && !self.groups().contains(DEFAULT_GROUP) {
            bail!("manifest declares no '{}' group", DEFAULT_GROUP);
        }
        Ok(())
    }

    /// All group names present in the manifest.
    pub fn groups(&self) -> BTreeSet<&str> {
        self.dependencies.iter().map(|d| d.group.as_str()).collect()
    }

    /// Dependencies remaining after group exclusion, sorted by name so
    /// resolution order (and the resulting ledger) is deterministic.
    pub fn selection(&self, exclude_groups: &[String]) -> Vec<&Dependency> {
        let mut selected: Vec<&Dependency> = self
            .dependencies
            .iter()
            .filter(|d| !exclude_groups.iter().any(|g| g == &d.group))
            .collect();
        selected.sort_by(|a, b| a.name.cmp(&b.name));
        selected
    }
}
