//! Dependency resolution under a group-exclusion policy.
//!
//! Resolution materializes manifest entries into the snapshot's dependency
//! cache: one payload directory per dependency plus an `installed.json`
//! ledger. Fetches run concurrently under a bounded worker count, each with
//! retry and exponential backoff for transient failures. A dependency still
//! unresolved after the configured retries aborts the stage; a partial set
//! is never usable.
//!
//! Incremental mode resolves only the delta against an existing ledger
//! (development layering the "development" group over testing's promoted
//! set). Non-incremental mode refuses to run over an existing ledger so a
//! copied set can never silently diverge by re-resolution.

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache;
use crate::context::RESOLVER_POLICY;
use crate::files::{copy_tree, write_file_with_dirs};
use crate::manifest::{Dependency, Manifest, Source};

/// Ledger file name inside the dependency cache.
pub const LEDGER: &str = "installed.json";

const USER_AGENT: &str = "strata/0.1";
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Resolver retry/concurrency policy.
///
/// Written into the snapshot by dev-base; testing and development read it
/// back from their own tree so every descendant resolves under the same
/// policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Retry attempts for a transient fetch failure.
    pub retries: u32,
    /// Bounded worker count for parallel fetches.
    pub workers: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            retries: 3,
            workers: 8,
        }
    }
}

impl Policy {
    /// Read the policy from a snapshot tree, falling back to defaults when
    /// no policy file was provisioned.
    pub fn load(root: &Path) -> Policy {
        let path = root.join(RESOLVER_POLICY);
        if !path.exists() {
            return Policy::default();
        }
        match fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|s| toml::from_str(&s).map_err(anyhow::Error::from))
        {
            Ok(policy) => policy,
            Err(e) => {
                eprintln!(
                    "  [WARN] Failed to read resolver policy {}: {:#} (using defaults)",
                    path.display(),
                    e
                );
                Policy::default()
            }
        }
    }

    /// Write the policy into a snapshot tree.
    pub fn write(&self, root: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("serializing resolver policy")?;
        write_file_with_dirs(root.join(RESOLVER_POLICY), content)
    }
}

/// One materialized dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledEntry {
    pub name: String,
    pub version: String,
    pub group: String,
    /// Content digest of the payload directory.
    pub digest: String,
}

/// The materialized result of a resolution: ledger of installed
/// dependencies plus the digest of the manifest they came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledSet {
    pub manifest_digest: String,
    /// Sorted by name.
    pub entries: Vec<InstalledEntry>,
}

impl InstalledSet {
    /// Ledger location inside a dependency cache directory.
    pub fn ledger_path(cache_dir: &Path) -> PathBuf {
        cache_dir.join(LEDGER)
    }

    /// Load the ledger from a dependency cache directory.
    pub fn load(cache_dir: &Path) -> Result<Self> {
        let path = Self::ledger_path(cache_dir);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading dependency ledger at {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing dependency ledger at {}", path.display()))
    }

    /// Persist the ledger.
    pub fn save(&self, cache_dir: &Path) -> Result<()> {
        write_file_with_dirs(
            Self::ledger_path(cache_dir),
            serde_json::to_string_pretty(self)?,
        )
    }

    /// Whether a dependency is already materialized.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Group names present in the set.
    pub fn groups(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.group.as_str()).collect()
    }

    /// Installed names.
    pub fn names(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}

/// Inputs for one resolution run.
pub struct ResolveConfig<'a> {
    /// Local dependency registry the manifest's relative sources point into.
    pub registry: &'a Path,
    /// Snapshot dependency cache to materialize into.
    pub cache_dir: &'a Path,
    /// Manifest groups to skip.
    pub exclude_groups: &'a [String],
    /// Resolve only the delta against an existing ledger.
    pub incremental: bool,
    pub policy: Policy,
    /// Host-side cache for remote fetches.
    pub fetch_cache: PathBuf,
}

/// Resolve the manifest into the dependency cache.
pub fn resolve(
    manifest: &Manifest,
    manifest_digest: &str,
    cfg: &ResolveConfig,
) -> Result<InstalledSet> {
    let rt = tokio::runtime::Runtime::new().context("creating resolver runtime")?;
    rt.block_on(resolve_inner(manifest, manifest_digest, cfg))
}

async fn resolve_inner(
    manifest: &Manifest,
    manifest_digest: &str,
    cfg: &ResolveConfig<'_>,
) -> Result<InstalledSet> {
    let selection = manifest.selection(cfg.exclude_groups);

    let existing = if cfg.incremental {
        let set = InstalledSet::load(cfg.cache_dir).context(
            "incremental resolution requires an already materialized dependency set",
        )?;
        if set.manifest_digest != manifest_digest {
            bail!(
                "manifest drift: installed set was resolved from manifest {} but the current manifest is {}",
                &set.manifest_digest[..12.min(set.manifest_digest.len())],
                &manifest_digest[..12.min(manifest_digest.len())]
            );
        }
        set
    } else {
        if InstalledSet::ledger_path(cfg.cache_dir).exists() {
            bail!(
                "refusing to re-resolve over an existing dependency set at {} (use incremental resolution)",
                cfg.cache_dir.display()
            );
        }
        InstalledSet {
            manifest_digest: manifest_digest.to_string(),
            entries: Vec::new(),
        }
    };

    let pending: Vec<Dependency> = selection
        .into_iter()
        .filter(|d| !existing.contains(&d.name))
        .cloned()
        .collect();

    if pending.is_empty() {
        println!("  dependency set already current ({} installed)", existing.entries.len());
        return Ok(existing);
    }
    println!(
        "  resolving {} dependency(ies) with {} worker(s)",
        pending.len(),
        cfg.policy.workers.max(1)
    );

    fs::create_dir_all(cfg.cache_dir)
        .with_context(|| format!("creating dependency cache at {}", cfg.cache_dir.display()))?;

    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to create HTTP client")?;

    let semaphore = Arc::new(Semaphore::new(cfg.policy.workers.max(1)));
    let mut tasks: JoinSet<Result<InstalledEntry>> = JoinSet::new();

    for dep in pending {
        let semaphore = Arc::clone(&semaphore);
        let client = client.clone();
        let registry = cfg.registry.to_path_buf();
        let cache_dir = cfg.cache_dir.to_path_buf();
        let fetch_cache = cfg.fetch_cache.clone();
        let policy = cfg.policy.clone();

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("resolver semaphore closed")?;
            fetch_with_retry(&dep, &registry, &cache_dir, &fetch_cache, &client, &policy).await?;

            let payload = cache_dir.join(dep.id());
            let digest = tokio::task::spawn_blocking(move || cache::hash_tree(&payload))
                .await
                .context("payload digest task panicked")??;

            Ok(InstalledEntry {
                name: dep.name,
                version: dep.version,
                group: dep.group,
                digest,
            })
        });
    }

    let mut entries = existing.entries;
    let mut first_error: Option<anyhow::Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.context("resolver task panicked")? {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let set = InstalledSet {
        manifest_digest: manifest_digest.to_string(),
        entries,
    };
    set.save(cfg.cache_dir)?;
    println!("  dependency set: {} installed", set.entries.len());
    Ok(set)
}

/// Fetch one dependency payload, retrying transient failures with
/// exponential backoff.
async fn fetch_with_retry(
    dep: &Dependency,
    registry: &Path,
    cache_dir: &Path,
    fetch_cache: &Path,
    client: &reqwest::Client,
    policy: &Policy,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            // Exponential backoff, max 16x
            let delay = RETRY_BASE_DELAY * (1 << (attempt - 1).min(4));
            tokio::time::sleep(delay).await;
        }
        attempt += 1;

        match fetch_once(dep, registry, cache_dir, fetch_cache, client).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt > policy.retries => {
                return Err(e).with_context(|| {
                    format!(
                        "dependency '{}' unresolved after {} attempt(s)",
                        dep.id(),
                        attempt
                    )
                });
            }
            Err(e) => {
                eprintln!(
                    "  [WARN] fetch of '{}' failed (attempt {}/{}): {:#}",
                    dep.id(),
                    attempt,
                    policy.retries + 1,
                    e
                );
            }
        }
    }
}

async fn fetch_once(
    dep: &Dependency,
    registry: &Path,
    cache_dir: &Path,
    fetch_cache: &Path,
    client: &reqwest::Client,
) -> Result<()> {
    let dest = cache_dir.join(dep.id());

    match dep.source() {
        Source::Registry(rel) => {
            let src = registry.join(rel);
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || materialize_local(&src, &dest))
                .await
                .context("registry fetch task panicked")?
        }
        Source::Http(url) => {
            let cached = fetch_cache.join(format!("{}.pkg", dep.id()));
            if !cached.exists() {
                download(client, &url, &cached).await?;
            }
            let file_name = url
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}.pkg", dep.id()));
            tokio::task::spawn_blocking(move || -> Result<()> {
                if dest.exists() {
                    fs::remove_dir_all(&dest)
                        .with_context(|| format!("clearing partial payload at {}", dest.display()))?;
                }
                fs::create_dir_all(&dest)?;
                fs::copy(&cached, dest.join(&file_name))?;
                Ok(())
            })
            .await
            .context("payload materialization task panicked")?
        }
    }
}

fn materialize_local(src: &Path, dest: &Path) -> Result<()> {
    if !src.exists() {
        bail!("registry payload not found at {}", src.display());
    }
    if dest.exists() {
        fs::remove_dir_all(dest)
            .with_context(|| format!("clearing partial payload at {}", dest.display()))?;
    }
    if src.is_dir() {
        copy_tree(src, dest)?;
    } else {
        fs::create_dir_all(dest)?;
        let name = src.file_name().context("registry payload has no file name")?;
        fs::copy(src, dest.join(name))?;
    }
    Ok(())
}

/// Stream a remote payload to disk.
async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = dest.with_extension("part");

    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("HTTP request failed: {}", url))?;

    let status = response.status();
    if !status.is_success() {
        bail!(
            "HTTP {} for {}: {}",
            status.as_u16(),
            url,
            status.canonical_reason().unwrap_or("Unknown error")
        );
    }

    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("creating {}", partial.display()))?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("reading response body from {}", url))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&partial, dest)
        .await
        .with_context(|| format!("finalizing download at {}", dest.display()))?;
    Ok(())
}

/// Verify a promoted dependency cache is byte-identical to its ledger:
/// every payload present with a matching content digest.
pub fn verify(cache_dir: &Path, set: &InstalledSet) -> Result<()> {
    for entry in &set.entries {
        let payload = cache_dir.join(format!("{}-{}", entry.name, entry.version));
        if !payload.exists() {
            bail!(
                "promoted dependency set is missing payload for '{}'",
                entry.name
            );
        }
        let digest = cache::hash_tree(&payload)?;
        if digest != entry.digest {
            bail!(
                "promoted dependency set diverges from its ledger for '{}' (payload was modified after resolution)",
                entry.name
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use tempfile::TempDir;

    fn sample_manifest() -> (Manifest, String) {
        let doc = r#"
            [manifest]
            version = 1

            [[dependency]]
            name = "extdb-core"
            version = "2.1.0"
            source = "extdb-core-2.1.0"

            [[dependency]]
            name = "devtool"
            version = "0.9.1"
            group = "development"
            source = "devtool-0.9.1"
        "#;
        let m = Manifest::parse(doc).unwrap();
        let digest = cache::hash_bytes(&[doc.as_bytes()]);
        (m, digest)
    }

    fn seed_registry(dir: &Path) {
        crate::files::write_file_with_dirs(dir.join("extdb-core-2.1.0/lib/core.so"), "core")
            .unwrap();
        crate::files::write_file_with_dirs(dir.join("devtool-0.9.1/bin/devtool"), "tool").unwrap();
    }

    fn config<'a>(
        registry: &'a Path,
        cache_dir: &'a Path,
        exclude: &'a [String],
        incremental: bool,
        fetch_cache: PathBuf,
    ) -> ResolveConfig<'a> {
        ResolveConfig {
            registry,
            cache_dir,
            exclude_groups: exclude,
            incremental,
            policy: Policy {
                retries: 1,
                workers: 4,
            },
            fetch_cache,
        }
    }

    #[test]
    fn test_policy_roundtrip_and_defaults() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(Policy::load(tmp.path()).retries, 3);

        let policy = Policy {
            retries: 5,
            workers: 2,
        };
        policy.write(tmp.path()).unwrap();
        let read = Policy::load(tmp.path());
        assert_eq!(read.retries, 5);
        assert_eq!(read.workers, 2);
    }

    #[test]
    fn test_resolve_excludes_development_group() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry");
        seed_registry(&registry);
        let cache_dir = tmp.path().join("deps");
        let exclude = vec!["development".to_string()];
        let (m, digest) = sample_manifest();

        let set = resolve(
            &m,
            &digest,
            &config(&registry, &cache_dir, &exclude, false, tmp.path().join("fc")),
        )
        .unwrap();

        assert_eq!(set.names().into_iter().collect::<Vec<_>>(), ["extdb-core"]);
        assert!(cache_dir.join("extdb-core-2.1.0/lib/core.so").exists());
        assert!(!cache_dir.join("devtool-0.9.1").exists());
    }

    #[test]
    fn test_incremental_resolves_only_delta() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry");
        seed_registry(&registry);
        let cache_dir = tmp.path().join("deps");
        let (m, digest) = sample_manifest();
        let exclude = vec!["development".to_string()];

        resolve(
            &m,
            &digest,
            &config(&registry, &cache_dir, &exclude, false, tmp.path().join("fc")),
        )
        .unwrap();

        let set = resolve(
            &m,
            &digest,
            &config(&registry, &cache_dir, &[], true, tmp.path().join("fc")),
        )
        .unwrap();

        let names: Vec<_> = set.names().into_iter().collect();
        assert_eq!(names, ["devtool", "extdb-core"]);
        assert_eq!(set.groups().into_iter().collect::<Vec<_>>(), ["default", "development"]);
    }

    #[test]
    fn test_full_resolve_refuses_existing_ledger() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry");
        seed_registry(&registry);
        let cache_dir = tmp.path().join("deps");
        let (m, digest) = sample_manifest();

        resolve(
            &m,
            &digest,
            &config(&registry, &cache_dir, &[], false, tmp.path().join("fc")),
        )
        .unwrap();

        let err = resolve(
            &m,
            &digest,
            &config(&registry, &cache_dir, &[], false, tmp.path().join("fc")),
        )
        .unwrap_err();
        assert!(err.to_string().contains("refusing to re-resolve"));
    }

    #[test]
    fn test_incremental_detects_manifest_drift() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry");
        seed_registry(&registry);
        let cache_dir = tmp.path().join("deps");
        let (m, digest) = sample_manifest();

        resolve(
            &m,
            &digest,
            &config(&registry, &cache_dir, &[], false, tmp.path().join("fc")),
        )
        .unwrap();

        let err = resolve(
            &m,
            "0000000000000000",
            &config(&registry, &cache_dir, &[], true, tmp.path().join("fc")),
        )
        .unwrap_err();
        assert!(err.to_string().contains("manifest drift"));
    }

    #[test]
    fn test_missing_payload_fails_after_retries() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry"); // left empty
        let cache_dir = tmp.path().join("deps");
        let (m, digest) = sample_manifest();

        let err = resolve(
            &m,
            &digest,
            &config(&registry, &cache_dir, &[], false, tmp.path().join("fc")),
        )
        .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("unresolved after 2 attempt(s)"), "got: {}", msg);
    }

    #[test]
    fn test_verify_detects_divergence() {
        let tmp = TempDir::new().unwrap();
        let registry = tmp.path().join("registry");
        seed_registry(&registry);
        let cache_dir = tmp.path().join("deps");
        let exclude = vec!["development".to_string()];
        let (m, digest) = sample_manifest();

        let set = resolve(
            &m,
            &digest,
            &config(&registry, &cache_dir, &exclude, false, tmp.path().join("fc")),
        )
        .unwrap();
        verify(&cache_dir, &set).unwrap();

        fs::write(cache_dir.join("extdb-core-2.1.0/lib/core.so"), "tampered").unwrap();
        let err = verify(&cache_dir, &set).unwrap_err();
        assert!(err.to_string().contains("diverges"));
    }
}
