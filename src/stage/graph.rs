//! Stage graph validation and build orchestration.
//!
//! Stages build sequentially in declaration order, which `validate`
//! guarantees is topological: a stage's parent and every promotion source
//! are declared before it. A stage is rebuilt only when its input digest
//! (parent digest + definition fingerprint + external inputs) changed.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::time::Instant;

use super::defs;
use super::executor::{self, StageBuild};
use super::{Parent, StageDef, StageId};
use crate::cache;
use crate::context::BuildContext;
use crate::files::copy_tree;
use crate::snapshot::{self, Meta};

/// Validate the stage graph: unique ids, each stage exactly one parent
/// declared before it, promotion only from earlier stages.
pub fn validate(defs: &[StageDef]) -> Result<()> {
    let mut seen: BTreeSet<StageId> = BTreeSet::new();
    for def in defs {
        if !seen.insert(def.id) {
            bail!("duplicate stage '{}' in graph", def.id);
        }
        match &def.parent {
            Parent::Image(name) => {
                if name.is_empty() {
                    bail!("stage '{}' declares an empty base image", def.id);
                }
            }
            Parent::Stage(parent) => {
                if *parent == def.id {
                    bail!("stage '{}' cannot be its own parent", def.id);
                }
                if !seen.contains(parent) {
                    bail!(
                        "stage '{}' declares parent '{}' which is not defined before it",
                        def.id,
                        parent
                    );
                }
            }
        }
        for source in def.promote_sources() {
            if source == def.id || !seen.contains(&source) {
                bail!(
                    "stage '{}' promotes artifacts from '{}' which is not built before it",
                    def.id,
                    source
                );
            }
        }
    }
    Ok(())
}

/// Stages required to build `target`: the target itself, its ancestor
/// chain, and every promotion source, transitively. None means all.
fn closure(defs: &[StageDef], target: Option<StageId>) -> BTreeSet<StageId> {
    let Some(target) = target else {
        return defs.iter().map(|d| d.id).collect();
    };
    let by_id: BTreeMap<StageId, &StageDef> = defs.iter().map(|d| (d.id, d)).collect();

    let mut needed = BTreeSet::new();
    let mut stack = vec![target];
    while let Some(id) = stack.pop() {
        if !needed.insert(id) {
            continue;
        }
        if let Some(def) = by_id.get(&id) {
            if let Parent::Stage(parent) = def.parent {
                stack.push(parent);
            }
            stack.extend(def.promote_sources());
        }
    }
    needed
}

/// Build a stage target (and whatever it requires), or the whole graph.
pub fn build(ctx: &BuildContext, target: Option<StageId>) -> Result<()> {
    let defs = defs::stage_graph(&ctx.params);
    validate(&defs)?;
    let needed = closure(&defs, target);

    let mut digests: BTreeMap<StageId, String> = BTreeMap::new();
    for def in &defs {
        if !needed.contains(&def.id) {
            continue;
        }
        let digest = build_stage(ctx, def, &digests)?;
        digests.insert(def.id, digest);
    }
    Ok(())
}

/// Digest identifying the parent's final state.
fn parent_digest(
    ctx: &BuildContext,
    def: &StageDef,
    digests: &BTreeMap<StageId, String>,
) -> Result<String> {
    match &def.parent {
        Parent::Image(name) => {
            let dir = ctx.base_image_dir();
            if !dir.exists() {
                bail!(
                    "base image '{}' not found at {} (provide the base tree before building)",
                    name,
                    dir.display()
                );
            }
            cache::hash_tree(&dir)
        }
        Parent::Stage(parent) => digests
            .get(parent)
            .cloned()
            .with_context(|| format!("parent stage '{}' was not built before '{}'", parent, def.id)),
    }
}

/// Digest over everything that determines this stage's output: parent
/// state, the definition itself, the archive index, the project inputs,
/// and the digests of every promotion source (the explicit artifact
/// handle that makes a stale promoted set detectable).
fn input_digest(
    ctx: &BuildContext,
    def: &StageDef,
    parent: &str,
    digests: &BTreeMap<StageId, String>,
) -> Result<String> {
    let mut parts: Vec<Vec<u8>> = vec![
        parent.as_bytes().to_vec(),
        def.fingerprint().into_bytes(),
    ];

    for source in def.promote_sources() {
        let digest = digests.get(&source).cloned().with_context(|| {
            format!(
                "promotion source '{}' was not built before '{}'",
                source, def.id
            )
        })?;
        parts.push(digest.into_bytes());
    }

    let archive_index = ctx.archive_dir().join("index.json");
    if archive_index.exists() {
        parts.push(cache::hash_file(&archive_index)?.into_bytes());
    } else {
        parts.push(b"no-archive".to_vec());
    }

    if def.touches_project() {
        let manifest = ctx.manifest_path();
        if manifest.exists() {
            parts.push(cache::hash_file(&manifest)?.into_bytes());
        } else {
            parts.push(b"no-manifest".to_vec());
        }
        if ctx.params.project_dir.exists() {
            parts.push(cache::hash_tree(&ctx.params.project_dir)?.into_bytes());
        } else {
            parts.push(b"no-project".to_vec());
        }
    }

    let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
    Ok(cache::hash_bytes(&refs))
}

/// Build one stage into its snapshot. Returns the input digest either way;
/// an up-to-date snapshot is skipped, a failed build leaves no output.
fn build_stage(
    ctx: &BuildContext,
    def: &StageDef,
    digests: &BTreeMap<StageId, String>,
) -> Result<String> {
    let parent = parent_digest(ctx, def, digests)?;
    let input = input_digest(ctx, def, &parent, digests)?;

    let hash_file = ctx.hash_file(def.id);
    let snap = ctx.snapshot_dir(def.id);
    if snapshot::is_complete(&snap) && cache::is_current(&hash_file, &input, &snap) {
        println!("[SKIP] stage '{}' is up to date", def.id);
        return Ok(input);
    }

    println!("=== Building stage '{}' ===", def.id);
    let start = Instant::now();

    let staging = ctx.staging_for(def.id);
    snapshot::discard(&staging);
    fs::create_dir_all(ctx.staging_dir())?;

    // Materialize the parent's final state, then apply this stage's
    // mutations on top, in declaration order.
    let meta = match &def.parent {
        Parent::Image(name) => {
            copy_tree(&ctx.base_image_dir(), &staging)
                .with_context(|| format!("materializing base image '{}'", name))?;
            Meta::for_image(def.id.name(), name)
        }
        Parent::Stage(parent_id) => {
            let parent_root = ctx.snapshot_dir(*parent_id);
            if !snapshot::is_complete(&parent_root) {
                snapshot::discard(&staging);
                bail!(
                    "parent stage '{}' has no completed snapshot at {}",
                    parent_id,
                    parent_root.display()
                );
            }
            let parent_meta = snapshot::read_meta(&parent_root)?;
            copy_tree(&parent_root, &staging)
                .with_context(|| format!("materializing parent stage '{}'", parent_id))?;
            Meta::derived(def.id.name(), &parent_meta)
        }
    };

    let mut build = StageBuild {
        ctx,
        root: staging.clone(),
        meta,
    };
    build.meta.build_args.extend(def.build_args.clone());

    if let Err(e) = executor::run_steps(&mut build, def) {
        // No partial output: a failed stage has no snapshot.
        snapshot::discard(&staging);
        return Err(e).with_context(|| format!("stage '{}' failed", def.id));
    }

    build.meta.complete = true;
    snapshot::write_meta(&staging, &build.meta)?;
    snapshot::commit(&staging, &snap)?;
    cache::record(&hash_file, &input)?;

    println!(
        "  [{:.1}s] stage '{}' -> {}\n",
        start.elapsed().as_secs_f64(),
        def.id,
        snap.display()
    );
    Ok(input)
}
