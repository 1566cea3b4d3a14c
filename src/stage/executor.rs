//! Step executor - interprets stage operations against a staging tree.
//!
//! This is the single place where every declared operation is implemented.
//! Identity handling is uniform: before a build-identity step the executor
//! verifies the account exists and the protected directories are aligned;
//! after every root-identity step it repairs ownership as a checked
//! post-condition. Once a build account exists, root steps are only legal
//! because of the passwordless sudo grant, and the executor verifies the
//! grant is present.

use anyhow::{bail, Context, Result};
use std::fs;

use super::{Identity, Op, StageDef, Step};
use crate::context::{BuildContext, DEP_CACHE, MANIFEST_NAME, WORKDIR};
use crate::files::{write_file_mode, write_file_with_dirs};
use crate::manifest::Manifest;
use crate::pkg;
use crate::process;
use crate::promote;
use crate::resolve::{self, Policy, ResolveConfig};
use crate::snapshot::Meta;
use crate::users;

/// In-progress stage build: the staging tree plus its working metadata.
pub struct StageBuild<'a> {
    pub ctx: &'a BuildContext,
    pub root: std::path::PathBuf,
    pub meta: Meta,
}

/// Execute all steps of a stage definition, in declaration order.
pub fn run_steps(build: &mut StageBuild, def: &StageDef) -> Result<()> {
    for (index, step) in def.steps.iter().enumerate() {
        println!("  [{}/{}] {}", index + 1, def.steps.len(), step.op.label());
        prepare_identity(build, step)?;
        execute_op(build, &step.op).with_context(|| {
            format!(
                "step {} ({}) of stage '{}' failed",
                index + 1,
                step.op.label(),
                def.id
            )
        })?;
        if step.who == Identity::Root {
            finish_root_step(build)?;
        }
    }
    Ok(())
}

/// Identity preconditions for a step.
fn prepare_identity(build: &StageBuild, step: &Step) -> Result<()> {
    match step.who {
        Identity::Build => {
            let Some(user) = build.meta.build_user.clone() else {
                bail!(
                    "step '{}' runs as the build account, but none has been provisioned",
                    step.op.label()
                );
            };
            users::assert_alignment(&build.root, &user)?;
        }
        Identity::Root => {
            // After the account exists, root steps self-elevate through
            // the sudo grant; a missing grant means the stage cannot run.
            if let Some(user) = &build.meta.build_user {
                if !users::has_sudo(&build.root, user) {
                    bail!(
                        "step '{}' needs elevated privileges but '{}' has no sudo grant",
                        step.op.label(),
                        user
                    );
                }
            }
        }
    }
    Ok(())
}

/// Post-condition of every root step: protected directories end up owned
/// by the build account again.
fn finish_root_step(build: &StageBuild) -> Result<()> {
    if let Some(user) = &build.meta.build_user {
        let repaired = users::repair_ownership(&build.root, user)?;
        if !repaired.is_empty() {
            println!("    reassigned ownership to {}: {}", user, repaired.join(", "));
        }
    }
    Ok(())
}

/// Execute a single operation.
fn execute_op(build: &mut StageBuild, op: &Op) -> Result<()> {
    let ctx = build.ctx;
    let root = build.root.clone();

    match op {
        Op::InstallPackages { names, minimal } => {
            let archive = pkg::Archive::open(&ctx.archive_dir())?;
            pkg::install(&root, &archive, names, *minimal)?;
        }

        Op::PurgePackageIndex => {
            pkg::purge_index_cache(&root)?;
        }

        Op::WriteResolverPolicy(policy) => {
            policy.write(&root)?;
        }

        Op::CreateBuildUser => {
            let name = ctx.params.build_user.clone();
            let uid = ctx.params.build_uid;
            users::create_build_account(&root, &name, uid)?;
            build.meta.build_user = Some(name);
            build.meta.build_uid = Some(uid);
        }

        Op::Dir(path) => {
            fs::create_dir_all(root.join(path))?;
        }

        Op::WriteFile {
            path,
            content,
            mode,
        } => {
            write_file_mode(root.join(path), content, *mode)?;
        }

        Op::Env { key, value } => {
            build.meta.env.insert(key.clone(), value.clone());
            write_env_profile(build)?;
        }

        Op::PathAppend(dir) => {
            build
                .meta
                .env
                .insert("PATH".to_string(), format!("/{}:$PATH", dir));
            write_file_with_dirs(
                build.root.join("etc/profile.d/30-workspace-path.sh"),
                format!("export PATH=\"/{}:$PATH\"\n", dir),
            )?;
        }

        Op::CopyManifest => {
            let src = ctx.manifest_path();
            if !src.exists() {
                bail!("dependency manifest not found at {}", src.display());
            }
            let dest = root.join(WORKDIR).join(MANIFEST_NAME);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dest)
                .with_context(|| format!("copying manifest {} into image", src.display()))?;
        }

        Op::CopySourceTree => {
            let copied = crate::files::copy_tree(&ctx.params.project_dir, &root.join(WORKDIR))
                .context("populating working directory from project tree")?;
            println!("    copied {} source file(s)", copied);
        }

        Op::ResolveDeps {
            exclude_groups,
            incremental,
        } => {
            // The resolver sees only the manifest already inside the
            // image; unrelated source edits cannot invalidate it.
            let (manifest, digest) = Manifest::load(&root.join(WORKDIR).join(MANIFEST_NAME))?;
            let policy = Policy::load(&root);
            let cache_dir = root.join(DEP_CACHE);
            let cfg = ResolveConfig {
                registry: &ctx.params.registry_dir,
                cache_dir: &cache_dir,
                exclude_groups,
                incremental: *incremental,
                policy,
                fetch_cache: ctx.fetch_cache_dir(),
            };
            resolve::resolve(&manifest, &digest, &cfg)?;
        }

        Op::RunInstallCommand => {
            let (manifest, _) = Manifest::load(&root.join(WORKDIR).join(MANIFEST_NAME))?;
            match manifest.manifest.install_command {
                None => println!("    no install command declared, skipping"),
                Some(command) => {
                    let workdir = root.join(WORKDIR);
                    process::Cmd::new("sh")
                        .arg("-c")
                        .arg(&command)
                        .dir(&workdir)
                        .env("STRATA_STAGE", &build.meta.stage)
                        .error_msg(format!("install command '{}' failed", command))
                        .run()?;
                }
            }
        }

        Op::PromoteFrom(source) => {
            promote::promote(ctx, &root, *source)?;
        }
    }

    Ok(())
}

/// Rewrite the profile.d environment file from the accumulated env map.
/// PATH is materialized by its own op.
fn write_env_profile(build: &StageBuild) -> Result<()> {
    let mut content = String::new();
    for (key, value) in &build.meta.env {
        if key == "PATH" {
            continue;
        }
        content.push_str(&format!("export {}=\"{}\"\n", key, value));
    }
    write_file_with_dirs(build.root.join("etc/profile.d/20-strata-env.sh"), content)
}
