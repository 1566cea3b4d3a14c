//! Build account provisioning and ownership tracking.
//!
//! The build account is created once in the dev-base stage as passwd/group
//! entries inside the snapshot tree, plus a passwordless sudoers drop-in so
//! descendant stages can self-elevate for package installs.
//!
//! Snapshots are assembled by an unprivileged host process, so file
//! ownership inside the tree is tracked in an ownership table under
//! `.strata/owners.json` rather than applied with chown; whatever packs the
//! snapshot into a bootable image applies it for real. Paths absent from
//! the table are root-owned.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::context::{DEP_CACHE, WORKDIR};
use crate::files::{write_file_mode, write_file_with_dirs};
use crate::snapshot::META_DIR;

/// Login shell of the build account.
pub const BUILD_SHELL: &str = "/bin/bash";

/// Home directory of an account, relative to the snapshot root.
pub fn home_dir(name: &str) -> String {
    format!("home/{}", name)
}

/// Read a UID/GID pair from the snapshot passwd file.
///
/// Returns Ok(None) if the user or the file doesn't exist; a corrupted
/// entry is an error.
pub fn read_uid(root: &Path, username: &str) -> Result<Option<(u32, u32)>> {
    let passwd_path = root.join("etc/passwd");

    if !passwd_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&passwd_path)
        .with_context(|| format!("Failed to read passwd file at {}", passwd_path.display()))?;

    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 4 && parts[0] == username {
            let uid: u32 = parts[2].parse().with_context(|| {
                format!(
                    "Corrupted passwd file: invalid UID '{}' for user '{}' at {}",
                    parts[2],
                    username,
                    passwd_path.display()
                )
            })?;
            let gid: u32 = parts[3].parse().with_context(|| {
                format!(
                    "Corrupted passwd file: invalid GID '{}' for user '{}' at {}",
                    parts[3],
                    username,
                    passwd_path.display()
                )
            })?;
            return Ok(Some((uid, gid)));
        }
    }
    Ok(None)
}

/// Ensure a group exists in the snapshot group file.
pub fn ensure_group(root: &Path, groupname: &str, gid: u32) -> Result<()> {
    let group_path = root.join("etc/group");

    let mut group = if group_path.exists() {
        fs::read_to_string(&group_path)
            .with_context(|| format!("Failed to read group file at {}", group_path.display()))?
    } else {
        String::new()
    };

    if !group.lines().any(|l| l.starts_with(&format!("{}:", groupname))) {
        group.push_str(&format!("{}:x:{}:\n", groupname, gid));
        write_file_with_dirs(&group_path, group)
            .with_context(|| format!("Failed to write group entry for {}", groupname))?;
    }
    Ok(())
}

/// Ensure a user exists in the snapshot passwd file.
pub fn ensure_user(
    root: &Path,
    username: &str,
    uid: u32,
    gid: u32,
    home: &str,
    shell: &str,
) -> Result<()> {
    let passwd_path = root.join("etc/passwd");

    let mut passwd = if passwd_path.exists() {
        fs::read_to_string(&passwd_path)
            .with_context(|| format!("Failed to read passwd file at {}", passwd_path.display()))?
    } else {
        String::new()
    };

    if !passwd.lines().any(|l| l.starts_with(&format!("{}:", username))) {
        passwd.push_str(&format!(
            "{}:x:{}:{}:{}:/{}:{}\n",
            username, uid, gid, username, home, shell
        ));
        write_file_with_dirs(&passwd_path, passwd)
            .with_context(|| format!("Failed to write passwd entry for {}", username))?;
    }
    Ok(())
}

/// Grant passwordless sudo to an account via a sudoers drop-in.
pub fn grant_sudo(root: &Path, username: &str) -> Result<()> {
    let content = format!("{} ALL=(ALL) NOPASSWD:ALL\n", username);
    write_file_mode(root.join("etc/sudoers.d").join(username), content, 0o440)
        .with_context(|| format!("Failed to write sudoers drop-in for {}", username))
}

/// Whether an account holds a passwordless sudo grant.
pub fn has_sudo(root: &Path, username: &str) -> bool {
    root.join("etc/sudoers.d").join(username).exists()
}

/// Provision the unprivileged build account: group, passwd entry, home
/// directory skeleton, sudo grant, and ownership of the home tree.
pub fn create_build_account(root: &Path, username: &str, uid: u32) -> Result<()> {
    let home = home_dir(username);
    ensure_group(root, username, uid)?;
    ensure_user(root, username, uid, uid, &home, BUILD_SHELL)?;
    fs::create_dir_all(root.join(&home))
        .with_context(|| format!("Failed to create home directory for {}", username))?;
    grant_sudo(root, username)?;

    let mut owners = Owners::load(root)?;
    owners.set(&home, username);
    owners.save(root)?;
    Ok(())
}

/// Ownership table for a snapshot tree. Maps relative paths to account
/// names; lookup resolves to the longest matching prefix.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Owners(BTreeMap<String, String>);

impl Owners {
    fn path(root: &Path) -> PathBuf {
        root.join(META_DIR).join("owners.json")
    }

    /// Load the table, empty when none has been written yet.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading ownership table at {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing ownership table at {}", path.display()))
    }

    /// Persist the table.
    pub fn save(&self, root: &Path) -> Result<()> {
        write_file_with_dirs(Self::path(root), serde_json::to_string_pretty(self)?)
    }

    /// Assign ownership of a relative path (and everything under it).
    pub fn set(&mut self, rel: &str, account: &str) {
        self.0
            .insert(rel.trim_matches('/').to_string(), account.to_string());
    }

    /// Owning account of a relative path, longest-prefix match.
    /// None means root-owned.
    pub fn owner_of(&self, rel: &str) -> Option<&str> {
        let rel = rel.trim_matches('/');
        let mut best: Option<(&str, &str)> = None;
        for (prefix, account) in &self.0 {
            let prefix = prefix.as_str();
            let matches = rel == prefix || rel.starts_with(&format!("{}/", prefix));
            if matches {
                match best {
                    Some((b, _)) if b.len() >= prefix.len() => {}
                    _ => best = Some((prefix, account)),
                }
            }
        }
        best.map(|(_, account)| account)
    }
}

/// Directories whose steady-state owner must be the build account.
pub fn protected_paths(username: &str) -> Vec<String> {
    vec![
        WORKDIR.to_string(),
        DEP_CACHE.to_string(),
        home_dir(username),
    ]
}

/// Reassign ownership of the protected directories to the build account.
///
/// Called after every root-identity step; root-owned writes into the
/// working tree or dependency cache after user creation would otherwise
/// break later unprivileged steps. Returns the paths that changed.
pub fn repair_ownership(root: &Path, username: &str) -> Result<Vec<String>> {
    let mut owners = Owners::load(root)?;
    let mut repaired = Vec::new();
    for rel in protected_paths(username) {
        if !root.join(&rel).exists() {
            continue;
        }
        if owners.owner_of(&rel) != Some(username) {
            owners.set(&rel, username);
            repaired.push(rel);
        }
    }
    if !repaired.is_empty() {
        owners.save(root)?;
    }
    Ok(repaired)
}

/// Verify the protected directories are owned by the build account.
///
/// Run before every build-identity step; an unprivileged step that cannot
/// write its own cache must fail loudly rather than silently degrade.
pub fn assert_alignment(root: &Path, username: &str) -> Result<()> {
    let owners = Owners::load(root)?;
    for rel in protected_paths(username) {
        if !root.join(&rel).exists() {
            continue;
        }
        match owners.owner_of(&rel) {
            Some(owner) if owner == username => {}
            other => bail!(
                "permission misalignment: {} is owned by {} but the build account is '{}'",
                rel,
                other.unwrap_or("root"),
                username
            ),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_user_and_group_idempotent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();

        ensure_group(root, "dev", 1000).unwrap();
        ensure_user(root, "dev", 1000, 1000, "home/dev", BUILD_SHELL).unwrap();
        ensure_user(root, "dev", 1000, 1000, "home/dev", BUILD_SHELL).unwrap();

        let passwd = fs::read_to_string(root.join("etc/passwd")).unwrap();
        let entries = passwd.lines().filter(|l| l.starts_with("dev:")).count();
        assert_eq!(entries, 1);
        assert!(passwd.contains(":/home/dev:"));
        assert_eq!(read_uid(root, "dev").unwrap(), Some((1000, 1000)));
    }

    #[test]
    fn test_read_uid_rejects_corrupted_entry() {
        let tmp = TempDir::new().unwrap();
        write_file_with_dirs(tmp.path().join("etc/passwd"), "dev:x:oops:1000::/home/dev:/bin/bash\n")
            .unwrap();
        assert!(read_uid(tmp.path(), "dev").is_err());
    }

    #[test]
    fn test_create_build_account_grants_sudo_and_home() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();

        create_build_account(root, "dev", 1000).unwrap();
        assert!(has_sudo(root, "dev"));
        assert!(root.join("home/dev").is_dir());

        let owners = Owners::load(root).unwrap();
        assert_eq!(owners.owner_of("home/dev"), Some("dev"));
        assert_eq!(owners.owner_of("home/dev/.bashrc"), Some("dev"));
    }

    #[test]
    fn test_owner_longest_prefix_wins() {
        let mut owners = Owners::default();
        owners.set("workspace", "dev");
        owners.set("workspace/secret", "auditor");

        assert_eq!(owners.owner_of("workspace/src/lib.rs"), Some("dev"));
        assert_eq!(owners.owner_of("workspace/secret/key"), Some("auditor"));
        assert_eq!(owners.owner_of("var/cache"), None);
        // "workspaces" must not match the "workspace" prefix
        assert_eq!(owners.owner_of("workspaces/other"), None);
    }

    #[test]
    fn test_repair_and_alignment() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        create_build_account(root, "dev", 1000).unwrap();
        fs::create_dir_all(root.join(WORKDIR)).unwrap();
        fs::create_dir_all(root.join(DEP_CACHE)).unwrap();

        // Fresh dirs are root-owned: alignment must fail before repair.
        assert!(assert_alignment(root, "dev").is_err());

        let repaired = repair_ownership(root, "dev").unwrap();
        assert!(repaired.contains(&WORKDIR.to_string()));
        assert!(repaired.contains(&DEP_CACHE.to_string()));
        assert_alignment(root, "dev").unwrap();

        // Second repair is a no-op.
        assert!(repair_ownership(root, "dev").unwrap().is_empty());
    }
}
