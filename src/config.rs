//! Build parameter configuration.
//!
//! Reads parameters from a .env file and environment variables.
//! Environment variables take precedence over the .env file. Parameters
//! only substitute values into the stage definitions; they never change
//! the shape of the stage graph.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default language-runtime version baked into the base image name.
pub const DEFAULT_RUNTIME_VERSION: &str = "3.12";
/// Default base-OS variant.
pub const DEFAULT_OS_VARIANT: &str = "bookworm";
/// Default numeric id of the build account.
pub const DEFAULT_BUILD_UID: u32 = 1000;
/// Default name of the build account.
pub const DEFAULT_BUILD_USER: &str = "dev";

/// Build parameters for the stage graph.
#[derive(Debug, Clone)]
pub struct Params {
    /// Language-runtime version of the base image (e.g., "3.12")
    pub runtime_version: String,
    /// Base-OS variant of the base image and package archive
    pub os_variant: String,
    /// Numeric id of the unprivileged build account
    pub build_uid: u32,
    /// Name of the unprivileged build account
    pub build_user: String,
    /// Library project tree (manifest + sources), default: project/
    pub project_dir: PathBuf,
    /// Dependency registry the resolver fetches from, default: registry/
    pub registry_dir: PathBuf,
}

impl Params {
    /// Load parameters from .env file and environment.
    pub fn load(base_dir: &Path) -> Self {
        let mut env_vars = HashMap::new();

        // Try to load .env file
        let env_path = base_dir.join(".env");
        if env_path.exists() {
            if let Ok(content) = fs::read_to_string(&env_path) {
                for line in content.lines() {
                    let line = line.trim();
                    // Skip comments and empty lines
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    // Parse KEY=value
                    if let Some((key, value)) = line.split_once('=') {
                        let key = key.trim();
                        let value = value.trim();
                        // Remove quotes if present
                        let value = value.trim_matches('"').trim_matches('\'');
                        env_vars.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }

        // Environment variables override .env file
        for (key, value) in std::env::vars() {
            env_vars.insert(key, value);
        }

        let runtime_version = env_vars
            .get("STRATA_RUNTIME_VERSION")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RUNTIME_VERSION.to_string());

        let os_variant = env_vars
            .get("STRATA_OS_VARIANT")
            .cloned()
            .unwrap_or_else(|| DEFAULT_OS_VARIANT.to_string());

        let build_uid = match env_vars.get("STRATA_BUILD_UID") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                eprintln!(
                    "  [WARN] STRATA_BUILD_UID '{}' is not a number, using {}",
                    raw, DEFAULT_BUILD_UID
                );
                DEFAULT_BUILD_UID
            }),
            None => DEFAULT_BUILD_UID,
        };

        let build_user = env_vars
            .get("STRATA_BUILD_USER")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BUILD_USER.to_string());

        let project_dir = resolve_path(base_dir, env_vars.get("STRATA_PROJECT_DIR"), "project");
        let registry_dir = resolve_path(base_dir, env_vars.get("STRATA_REGISTRY_DIR"), "registry");

        Self {
            runtime_version,
            os_variant,
            build_uid,
            build_user,
            project_dir,
            registry_dir,
        }
    }

    /// Name of the external base image the runtime stage starts from.
    pub fn base_image(&self) -> String {
        format!("{}-{}", self.os_variant, self.runtime_version)
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  STRATA_RUNTIME_VERSION: {}", self.runtime_version);
        println!("  STRATA_OS_VARIANT: {}", self.os_variant);
        println!("  STRATA_BUILD_UID: {}", self.build_uid);
        println!("  STRATA_BUILD_USER: {}", self.build_user);
        println!("  STRATA_PROJECT_DIR: {}", self.project_dir.display());
        println!("  STRATA_REGISTRY_DIR: {}", self.registry_dir.display());
        println!("  Base image: {}", self.base_image());
    }
}

fn resolve_path(base_dir: &Path, value: Option<&String>, default: &str) -> PathBuf {
    value
        .map(|s| {
            let path = PathBuf::from(s);
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        })
        .unwrap_or_else(|| base_dir.join(default))
}
