//! Plugin manifest loading for plughost
//!
//! This module handles reading `plugin.json` manifests from plugin
//! directories and validating their contents before a candidate is offered
//! to the registry.

use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{HostError, Result};

use super::types::PluginManifest;

/// File name of a plugin manifest inside its directory.
pub const MANIFEST_FILE: &str = "plugin.json";

static MODULE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("static module path regex")
});

static ENTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_\-]{0,63}$").expect("static entry regex"));

/// Load and validate the manifest in `dir`.
///
/// # Errors
/// - `HostError::Manifest` if `plugin.json` does not exist or fails validation
/// - `HostError::Json` if the JSON is malformed
pub fn load_manifest(dir: &Path) -> Result<PluginManifest> {
    let manifest_path = dir.join(MANIFEST_FILE);

    if !manifest_path.exists() {
        return Err(HostError::Manifest(format!(
            "No {} found in {}",
            MANIFEST_FILE,
            dir.display()
        )));
    }

    let content = fs::read_to_string(&manifest_path).map_err(|e| {
        HostError::Manifest(format!("Failed to read {}: {}", manifest_path.display(), e))
    })?;

    let manifest: PluginManifest = serde_json::from_str(&content)?;

    validate_manifest(&manifest)?;

    Ok(manifest)
}

/// Validate a plugin manifest.
///
/// Performs the following checks:
/// - Name must be non-empty, at most 100 characters, and produce a non-empty slug
/// - Version must be non-empty
/// - `entry`, when present, must be a lowercase factory name
/// - Task declarations must be complete (see `ScheduledTask::validate`)
/// - The app module path must be a dotted identifier with a non-empty label
/// - Route paths must be relative and must not climb out of the mount point
pub fn validate_manifest(manifest: &PluginManifest) -> Result<()> {
    let name = manifest.name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(HostError::Manifest(format!(
            "Invalid plugin name '{}': must be 1-100 characters",
            manifest.name
        )));
    }

    let slug = manifest.meta().slug();
    if slug.is_empty() {
        return Err(HostError::Manifest(format!(
            "Plugin '{}' does not produce a usable slug",
            manifest.name
        )));
    }

    if manifest.version.trim().is_empty() {
        return Err(HostError::Manifest(format!(
            "Plugin '{}' has an empty version string",
            manifest.name
        )));
    }

    if let Some(entry) = &manifest.entry {
        if !ENTRY_RE.is_match(entry) {
            return Err(HostError::Manifest(format!(
                "Invalid entry '{}' in plugin '{}': must be a lowercase factory name",
                entry, manifest.name
            )));
        }
    }

    for (key, task) in &manifest.tasks {
        task.validate(key).map_err(|reason| {
            HostError::Manifest(format!("Plugin '{}': {}", manifest.name, reason))
        })?;
    }

    if let Some(app) = &manifest.app {
        if !MODULE_PATH_RE.is_match(&app.path) || app.label.trim().is_empty() {
            return Err(HostError::Manifest(format!(
                "Invalid app module '{}' in plugin '{}'",
                app.path, manifest.name
            )));
        }
    }

    for route in &manifest.routes {
        if route.path.starts_with('/') || route.path.split('/').any(|seg| seg == "..") {
            return Err(HostError::Manifest(format!(
                "Route '{}' in plugin '{}' must be relative to the plugin mount point",
                route.path, manifest.name
            )));
        }
        if route.name.trim().is_empty() {
            return Err(HostError::Manifest(format!(
                "Route '{}' in plugin '{}' has no name",
                route.path, manifest.name
            )));
        }
    }

    Ok(())
}
