//! Plugin types for plughost
//!
//! This module defines the types shared across the plugin subsystem: the
//! [`Plugin`] trait every extension implements, the manifest parsed from
//! `plugin.json` files, static plugin metadata, module identity and
//! provenance, and slug derivation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::mixins::{CapabilitySet, Gate, Mixin, ScheduledTask, SettingsSchema};
use crate::host::{AppModule, Route};

/// A constructed extension.
///
/// Only [`Plugin::capabilities`] is required. Every other method backs one
/// mixin and is consulted only when that mixin is declared and enabled.
pub trait Plugin: Send + Sync {
    /// Mixins this plugin implements, built in its constructor.
    fn capabilities(&self) -> &CapabilitySet;

    /// Truthiness of a named gate (see [`Gate::Named`]).
    fn gate(&self, _name: &str) -> bool {
        false
    }

    /// Settings schema (settings mixin).
    fn settings(&self) -> SettingsSchema {
        SettingsSchema::new()
    }

    /// Recurring tasks keyed by task name (schedule mixin).
    fn scheduled_tasks(&self) -> BTreeMap<String, ScheduledTask> {
        BTreeMap::new()
    }

    /// App module to mount into the host (app mixin).
    fn app_module(&self) -> Option<AppModule> {
        None
    }

    /// Routes relative to `plugin/<slug>/` (urls mixin).
    fn routes(&self) -> Vec<Route> {
        Vec::new()
    }

    /// Invoke a named method. Errors are returned to the caller untouched.
    fn call(&self, method: &str, _args: &[Value]) -> anyhow::Result<Value> {
        anyhow::bail!("plugin has no method '{}'", method)
    }
}

/// Whether `mixin` is declared by `plugin` and its gate is open.
pub fn mixin_enabled(plugin: &dyn Plugin, mixin: &Mixin) -> bool {
    match plugin.capabilities().gate(mixin) {
        None => false,
        Some(Gate::Always) => true,
        Some(Gate::Named(name)) => plugin.gate(name),
    }
}

/// Mixin declaration inside a manifest: `true`/`false` or a gate name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GateDecl {
    Enabled(bool),
    Named(String),
}

/// The manifest loaded from a plugin's `plugin.json` file.
///
/// # Example
///
/// ```json
/// {
///   "name": "Stock Alerts",
///   "version": "1.0.0",
///   "description": "Low stock notifications",
///   "author": "Ops Team",
///   "mixins": { "settings": true, "schedule": true, "app": "enable_app" },
///   "settings": {
///     "THRESHOLD": { "name": "Threshold", "default": 10, "validator": "int" }
///   },
///   "tasks": {
///     "check": { "func": "check_levels", "schedule": "hourly" }
///   },
///   "app": { "path": "plugins.stock_alerts", "label": "stock_alerts" },
///   "flags": { "enable_app": true }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Display name. Must be non-empty.
    pub name: String,

    /// Explicit identity key. Derived from `name` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,

    /// Semantic version string (e.g., "1.0.0").
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    /// Factory name in the host's catalog. Without it the plugin is built
    /// purely from this manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,

    #[serde(default)]
    pub mixins: BTreeMap<String, GateDecl>,

    #[serde(default)]
    pub settings: SettingsSchema,

    #[serde(default)]
    pub tasks: BTreeMap<String, ScheduledTask>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<AppModule>,

    #[serde(default)]
    pub routes: Vec<Route>,

    /// Values of named gates.
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
}

impl PluginManifest {
    /// Capability set declared by the `mixins` table.
    pub fn capabilities(&self) -> CapabilitySet {
        self.mixins
            .iter()
            .fold(CapabilitySet::new(), |caps, (key, decl)| {
                let mixin: Mixin = match key.parse() {
                    Ok(m) => m,
                    Err(never) => match never {},
                };
                match decl {
                    GateDecl::Enabled(true) => caps.with(mixin, Gate::Always),
                    GateDecl::Enabled(false) => caps,
                    GateDecl::Named(name) => caps.with(mixin, Gate::Named(name.clone())),
                }
            })
    }

    /// Static metadata for this manifest.
    pub fn meta(&self) -> PluginMeta {
        PluginMeta {
            name: self.name.clone(),
            slug: self.slug.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            author: self.author.clone(),
            pub_date: None,
            website: self.website.clone(),
            license: self.license.clone(),
        }
    }
}

/// Static description of a plugin, known before it is constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub pub_date: Option<NaiveDate>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
}

impl PluginMeta {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            ..Self::default()
        }
    }

    /// Identity key: explicit slug, else the slugified name.
    pub fn slug(&self) -> String {
        match self.slug.as_deref().map(str::trim) {
            Some(explicit) if !explicit.is_empty() => slugify(explicit),
            _ => slugify(&self.name),
        }
    }

    /// Whether this meta names a plugin at all.
    pub fn has_identity(&self) -> bool {
        !self.name.trim().is_empty()
    }
}

/// Where a discovered plugin came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum Provenance {
    /// Compiled into the host and always offered.
    Builtin,
    /// Bundled sample, offered when samples are enabled.
    Sample,
    /// A `plugin.json` inside a user plugin root.
    LooseFile { path: PathBuf },
    /// Provided by an installed package.
    Package { package: String, version: String },
}

impl Provenance {
    pub fn is_packaged(&self) -> bool {
        matches!(self, Provenance::Package { .. })
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, Provenance::Builtin)
    }
}

/// Identity of a plugin module, unique across all sources.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn builtin(name: &str) -> Self {
        Self(format!("builtin:{}", name))
    }

    pub fn sample(name: &str) -> Self {
        Self(format!("sample:{}", name))
    }

    pub fn loose_file(path: &std::path::Path) -> Self {
        Self(format!("dir:{}", path.display()))
    }

    pub fn package(package: &str, name: &str) -> Self {
        Self(format!("package:{}/{}", package, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

static NON_SLUG_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s-]").expect("static slug regex"));
static SLUG_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-\s]+").expect("static slug regex"));

/// Normalize a name into an identity key: lowercase, punctuation stripped,
/// whitespace and hyphen runs collapsed to `-`, outer `-`/`_` trimmed.
pub fn slugify(name: &str) -> String {
    let lowered = name.to_lowercase();
    let stripped = NON_SLUG_CHARS.replace_all(&lowered, "");
    let joined = SLUG_SEPARATORS.replace_all(stripped.trim(), "-");
    joined.trim_matches(|c| c == '-' || c == '_').to_string()
}
