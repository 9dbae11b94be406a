//! Plugin discovery for plughost
//!
//! Discovery walks an ordered list of [`PluginSource`]s and concatenates
//! their candidates. A candidate carries its identity and metadata plus a
//! lazy loader; nothing is constructed here. Sources shipped with the crate:
//!
//! - [`StaticSource`]: plugins compiled into the host (built-ins, samples)
//! - [`DirectorySource`]: `plugin.json` directories under user plugin roots
//! - [`PackageSource`]: plugins provided by installed packages, read from
//!   the package index
//!
//! A candidate that cannot be resolved is recorded in the error log under
//! `discovery` and skipped; it never aborts discovery of the others.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{expand_home, Config};

use super::builtin;
use super::error_log::{self, ErrorLog};
use super::loader::{load_manifest, validate_manifest, MANIFEST_FILE};
use super::manifest_plugin::ManifestPlugin;
use super::types::{ModuleId, Plugin, PluginManifest, PluginMeta, Provenance};

/// Marker file seeded into every plugin root.
pub const PACKAGE_MARKER: &str = ".plughost-plugins";

/// Builds a plugin instance on demand.
pub type PluginLoader = Arc<dyn Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync>;

/// Builds a code-bearing plugin from its manifest.
pub type Factory =
    Arc<dyn Fn(&PluginManifest) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync>;

/// A discovered, not yet constructed plugin.
#[derive(Clone)]
pub struct PluginCandidate {
    pub module: ModuleId,
    pub meta: PluginMeta,
    pub provenance: Provenance,
    /// `active` flag for a record created on first sight.
    pub default_active: bool,
    loader: PluginLoader,
}

impl PluginCandidate {
    pub fn new(
        module: ModuleId,
        meta: PluginMeta,
        provenance: Provenance,
        loader: PluginLoader,
    ) -> Self {
        Self {
            module,
            meta,
            provenance,
            default_active: false,
            loader,
        }
    }

    pub fn active_by_default(mut self) -> Self {
        self.default_active = true;
        self
    }

    pub fn slug(&self) -> String {
        self.meta.slug()
    }

    /// Run the loader.
    pub fn construct(&self) -> anyhow::Result<Box<dyn Plugin>> {
        (self.loader)()
    }
}

impl fmt::Debug for PluginCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCandidate")
            .field("module", &self.module)
            .field("meta", &self.meta)
            .field("provenance", &self.provenance)
            .field("default_active", &self.default_active)
            .finish_non_exhaustive()
    }
}

/// One origin of plugin candidates.
pub trait PluginSource: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Candidates offered by this source, in a stable order. Failures are
    /// recorded in `log` and the offending candidate skipped.
    fn candidates(&self, log: &mut ErrorLog) -> Vec<PluginCandidate>;
}

/// Concatenate the candidates of every source, dropping unnamed ones.
pub fn collect_plugins(sources: &[Box<dyn PluginSource>], log: &mut ErrorLog) -> Vec<PluginCandidate> {
    let mut found = Vec::new();

    for source in sources {
        let before = found.len();
        for candidate in source.candidates(log) {
            if !candidate.meta.has_identity() {
                debug!(module = %candidate.module, "Skipping candidate without a name");
                continue;
            }
            found.push(candidate);
        }
        debug!(
            source = source.name(),
            count = found.len() - before,
            "Collected plugin candidates"
        );
    }

    info!(count = found.len(), "Discovered plugins");
    found
}

// ---------------------------------------------------------------------------
// Factory catalog
// ---------------------------------------------------------------------------

/// Named constructors for code-bearing plugins, referenced from manifests
/// through `entry`.
#[derive(Clone, Default)]
pub struct FactoryCatalog {
    factories: BTreeMap<String, Factory>,
}

impl FactoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&PluginManifest) -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<Factory> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Loader for `manifest`: its entry factory if it names one, else a
    /// declarative plugin. `None` if the entry is unknown.
    fn loader_for(&self, manifest: &PluginManifest) -> Option<PluginLoader> {
        let manifest = manifest.clone();
        let loader: PluginLoader = match manifest.entry.clone() {
            Some(entry) => {
                let factory = self.get(&entry)?;
                Arc::new(move || factory(&manifest))
            }
            None => Arc::new(move || {
                Ok(Box::new(ManifestPlugin::new(manifest.clone())) as Box<dyn Plugin>)
            }),
        };
        Some(loader)
    }
}

impl fmt::Debug for FactoryCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

// ---------------------------------------------------------------------------
// Static source
// ---------------------------------------------------------------------------

/// Plugins compiled into the host.
pub struct StaticSource {
    label: String,
    candidates: Vec<PluginCandidate>,
}

impl StaticSource {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            candidates: Vec::new(),
        }
    }

    /// Add a compiled-in plugin. `provenance` decides the module id form.
    pub fn with<F>(mut self, meta: PluginMeta, provenance: Provenance, loader: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        let module = match provenance {
            Provenance::Builtin => ModuleId::builtin(&meta.slug()),
            _ => ModuleId::sample(&meta.slug()),
        };
        let default_active = provenance.is_builtin();
        let mut candidate = PluginCandidate::new(module, meta, provenance, Arc::new(loader));
        candidate.default_active = default_active;
        self.candidates.push(candidate);
        self
    }

    /// Add a prepared candidate as-is.
    pub fn with_candidate(mut self, candidate: PluginCandidate) -> Self {
        self.candidates.push(candidate);
        self
    }
}

impl PluginSource for StaticSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn candidates(&self, _log: &mut ErrorLog) -> Vec<PluginCandidate> {
        self.candidates.clone()
    }
}

// ---------------------------------------------------------------------------
// Directory source
// ---------------------------------------------------------------------------

/// Plugin directories (each holding a `plugin.json`) under user roots.
pub struct DirectorySource {
    roots: Vec<PathBuf>,
    catalog: FactoryCatalog,
}

impl DirectorySource {
    pub fn new(roots: Vec<PathBuf>, catalog: FactoryCatalog) -> Self {
        Self { roots, catalog }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn scan_root(&self, root: &Path, log: &mut ErrorLog, out: &mut Vec<PluginCandidate>) {
        if let Err(e) = ensure_plugin_root(root) {
            warn!(dir = %root.display(), error = %e, "Cannot prepare plugin root, skipping");
            log.record(
                error_log::DISCOVERY,
                root.display().to_string(),
                e.to_string(),
            );
            return;
        }

        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                log.record(
                    error_log::DISCOVERY,
                    root.display().to_string(),
                    e.to_string(),
                );
                return;
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir() && path.join(MANIFEST_FILE).exists())
            .collect();
        dirs.sort();

        for dir in dirs {
            let module = ModuleId::loose_file(&dir);
            let manifest = match load_manifest(&dir) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(module = %module, error = %e, "Failed to load plugin, skipping");
                    log.record(error_log::DISCOVERY, module.as_str(), e.to_string());
                    continue;
                }
            };

            let Some(loader) = self.catalog.loader_for(&manifest) else {
                let message = format!(
                    "Unknown entry '{}'",
                    manifest.entry.as_deref().unwrap_or_default()
                );
                warn!(module = %module, "{}", message);
                log.record(error_log::DISCOVERY, module.as_str(), message);
                continue;
            };

            let manifest_path = dir.join(MANIFEST_FILE);
            let mut meta = manifest.meta();
            if let Some((author, date)) = git_metadata(&manifest_path) {
                meta.author.get_or_insert(author);
                meta.pub_date = Some(date);
            }

            out.push(PluginCandidate::new(
                module,
                meta,
                Provenance::LooseFile {
                    path: manifest_path,
                },
                loader,
            ));
        }
    }
}

impl PluginSource for DirectorySource {
    fn name(&self) -> &str {
        "directories"
    }

    fn candidates(&self, log: &mut ErrorLog) -> Vec<PluginCandidate> {
        let mut out = Vec::new();
        for root in &self.roots {
            self.scan_root(root, log, &mut out);
        }
        out
    }
}

/// Create `dir` if missing and seed the package marker. Idempotent.
pub fn ensure_plugin_root(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let marker = dir.join(PACKAGE_MARKER);
    if !marker.exists() {
        fs::write(&marker, "# plughost plugin root\n")?;
    }
    Ok(())
}

/// Author and date of the last commit touching `file`, if it is tracked.
fn git_metadata(file: &Path) -> Option<(String, NaiveDate)> {
    let dir = file.parent()?;
    let output = Command::new("git")
        .args(["log", "-1", "--format=%an%x1f%as", "--"])
        .arg(file)
        .current_dir(dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let (author, date) = text.trim().split_once('\u{1f}')?;
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    Some((author.to_string(), date))
}

/// Configured user plugin roots: `~` expanded, made absolute and
/// normalized, created and seeded. Roots that cannot be created are logged
/// and left out.
pub fn plugin_dirs(configured: &[String]) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();

    for raw in configured {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let path = normalize(&expand_home(raw));
        if let Err(e) = ensure_plugin_root(&path) {
            warn!(dir = %path.display(), error = %e, "Cannot create plugin directory");
            continue;
        }

        let path = fs::canonicalize(&path).unwrap_or(path);
        if !out.contains(&path) {
            out.push(path);
        }
    }

    out
}

fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Package source
// ---------------------------------------------------------------------------

/// One installed package as listed in the package index.
#[derive(Debug, Clone, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub published: Option<NaiveDate>,
    #[serde(default)]
    pub plugins: Vec<PluginManifest>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PackageIndex {
    #[serde(default)]
    packages: Vec<InstalledPackage>,
}

/// Plugins provided by installed packages.
pub struct PackageSource {
    index_path: PathBuf,
    catalog: FactoryCatalog,
}

impl PackageSource {
    pub fn new(index_path: PathBuf, catalog: FactoryCatalog) -> Self {
        Self {
            index_path,
            catalog,
        }
    }

    fn read_index(&self) -> Result<PackageIndex, String> {
        if !self.index_path.exists() {
            return Ok(PackageIndex::default());
        }
        let content = fs::read_to_string(&self.index_path).map_err(|e| e.to_string())?;
        if content.trim().is_empty() {
            return Ok(PackageIndex::default());
        }
        serde_json::from_str(&content).map_err(|e| e.to_string())
    }
}

impl PluginSource for PackageSource {
    fn name(&self) -> &str {
        "packages"
    }

    fn candidates(&self, log: &mut ErrorLog) -> Vec<PluginCandidate> {
        let index = match self.read_index() {
            Ok(index) => index,
            Err(e) => {
                warn!(index = %self.index_path.display(), error = %e, "Unreadable package index");
                log.record(
                    error_log::DISCOVERY,
                    self.index_path.display().to_string(),
                    e,
                );
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for package in index.packages {
            for manifest in &package.plugins {
                let module = ModuleId::package(&package.name, &manifest.meta().slug());

                if let Err(e) = validate_manifest(manifest) {
                    log.record(error_log::DISCOVERY, module.as_str(), e.to_string());
                    continue;
                }

                let Some(loader) = self.catalog.loader_for(manifest) else {
                    log.record(
                        error_log::DISCOVERY,
                        module.as_str(),
                        format!(
                            "Unknown entry '{}'",
                            manifest.entry.as_deref().unwrap_or_default()
                        ),
                    );
                    continue;
                };

                let mut meta = manifest.meta();
                if meta.author.is_none() {
                    meta.author = package.author.clone();
                }
                meta.pub_date = package.published;

                out.push(PluginCandidate::new(
                    module,
                    meta,
                    Provenance::Package {
                        package: package.name.clone(),
                        version: package.version.clone(),
                    },
                    loader,
                ));
            }
        }
        out
    }
}

/// Sources in discovery order for `config`: built-ins, samples (if
/// enabled), user plugin roots, installed packages (unless test mode
/// disables them).
pub fn standard_sources(config: &Config, catalog: &FactoryCatalog) -> Vec<Box<dyn PluginSource>> {
    let settings = &config.plugins;
    let mut sources: Vec<Box<dyn PluginSource>> = vec![Box::new(builtin::builtin_source())];

    if settings.samples {
        sources.push(Box::new(builtin::sample_source()));
    }

    sources.push(Box::new(DirectorySource::new(
        plugin_dirs(&settings.plugin_dirs),
        catalog.clone(),
    )));

    if settings.package_discovery_enabled() {
        sources.push(Box::new(PackageSource::new(
            settings.package_index_path(),
            catalog.clone(),
        )));
    }

    sources
}
