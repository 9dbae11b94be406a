//! Plugin system for plughost
//!
//! This module discovers extension modules from several origins, negotiates
//! their optional capabilities ("mixins"), constructs them in isolation so
//! one broken plugin never blocks the rest, and wires their contributions
//! into the host: settings schemas, scheduled tasks, app modules and routes.
//! All of it can be torn down and rebuilt at runtime.
//!
//! # Architecture
//!
//! - **types**: the [`Plugin`] trait, manifests, metadata, module identity
//! - **mixins**: capability keys, gates, settings and task declarations
//! - **loader**: `plugin.json` loading and validation
//! - **discovery**: plugin sources and candidate collection
//! - **instantiate**: record resolution, isolated construction, retry loop
//! - **activate**: settings, schedule and app activators
//! - **mounts**: the `admin` and `plugin` mount points
//! - **registry**: runtime state and the public API
//!
//! # Plugin Directory Structure
//!
//! ```text
//! ~/.plughost/plugins/
//! ├── .plughost-plugins
//! ├── stock-alerts/
//! │   └── plugin.json
//! └── shelf-labels/
//!     └── plugin.json
//! ```
//!
//! # Example plugin.json
//!
//! ```json
//! {
//!   "name": "Stock Alerts",
//!   "version": "1.0.0",
//!   "description": "Low stock notifications",
//!   "mixins": { "settings": true, "schedule": true, "urls": true },
//!   "settings": {
//!     "THRESHOLD": { "name": "Threshold", "default": 10 }
//!   },
//!   "tasks": {
//!     "check": { "func": "host.stock.check_levels", "schedule": "hourly" }
//!   },
//!   "routes": [ { "path": "levels/", "name": "levels" } ]
//! }
//! ```
//!
//! A manifest without `entry` becomes a declarative plugin. With `entry` it
//! names a factory registered in the host's [`FactoryCatalog`].

mod activate;
pub mod builtin;
pub mod discovery;
pub mod error_log;
pub mod install;
pub mod instantiate;
mod loader;
mod manifest_plugin;
pub mod mixins;
mod mounts;
pub mod registry;
pub mod types;

pub use activate::task_name;
pub use discovery::{
    collect_plugins, plugin_dirs, standard_sources, DirectorySource, FactoryCatalog,
    PackageSource, PluginCandidate, PluginSource, StaticSource,
};
pub use error_log::{ErrorEntry, ErrorLog};
pub use install::{install_plugin_file, InstallOutcome};
pub use loader::{load_manifest, validate_manifest, MANIFEST_FILE};
pub use manifest_plugin::ManifestPlugin;
pub use mixins::{CapabilitySet, Gate, Mixin, ScheduledTask, SettingSpec, SettingsSchema};
pub use mounts::plugin_routes;
pub use registry::{
    InactivePlugin, InactiveReason, LoadOutcome, PluginInstance, Registry, RegistryState,
};
pub use types::{slugify, ModuleId, Plugin, PluginManifest, PluginMeta, Provenance};
