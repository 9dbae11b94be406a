//! Host application surface seen by the plugin registry.
//!
//! The registry never owns the host. It reaches it through the [`Host`]
//! trait to:
//!
//! - read and repopulate the list of enabled app modules,
//! - rewrite the two plugin-owned mount points of the route table,
//! - raise and restore maintenance mode around a reload.
//!
//! [`LocalHost`] is an in-process implementation used by the binary and
//! the tests. Repopulation is two-phase: a new [`AppRegistry`] is built
//! and validated off to the side, then swapped in as a single `Arc`.

mod local;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, Result};

pub use local::LocalHost;

/// A single route: URL pattern, route name and handler target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub target: String,
}

impl Route {
    pub fn new(path: &str, name: &str, target: &str) -> Self {
        Self {
            path: path.to_string(),
            name: name.to_string(),
            target: target.to_string(),
        }
    }

    /// Copy of this route with `prefix` prepended to its path and `ns:`
    /// prepended to its name.
    pub fn nested(&self, prefix: &str, ns: &str) -> Self {
        Self {
            path: format!("{}{}", prefix, self.path),
            name: format!("{}:{}", ns, self.name),
            target: self.target.clone(),
        }
    }
}

/// An ordered list of routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The two route-table slots owned by the plugin subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountPoint {
    /// Admin surface, rebuilt from the host's app registry.
    Admin,
    /// Plugin surface, rebuilt from active urls-enabled plugins.
    Plugin,
}

impl MountPoint {
    pub fn name(&self) -> &'static str {
        match self {
            MountPoint::Admin => "admin",
            MountPoint::Plugin => "plugin",
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            MountPoint::Admin => "admin/",
            MountPoint::Plugin => "plugin/",
        }
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An application module that can be mounted into the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppModule {
    /// Dotted import path, unique across the host.
    pub path: String,
    /// Short label, unique across the host; namespaces admin routes.
    pub label: String,
    /// Admin routes contributed by this module.
    #[serde(default)]
    pub admin_routes: Vec<Route>,
}

impl AppModule {
    pub fn new(path: &str, label: &str) -> Self {
        Self {
            path: path.to_string(),
            label: label.to_string(),
            admin_routes: Vec::new(),
        }
    }

    pub fn with_admin_route(mut self, route: Route) -> Self {
        self.admin_routes.push(route);
        self
    }
}

/// Immutable snapshot of the host's enabled app modules.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    modules: Vec<AppModule>,
    generation: u64,
}

impl AppRegistry {
    /// Build and validate a registry for `modules`. Fails without side
    /// effects if a path or label is empty or duplicated.
    pub fn build(modules: Vec<AppModule>, generation: u64) -> Result<Self> {
        let mut paths = HashSet::new();
        let mut labels = HashSet::new();

        for module in &modules {
            if module.path.trim().is_empty() || module.label.trim().is_empty() {
                return Err(HostError::Host(format!(
                    "App module '{}' has an empty path or label",
                    module.path
                )));
            }
            if !paths.insert(module.path.as_str()) {
                return Err(HostError::Host(format!(
                    "App module '{}' is listed twice",
                    module.path
                )));
            }
            if !labels.insert(module.label.as_str()) {
                return Err(HostError::Host(format!(
                    "App module '{}' reuses label '{}'",
                    module.path, module.label
                )));
            }
        }

        Ok(Self {
            modules,
            generation,
        })
    }

    pub fn modules(&self) -> &[AppModule] {
        &self.modules
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contains(&self, path: &str) -> bool {
        self.modules.iter().any(|m| m.path == path)
    }

    /// Admin sub-table: every module's admin routes under `<label>/`.
    pub fn admin_routes(&self) -> RouteTable {
        RouteTable::new(
            self.modules
                .iter()
                .flat_map(|m| {
                    let prefix = format!("{}/", m.label);
                    m.admin_routes
                        .iter()
                        .map(move |r| r.nested(&prefix, &m.label))
                })
                .collect(),
        )
    }
}

/// The host application as seen by the registry.
pub trait Host: Send + Sync {
    /// Currently enabled app modules, in mount order.
    fn modules(&self) -> Vec<AppModule>;

    /// Replace the enabled module list and re-initialize the host's app
    /// registry. Must leave the previous state untouched on error.
    fn repopulate(&self, modules: Vec<AppModule>) -> Result<()>;

    /// Admin routes derived from the current app registry.
    fn admin_routes(&self) -> RouteTable;

    /// Replace the sub-table mounted at `point`.
    fn mount(&self, point: MountPoint, table: RouteTable);

    /// Drop cached route resolutions.
    fn clear_route_cache(&self);

    fn maintenance_mode(&self) -> bool;

    fn set_maintenance_mode(&self, on: bool);
}

/// Holds maintenance mode on for its lifetime and restores the previous
/// value on drop, so nested guards are harmless.
pub struct MaintenanceGuard<'a> {
    host: &'a dyn Host,
    previous: bool,
}

impl<'a> MaintenanceGuard<'a> {
    pub fn enter(host: &'a dyn Host) -> Self {
        let previous = host.maintenance_mode();
        host.set_maintenance_mode(true);
        Self { host, previous }
    }
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.host.set_maintenance_mode(self.previous);
    }
}
