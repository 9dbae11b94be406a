//! In-process host implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use super::{AppModule, AppRegistry, Host, MountPoint, Route, RouteTable};
use crate::error::{HostError, Result};

/// One entry of the top-level route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEntry {
    /// A plain route owned by the host.
    Route(Route),
    /// A named slot with a sub-table attached under `prefix`.
    Mount {
        name: String,
        prefix: String,
        table: RouteTable,
    },
}

/// Host application living in the same process as the registry.
///
/// Holds the app registry behind an `Arc` that is swapped on repopulation,
/// a top-level route table with `admin` and `plugin` mount slots, a route
/// resolution cache, and the maintenance flag.
pub struct LocalHost {
    apps: RwLock<Arc<AppRegistry>>,
    routes: RwLock<Vec<RouteEntry>>,
    route_cache: Mutex<HashMap<String, Option<String>>>,
    maintenance: AtomicBool,
    admin_mounts: AtomicU64,
    plugin_mounts: AtomicU64,
}

impl LocalHost {
    /// Create a host with the given core modules enabled.
    pub fn new(core_modules: Vec<AppModule>) -> Result<Self> {
        let apps = AppRegistry::build(core_modules, 0)?;
        let routes = vec![
            RouteEntry::Route(Route::new("", "index", "host.views.index")),
            RouteEntry::Mount {
                name: MountPoint::Admin.name().to_string(),
                prefix: MountPoint::Admin.prefix().to_string(),
                table: apps.admin_routes(),
            },
            RouteEntry::Mount {
                name: MountPoint::Plugin.name().to_string(),
                prefix: MountPoint::Plugin.prefix().to_string(),
                table: RouteTable::default(),
            },
        ];

        Ok(Self {
            apps: RwLock::new(Arc::new(apps)),
            routes: RwLock::new(routes),
            route_cache: Mutex::new(HashMap::new()),
            maintenance: AtomicBool::new(false),
            admin_mounts: AtomicU64::new(0),
            plugin_mounts: AtomicU64::new(0),
        })
    }

    /// Current app registry snapshot.
    pub fn app_registry(&self) -> Arc<AppRegistry> {
        match self.apps.read() {
            Ok(apps) => Arc::clone(&apps),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Copy of the top-level route table.
    pub fn route_entries(&self) -> Vec<RouteEntry> {
        self.routes.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// Sub-table currently mounted at `point`.
    pub fn mounted(&self, point: MountPoint) -> Option<RouteTable> {
        self.route_entries().into_iter().find_map(|entry| match entry {
            RouteEntry::Mount { name, table, .. } if name == point.name() => Some(table),
            _ => None,
        })
    }

    /// How many times `point` was rewritten.
    pub fn mount_count(&self, point: MountPoint) -> u64 {
        match point {
            MountPoint::Admin => self.admin_mounts.load(Ordering::SeqCst),
            MountPoint::Plugin => self.plugin_mounts.load(Ordering::SeqCst),
        }
    }

    /// Resolve a full path to its route name, caching the answer.
    pub fn resolve(&self, path: &str) -> Option<String> {
        if let Ok(cache) = self.route_cache.lock() {
            if let Some(hit) = cache.get(path) {
                return hit.clone();
            }
        }

        let resolved = self.route_entries().iter().find_map(|entry| match entry {
            RouteEntry::Route(route) if route.path == path => Some(route.name.clone()),
            RouteEntry::Mount { prefix, table, .. } => path.strip_prefix(prefix.as_str()).and_then(
                |rest| {
                    table
                        .routes
                        .iter()
                        .find(|r| r.path == rest)
                        .map(|r| r.name.clone())
                },
            ),
            _ => None,
        });

        if let Ok(mut cache) = self.route_cache.lock() {
            cache.insert(path.to_string(), resolved.clone());
        }
        resolved
    }

    pub fn cached_routes(&self) -> usize {
        self.route_cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Host for LocalHost {
    fn modules(&self) -> Vec<AppModule> {
        self.app_registry().modules().to_vec()
    }

    fn repopulate(&self, modules: Vec<AppModule>) -> Result<()> {
        let current = self.app_registry();
        let next = AppRegistry::build(modules, current.generation() + 1)?;

        let mut apps = self
            .apps
            .write()
            .map_err(|_| HostError::Host("app registry lock poisoned".into()))?;
        info!(
            generation = next.generation(),
            modules = next.modules().len(),
            "Repopulated app registry"
        );
        *apps = Arc::new(next);
        Ok(())
    }

    fn admin_routes(&self) -> RouteTable {
        self.app_registry().admin_routes()
    }

    fn mount(&self, point: MountPoint, table: RouteTable) {
        let Ok(mut routes) = self.routes.write() else {
            return;
        };

        let slot = routes.iter_mut().find_map(|entry| match entry {
            RouteEntry::Mount { name, table, .. } if name == point.name() => Some(table),
            _ => None,
        });

        match slot {
            Some(existing) => *existing = table,
            None => routes.push(RouteEntry::Mount {
                name: point.name().to_string(),
                prefix: point.prefix().to_string(),
                table,
            }),
        }

        let counter = match point {
            MountPoint::Admin => &self.admin_mounts,
            MountPoint::Plugin => &self.plugin_mounts,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        debug!(mount = %point, "Mount point rewritten");
    }

    fn clear_route_cache(&self) {
        if let Ok(mut cache) = self.route_cache.lock() {
            cache.clear();
        }
    }

    fn maintenance_mode(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    fn set_maintenance_mode(&self, on: bool) {
        self.maintenance.store(on, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> Vec<AppModule> {
        vec![AppModule::new("host.stock", "stock")
            .with_admin_route(Route::new("items/", "items", "stock.admin.items"))]
    }

    #[test]
    fn test_new_host_mounts_core_admin_routes() {
        let host = LocalHost::new(core()).unwrap();
        let admin = host.mounted(MountPoint::Admin).unwrap();
        assert_eq!(admin.routes[0].path, "stock/items/");
        assert!(host.mounted(MountPoint::Plugin).unwrap().is_empty());
        assert_eq!(host.mount_count(MountPoint::Admin), 0);
    }

    #[test]
    fn test_repopulate_swaps_registry() {
        let host = LocalHost::new(core()).unwrap();
        let before = host.app_registry();

        let mut modules = host.modules();
        modules.push(AppModule::new("plugins.reports", "reports"));
        host.repopulate(modules).unwrap();

        let after = host.app_registry();
        assert_eq!(before.generation() + 1, after.generation());
        assert!(after.contains("plugins.reports"));
        assert!(!before.contains("plugins.reports"));
    }

    #[test]
    fn test_failed_repopulate_keeps_previous_state() {
        let host = LocalHost::new(core()).unwrap();
        let mut modules = host.modules();
        modules.push(AppModule::new("plugins.clash", "stock"));

        assert!(host.repopulate(modules).is_err());
        assert_eq!(host.modules().len(), 1);
        assert_eq!(host.app_registry().generation(), 0);
    }

    #[test]
    fn test_mount_rewrites_only_named_slot() {
        let host = LocalHost::new(core()).unwrap();
        let before = host.route_entries().len();

        let table = RouteTable::new(vec![Route::new("demo/hello/", "demo:hello", "demo.hello")]);
        host.mount(MountPoint::Plugin, table.clone());
        host.mount(MountPoint::Plugin, table);

        assert_eq!(host.route_entries().len(), before);
        assert_eq!(host.mount_count(MountPoint::Plugin), 2);
        assert_eq!(
            host.resolve("plugin/demo/hello/"),
            Some("demo:hello".to_string())
        );
    }

    #[test]
    fn test_clear_route_cache() {
        let host = LocalHost::new(core()).unwrap();
        assert_eq!(host.resolve(""), Some("index".to_string()));
        assert_eq!(host.resolve("missing/"), None);
        assert_eq!(host.cached_routes(), 2);

        host.clear_route_cache();
        assert_eq!(host.cached_routes(), 0);
    }
}
