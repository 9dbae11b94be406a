//! Rewrites the `admin` and `plugin` mount points of the host route table.

use tracing::debug;

use super::activate::ActiveMap;
use super::mixins::Mixin;
use crate::host::{Host, MountPoint, RouteTable};

/// Routes of every urls-enabled instance, each nested under `<slug>/` and
/// namespaced by slug.
pub fn plugin_routes(active: &ActiveMap) -> RouteTable {
    let routes = active
        .values()
        .filter(|instance| instance.mixin_enabled(&Mixin::Urls))
        .flat_map(|instance| {
            let prefix = format!("{}/", instance.slug);
            instance
                .plugin()
                .routes()
                .into_iter()
                .map(move |route| route.nested(&prefix, &instance.slug))
                .collect::<Vec<_>>()
        })
        .collect();
    RouteTable::new(routes)
}

/// Rebuild both plugin-owned mount points and drop cached resolutions.
///
/// With `mount_urls` unset the plugin slot is mounted empty.
pub fn update_mount_points(host: &dyn Host, active: &ActiveMap, mount_urls: bool) {
    let admin = host.admin_routes();

    let plugin = if mount_urls {
        plugin_routes(active)
    } else {
        RouteTable::default()
    };

    debug!(admin = admin.len(), plugin = plugin.len(), "Updating mount points");
    host.mount(MountPoint::Admin, admin);
    host.mount(MountPoint::Plugin, plugin);
    host.clear_route_cache();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{AppModule, LocalHost, Route};
    use crate::plugins::discovery::PluginCandidate;
    use crate::plugins::mixins::{CapabilitySet, Gate};
    use crate::plugins::registry::PluginInstance;
    use crate::plugins::types::{ModuleId, Plugin, PluginMeta, Provenance};
    use std::sync::Arc;

    struct Routed(CapabilitySet);

    impl Plugin for Routed {
        fn capabilities(&self) -> &CapabilitySet {
            &self.0
        }

        fn routes(&self) -> Vec<Route> {
            vec![Route::new("levels/", "levels", "alerts.views.levels")]
        }
    }

    fn active(caps: CapabilitySet) -> ActiveMap {
        let candidate = PluginCandidate::new(
            ModuleId::sample("alerts"),
            PluginMeta::new("Alerts", "1.0"),
            Provenance::Sample,
            Arc::new(|| -> anyhow::Result<Box<dyn Plugin>> { anyhow::bail!("unused") }),
        );
        let instance = PluginInstance::new(&candidate, Box::new(Routed(caps)));
        [("alerts".to_string(), Arc::new(instance))]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_plugin_routes_nested_under_slug() {
        let table = plugin_routes(&active(
            CapabilitySet::new().with(Mixin::Urls, Gate::Always),
        ));
        assert_eq!(table.len(), 1);
        assert_eq!(table.routes[0].path, "alerts/levels/");
        assert_eq!(table.routes[0].name, "alerts:levels");
    }

    #[test]
    fn test_disabled_urls_contribute_nothing() {
        let table = plugin_routes(&active(
            CapabilitySet::new().with(Mixin::Urls, Gate::named("closed")),
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_update_is_idempotent() {
        let host = LocalHost::new(vec![AppModule::new("host.core", "core")
            .with_admin_route(Route::new("", "index", "core.admin"))])
        .unwrap();
        let map = active(CapabilitySet::new().with(Mixin::Urls, Gate::Always));

        host.resolve("plugin/alerts/levels/");
        update_mount_points(&host, &map, true);
        let first = host.route_entries();
        update_mount_points(&host, &map, true);

        assert_eq!(host.route_entries(), first);
        assert_eq!(host.route_entries().len(), 3);
        assert_eq!(host.mount_count(MountPoint::Admin), 2);
        assert_eq!(host.cached_routes(), 0);
        assert_eq!(
            host.resolve("plugin/alerts/levels/").as_deref(),
            Some("alerts:levels")
        );
        assert_eq!(host.resolve("admin/core/").as_deref(), Some("core:index"));
    }

    #[test]
    fn test_urls_off_mounts_empty_plugin_slot() {
        let host = LocalHost::new(vec![]).unwrap();
        let map = active(CapabilitySet::new().with(Mixin::Urls, Gate::Always));
        update_mount_points(&host, &map, false);
        assert!(host.mounted(MountPoint::Plugin).unwrap().is_empty());
    }
}
