//! Mixin activators.
//!
//! Run in the order settings, schedule, app after a load cycle, and in the
//! reverse order on unload. Each activator only looks at active instances
//! whose mixin is enabled. Failures are recorded in the error log; an
//! activator never fails the load.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::error_log::{self, ErrorLog};
use super::mixins::{Mixin, SettingsSchema};
use super::registry::PluginInstance;
use crate::host::{AppModule, Host};
use crate::store::{ScheduleEntry, ScheduleStore, TaskTarget, PLUGIN_TASK_PREFIX};

/// Active instances keyed by slug.
pub type ActiveMap = BTreeMap<String, Arc<PluginInstance>>;

/// Collect the settings schema of every settings-enabled instance.
pub fn activate_settings(active: &ActiveMap) -> BTreeMap<String, SettingsSchema> {
    let collected: BTreeMap<String, SettingsSchema> = active
        .values()
        .filter(|instance| instance.mixin_enabled(&Mixin::Settings))
        .map(|instance| (instance.slug.clone(), instance.plugin().settings()))
        .collect();

    debug!(plugins = collected.len(), "Activated plugin settings");
    collected
}

/// Schedule entry name of `task` declared by `slug`.
pub fn task_name(slug: &str, task: &str) -> String {
    format!("{}{}.{}", PLUGIN_TASK_PREFIX, slug, task)
}

/// Register the tasks of every schedule-enabled instance, then delete
/// plugin-owned entries nobody declared anymore.
///
/// Returns the names registered by this call.
pub fn activate_schedule(
    active: &ActiveMap,
    store: &dyn ScheduleStore,
    log: &mut ErrorLog,
) -> Vec<String> {
    let mut registered = Vec::new();

    for instance in active.values() {
        if !instance.mixin_enabled(&Mixin::Schedule) {
            continue;
        }

        for (key, task) in instance.plugin().scheduled_tasks() {
            if let Err(reason) = task.validate(&key) {
                warn!(plugin = %instance.slug, task = %key, "Invalid scheduled task: {}", reason);
                log.record(error_log::SCHEDULE, instance.module.as_str(), reason);
                continue;
            }

            let target = if task.is_plugin_method() {
                TaskTarget::PluginMethod {
                    slug: instance.slug.clone(),
                    method: task.func.clone(),
                }
            } else {
                TaskTarget::Function {
                    path: task.func.clone(),
                }
            };

            let entry = ScheduleEntry {
                name: task_name(&instance.slug, &key),
                target,
                kind: task.schedule,
                minutes: task.minutes,
                args: task.args.clone(),
            };

            let name = entry.name.clone();
            match store.upsert(entry) {
                Ok(()) => {
                    debug!(plugin = %instance.slug, task = %name, "Registered scheduled task");
                    registered.push(name);
                }
                Err(e) => {
                    error!(plugin = %instance.slug, task = %name, error = %e, "Failed to register scheduled task");
                    log.record(error_log::SCHEDULE, instance.module.as_str(), e.to_string());
                }
            }
        }
    }

    collect_stale_tasks(store, &registered, log);

    info!(tasks = registered.len(), "Activated plugin schedules");
    registered
}

/// Delete every `plugin.` entry not in `keep`.
fn collect_stale_tasks(store: &dyn ScheduleStore, keep: &[String], log: &mut ErrorLog) {
    let keep: BTreeSet<&str> = keep.iter().map(String::as_str).collect();

    let stale: Vec<String> = match store.names_with_prefix(PLUGIN_TASK_PREFIX) {
        Ok(names) => names
            .into_iter()
            .filter(|name| !keep.contains(name.as_str()))
            .collect(),
        Err(e) => {
            warn!(error = %e, "Cannot list scheduled tasks for cleanup");
            log.record(error_log::SCHEDULE, "schedule", e.to_string());
            return;
        }
    };

    if stale.is_empty() {
        return;
    }

    match store.delete(&stale) {
        Ok(removed) => info!(removed, "Removed stale plugin tasks"),
        Err(e) => {
            warn!(error = %e, "Failed to remove stale plugin tasks");
            log.record(error_log::SCHEDULE, "schedule", e.to_string());
        }
    }
}

/// Remove the entries registered by [`activate_schedule`].
pub fn deactivate_schedule(store: &dyn ScheduleStore, registered: &[String], log: &mut ErrorLog) {
    if registered.is_empty() {
        return;
    }

    match store.delete(registered) {
        Ok(removed) => info!(removed, "Deactivated plugin schedules"),
        Err(e) => {
            warn!(error = %e, "Failed to remove plugin tasks");
            log.record(error_log::SCHEDULE, "schedule", e.to_string());
        }
    }
}

/// Mount the app module of every app-enabled instance into the host.
///
/// `installed` is the list of modules mounted by plugins so far; modules
/// this call adds are appended to it. A module the host already has is
/// left alone and never recorded, so unloading cannot remove it. The host is repopulated when a module was
/// added or `full_reload` is set. If repopulation fails the host keeps its
/// previous state and the new modules are withdrawn from `installed`.
pub fn activate_apps(
    active: &ActiveMap,
    host: &dyn Host,
    installed: &mut Vec<AppModule>,
    full_reload: bool,
    log: &mut ErrorLog,
) {
    let mut modules = host.modules();
    let mut added: Vec<(String, String)> = Vec::new();

    for instance in active.values() {
        if !instance.mixin_enabled(&Mixin::App) {
            continue;
        }
        let Some(app) = instance.plugin().app_module() else {
            warn!(plugin = %instance.slug, "App mixin enabled but no app module supplied");
            continue;
        };

        if modules.iter().any(|m| m.path == app.path) {
            continue;
        }

        debug!(plugin = %instance.slug, app = %app.path, "Adding plugin app");
        modules.push(app.clone());
        added.push((app.path.clone(), instance.module.to_string()));
        if !installed.iter().any(|m| m.path == app.path) {
            installed.push(app);
        }
    }

    if added.is_empty() && !full_reload {
        return;
    }

    match host.repopulate(modules) {
        Ok(()) => info!(added = added.len(), "Activated plugin apps"),
        Err(e) => {
            error!(error = %e, "Host rejected plugin apps, keeping previous app registry");
            for (path, module) in &added {
                log.record(error_log::APP, module.as_str(), format!("{}: {}", path, e));
            }
            installed.retain(|m| !added.iter().any(|(path, _)| *path == m.path));
        }
    }
}

/// Remove every plugin-installed app module from the host.
pub fn deactivate_apps(host: &dyn Host, installed: &mut Vec<AppModule>, log: &mut ErrorLog) {
    if installed.is_empty() {
        return;
    }

    let modules: Vec<AppModule> = host
        .modules()
        .into_iter()
        .filter(|m| !installed.iter().any(|i| i.path == m.path))
        .collect();

    match host.repopulate(modules) {
        Ok(()) => {
            info!(removed = installed.len(), "Deactivated plugin apps");
            installed.clear();
        }
        Err(e) => {
            error!(error = %e, "Host rejected app removal");
            log.record(error_log::APP, "host", e.to_string());
        }
    }
}
