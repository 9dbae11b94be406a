//! Plugin registry for plughost
//!
//! This module provides the [`Registry`], the owner of all plugin runtime
//! state and the public plugin API. A load cycle runs discovery, the
//! instantiate/retry loop, the mixin activators and the mount-point
//! updater, then publishes the new active map as a single `Arc` snapshot.
//! Queries only ever read the published snapshot, so plugin code may call
//! back into the registry while a cycle is running.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::host::{AppModule, Host, MaintenanceGuard};
use crate::store::{RecordStore, ScheduleStore};

use super::activate::{self, ActiveMap};
use super::discovery::{self, PluginCandidate, PluginSource};
use super::error_log::ErrorLog;
use super::install::{self, InstallOutcome};
use super::instantiate::run_cycle;
use super::mixins::{CapabilitySet, Mixin, SettingsSchema};
use super::mounts;
use super::types::{mixin_enabled, ModuleId, Plugin, PluginMeta, Provenance};

/// A constructed, active plugin.
pub struct PluginInstance {
    pub slug: String,
    pub name: String,
    pub module: ModuleId,
    pub meta: PluginMeta,
    pub provenance: Provenance,
    /// Id of the activation record.
    pub record_id: u64,
    /// The record's `active` flag when the plugin was loaded. Can be false
    /// in test mode.
    pub record_active: bool,
    plugin: Box<dyn Plugin>,
}

impl PluginInstance {
    pub fn new(candidate: &PluginCandidate, plugin: Box<dyn Plugin>) -> Self {
        Self {
            slug: candidate.slug(),
            name: candidate.meta.name.clone(),
            module: candidate.module.clone(),
            meta: candidate.meta.clone(),
            provenance: candidate.provenance.clone(),
            record_id: 0,
            record_active: false,
            plugin,
        }
    }

    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        self.plugin.capabilities()
    }

    pub fn has_mixin(&self, mixin: &Mixin) -> bool {
        self.capabilities().has(mixin)
    }

    /// Declared and gate open.
    pub fn mixin_enabled(&self, mixin: &Mixin) -> bool {
        mixin_enabled(self.plugin(), mixin)
    }

    pub fn call(&self, method: &str, args: &[Value]) -> anyhow::Result<Value> {
        self.plugin.call(method, args)
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("slug", &self.slug)
            .field("module", &self.module)
            .field("record_id", &self.record_id)
            .field("capabilities", self.capabilities())
            .finish()
    }
}

/// Why a discovered plugin is not active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    /// Its record is inactive.
    Disabled,
    /// Construction failed during this cycle; its record was disabled.
    ConstructionFailed,
}

impl fmt::Display for InactiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InactiveReason::Disabled => f.write_str("disabled"),
            InactiveReason::ConstructionFailed => f.write_str("construction failed"),
        }
    }
}

/// A discovered plugin that was not constructed.
#[derive(Debug, Clone, Serialize)]
pub struct InactivePlugin {
    pub slug: String,
    pub name: String,
    pub module: ModuleId,
    pub meta: PluginMeta,
    pub provenance: Provenance,
    pub record_id: Option<u64>,
    pub reason: InactiveReason,
}

impl InactivePlugin {
    pub fn new(candidate: &PluginCandidate, record_id: Option<u64>, reason: InactiveReason) -> Self {
        Self {
            slug: candidate.slug(),
            name: candidate.meta.name.clone(),
            module: candidate.module.clone(),
            meta: candidate.meta.clone(),
            provenance: candidate.provenance.clone(),
            record_id,
            reason,
        }
    }
}

/// Lifecycle state of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

/// Result of `load_plugins`, `unload_plugins` or `reload_plugins`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded {
        active: usize,
        inactive: usize,
        retries: u32,
        /// The retry budget ran out and a partial result was kept.
        exhausted: bool,
    },
    Unloaded,
    /// Another load, unload or reload was already running.
    Skipped,
    /// The record store could not be reached; nothing was loaded.
    StoreUnavailable,
}

/// State published after every cycle.
#[derive(Default)]
struct Snapshot {
    active: ActiveMap,
    inactive: BTreeMap<String, InactivePlugin>,
    settings: BTreeMap<String, SettingsSchema>,
}

/// Clears the loading flag when dropped.
struct LoadingGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> LoadingGuard<'a> {
    fn try_enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Owner of plugin runtime state and the public plugin API.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use plughost::config::Config;
/// use plughost::host::LocalHost;
/// use plughost::plugins::{builtin, PluginSource, Registry};
/// use plughost::store::{MemoryRecordStore, MemoryScheduleStore};
///
/// let sources: Vec<Box<dyn PluginSource>> = vec![Box::new(builtin::builtin_source())];
/// let registry = Registry::new(
///     Config::default(),
///     sources,
///     Arc::new(MemoryRecordStore::new()),
///     Arc::new(MemoryScheduleStore::new()),
///     Arc::new(LocalHost::new(vec![]).unwrap()),
/// );
///
/// registry.load_plugins(false);
/// assert!(registry.get_plugin("host-status").is_some());
/// ```
pub struct Registry {
    config: Config,
    sources: Vec<Box<dyn PluginSource>>,
    records: Arc<dyn RecordStore>,
    schedule: Arc<dyn ScheduleStore>,
    host: Arc<dyn Host>,
    is_loading: AtomicBool,
    state: RwLock<RegistryState>,
    snapshot: RwLock<Arc<Snapshot>>,
    errors: Mutex<ErrorLog>,
    installed_apps: Mutex<Vec<AppModule>>,
    registered_tasks: Mutex<Vec<String>>,
}

impl Registry {
    pub fn new(
        config: Config,
        sources: Vec<Box<dyn PluginSource>>,
        records: Arc<dyn RecordStore>,
        schedule: Arc<dyn ScheduleStore>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            config,
            sources,
            records,
            schedule,
            host,
            is_loading: AtomicBool::new(false),
            state: RwLock::new(RegistryState::Unloaded),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            errors: Mutex::new(ErrorLog::new()),
            installed_apps: Mutex::new(Vec::new()),
            registered_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> RegistryState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(RegistryState::Unloaded)
    }

    fn set_state(&self, next: RegistryState) {
        if let Ok(mut state) = self.state.write() {
            *state = next;
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        match self.snapshot.read() {
            Ok(snapshot) => Arc::clone(&snapshot),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn publish(&self, next: Snapshot) {
        let next = Arc::new(next);
        match self.snapshot.write() {
            Ok(mut snapshot) => *snapshot = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn append_errors(&self, log: ErrorLog) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.extend(log);
        }
    }

    fn schedule_enabled(&self) -> bool {
        self.config.features.schedule || self.config.plugins.testing
    }

    fn apps_enabled(&self) -> bool {
        self.config.features.app || self.config.plugins.testing
    }

    fn urls_enabled(&self) -> bool {
        self.config.features.urls || self.config.plugins.testing
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Discover, instantiate and activate plugins.
    ///
    /// Maintenance mode is held for the whole cycle. `full_reload` forces the host to repopulate its app registry even if
    /// no new app module was added.
    pub fn load_plugins(&self, full_reload: bool) -> LoadOutcome {
        let Some(_guard) = LoadingGuard::try_enter(&self.is_loading) else {
            debug!("Plugin load already in progress, skipping");
            return LoadOutcome::Skipped;
        };
        self.load_inner(full_reload)
    }

    /// Deactivate every plugin and clear the active map. Maintenance mode is
    /// held while the host is touched.
    pub fn unload_plugins(&self) -> LoadOutcome {
        let Some(_guard) = LoadingGuard::try_enter(&self.is_loading) else {
            debug!("Plugin load already in progress, skipping unload");
            return LoadOutcome::Skipped;
        };
        self.unload_inner()
    }

    /// Unload then load with maintenance mode held for the duration.
    pub fn reload_plugins(&self, full_reload: bool) -> LoadOutcome {
        let Some(_guard) = LoadingGuard::try_enter(&self.is_loading) else {
            debug!("Plugin load already in progress, skipping reload");
            return LoadOutcome::Skipped;
        };

        info!(full_reload, "Reloading plugins");
        let _maintenance = MaintenanceGuard::enter(self.host.as_ref());
        self.unload_inner();
        self.load_inner(full_reload)
    }

    fn load_inner(&self, full_reload: bool) -> LoadOutcome {
        let span = info_span!("plugin_load", cycle = %Uuid::new_v4());
        let _enter = span.enter();
        let _maintenance = MaintenanceGuard::enter(self.host.as_ref());

        self.set_state(RegistryState::Loading);
        let mut log = ErrorLog::new();

        let candidates = discovery::collect_plugins(&self.sources, &mut log);

        let outcome = match run_cycle(
            &candidates,
            self.records.as_ref(),
            self.config.plugins.testing,
            self.config.plugins.retry_attempts,
            &mut log,
        ) {
            Ok(outcome) => outcome,
            // Construction failures never escape run_cycle.
            Err(e) => {
                warn!(error = %e, "Plugins not loaded");
                self.append_errors(log);
                self.set_state(RegistryState::Unloaded);
                return LoadOutcome::StoreUnavailable;
            }
        };

        let active = outcome.pass.active;
        let inactive = outcome.pass.inactive;

        let settings = activate::activate_settings(&active);
        self.publish(Snapshot {
            active: active.clone(),
            inactive,
            settings,
        });

        if self.schedule_enabled() {
            let registered = activate::activate_schedule(&active, self.schedule.as_ref(), &mut log);
            if let Ok(mut tasks) = self.registered_tasks.lock() {
                *tasks = registered;
            }
        }

        if self.apps_enabled() {
            let mut installed = self
                .installed_apps
                .lock()
                .map(|mut apps| mem::take(&mut *apps))
                .unwrap_or_default();
            activate::activate_apps(&active, self.host.as_ref(), &mut installed, full_reload, &mut log);
            if let Ok(mut apps) = self.installed_apps.lock() {
                *apps = installed;
            }
        }

        mounts::update_mount_points(self.host.as_ref(), &active, self.urls_enabled());

        let snapshot = self.snapshot();
        info!(
            active = snapshot.active.len(),
            inactive = snapshot.inactive.len(),
            retries = outcome.retries_used,
            errors = log.len(),
            "Plugins loaded"
        );

        self.append_errors(log);
        self.set_state(RegistryState::Loaded);

        LoadOutcome::Loaded {
            active: snapshot.active.len(),
            inactive: snapshot.inactive.len(),
            retries: outcome.retries_used,
            exhausted: outcome.exhausted,
        }
    }

    fn unload_inner(&self) -> LoadOutcome {
        let _maintenance = MaintenanceGuard::enter(self.host.as_ref());
        self.set_state(RegistryState::Unloading);
        let mut log = ErrorLog::new();

        let mut installed = self
            .installed_apps
            .lock()
            .map(|mut apps| mem::take(&mut *apps))
            .unwrap_or_default();
        activate::deactivate_apps(self.host.as_ref(), &mut installed, &mut log);
        if let Ok(mut apps) = self.installed_apps.lock() {
            *apps = installed;
        }

        let registered = self
            .registered_tasks
            .lock()
            .map(|mut tasks| mem::take(&mut *tasks))
            .unwrap_or_default();
        activate::deactivate_schedule(self.schedule.as_ref(), &registered, &mut log);

        self.publish(Snapshot::default());

        mounts::update_mount_points(self.host.as_ref(), &ActiveMap::new(), self.urls_enabled());

        info!("Plugins unloaded");
        self.append_errors(log);
        self.set_state(RegistryState::Unloaded);
        LoadOutcome::Unloaded
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Active plugin by slug.
    pub fn get_plugin(&self, slug: &str) -> Option<Arc<PluginInstance>> {
        self.snapshot()
            .active
            .get(&slug.trim().to_lowercase())
            .cloned()
    }

    /// Active plugins with `mixin` declared and enabled. With `active` set,
    /// only those whose record `active` flag matches it.
    pub fn with_mixin(&self, mixin: &str, active: Option<bool>) -> Vec<Arc<PluginInstance>> {
        let mixin: Mixin = match mixin.parse() {
            Ok(m) => m,
            Err(never) => match never {},
        };

        self.snapshot()
            .active
            .values()
            .filter(|instance| instance.mixin_enabled(&mixin))
            .filter(|instance| active.map_or(true, |want| instance.record_active == want))
            .cloned()
            .collect()
    }

    /// Call `method` on the active plugin `slug`.
    ///
    /// Returns `Ok(None)` if no such plugin is active. Errors raised by the
    /// plugin are returned unchanged.
    pub fn call_plugin_function(
        &self,
        slug: &str,
        method: &str,
        args: &[Value],
    ) -> anyhow::Result<Option<Value>> {
        let Some(instance) = self.get_plugin(slug) else {
            info!(plugin = %slug, method = %method, "Plugin not found, call skipped");
            return Ok(None);
        };

        debug!(plugin = %instance.slug, method = %method, "Calling plugin function");
        instance.call(method, args).map(Some)
    }

    /// All active plugins ordered by slug.
    pub fn active_plugins(&self) -> Vec<Arc<PluginInstance>> {
        self.snapshot().active.values().cloned().collect()
    }

    /// All discovered but inactive plugins ordered by slug.
    pub fn inactive_plugins(&self) -> Vec<InactivePlugin> {
        self.snapshot().inactive.values().cloned().collect()
    }

    /// Settings schemas of settings-enabled plugins, keyed by slug.
    pub fn plugin_settings(&self) -> BTreeMap<String, SettingsSchema> {
        self.snapshot().settings.clone()
    }

    /// App modules mounted by plugins.
    pub fn installed_apps(&self) -> Vec<AppModule> {
        self.installed_apps
            .lock()
            .map(|apps| apps.clone())
            .unwrap_or_default()
    }

    /// Schedule entry names registered by the last load.
    pub fn registered_tasks(&self) -> Vec<String> {
        self.registered_tasks
            .lock()
            .map(|tasks| tasks.clone())
            .unwrap_or_default()
    }

    /// Copy of the error log.
    pub fn errors(&self) -> ErrorLog {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    // ---------------------------------------------------------------------
    // Discovery and installation
    // ---------------------------------------------------------------------

    /// Normalized user plugin roots, created and seeded.
    pub fn plugin_dirs(&self) -> Vec<PathBuf> {
        discovery::plugin_dirs(&self.config.plugins.plugin_dirs)
    }

    /// Run discovery only. Failures are appended to the error log.
    pub fn collect_plugins(&self) -> Vec<PluginCandidate> {
        let mut log = ErrorLog::new();
        let candidates = discovery::collect_plugins(&self.sources, &mut log);
        self.append_errors(log);
        candidates
    }

    /// Install the plugin file once per process.
    pub fn install_plugin_file(&self) -> InstallOutcome {
        install::install_plugin_file(&self.config.plugins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{LocalHost, MountPoint, Route};
    use crate::plugins::discovery::{PluginLoader, StaticSource};
    use crate::plugins::error_log;
    use crate::plugins::mixins::{Gate, ScheduledTask, SettingSpec};
    use crate::store::{MemoryRecordStore, MemoryScheduleStore, MockRecordStore, StoreError};
    use serde_json::json;
    use std::sync::Weak;

    // ---- fixtures ----

    struct SettingsPlugin {
        caps: CapabilitySet,
    }

    impl Plugin for SettingsPlugin {
        fn capabilities(&self) -> &CapabilitySet {
            &self.caps
        }

        fn settings(&self) -> SettingsSchema {
            let mut schema = SettingsSchema::new();
            schema.insert("LIMIT".into(), SettingSpec::new("Limit", json!(5)));
            schema
        }

        fn call(&self, method: &str, args: &[Value]) -> anyhow::Result<Value> {
            match method {
                "double" => {
                    let n = args
                        .first()
                        .and_then(Value::as_i64)
                        .ok_or_else(|| anyhow::anyhow!("expected a number"))?;
                    Ok(json!(n * 2))
                }
                other => anyhow::bail!("no method '{}'", other),
            }
        }
    }

    struct AppPlugin {
        caps: CapabilitySet,
    }

    impl Plugin for AppPlugin {
        fn capabilities(&self) -> &CapabilitySet {
            &self.caps
        }

        fn app_module(&self) -> Option<AppModule> {
            Some(
                AppModule::new("plugins.app_c", "app_c")
                    .with_admin_route(Route::new("things/", "things", "app_c.admin.things")),
            )
        }

        fn routes(&self) -> Vec<Route> {
            vec![Route::new("hello/", "hello", "app_c.views.hello")]
        }
    }

    struct SchedulePlugin {
        caps: CapabilitySet,
    }

    impl Plugin for SchedulePlugin {
        fn capabilities(&self) -> &CapabilitySet {
            &self.caps
        }

        fn scheduled_tasks(&self) -> BTreeMap<String, ScheduledTask> {
            let mut tasks = BTreeMap::new();
            tasks.insert("poll".into(), ScheduledTask::every_minutes("poll", 15));
            tasks
        }
    }

    fn loader<F>(f: F) -> PluginLoader
    where
        F: Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn candidate(name: &str, loader: PluginLoader) -> PluginCandidate {
        PluginCandidate::new(
            ModuleId::sample(&name.to_lowercase()),
            PluginMeta::new(name, "1.0"),
            Provenance::Sample,
            loader,
        )
    }

    fn plugin_a() -> PluginCandidate {
        candidate(
            "A",
            loader(|| {
                Ok(Box::new(SettingsPlugin {
                    caps: CapabilitySet::new().with(Mixin::Settings, Gate::Always),
                }) as Box<dyn Plugin>)
            }),
        )
    }

    fn plugin_b_broken() -> PluginCandidate {
        candidate("B", loader(|| panic!("B cannot start")))
    }

    fn plugin_c() -> PluginCandidate {
        candidate(
            "C",
            loader(|| {
                Ok(Box::new(AppPlugin {
                    caps: CapabilitySet::new()
                        .with(Mixin::App, Gate::Always)
                        .with(Mixin::Urls, Gate::Always),
                }) as Box<dyn Plugin>)
            }),
        )
    }

    fn plugin_schedule(name: &str) -> PluginCandidate {
        candidate(
            name,
            loader(|| {
                Ok(Box::new(SchedulePlugin {
                    caps: CapabilitySet::new().with(Mixin::Schedule, Gate::Always),
                }) as Box<dyn Plugin>)
            }),
        )
    }

    struct Harness {
        registry: Registry,
        records: Arc<MemoryRecordStore>,
        schedule: Arc<MemoryScheduleStore>,
        host: Arc<LocalHost>,
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.features.schedule = true;
        config.features.app = true;
        config.features.urls = true;
        config
    }

    fn harness(config: Config, candidates: Vec<PluginCandidate>) -> Harness {
        let records = Arc::new(MemoryRecordStore::new());
        for c in &candidates {
            records.get_or_create(&c.slug(), &c.meta.name, true).unwrap();
        }
        harness_with(config, candidates, records)
    }

    fn harness_with(
        config: Config,
        candidates: Vec<PluginCandidate>,
        records: Arc<MemoryRecordStore>,
    ) -> Harness {
        let schedule = Arc::new(MemoryScheduleStore::new());
        let host = Arc::new(LocalHost::new(vec![AppModule::new("host.core", "core")]).unwrap());
        let source = candidates
            .into_iter()
            .fold(StaticSource::new("test"), |s, c| s.with_candidate(c));
        let registry = Registry::new(
            config,
            vec![Box::new(source)],
            records.clone(),
            schedule.clone(),
            host.clone(),
        );
        Harness {
            registry,
            records,
            schedule,
            host,
        }
    }

    fn module_paths(host: &LocalHost) -> Vec<String> {
        host.modules().into_iter().map(|m| m.path).collect()
    }

    // ---- scenarios ----

    #[test]
    fn test_abc_scenario() {
        let h = harness(config(), vec![plugin_a(), plugin_b_broken(), plugin_c()]);

        let outcome = h.registry.load_plugins(false);

        assert_eq!(
            outcome,
            LoadOutcome::Loaded {
                active: 2,
                inactive: 1,
                retries: 1,
                exhausted: false
            }
        );
        assert!(h.registry.get_plugin("a").is_some());
        assert!(h.registry.get_plugin("b").is_none());
        assert!(!h.records.get("b").unwrap().active);
        assert!(module_paths(&h.host).contains(&"plugins.app_c".to_string()));
        assert_eq!(h.host.mount_count(MountPoint::Admin), 1);
        assert_eq!(h.host.mount_count(MountPoint::Plugin), 1);
        assert_eq!(h.registry.state(), RegistryState::Loaded);

        let errors = h.registry.errors();
        assert_eq!(errors.bucket(error_log::INIT).len(), 1);
        assert_eq!(errors.bucket(error_log::INIT)[0].module, "sample:b");

        let inactive = h.registry.inactive_plugins();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].reason, InactiveReason::ConstructionFailed);
    }

    #[test]
    fn test_disabled_plugin_stays_down_on_next_load() {
        let h = harness(config(), vec![plugin_a(), plugin_b_broken()]);
        h.registry.load_plugins(false);

        match h.registry.load_plugins(false) {
            LoadOutcome::Loaded { retries, .. } => assert_eq!(retries, 0),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            h.registry.inactive_plugins()[0].reason,
            InactiveReason::Disabled
        );
        // The second load never constructed B.
        assert_eq!(h.registry.errors().bucket(error_log::INIT).len(), 1);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let h = harness(config(), vec![plugin_a(), plugin_c(), plugin_schedule("S")]);
        h.registry.load_plugins(false);

        let active: Vec<String> = h.registry.active_plugins().iter().map(|p| p.slug.clone()).collect();
        let modules = module_paths(&h.host);
        let tasks = h.schedule.list().unwrap();
        let routes = h.host.route_entries();

        h.registry.reload_plugins(false);
        h.registry.reload_plugins(false);

        let again: Vec<String> = h.registry.active_plugins().iter().map(|p| p.slug.clone()).collect();
        assert_eq!(again, active);
        assert_eq!(module_paths(&h.host), modules);
        assert_eq!(h.schedule.list().unwrap(), tasks);
        assert_eq!(h.host.route_entries(), routes);
        assert_eq!(h.registry.installed_apps().len(), 1);
        assert!(!h.host.maintenance_mode());
    }

    #[test]
    fn test_capability_gating_by_feature_flags() {
        let h = harness(Config::default(), vec![plugin_c(), plugin_schedule("S")]);
        h.registry.load_plugins(false);

        assert!(h.registry.get_plugin("c").is_some());
        assert_eq!(module_paths(&h.host), vec!["host.core".to_string()]);
        assert!(h.schedule.list().unwrap().is_empty());
        assert!(h.host.mounted(MountPoint::Plugin).unwrap().is_empty());
    }

    #[test]
    fn test_testing_mode_opens_gates_and_ignores_records() {
        let mut config = Config::default();
        config.plugins.testing = true;
        let h = harness_with(
            config,
            vec![plugin_c(), plugin_schedule("S")],
            Arc::new(MemoryRecordStore::new()),
        );
        h.registry.load_plugins(false);

        assert!(h.registry.get_plugin("c").is_some());
        assert!(!h.records.get("c").unwrap().active);
        assert!(module_paths(&h.host).contains(&"plugins.app_c".to_string()));
        assert_eq!(h.registry.registered_tasks(), vec!["plugin.s.poll".to_string()]);
        assert_eq!(h.registry.with_mixin("app", Some(false)).len(), 1);
        assert!(h.registry.with_mixin("app", Some(true)).is_empty());
    }

    #[test]
    fn test_schedule_gc_removes_undeclared_tasks() {
        let h = harness(config(), vec![plugin_schedule("S"), plugin_schedule("T")]);
        h.registry.load_plugins(false);
        assert_eq!(h.schedule.list().unwrap().len(), 2);

        h.records.set_active("t", false).unwrap();
        h.registry.load_plugins(false);

        let names: Vec<String> = h.schedule.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["plugin.s.poll".to_string()]);
    }

    #[test]
    fn test_unload_reverts_everything() {
        let h = harness(config(), vec![plugin_a(), plugin_c(), plugin_schedule("S")]);
        h.registry.load_plugins(false);

        assert_eq!(h.registry.unload_plugins(), LoadOutcome::Unloaded);

        assert!(h.registry.active_plugins().is_empty());
        assert!(h.registry.plugin_settings().is_empty());
        assert!(h.schedule.list().unwrap().is_empty());
        assert_eq!(module_paths(&h.host), vec!["host.core".to_string()]);
        assert!(h.host.mounted(MountPoint::Plugin).unwrap().is_empty());
        assert_eq!(h.registry.state(), RegistryState::Unloaded);
    }

    #[test]
    fn test_mount_points_rebuilt_once_per_load() {
        let h = harness(config(), vec![plugin_c()]);
        h.registry.load_plugins(false);
        h.registry.load_plugins(false);

        assert_eq!(h.host.mount_count(MountPoint::Admin), 2);
        assert_eq!(h.host.mount_count(MountPoint::Plugin), 2);
        assert_eq!(
            h.host.resolve("plugin/c/hello/").as_deref(),
            Some("c:hello")
        );
        assert_eq!(
            h.host.resolve("admin/app_c/things/").as_deref(),
            Some("app_c:things")
        );
    }

    #[test]
    fn test_bounded_retries() {
        let mut config = config();
        config.plugins.retry_attempts = 1;
        let h = harness(
            config,
            vec![
                plugin_a(),
                candidate("F1", loader(|| anyhow::bail!("f1"))),
                candidate("F2", loader(|| anyhow::bail!("f2"))),
                candidate("F3", loader(|| anyhow::bail!("f3"))),
            ],
        );

        match h.registry.load_plugins(false) {
            LoadOutcome::Loaded {
                retries, exhausted, ..
            } => {
                assert_eq!(retries, 1);
                assert!(exhausted);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(h.registry.get_plugin("a").is_some());
    }

    #[test]
    fn test_exhausted_failure_is_retried_on_next_load() {
        let mut config = config();
        config.plugins.retry_attempts = 0;
        let h = harness(
            config,
            vec![plugin_a(), candidate("Flaky", loader(|| anyhow::bail!("flaky")))],
        );

        for _ in 0..2 {
            assert_eq!(
                h.registry.load_plugins(false),
                LoadOutcome::Loaded {
                    active: 1,
                    inactive: 0,
                    retries: 0,
                    exhausted: true
                }
            );
            assert!(h.records.get("flaky").unwrap().active);
        }
        assert_eq!(h.registry.errors().bucket(error_log::INIT).len(), 2);
    }

    #[test]
    fn test_store_unavailable() {
        let records = Arc::new(MemoryRecordStore::new());
        records.set_available(false);
        let h = harness_with(config(), vec![plugin_a()], records);

        assert_eq!(h.registry.load_plugins(false), LoadOutcome::StoreUnavailable);
        assert!(h.registry.active_plugins().is_empty());
        assert_eq!(h.registry.state(), RegistryState::Unloaded);
        assert!(h.registry.errors().is_empty());
        assert_eq!(h.host.mount_count(MountPoint::Admin), 0);
    }

    #[test]
    fn test_store_unavailable_with_mock() {
        let mut records = MockRecordStore::new();
        records
            .expect_get_or_create()
            .returning(|_, _, _| Err(StoreError::Unavailable("no table".into())));
        records.expect_set_active().never();

        let source = StaticSource::new("test").with_candidate(plugin_a());
        let registry = Registry::new(
            config(),
            vec![Box::new(source)],
            Arc::new(records),
            Arc::new(MemoryScheduleStore::new()),
            Arc::new(LocalHost::new(vec![]).unwrap()),
        );

        assert_eq!(registry.load_plugins(false), LoadOutcome::StoreUnavailable);
        assert!(registry.get_plugin("a").is_none());
    }

    #[test]
    fn test_call_plugin_function() {
        let h = harness(config(), vec![plugin_a()]);
        h.registry.load_plugins(false);

        assert_eq!(
            h.registry
                .call_plugin_function("a", "double", &[json!(21)])
                .unwrap(),
            Some(json!(42))
        );
        assert_eq!(
            h.registry.call_plugin_function("missing", "double", &[]).unwrap(),
            None
        );

        let err = h
            .registry
            .call_plugin_function("a", "double", &[json!("x")])
            .unwrap_err();
        assert_eq!(err.to_string(), "expected a number");
    }

    #[test]
    fn test_with_mixin_and_settings() {
        let h = harness(config(), vec![plugin_a(), plugin_c()]);
        h.registry.load_plugins(false);

        let with_settings: Vec<String> = h
            .registry
            .with_mixin("settings", None)
            .iter()
            .map(|p| p.slug.clone())
            .collect();
        assert_eq!(with_settings, vec!["a".to_string()]);
        assert_eq!(h.registry.with_mixin("urls", Some(true)).len(), 1);
        assert!(h.registry.with_mixin("navigation", None).is_empty());

        let settings = h.registry.plugin_settings();
        assert_eq!(settings["a"]["LIMIT"].default, json!(5));
    }

    #[test]
    fn test_full_reload_repopulates_host() {
        let h = harness(config(), vec![plugin_a()]);
        h.registry.load_plugins(false);
        let generation = h.host.app_registry().generation();

        h.registry.load_plugins(true);
        assert_eq!(h.host.app_registry().generation(), generation + 1);
    }

    /// Records the maintenance flag seen by every repopulate.
    struct SpyHost {
        inner: LocalHost,
        seen: Mutex<Vec<bool>>,
    }

    impl Host for SpyHost {
        fn modules(&self) -> Vec<AppModule> {
            self.inner.modules()
        }

        fn repopulate(&self, modules: Vec<AppModule>) -> crate::error::Result<()> {
            self.seen.lock().unwrap().push(self.inner.maintenance_mode());
            self.inner.repopulate(modules)
        }

        fn admin_routes(&self) -> crate::host::RouteTable {
            self.inner.admin_routes()
        }

        fn mount(&self, point: MountPoint, table: crate::host::RouteTable) {
            self.inner.mount(point, table)
        }

        fn clear_route_cache(&self) {
            self.inner.clear_route_cache()
        }

        fn maintenance_mode(&self) -> bool {
            self.inner.maintenance_mode()
        }

        fn set_maintenance_mode(&self, on: bool) {
            self.inner.set_maintenance_mode(on)
        }
    }

    #[test]
    fn test_host_repopulates_only_in_maintenance_mode() {
        let records = Arc::new(MemoryRecordStore::new());
        records.get_or_create("c", "C", true).unwrap();
        let host = Arc::new(SpyHost {
            inner: LocalHost::new(vec![AppModule::new("host.core", "core")]).unwrap(),
            seen: Mutex::new(Vec::new()),
        });
        let registry = Registry::new(
            config(),
            vec![Box::new(StaticSource::new("test").with_candidate(plugin_c()))],
            records,
            Arc::new(MemoryScheduleStore::new()),
            host.clone(),
        );

        registry.load_plugins(false);
        registry.unload_plugins();
        registry.reload_plugins(true);

        let seen = host.seen.lock().unwrap().clone();
        assert!(seen.len() >= 3);
        assert!(seen.iter().all(|on| *on));
        assert!(!host.maintenance_mode());
    }

    #[test]
    fn test_unload_keeps_host_owned_app() {
        struct SharedApp(CapabilitySet);

        impl Plugin for SharedApp {
            fn capabilities(&self) -> &CapabilitySet {
                &self.0
            }

            fn app_module(&self) -> Option<AppModule> {
                Some(AppModule::new("host.core", "core"))
            }
        }

        let h = harness(
            config(),
            vec![candidate(
                "Shared",
                loader(|| {
                    Ok(Box::new(SharedApp(CapabilitySet::new().with(Mixin::App, Gate::Always)))
                        as Box<dyn Plugin>)
                }),
            )],
        );

        h.registry.load_plugins(false);
        assert!(h.registry.get_plugin("shared").is_some());
        assert!(h.registry.installed_apps().is_empty());

        h.registry.unload_plugins();
        assert_eq!(module_paths(&h.host), vec!["host.core"]);
    }

    // ---- reentrancy ----

    struct Reentrant {
        caps: CapabilitySet,
        registry: Arc<Mutex<Weak<Registry>>>,
        observed: Arc<Mutex<Vec<LoadOutcome>>>,
    }

    impl Plugin for Reentrant {
        fn capabilities(&self) -> &CapabilitySet {
            &self.caps
        }

        fn settings(&self) -> SettingsSchema {
            let registry = self.registry.lock().unwrap().upgrade();
            if let Some(registry) = registry {
                let mut observed = self.observed.lock().unwrap();
                observed.push(registry.load_plugins(false));
                observed.push(registry.reload_plugins(false));
                observed.push(registry.unload_plugins());
            }
            SettingsSchema::new()
        }
    }

    #[test]
    fn test_nested_load_is_skipped() {
        let slot: Arc<Mutex<Weak<Registry>>> = Arc::new(Mutex::new(Weak::new()));
        let observed = Arc::new(Mutex::new(Vec::new()));

        let plugin_slot = slot.clone();
        let plugin_observed = observed.clone();
        let reentrant = candidate(
            "R",
            loader(move || {
                Ok(Box::new(Reentrant {
                    caps: CapabilitySet::new().with(Mixin::Settings, Gate::Always),
                    registry: plugin_slot.clone(),
                    observed: plugin_observed.clone(),
                }) as Box<dyn Plugin>)
            }),
        );

        let h = harness(config(), vec![reentrant]);
        let registry = Arc::new(h.registry);
        *slot.lock().unwrap() = Arc::downgrade(&registry);

        let outcome = registry.load_plugins(false);

        assert!(matches!(outcome, LoadOutcome::Loaded { active: 1, .. }));
        assert_eq!(
            *observed.lock().unwrap(),
            vec![LoadOutcome::Skipped, LoadOutcome::Skipped, LoadOutcome::Skipped]
        );
        assert!(registry.get_plugin("r").is_some());
        // The guard is released after the cycle.
        assert!(matches!(
            registry.load_plugins(false),
            LoadOutcome::Loaded { .. }
        ));
    }

    #[test]
    fn test_registry_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Registry>();
    }

    #[test]
    fn test_collect_plugins_and_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = config();
        config.plugins.plugin_dirs = vec![tmp.path().join("roots").display().to_string()];
        let h = harness(config, vec![plugin_a(), plugin_c()]);

        let found = h.registry.collect_plugins();
        assert_eq!(found.len(), 2);
        let dirs = h.registry.plugin_dirs();
        assert_eq!(dirs.len(), 1);
        assert!(dirs[0].is_dir());
    }
}
