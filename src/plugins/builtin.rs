//! Plugins compiled into plughost.
//!
//! `host-status` is always offered and active by default. The three samples
//! are offered when `plugins.samples` is set and start inactive like any
//! other newly discovered plugin.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::discovery::{FactoryCatalog, StaticSource};
use super::manifest_plugin::ManifestPlugin;
use super::mixins::{CapabilitySet, Gate, Mixin, ScheduledTask, SettingSpec, SettingsSchema};
use super::types::{Plugin, PluginManifest, PluginMeta, Provenance};
use crate::host::{AppModule, Route};
use crate::store::ScheduleKind;

/// Reports host and plugin runtime status.
pub struct HostStatusPlugin {
    caps: CapabilitySet,
}

impl HostStatusPlugin {
    pub const NAME: &'static str = "Host Status";

    pub fn new() -> Self {
        Self {
            caps: CapabilitySet::new().with(Mixin::Settings, Gate::Always),
        }
    }
}

impl Default for HostStatusPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for HostStatusPlugin {
    fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    fn settings(&self) -> SettingsSchema {
        let mut schema = SettingsSchema::new();
        schema.insert(
            "STATUS_VERBOSE".into(),
            SettingSpec::new("Verbose status", json!(false))
                .describe("Include plugin details in status output"),
        );
        schema
    }

    fn call(&self, method: &str, _args: &[Value]) -> anyhow::Result<Value> {
        match method {
            "ping" => Ok(json!("pong")),
            "version" => Ok(json!(env!("CARGO_PKG_VERSION"))),
            other => anyhow::bail!("host-status has no method '{}'", other),
        }
    }
}

/// Sample: settings plus a callable method.
pub struct GreeterPlugin {
    caps: CapabilitySet,
}

impl GreeterPlugin {
    pub const NAME: &'static str = "Sample Greeter";

    pub fn new() -> Self {
        Self {
            caps: CapabilitySet::new().with(Mixin::Settings, Gate::Always),
        }
    }
}

impl Plugin for GreeterPlugin {
    fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    fn settings(&self) -> SettingsSchema {
        let mut schema = SettingsSchema::new();
        schema.insert(
            "GREETING".into(),
            SettingSpec::new("Greeting", json!("Hello")),
        );
        schema
    }

    fn call(&self, method: &str, args: &[Value]) -> anyhow::Result<Value> {
        match method {
            "greet" => {
                let who = args.first().and_then(Value::as_str).unwrap_or("world");
                Ok(json!(format!("Hello, {}!", who)))
            }
            other => anyhow::bail!("sample-greeter has no method '{}'", other),
        }
    }
}

/// Sample: recurring tasks against its own method and a host function.
pub struct HeartbeatPlugin {
    caps: CapabilitySet,
}

impl HeartbeatPlugin {
    pub const NAME: &'static str = "Sample Heartbeat";

    pub fn new() -> Self {
        Self {
            caps: CapabilitySet::new().with(Mixin::Schedule, Gate::Always),
        }
    }
}

impl Plugin for HeartbeatPlugin {
    fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    fn scheduled_tasks(&self) -> BTreeMap<String, ScheduledTask> {
        let mut tasks = BTreeMap::new();
        tasks.insert("beat".into(), ScheduledTask::every_minutes("beat", 5));
        tasks.insert(
            "cleanup".into(),
            ScheduledTask::new("host.tasks.cleanup", ScheduleKind::Daily),
        );
        tasks
    }

    fn call(&self, method: &str, _args: &[Value]) -> anyhow::Result<Value> {
        match method {
            "beat" => Ok(json!({"alive": true})),
            other => anyhow::bail!("sample-heartbeat has no method '{}'", other),
        }
    }
}

/// Sample: an app module and plugin routes, the app behind a named gate.
pub struct DashboardPlugin {
    caps: CapabilitySet,
    enable_app: bool,
}

impl DashboardPlugin {
    pub const NAME: &'static str = "Sample Dashboard";

    pub fn new() -> Self {
        Self {
            caps: CapabilitySet::new()
                .with(Mixin::App, Gate::named("enable_app"))
                .with(Mixin::Urls, Gate::Always),
            enable_app: true,
        }
    }
}

impl Plugin for DashboardPlugin {
    fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    fn gate(&self, name: &str) -> bool {
        name == "enable_app" && self.enable_app
    }

    fn app_module(&self) -> Option<AppModule> {
        Some(
            AppModule::new("plugins.sample_dashboard", "sample_dashboard").with_admin_route(
                Route::new("widgets/", "widgets", "sample_dashboard.admin.widgets"),
            ),
        )
    }

    fn routes(&self) -> Vec<Route> {
        vec![
            Route::new("", "index", "sample_dashboard.views.index"),
            Route::new("stats/", "stats", "sample_dashboard.views.stats"),
        ]
    }
}

/// Source offering the built-in plugins.
pub fn builtin_source() -> StaticSource {
    StaticSource::new("builtin").with(
        PluginMeta {
            description: "Host and plugin runtime status".into(),
            author: Some("plughost".into()),
            ..PluginMeta::new(HostStatusPlugin::NAME, env!("CARGO_PKG_VERSION"))
        },
        Provenance::Builtin,
        || Ok(Box::new(HostStatusPlugin::new()) as Box<dyn Plugin>),
    )
}

/// Source offering the bundled samples.
pub fn sample_source() -> StaticSource {
    let meta = |name: &str, description: &str| PluginMeta {
        description: description.into(),
        author: Some("plughost".into()),
        ..PluginMeta::new(name, "0.1.0")
    };

    StaticSource::new("samples")
        .with(
            meta(GreeterPlugin::NAME, "Settings and a callable method"),
            Provenance::Sample,
            || Ok(Box::new(GreeterPlugin::new()) as Box<dyn Plugin>),
        )
        .with(
            meta(HeartbeatPlugin::NAME, "Recurring tasks"),
            Provenance::Sample,
            || Ok(Box::new(HeartbeatPlugin::new()) as Box<dyn Plugin>),
        )
        .with(
            meta(DashboardPlugin::NAME, "App module and plugin routes"),
            Provenance::Sample,
            || Ok(Box::new(DashboardPlugin::new()) as Box<dyn Plugin>),
        )
}

/// Echoes its arguments back; otherwise behaves like its manifest.
struct EchoPlugin {
    inner: ManifestPlugin,
}

impl Plugin for EchoPlugin {
    fn capabilities(&self) -> &CapabilitySet {
        self.inner.capabilities()
    }

    fn gate(&self, name: &str) -> bool {
        self.inner.gate(name)
    }

    fn settings(&self) -> SettingsSchema {
        self.inner.settings()
    }

    fn scheduled_tasks(&self) -> BTreeMap<String, ScheduledTask> {
        self.inner.scheduled_tasks()
    }

    fn app_module(&self) -> Option<AppModule> {
        self.inner.app_module()
    }

    fn routes(&self) -> Vec<Route> {
        self.inner.routes()
    }

    fn call(&self, method: &str, args: &[Value]) -> anyhow::Result<Value> {
        match method {
            "echo" => Ok(Value::Array(args.to_vec())),
            other => self.inner.call(other, args),
        }
    }
}

/// Entry factories available to directory and package manifests.
pub fn default_catalog() -> FactoryCatalog {
    let mut catalog = FactoryCatalog::new();
    catalog.register("echo", |manifest: &PluginManifest| {
        Ok(Box::new(EchoPlugin {
            inner: ManifestPlugin::new(manifest.clone()),
        }) as Box<dyn Plugin>)
    });
    catalog.register("greeter", |_manifest: &PluginManifest| {
        Ok(Box::new(GreeterPlugin::new()) as Box<dyn Plugin>)
    });
    catalog.register("heartbeat", |_manifest: &PluginManifest| {
        Ok(Box::new(HeartbeatPlugin::new()) as Box<dyn Plugin>)
    });
    catalog
}
