//! Declarative plugins built entirely from a `plugin.json` manifest.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::mixins::{schema_defaults, CapabilitySet, ScheduledTask, SettingsSchema};
use super::types::{Plugin, PluginManifest};
use crate::host::{AppModule, Route};

/// A plugin whose every contribution comes from its manifest.
///
/// Named gates are read from the manifest's `flags` table. The only callable
/// methods are `describe` (manifest summary) and `settings` (setting
/// defaults).
pub struct ManifestPlugin {
    manifest: PluginManifest,
    caps: CapabilitySet,
}

impl ManifestPlugin {
    pub fn new(manifest: PluginManifest) -> Self {
        let caps = manifest.capabilities();
        Self { manifest, caps }
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }
}

impl Plugin for ManifestPlugin {
    fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    fn gate(&self, name: &str) -> bool {
        self.manifest.flags.get(name).copied().unwrap_or(false)
    }

    fn settings(&self) -> SettingsSchema {
        self.manifest.settings.clone()
    }

    fn scheduled_tasks(&self) -> BTreeMap<String, ScheduledTask> {
        self.manifest.tasks.clone()
    }

    fn app_module(&self) -> Option<AppModule> {
        self.manifest.app.clone()
    }

    fn routes(&self) -> Vec<Route> {
        self.manifest.routes.clone()
    }

    fn call(&self, method: &str, _args: &[Value]) -> anyhow::Result<Value> {
        match method {
            "describe" => Ok(json!({
                "name": self.manifest.name,
                "version": self.manifest.version,
                "description": self.manifest.description,
                "mixins": self.caps.mixins().map(|m| m.to_string()).collect::<Vec<_>>(),
            })),
            "settings" => Ok(serde_json::to_value(schema_defaults(&self.manifest.settings))?),
            other => anyhow::bail!(
                "plugin '{}' has no method '{}'",
                self.manifest.meta().slug(),
                other
            ),
        }
    }
}
