//! Capability ("mixin") declarations.
//!
//! A plugin advertises the optional contracts it implements through a
//! [`CapabilitySet`] built in its constructor:
//!
//! ```rust
//! use plughost::plugins::{CapabilitySet, Gate, Mixin};
//!
//! let caps = CapabilitySet::new()
//!     .with(Mixin::Settings, Gate::Always)
//!     .with(Mixin::App, Gate::named("enable_app"));
//!
//! assert!(caps.has(&Mixin::App));
//! ```
//!
//! Having a mixin is not the same as having it enabled: a `Gate::Named`
//! gate is evaluated against the plugin at activation time.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::ScheduleKind;

/// Optional capability keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mixin {
    /// Contributes a settings schema.
    Settings,
    /// Declares recurring tasks.
    Schedule,
    /// Supplies an app module mounted into the host.
    App,
    /// Contributes routes under the plugin mount point.
    Urls,
    /// Any host-defined capability.
    Custom(String),
}

impl Mixin {
    pub fn as_str(&self) -> &str {
        match self {
            Mixin::Settings => "settings",
            Mixin::Schedule => "schedule",
            Mixin::App => "app",
            Mixin::Urls => "urls",
            Mixin::Custom(key) => key.as_str(),
        }
    }
}

impl fmt::Display for Mixin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mixin {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "settings" => Mixin::Settings,
            "schedule" => Mixin::Schedule,
            "app" => Mixin::App,
            "urls" => Mixin::Urls,
            other => Mixin::Custom(other.to_string()),
        })
    }
}

/// When a declared mixin counts as enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Always,
    /// Enabled while the plugin reports this gate as truthy.
    Named(String),
}

impl Gate {
    pub fn named(name: &str) -> Self {
        Gate::Named(name.to_string())
    }
}

/// Mixins a plugin implements, each with its enabling gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    gates: BTreeMap<Mixin, Gate>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mixin. Registering the same key twice replaces the gate.
    pub fn with(mut self, mixin: Mixin, gate: Gate) -> Self {
        self.gates.insert(mixin, gate);
        self
    }

    pub fn has(&self, mixin: &Mixin) -> bool {
        self.gates.contains_key(mixin)
    }

    pub fn gate(&self, mixin: &Mixin) -> Option<&Gate> {
        self.gates.get(mixin)
    }

    pub fn mixins(&self) -> impl Iterator<Item = &Mixin> {
        self.gates.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

/// One setting a plugin exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingSpec {
    /// Human-readable label.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: serde_json::Value,
    /// Value kind hint for the host UI (`string`, `int`, `bool`, `choice`).
    #[serde(default = "default_validator")]
    pub validator: String,
    #[serde(default)]
    pub choices: Vec<String>,
}

fn default_validator() -> String {
    "string".to_string()
}

impl SettingSpec {
    pub fn new(name: &str, default: serde_json::Value) -> Self {
        let validator = match &default {
            serde_json::Value::Bool(_) => "bool",
            serde_json::Value::Number(_) => "int",
            _ => "string",
        };
        Self {
            name: name.to_string(),
            description: String::new(),
            default,
            validator: validator.to_string(),
            choices: Vec::new(),
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Setting key to spec, as contributed by one plugin.
pub type SettingsSchema = BTreeMap<String, SettingSpec>;

/// Default values of every setting in a schema.
pub fn schema_defaults(schema: &SettingsSchema) -> BTreeMap<String, serde_json::Value> {
    schema
        .iter()
        .map(|(key, spec)| (key.clone(), spec.default.clone()))
        .collect()
}

/// A recurring task declared by a plugin.
///
/// `func` without a `.` names a plugin method; a dotted `func` names a host
/// function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub func: String,
    pub schedule: ScheduleKind,
    #[serde(default)]
    pub minutes: Option<u32>,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl ScheduledTask {
    pub fn new(func: &str, schedule: ScheduleKind) -> Self {
        Self {
            func: func.to_string(),
            schedule,
            minutes: None,
            args: Vec::new(),
        }
    }

    pub fn every_minutes(func: &str, minutes: u32) -> Self {
        Self {
            minutes: Some(minutes),
            ..Self::new(func, ScheduleKind::Minutes)
        }
    }

    /// Whether `func` names a method on the declaring plugin.
    pub fn is_plugin_method(&self) -> bool {
        !self.func.contains('.')
    }

    /// Check the declaration, returning a description of the first problem.
    pub fn validate(&self, key: &str) -> Result<(), String> {
        if key.trim().is_empty() {
            return Err("task key must not be empty".to_string());
        }
        if key.contains('.') {
            return Err(format!("task key '{}' must not contain '.'", key));
        }
        if self.func.trim().is_empty() {
            return Err(format!("task '{}' is missing 'func'", key));
        }
        if self.schedule == ScheduleKind::Minutes && self.minutes.unwrap_or(0) == 0 {
            return Err(format!(
                "task '{}' runs every N minutes but 'minutes' is missing or zero",
                key
            ));
        }
        Ok(())
    }
}
