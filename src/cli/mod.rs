//! Command handlers for the plughost binary.

pub(crate) mod watch;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use plughost::config::Config;
use plughost::host::{AppModule, LocalHost, Route};
use plughost::plugins::{builtin, standard_sources, InstallOutcome, LoadOutcome, Registry};
use plughost::store::{FileRecordStore, FileScheduleStore, RecordStore};

/// App modules every host starts with.
fn core_modules() -> Vec<AppModule> {
    vec![AppModule::new("host.core", "core")
        .with_admin_route(Route::new("settings/", "settings", "host.admin.settings"))]
}

fn open_records() -> Result<FileRecordStore> {
    let path = Config::dir().join("records.json");
    FileRecordStore::open(&path)
        .with_context(|| format!("Failed to open plugin records at {:?}", path))
}

/// Assemble a registry backed by the JSON stores under `~/.plughost`.
pub(crate) fn build_registry(config: Config) -> Result<Registry> {
    let schedule_path = Config::dir().join("schedule.json");
    let schedule = FileScheduleStore::open(&schedule_path)
        .with_context(|| format!("Failed to open schedule store at {:?}", schedule_path))?;
    let host = LocalHost::new(core_modules()).with_context(|| "Failed to start host")?;

    let catalog = builtin::default_catalog();
    let sources = standard_sources(&config, &catalog);

    Ok(Registry::new(
        config,
        sources,
        Arc::new(open_records()?),
        Arc::new(schedule),
        Arc::new(host),
    ))
}

pub(crate) fn load_config() -> Result<Config> {
    Config::load().with_context(|| "Failed to load configuration")
}

pub(crate) fn print_outcome(outcome: &LoadOutcome) {
    match outcome {
        LoadOutcome::Loaded {
            active,
            inactive,
            retries,
            exhausted,
        } => {
            println!("Loaded {} plugin(s), {} inactive", active, inactive);
            if *retries > 0 {
                println!("  {} retry pass(es) after construction failures", retries);
            }
            if *exhausted {
                println!("  Retry budget exhausted, some plugins may be missing");
            }
        }
        LoadOutcome::Unloaded => println!("Plugins unloaded"),
        LoadOutcome::Skipped => println!("Another load is in progress, skipped"),
        LoadOutcome::StoreUnavailable => {
            eprintln!("Plugin record store unavailable, no plugins loaded")
        }
    }
}

pub(crate) fn cmd_list() -> Result<()> {
    let registry = build_registry(load_config()?)?;
    registry.load_plugins(false);

    let active = registry.active_plugins();
    let inactive = registry.inactive_plugins();

    if active.is_empty() && inactive.is_empty() {
        println!("No plugins found.");
        return Ok(());
    }

    println!("Active ({}):", active.len());
    for plugin in &active {
        let mixins: Vec<String> = plugin
            .capabilities()
            .mixins()
            .filter(|m| plugin.mixin_enabled(m))
            .map(|m| m.to_string())
            .collect();
        println!(
            "  {:<24} {:<10} {:<28} [{}]",
            plugin.slug,
            plugin.meta.version,
            plugin.module,
            mixins.join(", ")
        );
    }

    if !inactive.is_empty() {
        println!();
        println!("Inactive ({}):", inactive.len());
        for plugin in &inactive {
            println!(
                "  {:<24} {:<10} {:<28} {}",
                plugin.slug, plugin.meta.version, plugin.module, plugin.reason
            );
        }
    }

    Ok(())
}

pub(crate) fn cmd_reload(full: bool) -> Result<()> {
    let registry = build_registry(load_config()?)?;
    registry.load_plugins(false);
    let outcome = registry.reload_plugins(full);
    print_outcome(&outcome);
    Ok(())
}

pub(crate) fn cmd_dirs() -> Result<()> {
    let config = load_config()?;
    let registry = build_registry(config)?;
    for dir in registry.plugin_dirs() {
        println!("{}", dir.display());
    }
    if registry.config().plugins.package_discovery_enabled() {
        println!(
            "packages: {}",
            registry.config().plugins.package_index_path().display()
        );
    }
    Ok(())
}

pub(crate) fn cmd_errors() -> Result<()> {
    let registry = build_registry(load_config()?)?;
    registry.load_plugins(false);

    let errors = registry.errors();
    if errors.is_empty() {
        println!("No plugin errors.");
        return Ok(());
    }

    for (bucket, entries) in errors.buckets() {
        println!("{}:", bucket);
        for entry in entries {
            println!("  {}: {}", entry.module, entry.message);
        }
    }
    Ok(())
}

pub(crate) fn cmd_call(slug: String, method: String, args: Vec<String>) -> Result<()> {
    let args: Vec<Value> = args
        .iter()
        .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())))
        .collect();

    let registry = build_registry(load_config()?)?;
    registry.load_plugins(false);

    match registry
        .call_plugin_function(&slug, &method, &args)
        .with_context(|| format!("Plugin '{}' failed in '{}'", slug, method))?
    {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => anyhow::bail!("No active plugin '{}'", slug),
    }
    Ok(())
}

pub(crate) fn cmd_set_active(slug: String, active: bool) -> Result<()> {
    let records = open_records()?;
    let key = slug.trim().to_lowercase();

    let existing = records
        .list()?
        .into_iter()
        .find(|record| record.key == key)
        .with_context(|| format!("No plugin record '{}'. Run 'plughost list' first.", key))?;

    records.set_active(&existing.key, active)?;
    println!(
        "{} {}",
        if active { "Enabled" } else { "Disabled" },
        existing.key
    );
    Ok(())
}

pub(crate) fn cmd_install() -> Result<()> {
    let registry = build_registry(load_config()?)?;
    match registry.install_plugin_file() {
        InstallOutcome::Installed { file } => println!("Installed {}", file.display()),
        InstallOutcome::Skipped { reason } => println!("Skipped: {}", reason),
        InstallOutcome::Failed { message } => anyhow::bail!("Install failed: {}", message),
    }
    Ok(())
}
