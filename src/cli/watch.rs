//! Watch command: reload plugins when a manifest changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use plughost::config::Config;
use plughost::plugins::{Registry, MANIFEST_FILE};

use super::{build_registry, print_outcome};

/// Parse interval string like "1h", "30m", "15m", "60s" into seconds.
pub fn parse_interval(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();
    if let Some(hours) = s.strip_suffix('h') {
        let n: u64 = hours.parse().with_context(|| "Invalid hours value")?;
        Ok(n * 3600)
    } else if let Some(mins) = s.strip_suffix('m') {
        let n: u64 = mins.parse().with_context(|| "Invalid minutes value")?;
        Ok(n * 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        let n: u64 = secs.parse().with_context(|| "Invalid seconds value")?;
        Ok(n)
    } else {
        s.parse::<u64>()
            .with_context(|| "Invalid interval. Use formats like 1h, 30m, or 60s")
    }
}

/// SHA-256 over every manifest under `roots` and the package index, in a
/// stable order. Missing files hash as absent.
pub fn fingerprint(roots: &[PathBuf], package_index: &Path) -> String {
    let mut manifests: Vec<PathBuf> = roots
        .iter()
        .filter_map(|root| fs::read_dir(root).ok())
        .flat_map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())))
        .map(|dir| dir.join(MANIFEST_FILE))
        .filter(|path| path.is_file())
        .collect();
    manifests.sort();
    manifests.push(package_index.to_path_buf());

    let mut hasher = Sha256::new();
    for path in &manifests {
        hasher.update(path.display().to_string().as_bytes());
        match fs::read(path) {
            Ok(bytes) => {
                hasher.update(b"\x01");
                hasher.update(&bytes);
            }
            Err(_) => hasher.update(b"\x00"),
        }
    }
    hex::encode(hasher.finalize())
}

/// Tracks the last seen fingerprint of a set of plugin roots.
pub struct ManifestWatch {
    roots: Vec<PathBuf>,
    package_index: PathBuf,
    last: String,
}

impl ManifestWatch {
    pub fn new(roots: Vec<PathBuf>, package_index: PathBuf) -> Self {
        let last = fingerprint(&roots, &package_index);
        Self {
            roots,
            package_index,
            last,
        }
    }

    /// Whether anything changed since the previous call.
    pub fn changed(&mut self) -> bool {
        let current = fingerprint(&self.roots, &self.package_index);
        if current == self.last {
            return false;
        }
        self.last = current;
        true
    }
}

/// Poll `watch` every `period` and reload `registry` on change. Stops after
/// `max_ticks` polls if given. Returns the number of reloads.
pub async fn watch_loop(
    registry: Arc<Registry>,
    mut watch: ManifestWatch,
    period: Duration,
    max_ticks: Option<usize>,
) -> Result<usize> {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    let mut ticks = 0usize;
    let mut reloads = 0usize;

    while max_ticks.map_or(true, |max| ticks < max) {
        ticker.tick().await;
        ticks += 1;

        if !watch.changed() {
            continue;
        }

        println!(
            "[{}] Plugin manifests changed, reloading",
            chrono::Local::now().format("%H:%M:%S")
        );
        let target = Arc::clone(&registry);
        let outcome = tokio::task::spawn_blocking(move || target.reload_plugins(false))
            .await
            .with_context(|| "Reload task failed")?;
        print_outcome(&outcome);
        reloads += 1;
    }

    Ok(reloads)
}

pub(crate) async fn cmd_watch(config: Config, interval: String) -> Result<()> {
    let interval_secs = parse_interval(&interval)?;
    if interval_secs == 0 {
        anyhow::bail!("Interval must be at least one second");
    }

    let package_index = config.plugins.package_index_path();
    let registry = Arc::new(build_registry(config)?);

    let initial = Arc::clone(&registry);
    let outcome = tokio::task::spawn_blocking(move || initial.load_plugins(false)).await?;
    print_outcome(&outcome);

    let watch = ManifestWatch::new(registry.plugin_dirs(), package_index);
    for dir in registry.plugin_dirs() {
        println!("Watching: {}", dir.display());
    }
    println!("Interval: {} ({}s)", interval, interval_secs);
    println!();
    println!("Press Ctrl+C to stop.");
    println!();

    tokio::select! {
        result = watch_loop(Arc::clone(&registry), watch, Duration::from_secs(interval_secs), None) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            let target = Arc::clone(&registry);
            let outcome = tokio::task::spawn_blocking(move || target.unload_plugins()).await?;
            print_outcome(&outcome);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plughost::host::LocalHost;
    use plughost::plugins::{builtin, DirectorySource, PluginSource};
    use plughost::store::{MemoryRecordStore, MemoryScheduleStore};
    use tempfile::TempDir;

    fn write_manifest(root: &Path, dir: &str, version: &str) {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(
            path.join(MANIFEST_FILE),
            format!(r#"{{"name": "{}", "version": "{}"}}"#, dir, version),
        )
        .unwrap();
    }

    #[test]
    fn test_parse_interval_hours() {
        assert_eq!(parse_interval("1h").unwrap(), 3600);
        assert_eq!(parse_interval("2h").unwrap(), 7200);
    }

    #[test]
    fn test_parse_interval_minutes() {
        assert_eq!(parse_interval("30m").unwrap(), 1800);
    }

    #[test]
    fn test_parse_interval_seconds_and_bare() {
        assert_eq!(parse_interval("60s").unwrap(), 60);
        assert_eq!(parse_interval("3600").unwrap(), 3600);
    }

    #[test]
    fn test_parse_interval_invalid() {
        assert!(parse_interval("abc").is_err());
        assert!(parse_interval("").is_err());
    }

    #[test]
    fn test_fingerprint_tracks_manifest_content() {
        let tmp = TempDir::new().unwrap();
        let roots = vec![tmp.path().to_path_buf()];
        let index = tmp.path().join("packages.json");

        write_manifest(tmp.path(), "alpha", "1.0");
        let first = fingerprint(&roots, &index);
        assert_eq!(first, fingerprint(&roots, &index));
        assert_eq!(first.len(), 64);

        write_manifest(tmp.path(), "alpha", "1.1");
        assert_ne!(first, fingerprint(&roots, &index));
    }

    #[test]
    fn test_fingerprint_ignores_non_manifest_files() {
        let tmp = TempDir::new().unwrap();
        let roots = vec![tmp.path().to_path_buf()];
        let index = tmp.path().join("packages.json");

        let before = fingerprint(&roots, &index);
        fs::write(tmp.path().join("notes.txt"), "scratch").unwrap();
        assert_eq!(before, fingerprint(&roots, &index));
    }

    #[test]
    fn test_manifest_watch_reports_once() {
        let tmp = TempDir::new().unwrap();
        let mut watch =
            ManifestWatch::new(vec![tmp.path().to_path_buf()], tmp.path().join("none.json"));
        assert!(!watch.changed());

        write_manifest(tmp.path(), "beta", "1.0");
        assert!(watch.changed());
        assert!(!watch.changed());
    }

    #[tokio::test]
    async fn test_watch_loop_reloads_on_change() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("plugins");
        fs::create_dir_all(&root).unwrap();

        let mut config = Config::default();
        config.plugins.testing = true;

        let sources: Vec<Box<dyn PluginSource>> = vec![Box::new(DirectorySource::new(
            vec![root.clone()],
            builtin::default_catalog(),
        ))];
        let registry = Arc::new(Registry::new(
            config,
            sources,
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryScheduleStore::new()),
            Arc::new(LocalHost::new(vec![]).unwrap()),
        ));
        registry.load_plugins(false);
        assert!(registry.active_plugins().is_empty());

        let watch = ManifestWatch::new(vec![root.clone()], tmp.path().join("packages.json"));
        write_manifest(&root, "gamma", "1.0");

        let reloads = watch_loop(
            Arc::clone(&registry),
            watch,
            Duration::from_millis(10),
            Some(2),
        )
        .await
        .unwrap();

        assert_eq!(reloads, 1);
        assert!(registry.get_plugin("gamma").is_some());
    }
}
